//! Stabilized (GLS) Navier-Stokes contributions of a single cell.
//!
//! The Jacobian of the PSPG and SUPG terms ignores the dependence of `tau` on
//! the velocity. Newton therefore converges slightly below quadratic rate.

use crate::discretization::fe::{FeValues, ShapeData};
use crate::discretization::mapping::Tensor2;
use crate::discretization::mesh::Point;
use crate::error::ConfigurationError;
use crate::numerics::time_integration::{TimeSteppingMethod, time_derivative_weights};
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

/// Element size `h` from the cell measure, normalized by the velocity degree.
pub fn cell_size<const DIM: usize>(measure: f64, degree: usize) -> f64 {
    let degree = degree.max(1) as f64;
    match DIM {
        2 => (4.0 * measure / PI).sqrt() / degree,
        3 => (6.0 * measure / PI).cbrt() / degree,
        _ => measure / degree,
    }
}

/// `tau = (sdt^2 + (2|u|/h)^2 + 9 (4 nu / h^2)^2)^(-1/2)`, the `sdt` term only
/// for transient schemes. `|u|` is floored at `1e-12 * velocity_scale`.
pub fn stabilization_tau(u_mag: f64, h: f64, viscosity: f64, sdt: Option<f64>, velocity_scale: f64) -> f64 {
    let u_mag = u_mag.max(1e-12 * velocity_scale);
    let advective = 2.0 * u_mag / h;
    let diffusive = 4.0 * viscosity / (h * h);
    let transient = sdt.unwrap_or(0.0);
    1.0 / (transient * transient + advective * advective + 9.0 * diffusive * diffusive).sqrt()
}

#[derive(Debug, Clone, Copy)]
pub struct GlsParameters {
    pub viscosity: f64,
    pub velocity_scale: f64,
    pub supg: bool,
    /// Velocity polynomial degree, used by the element size.
    pub degree: usize,
}

/// Discrete time derivative of one assembly: weights on the history slots
/// `[present, m1, m2, m3]` and the inverse step entering `tau`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeTerms {
    pub weights: Vec<f64>,
    pub sdt: Option<f64>,
}

impl TimeTerms {
    pub fn new(method: TimeSteppingMethod, step_history: &[f64]) -> Result<Self, ConfigurationError> {
        if method.is_steady() {
            return Ok(Self::default());
        }
        Ok(Self {
            weights: time_derivative_weights(method, step_history)?,
            sdt: step_history.first().map(|dt| 1.0 / dt),
        })
    }

    /// Coefficient of the mass term in the Jacobian.
    pub fn mass_coefficient(&self) -> f64 {
        self.weights.first().copied().unwrap_or(0.0)
    }
}

/// Everything the evaluator reads for one cell. Local vectors follow the
/// local dof order `node * (DIM + 1) + component`.
pub struct CellInput<'a, const DIM: usize> {
    pub fe_values: &'a FeValues<DIM>,
    pub measure: f64,
    pub present: &'a [f64],
    /// Velocity history, slot `k` holds `m(k+1)`.
    pub history: &'a [Vec<f64>],
    /// Body force at every quadrature point; empty means no forcing.
    pub forcing: &'a [Point<DIM>],
}

#[derive(Debug, Clone)]
pub struct LocalSystem {
    pub matrix: Option<DMatrix<f64>>,
    pub rhs: DVector<f64>,
}

/// Solution fields at one quadrature point.
#[derive(Debug, Clone, Copy)]
pub struct PointFields<const DIM: usize> {
    pub velocity: Point<DIM>,
    /// `grad[(a, b)] = d u_a / d x_b`.
    pub gradient: Tensor2<DIM>,
    pub laplacian: Point<DIM>,
    pub pressure: f64,
    pub pressure_gradient: Point<DIM>,
}

impl<const DIM: usize> PointFields<DIM> {
    pub fn interpolate(shape: &[ShapeData<DIM>], local: &[f64]) -> Self {
        let mut fields = Self {
            velocity: Point::zeros(),
            gradient: Tensor2::zeros(),
            laplacian: Point::zeros(),
            pressure: 0.0,
            pressure_gradient: Point::zeros(),
        };
        for (node, s) in shape.iter().enumerate() {
            let base = node * (DIM + 1);
            let lap = s.hessian.trace();
            for c in 0..DIM {
                let coef = local[base + c];
                fields.velocity[c] += coef * s.value;
                fields.laplacian[c] += coef * lap;
                for b in 0..DIM {
                    fields.gradient[(c, b)] += coef * s.grad[b];
                }
            }
            let p = local[base + DIM];
            fields.pressure += p * s.value;
            fields.pressure_gradient += s.grad * p;
        }
        fields
    }

    pub fn divergence(&self) -> f64 {
        self.gradient.trace()
    }

    /// Curl of the velocity: `[w_z]` in 2D, `[w_x, w_y, w_z]` in 3D.
    pub fn vorticity(&self) -> Vec<f64> {
        let g = &self.gradient;
        match DIM {
            2 => vec![g[(1, 0)] - g[(0, 1)]],
            3 => vec![
                g[(2, 1)] - g[(1, 2)],
                g[(0, 2)] - g[(2, 0)],
                g[(1, 0)] - g[(0, 1)],
            ],
            _ => Vec::new(),
        }
    }
}

pub fn velocity_at<const DIM: usize>(shape: &[ShapeData<DIM>], local: &[f64]) -> Point<DIM> {
    let mut u = Point::zeros();
    for (node, s) in shape.iter().enumerate() {
        for c in 0..DIM {
            u[c] += local[node * (DIM + 1) + c] * s.value;
        }
    }
    u
}

/// Derivative of the strong residual with respect to local dof `(component, shape)`.
fn strong_jacobian<const DIM: usize>(
    component: usize,
    s: &ShapeData<DIM>,
    fields: &PointFields<DIM>,
    viscosity: f64,
    mass: f64,
) -> Point<DIM> {
    if component == DIM {
        return s.grad;
    }
    let mut jac = fields.gradient.column(component) * s.value;
    jac[component] += s.grad.dot(&fields.velocity) - viscosity * s.hessian.trace() + mass * s.value;
    jac
}

/// Local Jacobian (when `assemble_matrix`) and residual of one cell.
pub fn evaluate_cell<const DIM: usize>(
    params: &GlsParameters,
    time: &TimeTerms,
    cell: &CellInput<'_, DIM>,
    assemble_matrix: bool,
) -> LocalSystem {
    let values = cell.fe_values;
    let n = values.shape.first().map_or(0, Vec::len) * (DIM + 1);
    let mut matrix = assemble_matrix.then(|| DMatrix::zeros(n, n));
    let mut rhs = DVector::zeros(n);

    let h = cell_size::<DIM>(cell.measure, params.degree);
    let nu = params.viscosity;
    let mass = time.mass_coefficient();

    for (q, shape) in values.shape.iter().enumerate() {
        let jxw = values.jxw[q];
        let fields = PointFields::interpolate(shape, cell.present);
        let u = fields.velocity;

        let mut time_term = Point::<DIM>::zeros();
        if let Some((&w0, rest)) = time.weights.split_first() {
            time_term += u * w0;
            for (w, slot) in rest.iter().zip(cell.history) {
                time_term += velocity_at(shape, slot) * *w;
            }
        }
        let force = cell.forcing.get(q).copied().unwrap_or_else(Point::zeros);

        let tau = stabilization_tau(u.norm(), h, nu, time.sdt, params.velocity_scale);
        let strong = fields.gradient * u + fields.pressure_gradient - fields.laplacian * nu - force + time_term;
        let convection = fields.gradient * u;

        if let Some(m) = matrix.as_mut() {
            for j in 0..n {
                let (cj, nj) = (j % (DIM + 1), j / (DIM + 1));
                let sj = &shape[nj];
                let jac = strong_jacobian(cj, sj, &fields, nu, mass);
                let adv_j = sj.grad.dot(&u);
                for i in 0..n {
                    let (ci, ni) = (i % (DIM + 1), i / (DIM + 1));
                    let si = &shape[ni];
                    let mut v = 0.0;
                    if ci < DIM {
                        let adv_i = si.grad.dot(&u);
                        if cj < DIM {
                            if ci == cj {
                                v += nu * si.grad.dot(&sj.grad) + (adv_j + mass * sj.value) * si.value;
                            }
                            v += fields.gradient[(ci, cj)] * sj.value * si.value;
                            if params.supg {
                                v += tau * (jac[ci] * adv_i + strong[ci] * si.grad[cj] * sj.value);
                            }
                        } else {
                            v -= si.grad[ci] * sj.value;
                            if params.supg {
                                v += tau * jac[ci] * adv_i;
                            }
                        }
                    } else {
                        if cj < DIM {
                            v += si.value * sj.grad[cj];
                        }
                        // PSPG
                        v += tau * jac.dot(&si.grad);
                    }
                    m[(i, j)] += v * jxw;
                }
            }
        }

        let div = fields.divergence();
        for i in 0..n {
            let (ci, ni) = (i % (DIM + 1), i / (DIM + 1));
            let si = &shape[ni];
            let r = if ci < DIM {
                let mut r = -nu * fields.gradient.row(ci).transpose().dot(&si.grad) - convection[ci] * si.value
                    + fields.pressure * si.grad[ci]
                    + force[ci] * si.value
                    - time_term[ci] * si.value;
                if params.supg {
                    r -= tau * strong[ci] * si.grad.dot(&u);
                }
                r
            } else {
                -div * si.value - tau * strong.dot(&si.grad)
            };
            rhs[i] += r * jxw;
        }
    }

    LocalSystem { matrix, rhs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::fe::FeSystem;
    use crate::discretization::generator::hyper_cube;
    use crate::discretization::quadrature::QGauss;
    use approx::assert_relative_eq;

    fn params() -> GlsParameters {
        GlsParameters {
            viscosity: 0.1,
            velocity_scale: 1.0,
            supg: true,
            degree: 1,
        }
    }

    fn unit_cell_values(degree: usize) -> FeValues<2> {
        let mesh = hyper_cube::<2>(1, 0.0, 1.0, false);
        let fe = FeSystem::<2>::new(degree);
        let quad = QGauss::<2>::new(degree + 1);
        FeValues::reinit(&fe.tabulate(&quad), &quad, &mesh.cell_vertices(0)).unwrap()
    }

    #[test]
    fn tau_is_invariant_under_dimensional_rescaling() {
        let base = stabilization_tau(0.7, 0.05, 1e-3, None, 1.0);
        for lambda in [0.1, 3.0, 250.0] {
            let scaled = stabilization_tau(0.7 * lambda, 0.05 * lambda, 1e-3 * lambda * lambda, None, 1.0);
            assert_relative_eq!(base, scaled, max_relative = 1e-12);
        }
        // pure diffusion limit
        let h: f64 = 0.1;
        assert_relative_eq!(
            stabilization_tau(0.0, h, 1.0, None, 1.0),
            h * h / 12.0,
            max_relative = 1e-9
        );
        assert!(stabilization_tau(0.7, 0.05, 1e-3, Some(100.0), 1.0) < base);
    }

    #[test]
    fn cell_size_matches_equivalent_disc_and_sphere() {
        assert_relative_eq!(cell_size::<2>(PI, 1), 2.0, epsilon = 1e-14);
        assert_relative_eq!(cell_size::<2>(PI, 2), 1.0, epsilon = 1e-14);
        assert_relative_eq!(cell_size::<3>(PI / 6.0, 1), 1.0, epsilon = 1e-14);
    }

    #[test]
    fn uniform_flow_has_zero_residual() {
        let values = unit_cell_values(1);
        let present: Vec<f64> = (0..4).flat_map(|_| [1.5, -0.5, 0.0]).collect();
        let cell = CellInput {
            fe_values: &values,
            measure: 1.0,
            present: &present,
            history: &[],
            forcing: &[],
        };
        let local = evaluate_cell(&params(), &TimeTerms::default(), &cell, true);
        assert!(local.rhs.amax() < 1e-13);
        assert_eq!(local.matrix.map(|m| m.nrows()), Some(12));
    }

    #[test]
    fn bdf1_residual_carries_the_time_derivative() {
        let values = unit_cell_values(1);
        let dt = 0.1;
        let present: Vec<f64> = (0..4).flat_map(|_| [1.0, 0.0, 0.0]).collect();
        let previous: Vec<f64> = (0..4).flat_map(|_| [0.5, 0.0, 0.0]).collect();
        let history = vec![previous];
        let cell = CellInput {
            fe_values: &values,
            measure: 1.0,
            present: &present,
            history: &history,
            forcing: &[],
        };
        let time = TimeTerms::new(TimeSteppingMethod::Bdf1, &[dt]).unwrap();
        let galerkin = GlsParameters {
            supg: false,
            ..params()
        };
        let local = evaluate_cell(&galerkin, &time, &cell, false);
        // each x-momentum row integrates -du/dt * phi_i, du/dt = 5, int phi_i = 1/4
        for node in 0..4 {
            assert_relative_eq!(local.rhs[node * 3], -5.0 * 0.25, epsilon = 1e-12);
            assert_relative_eq!(local.rhs[node * 3 + 1], 0.0, epsilon = 1e-12);
        }
        assert!(local.matrix.is_none());
    }

    #[test]
    fn jacobian_matches_residual_derivative_at_rest() {
        // at u = 0 the omitted tau sensitivity vanishes, so the tangent is exact
        let values = unit_cell_values(2);
        let n = 27;
        let present: Vec<f64> = (0..n)
            .map(|i| if i % 3 == 2 { (i as f64 * 0.37).sin() } else { 0.0 })
            .collect();
        let history = vec![(0..n).map(|i| (i as f64 * 0.11).cos()).collect::<Vec<f64>>()];
        let forcing = vec![Point::<2>::new(0.3, -1.0); values.n_quadrature_points()];
        let p = GlsParameters { degree: 2, ..params() };
        let time = TimeTerms::new(TimeSteppingMethod::Bdf1, &[0.05]).unwrap();

        let eval = |state: &[f64], matrix: bool| {
            let cell = CellInput {
                fe_values: &values,
                measure: 1.0,
                present: state,
                history: &history,
                forcing: &forcing,
            };
            evaluate_cell(&p, &time, &cell, matrix)
        };
        let base = eval(&present, true);
        let jacobian = base.matrix.unwrap();

        let direction: Vec<f64> = (0..n).map(|i| ((i * 7 % 5) as f64 - 2.0) * 0.1).collect();
        let eps = 1e-6;
        let shifted: Vec<f64> = present.iter().zip(&direction).map(|(a, d)| a + eps * d).collect();
        let fd = (eval(&shifted, false).rhs - &base.rhs) / -eps;
        let predicted = &jacobian * DVector::from_vec(direction);
        assert!((fd - &predicted).amax() < 1e-4 * predicted.amax().max(1.0));
    }
}

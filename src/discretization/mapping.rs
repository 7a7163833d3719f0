//! Multilinear (Q1) mapping between the unit cell `[0,1]^DIM` and a physical cell.

use crate::discretization::mesh::Point;
use nalgebra::SMatrix;
use thiserror::Error;

pub type Tensor2<const DIM: usize> = SMatrix<f64, DIM, DIM>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MappingError {
    #[error("point {point:?} could not be mapped back into the unit cell")]
    TransformationFailed { point: Vec<f64> },
    #[error("degenerate cell: jacobian determinant {det:.3e}")]
    DegenerateCell { det: f64 },
}

const MAX_NEWTON_STEPS: usize = 30;

pub fn vertex_shape_value<const DIM: usize>(v: usize, xi: &Point<DIM>) -> f64 {
    (0..DIM)
        .map(|a| if (v >> a) & 1 == 1 { xi[a] } else { 1.0 - xi[a] })
        .product()
}

pub fn vertex_shape_grad<const DIM: usize>(v: usize, xi: &Point<DIM>) -> Point<DIM> {
    Point::<DIM>::from_fn(|b, _| {
        (0..DIM)
            .map(|a| {
                let up = (v >> a) & 1 == 1;
                match (a == b, up) {
                    (true, true) => 1.0,
                    (true, false) => -1.0,
                    (false, true) => xi[a],
                    (false, false) => 1.0 - xi[a],
                }
            })
            .product()
    })
}

/// Second reference derivatives of a vertex shape function. Only mixed terms survive.
pub fn vertex_shape_hessian<const DIM: usize>(v: usize, xi: &Point<DIM>) -> Tensor2<DIM> {
    Tensor2::<DIM>::from_fn(|b, c| {
        if b == c {
            return 0.0;
        }
        (0..DIM)
            .map(|a| {
                let up = (v >> a) & 1 == 1;
                match (a == b || a == c, up) {
                    (true, true) => 1.0,
                    (true, false) => -1.0,
                    (false, true) => xi[a],
                    (false, false) => 1.0 - xi[a],
                }
            })
            .product()
    })
}

pub fn map_to_real<const DIM: usize>(vertices: &[Point<DIM>], xi: &Point<DIM>) -> Point<DIM> {
    vertices
        .iter()
        .enumerate()
        .fold(Point::<DIM>::zeros(), |acc, (v, x)| {
            acc + x * vertex_shape_value(v, xi)
        })
}

/// `J[a][b] = dx_a / dxi_b`.
pub fn jacobian<const DIM: usize>(vertices: &[Point<DIM>], xi: &Point<DIM>) -> Tensor2<DIM> {
    vertices
        .iter()
        .enumerate()
        .fold(Tensor2::<DIM>::zeros(), |acc, (v, x)| {
            acc + x * vertex_shape_grad(v, xi).transpose()
        })
}

/// `d2x_a / dxi_b dxi_c` for every physical component `a`.
pub fn jacobian_grad<const DIM: usize>(vertices: &[Point<DIM>], xi: &Point<DIM>) -> [Tensor2<DIM>; DIM] {
    let mut out = [Tensor2::<DIM>::zeros(); DIM];
    for (v, x) in vertices.iter().enumerate() {
        let h = vertex_shape_hessian(v, xi);
        for (a, slot) in out.iter_mut().enumerate() {
            *slot += h * x[a];
        }
    }
    out
}

pub fn determinant<const DIM: usize>(m: &Tensor2<DIM>) -> f64 {
    match DIM {
        1 => m[(0, 0)],
        2 => m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)],
        3 => {
            m[(0, 0)] * (m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)])
                - m[(0, 1)] * (m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)])
                + m[(0, 2)] * (m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)])
        }
        _ => f64::NAN,
    }
}

/// Inverse through the adjugate; `None` for singular (or unsupported-size) matrices.
pub fn inverse<const DIM: usize>(m: &Tensor2<DIM>) -> Option<Tensor2<DIM>> {
    let det = determinant(m);
    if !det.is_finite() || det.abs() < 1e-300 {
        return None;
    }
    let adj = match DIM {
        1 => Tensor2::<DIM>::from_element(1.0),
        2 => Tensor2::<DIM>::from_fn(|i, j| match (i, j) {
            (0, 0) => m[(1, 1)],
            (0, 1) => -m[(0, 1)],
            (1, 0) => -m[(1, 0)],
            _ => m[(0, 0)],
        }),
        _ => Tensor2::<DIM>::from_fn(|i, j| {
            // adj[i][j] = cofactor[j][i]
            let (r0, r1) = others(j);
            let (c0, c1) = others(i);
            let minor = m[(r0, c0)] * m[(r1, c1)] - m[(r0, c1)] * m[(r1, c0)];
            if (i + j) % 2 == 0 { minor } else { -minor }
        }),
    };
    Some(adj / det)
}

fn others(i: usize) -> (usize, usize) {
    match i {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    }
}

/// Newton inversion of the multilinear map. Fails when the iteration does not
/// settle, which for a convex cell only happens for points far outside it.
pub fn transform_real_to_unit_cell<const DIM: usize>(
    vertices: &[Point<DIM>],
    p: &Point<DIM>,
) -> Result<Point<DIM>, MappingError> {
    let failed = || MappingError::TransformationFailed {
        point: p.iter().copied().collect(),
    };
    let scale = vertices
        .iter()
        .skip(1)
        .map(|v| (v - vertices[0]).norm())
        .fold(0.0, f64::max)
        .max(f64::MIN_POSITIVE);

    let mut xi = Point::<DIM>::repeat(0.5);
    for _ in 0..MAX_NEWTON_STEPS {
        let r = map_to_real(vertices, &xi) - p;
        if r.norm() <= 1e-12 * scale {
            return Ok(xi);
        }
        let inv = inverse(&jacobian(vertices, &xi)).ok_or_else(failed)?;
        xi -= inv * r;
        if xi.iter().any(|c| !c.is_finite() || c.abs() > 1e6) {
            return Err(failed());
        }
    }
    let r = map_to_real(vertices, &xi) - p;
    if r.norm() <= 1e-9 * scale {
        Ok(xi)
    } else {
        Err(failed())
    }
}

/// Infinity-norm distance of a reference point from the unit cell; zero inside.
pub fn distance_to_unit_cell<const DIM: usize>(xi: &Point<DIM>) -> f64 {
    xi.iter()
        .map(|&c| (-c).max(c - 1.0).max(0.0))
        .fold(0.0, f64::max)
}

pub fn project_to_unit_cell<const DIM: usize>(xi: &Point<DIM>) -> Point<DIM> {
    xi.map(|c| c.clamp(0.0, 1.0))
}

pub fn is_inside_unit_cell<const DIM: usize>(xi: &Point<DIM>, tolerance: f64) -> bool {
    distance_to_unit_cell(xi) <= tolerance
}

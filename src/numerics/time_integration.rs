//! Discrete time-derivative coefficients for BDF and SDIRK schemes.

use crate::error::ConfigurationError;
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSteppingMethod {
    Steady,
    Bdf1,
    Bdf2,
    Bdf3,
    Sdirk2,
    #[serde(rename = "sdirk2_1")]
    Sdirk2_1,
    #[serde(rename = "sdirk2_2")]
    Sdirk2_2,
    Sdirk3,
    #[serde(rename = "sdirk3_1")]
    Sdirk3_1,
    #[serde(rename = "sdirk3_2")]
    Sdirk3_2,
    #[serde(rename = "sdirk3_3")]
    Sdirk3_3,
}

impl TimeSteppingMethod {
    pub fn is_steady(self) -> bool {
        self == TimeSteppingMethod::Steady
    }

    pub fn is_sdirk(self) -> bool {
        use TimeSteppingMethod::*;
        matches!(
            self,
            Sdirk2 | Sdirk2_1 | Sdirk2_2 | Sdirk3 | Sdirk3_1 | Sdirk3_2 | Sdirk3_3
        )
    }

    pub fn bdf_order(self) -> Option<usize> {
        match self {
            TimeSteppingMethod::Bdf1 => Some(1),
            TimeSteppingMethod::Bdf2 => Some(2),
            TimeSteppingMethod::Bdf3 => Some(3),
            _ => None,
        }
    }

    /// `(order, stage)` for a single SDIRK stage tag.
    pub fn sdirk_stage(self) -> Option<(usize, usize)> {
        use TimeSteppingMethod::*;
        match self {
            Sdirk2_1 => Some((2, 0)),
            Sdirk2_2 => Some((2, 1)),
            Sdirk3_1 => Some((3, 0)),
            Sdirk3_2 => Some((3, 1)),
            Sdirk3_3 => Some((3, 2)),
            _ => None,
        }
    }

    /// Schemes assembled one after the other to complete a time step.
    pub fn stages(self) -> Vec<TimeSteppingMethod> {
        use TimeSteppingMethod::*;
        match self {
            Sdirk2 => vec![Sdirk2_1, Sdirk2_2],
            Sdirk3 => vec![Sdirk3_1, Sdirk3_2, Sdirk3_3],
            other => vec![other],
        }
    }

    /// Number of previous time levels the scheme reads.
    pub fn history_depth(self) -> usize {
        match self.bdf_order() {
            Some(order) => order,
            None if self.is_steady() => 0,
            None => 1,
        }
    }
}

impl FromStr for TimeSteppingMethod {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use TimeSteppingMethod::*;
        Ok(match s {
            "steady" => Steady,
            "bdf1" => Bdf1,
            "bdf2" => Bdf2,
            "bdf3" => Bdf3,
            "sdirk2" => Sdirk2,
            "sdirk2_1" => Sdirk2_1,
            "sdirk2_2" => Sdirk2_2,
            "sdirk3" => Sdirk3,
            "sdirk3_1" => Sdirk3_1,
            "sdirk3_2" => Sdirk3_2,
            "sdirk3_3" => Sdirk3_3,
            other => return Err(ConfigurationError::UnknownTimeSteppingMethod(other.into())),
        })
    }
}

impl fmt::Display for TimeSteppingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = format!("{self:?}").to_lowercase();
        f.write_str(&s)
    }
}

/// Variable-step BDF weights: `du/dt(t_{n+1}) ~ sum_k c_k u_{n+1-k}`.
///
/// `step_history` holds the most recent step first (`dt_{n+1}, dt_n, ...`).
/// With fewer than `order` entries the order drops to what the history
/// supports; an empty history or a non-positive step is rejected. The weights
/// are the derivatives of the Lagrange basis through the `order + 1` time
/// levels, evaluated at `t_{n+1}`.
pub fn bdf_coefficients(order: usize, step_history: &[f64]) -> Result<DVector<f64>, ConfigurationError> {
    if step_history.is_empty() {
        return Err(ConfigurationError::InvalidParameter {
            name: "step_history",
            reason: "a BDF scheme needs at least one time step".into(),
        });
    }
    let order = order.clamp(1, step_history.len());
    if let Some(dt) = step_history[..order].iter().find(|dt| **dt <= 0.0) {
        return Err(ConfigurationError::InvalidParameter {
            name: "step_history",
            reason: format!("time step {dt} is not positive"),
        });
    }
    let mut times = vec![0.0; order + 1];
    for k in 1..=order {
        times[k] = times[k - 1] - step_history[k - 1];
    }

    Ok(DVector::from_fn(order + 1, |j, _| {
        if j == 0 {
            (1..=order).map(|m| 1.0 / (times[0] - times[m])).sum()
        } else {
            let lead = 1.0 / (times[j] - times[0]);
            (1..=order)
                .filter(|&m| m != j)
                .map(|m| (times[0] - times[m]) / (times[j] - times[m]))
                .product::<f64>()
                * lead
        }
    }))
}

/// Butcher matrix of the L-stable SDIRK schemes.
fn sdirk_butcher(order: usize) -> DMatrix<f64> {
    if order == 2 {
        let alpha = 1.0 - 2f64.sqrt() / 2.0;
        let a = Matrix2::new(alpha, 0.0, 1.0 - alpha, alpha);
        DMatrix::from_iterator(2, 2, a.iter().copied())
    } else {
        let alpha = 0.435_866_521_508_458_999_42;
        let tau2 = (1.0 + alpha) / 2.0;
        let b1 = -(6.0 * alpha * alpha - 16.0 * alpha + 1.0) / 4.0;
        let b2 = (6.0 * alpha * alpha - 20.0 * alpha + 5.0) / 4.0;
        let a = Matrix3::new(
            alpha, 0.0, 0.0, //
            tau2 - alpha, alpha, 0.0, //
            b1, b2, alpha,
        );
        DMatrix::from_iterator(3, 3, a.iter().copied())
    }
}

/// Inverse of a lower triangular matrix with a non-zero diagonal, by forward
/// substitution on the columns of the identity.
fn lower_triangular_inverse(a: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    let mut inv = DMatrix::zeros(n, n);
    for j in 0..n {
        inv[(j, j)] = 1.0 / a[(j, j)];
        for i in j + 1..n {
            let sum: f64 = (j..i).map(|k| a[(i, k)] * inv[(k, j)]).sum();
            inv[(i, j)] = -sum / a[(i, i)];
        }
    }
    inv
}

/// SDIRK stage coefficients. Row `i` forms the time term of stage `i`:
/// column 0 multiplies the stage unknown, column 1 the solution at `t_n` and
/// column `1 + k` the result of stage `k` (`k < i`).
pub fn sdirk_coefficients(order: usize, dt: f64) -> DMatrix<f64> {
    let order = order.clamp(2, 3);
    let inv = lower_triangular_inverse(&sdirk_butcher(order));
    let sdt = 1.0 / dt;

    let mut coefs = DMatrix::zeros(order, order + 1);
    for i in 0..order {
        coefs[(i, 0)] = inv[(i, i)] * sdt;
        coefs[(i, 1)] = -(0..=i).map(|j| inv[(i, j)]).sum::<f64>() * sdt;
        for k in 0..i {
            coefs[(i, 2 + k)] = inv[(i, k)] * sdt;
        }
    }
    coefs
}

/// Weights applied to the history slots `[present, m1, m2, m3]` for one
/// assembly with `method`; empty for steady problems.
pub fn time_derivative_weights(
    method: TimeSteppingMethod,
    step_history: &[f64],
) -> Result<Vec<f64>, ConfigurationError> {
    if let Some(order) = method.bdf_order() {
        return Ok(bdf_coefficients(order, step_history)?.iter().copied().collect());
    }
    if let Some((order, stage)) = method.sdirk_stage() {
        let dt = match step_history.first() {
            Some(&dt) if dt > 0.0 => dt,
            _ => {
                return Err(ConfigurationError::InvalidParameter {
                    name: "step_history",
                    reason: format!("{method} needs a positive current time step"),
                });
            }
        };
        let c = sdirk_coefficients(order, dt);
        return Ok((0..=order).map(|k| c[(stage, k)]).collect());
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn uniform_bdf_weights() {
        let c = bdf_coefficients(2, &[0.1, 0.1]).unwrap();
        assert_relative_eq!(c[0], 1.5 / 0.1, epsilon = 1e-10);
        assert_relative_eq!(c[1], -2.0 / 0.1, epsilon = 1e-10);
        assert_relative_eq!(c[2], 0.5 / 0.1, epsilon = 1e-10);

        let c = bdf_coefficients(3, &[1.0, 1.0, 1.0]).unwrap();
        let expected = [11.0 / 6.0, -3.0, 1.5, -1.0 / 3.0];
        for (a, b) in c.iter().zip(expected) {
            assert_relative_eq!(*a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn variable_step_bdf_is_exact_for_polynomials_of_its_order() {
        let steps = [0.1, 0.25, 0.07];
        for order in 1..=3 {
            let c = bdf_coefficients(order, &steps).unwrap();
            let mut t = vec![1.0];
            for k in 0..order {
                t.push(t[k] - steps[k]);
            }
            // weights annihilate constants
            assert_relative_eq!(c.sum(), 0.0, epsilon = 1e-9);
            for p in 1..=order as i32 {
                let approx: f64 = (0..=order).map(|k| c[k] * t[k].powi(p)).sum();
                let exact = p as f64 * t[0].powi(p - 1);
                assert_relative_eq!(approx, exact, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn sdirk_rows_annihilate_constants() {
        for order in [2, 3] {
            let c = sdirk_coefficients(order, 0.2);
            for i in 0..order {
                let row_sum: f64 = (0..=order).map(|k| c[(i, k)]).sum();
                assert_relative_eq!(row_sum, 0.0, epsilon = 1e-10);
            }
            // singly diagonal
            assert_relative_eq!(c[(0, 0)], c[(order - 1, 0)], epsilon = 1e-12);
        }
    }

    #[test]
    fn sdirk_stage_weights_follow_slot_layout() {
        let w = time_derivative_weights(TimeSteppingMethod::Sdirk2_2, &[0.5]).unwrap();
        let c = sdirk_coefficients(2, 0.5);
        assert_eq!(w.len(), 3);
        assert_relative_eq!(w[2], c[(1, 2)]);
        assert!(time_derivative_weights(TimeSteppingMethod::Steady, &[0.5]).unwrap().is_empty());
        assert!("bdf4".parse::<TimeSteppingMethod>().is_err());
        assert_eq!("sdirk3_2".parse::<TimeSteppingMethod>().unwrap(), TimeSteppingMethod::Sdirk3_2);
    }

    #[test]
    fn empty_step_history_is_rejected() {
        for order in 1..=3 {
            assert!(matches!(
                bdf_coefficients(order, &[]),
                Err(ConfigurationError::InvalidParameter { name: "step_history", .. })
            ));
        }
        assert!(bdf_coefficients(2, &[0.1, 0.0]).is_err());
        assert!(time_derivative_weights(TimeSteppingMethod::Bdf2, &[]).is_err());
        assert!(time_derivative_weights(TimeSteppingMethod::Sdirk3_1, &[]).is_err());
        // a short history lowers the order instead
        assert_eq!(bdf_coefficients(3, &[0.1]).unwrap().len(), 2);
    }

    #[test]
    fn butcher_inverse_is_exact() {
        for order in [2, 3] {
            let a = sdirk_butcher(order);
            let product = lower_triangular_inverse(&a) * &a;
            assert!((product - DMatrix::<f64>::identity(order, order)).amax() < 1e-14);
        }
    }
}

use crate::config::{NonLinearSolverParameters, NonLinearSolverType, Verbosity};
use crate::error::SolverError;
use crate::numerics::krylov::SolveStats;
use crate::numerics::timing::{finalize_and_print, reset_timing};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

/// `(iteration, residual, fraction of initial, step reduction %)`.
pub type HistoryEntry = (usize, f64, f64, f64);

/// The operations a Newton solve needs from the discrete problem. The problem
/// owns `present_solution`, `evaluation_point`, `newton_update`, the system
/// matrix and the right-hand side `-R(evaluation_point)`.
pub trait NonLinearProblem {
    fn n_dofs(&self) -> usize;

    /// Jacobian and rhs at the evaluation point.
    fn assemble_matrix_and_rhs(&mut self, initial_step: bool) -> Result<(), SolverError>;

    fn assemble_rhs(&mut self, initial_step: bool) -> Result<(), SolverError>;

    fn system_rhs_norm(&self) -> f64;

    /// Computes `newton_update`; `matrix_changed` tells the linear solver
    /// whether its preconditioner is still valid.
    fn solve_linear_system(&mut self, initial_step: bool, matrix_changed: bool) -> Result<SolveStats, SolverError>;

    /// `evaluation_point = present_solution`.
    fn reset_evaluation_point(&mut self);

    /// `evaluation_point = present_solution + alpha * newton_update`, with the
    /// boundary values reimposed.
    fn set_trial_evaluation_point(&mut self, alpha: f64);

    /// `present_solution = evaluation_point`.
    fn accept_evaluation_point(&mut self);
}

pub struct NewtonSolver {
    pub params: NonLinearSolverParameters,
    /// Smallest line-search step tried before the iterate is accepted anyway.
    pub min_step_size: f64,
    /// Required residual reduction per accepted step.
    pub sufficient_decrease: f64,
}

#[derive(Debug, Clone)]
pub struct SolverResult {
    pub iterations: usize,
    pub final_residual: f64,
    pub linear_iterations: usize,
    pub jacobian_assemblies: usize,
    pub history: Vec<HistoryEntry>,
}

impl NewtonSolver {
    pub fn new(params: NonLinearSolverParameters) -> Self {
        Self {
            params,
            min_step_size: 1e-3,
            sufficient_decrease: 0.9,
        }
    }

    fn reassemble_jacobian(&self, iteration: usize, previous_reduction: Option<f64>) -> bool {
        match self.params.solver {
            NonLinearSolverType::Newton => true,
            NonLinearSolverType::SkipNewton => iteration % (self.params.skip_iterations + 1) == 0,
            NonLinearSolverType::AdaptativeNewton => previous_reduction.is_none_or(|r| r < 10.0),
        }
    }

    /// Drives `problem` to `params.tolerance`. `is_initial_step` marks the first
    /// solve of a time step: its first iteration imposes the boundary data.
    pub fn solve<P>(&self, problem: &mut P, is_initial_step: bool) -> Result<SolverResult, SolverError>
    where
        P: NonLinearProblem + ?Sized,
    {
        reset_timing();
        let solve_start = Instant::now();

        let logging = self.params.verbosity == Verbosity::Verbose;
        let precision = self.params.display_precision;
        let tolerance = self.params.tolerance;
        let max_iter = self.params.max_iterations;

        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut current_res = f64::MAX;
        let mut last_res = f64::MAX;
        let mut initial_residual = None;
        let mut previous_reduction = None;
        let mut linear_iterations = 0;
        let mut jacobian_assemblies = 0;

        if !is_initial_step {
            problem.reset_evaluation_point();
            problem.assemble_rhs(false)?;
            current_res = problem.system_rhs_norm();
            last_res = current_res;
        }

        if logging {
            println!("{} unknowns \n", problem.n_dofs());
            println!("    Iter   | Residual |  Fraction |  Step % |  Initial");
        }

        let mut first_step = is_initial_step;
        let mut iteration = 0;
        while (first_step || current_res > tolerance) && iteration < max_iter {
            let initial_step = first_step;
            first_step = false;

            problem.reset_evaluation_point();
            let reassemble = iteration == 0 || self.reassemble_jacobian(iteration, previous_reduction);
            if reassemble {
                problem.assemble_matrix_and_rhs(initial_step)?;
                jacobian_assemblies += 1;
            } else {
                problem.assemble_rhs(initial_step)?;
            }
            if iteration == 0 {
                current_res = problem.system_rhs_norm();
                last_res = current_res;
            }
            let init = *initial_residual.get_or_insert(current_res);

            let stats = match problem.solve_linear_system(initial_step, reassemble) {
                Ok(stats) => stats,
                Err(SolverError::SolverDivergence { .. }) if !reassemble => {
                    warn!(iteration, "linear solve diverged on a reused Jacobian, reassembling");
                    problem.assemble_matrix_and_rhs(initial_step)?;
                    jacobian_assemblies += 1;
                    problem.solve_linear_system(initial_step, true)?
                }
                Err(e) => return Err(e),
            };
            linear_iterations += stats.iterations;

            let mut alpha = 1.0;
            loop {
                problem.set_trial_evaluation_point(alpha);
                problem.assemble_rhs(false)?;
                current_res = problem.system_rhs_norm();
                debug!(iteration, alpha, residual = current_res, "line search");
                if current_res < self.sufficient_decrease * last_res || last_res < tolerance {
                    break;
                }
                alpha *= 0.5;
                if alpha <= self.min_step_size {
                    break;
                }
            }
            problem.accept_evaluation_point();

            if !current_res.is_finite() {
                return Err(SolverError::NewtonStall {
                    iterations: iteration + 1,
                    residual: current_res,
                    tolerance,
                });
            }

            let fraction = current_res / init;
            let step_percent = if last_res > 0.0 {
                (last_res - current_res) / last_res * 100.0
            } else {
                0.0
            };
            log_iteration(iteration, max_iter, current_res, fraction, step_percent, init, precision, logging);
            history.push((iteration, current_res, fraction, step_percent));

            previous_reduction = Some(if current_res > 0.0 { last_res / current_res } else { f64::INFINITY });
            last_res = current_res;
            iteration += 1;
        }

        finalize_and_print(solve_start.elapsed());

        if current_res > tolerance {
            return Err(SolverError::NewtonStall {
                iterations: iteration,
                residual: current_res,
                tolerance,
            });
        }

        Ok(SolverResult {
            iterations: iteration,
            final_residual: current_res,
            linear_iterations,
            jacobian_assemblies,
            history,
        })
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn log_iteration(
    i: usize,
    max_iter: usize,
    res_norm: f64,
    fraction: f64,
    step_percent: f64,
    init: f64,
    precision: usize,
    logging: bool,
) {
    if !logging {
        return;
    }
    let p = precision;
    if i == 0 {
        println!(
            "{i:>4} | {res_norm:>8.p$e} | {fraction:>8.p$e} | {step_percent:>6.2}% | {init:>8.p$e}"
        );
    } else {
        print!("\x1B[1F\x1B[2K");
        println!(
            "{i:>4}/{max_iter} | {res_norm:>8.p$e} | {fraction:>9.p$e} | {step_percent:>6.2}% | {init:>8.p$e}"
        );
    }
    io::stdout().flush().ok();
}

pub fn write_hist_to_file<P: AsRef<Path>>(path: P, history: &[HistoryEntry]) -> io::Result<()> {
    let init = history.first().map_or(0.0, |&(_, res, frac, _)| if frac > 0.0 { res / frac } else { 0.0 });
    let mut file = File::create(path)?;
    writeln!(file, "iter,residual,fraction,step_percent,initial")?;
    for &(i, res, frac, step) in history {
        writeln!(file, "{i},{res},{frac},{step},{init}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    /// `F(u) = u^3 + u - b`, solved component by component.
    struct Cubic {
        b: DVector<f64>,
        present: DVector<f64>,
        evaluation: DVector<f64>,
        update: DVector<f64>,
        jacobian: DVector<f64>,
        rhs: DVector<f64>,
        fail_on_reuse: bool,
        assemblies: usize,
    }

    impl Cubic {
        fn new(b: Vec<f64>) -> Self {
            let n = b.len();
            Self {
                b: DVector::from_vec(b),
                present: DVector::zeros(n),
                evaluation: DVector::zeros(n),
                update: DVector::zeros(n),
                jacobian: DVector::zeros(n),
                rhs: DVector::zeros(n),
                fail_on_reuse: false,
                assemblies: 0,
            }
        }
    }

    impl NonLinearProblem for Cubic {
        fn n_dofs(&self) -> usize {
            self.b.len()
        }

        fn assemble_matrix_and_rhs(&mut self, initial_step: bool) -> Result<(), SolverError> {
            self.assemblies += 1;
            self.jacobian = self.evaluation.map(|u| 3.0 * u * u + 1.0);
            self.assemble_rhs(initial_step)
        }

        fn assemble_rhs(&mut self, _initial_step: bool) -> Result<(), SolverError> {
            self.rhs = -(self.evaluation.map(|u| u * u * u + u) - &self.b);
            Ok(())
        }

        fn system_rhs_norm(&self) -> f64 {
            self.rhs.norm()
        }

        fn solve_linear_system(&mut self, _initial_step: bool, matrix_changed: bool) -> Result<SolveStats, SolverError> {
            if self.fail_on_reuse && !matrix_changed {
                return Err(SolverError::SolverDivergence {
                    iterations: 1,
                    residual: 1.0,
                    tolerance: 0.0,
                });
            }
            self.update = self.rhs.component_div(&self.jacobian);
            Ok(SolveStats {
                iterations: 1,
                residual: 0.0,
            })
        }

        fn reset_evaluation_point(&mut self) {
            self.evaluation = self.present.clone();
        }

        fn set_trial_evaluation_point(&mut self, alpha: f64) {
            self.evaluation = &self.present + &self.update * alpha;
        }

        fn accept_evaluation_point(&mut self) {
            self.present = self.evaluation.clone();
        }
    }

    fn params(solver: NonLinearSolverType) -> NonLinearSolverParameters {
        NonLinearSolverParameters {
            solver,
            verbosity: Verbosity::Quiet,
            tolerance: 1e-10,
            max_iterations: 50,
            ..NonLinearSolverParameters::default()
        }
    }

    #[test]
    fn newton_converges_quadratically() {
        let mut problem = Cubic::new(vec![2.0, 10.0, -3.0]);
        let result = NewtonSolver::new(params(NonLinearSolverType::Newton))
            .solve(&mut problem, true)
            .unwrap();
        assert!(result.final_residual < 1e-10);
        assert!(result.iterations <= 12);
        assert!((problem.present[0] - 1.0).abs() < 1e-9);
        assert_eq!(result.jacobian_assemblies, result.iterations);
        assert_eq!(result.history.len(), result.iterations);
    }

    #[test]
    fn jacobian_reuse_variants_assemble_less() {
        for kind in [NonLinearSolverType::SkipNewton, NonLinearSolverType::AdaptativeNewton] {
            let mut problem = Cubic::new(vec![2.0, 10.0, -3.0]);
            let result = NewtonSolver::new(params(kind)).solve(&mut problem, true).unwrap();
            assert!(result.final_residual < 1e-10);
            assert!(result.jacobian_assemblies < result.iterations, "{kind:?}");
        }
    }

    #[test]
    fn iteration_cap_reports_stall() {
        let mut problem = Cubic::new(vec![10.0]);
        let mut p = params(NonLinearSolverType::Newton);
        p.max_iterations = 1;
        let err = NewtonSolver::new(p).solve(&mut problem, true).unwrap_err();
        assert!(matches!(err, SolverError::NewtonStall { iterations: 1, .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn divergence_on_reused_jacobian_triggers_reassembly() {
        let mut problem = Cubic::new(vec![2.0]);
        problem.fail_on_reuse = true;
        let mut p = params(NonLinearSolverType::SkipNewton);
        p.skip_iterations = 3;
        let result = NewtonSolver::new(p).solve(&mut problem, true).unwrap();
        assert_eq!(result.jacobian_assemblies, problem.assemblies);
        assert_eq!(result.jacobian_assemblies, result.iterations);
    }

    #[test]
    fn converged_state_skips_iterations() {
        let mut problem = Cubic::new(vec![2.0]);
        problem.present[0] = 1.0;
        let result = NewtonSolver::new(params(NonLinearSolverType::Newton))
            .solve(&mut problem, false)
            .unwrap();
        assert_eq!(result.iterations, 0);
    }
}

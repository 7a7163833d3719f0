//! Krylov solve of the Newton correction with a cached preconditioner.

use crate::config::{LinearSolverParameters, LinearSolverType, Verbosity};
use crate::error::{ConfigurationError, SolverError};
use crate::numerics::krylov::{KrylovMethod, SolveStats, SolverControl, gmres, kryst_solve};
use crate::numerics::parallel::Communicator;
use crate::numerics::preconditioner::{AmgOptions, AmgPreconditioner, IluOptions, ilu_input};
use crate::numerics::sparse::SparseMatrix;
use crate::numerics::timing::{Phase, record};
use crate::physics::constraints::ConstraintSets;
use kryst::matrix::op::CsrOp;
use kryst::preconditioner::Preconditioner as _;
use kryst::preconditioner::ilu_csr::IluCsr;
use nalgebra::DVector;
use std::sync::Arc;
use tracing::{debug, info};

/// ILU feeds the kryst Krylov solvers; the AMG hierarchy drives the in-house GMRES.
pub enum ActivePreconditioner {
    Ilu(IluCsr),
    Amg(AmgPreconditioner),
}

/// Preconditioner lifecycle. `Stale` holds a factorization of a matrix that
/// has since been reassembled; it is never applied, only replaced.
#[derive(Default)]
pub enum PreconditionerCache {
    #[default]
    Absent,
    Stale(ActivePreconditioner),
    Valid(ActivePreconditioner),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Absent,
    Stale,
    Valid,
}

impl PreconditionerCache {
    pub fn state(&self) -> CacheState {
        match self {
            PreconditionerCache::Absent => CacheState::Absent,
            PreconditionerCache::Stale(_) => CacheState::Stale,
            PreconditionerCache::Valid(_) => CacheState::Valid,
        }
    }

    fn invalidate(&mut self) {
        if let PreconditionerCache::Valid(p) = std::mem::take(self) {
            *self = PreconditionerCache::Stale(p);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SolveRequest {
    /// First Newton iteration of a step: constrain with the nonzero set.
    pub initial_step: bool,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    pub matrix_changed: bool,
}

#[derive(Debug, Clone)]
pub struct LinearSolveOutcome {
    pub update: DVector<f64>,
    pub stats: SolveStats,
    pub preconditioner_rebuilt: bool,
}

pub struct LinearSolveDispatcher {
    params: LinearSolverParameters,
    cache: PreconditionerCache,
    n_rebuilds: usize,
}

impl LinearSolveDispatcher {
    pub fn new(params: LinearSolverParameters) -> Self {
        Self {
            params,
            cache: PreconditionerCache::Absent,
            n_rebuilds: 0,
        }
    }

    /// Resolves a textual solver selection before any factorization happens.
    pub fn from_tag(tag: &str, mut params: LinearSolverParameters) -> Result<Self, ConfigurationError> {
        params.solver = tag.parse()?;
        Ok(Self::new(params))
    }

    pub fn parameters(&self) -> &LinearSolverParameters {
        &self.params
    }

    pub fn cache_state(&self) -> CacheState {
        self.cache.state()
    }

    pub fn n_rebuilds(&self) -> usize {
        self.n_rebuilds
    }

    /// Drops the preconditioner, e.g. after the dof layout changed.
    pub fn reset(&mut self) {
        self.cache = PreconditionerCache::Absent;
    }

    fn ilu_options(&self) -> IluOptions {
        IluOptions {
            fill: self.params.ilu_precond_fill.max(0.0) as usize,
            atol: self.params.ilu_precond_atol,
            rtol: self.params.ilu_precond_rtol,
        }
    }

    fn amg_options(&self) -> AmgOptions {
        AmgOptions {
            n_cycles: self.params.amg_n_cycles.max(1),
            w_cycle: self.params.amg_w_cycles,
            aggregation_threshold: self.params.amg_aggregation_threshold,
            smoother_sweeps: self.params.amg_smoother_sweeps,
            smoother_overlap: self.params.amg_smoother_overlap,
            smoother: IluOptions {
                fill: self.params.amg_precond_ilu_fill.max(0.0) as usize,
                atol: self.params.amg_precond_ilu_atol,
                rtol: self.params.amg_precond_ilu_rtol,
            },
            ..AmgOptions::default()
        }
    }

    fn build(&self, matrix: &SparseMatrix, constant_modes: &[Vec<bool>]) -> Result<ActivePreconditioner, SolverError> {
        Ok(match self.params.solver {
            LinearSolverType::Gmres | LinearSolverType::Bicgstab => {
                let shifted = ilu_input(matrix, self.ilu_options())?;
                let op = CsrOp::new(Arc::new(shifted.to_csr()));
                let mut ilu = IluCsr::new_with_config(Default::default());
                ilu.setup(&op)
                    .map_err(|e| SolverError::LinearSolveFailed(format!("ILU setup failed: {e:?}")))?;
                ActivePreconditioner::Ilu(ilu)
            }
            LinearSolverType::Amg => ActivePreconditioner::Amg(AmgPreconditioner::new(
                matrix,
                self.amg_options(),
                constant_modes,
            )?),
        })
    }

    /// Rebuilds when the matrix changed or nothing is cached. The old handle is
    /// replaced only by a fully built one; a failed build leaves `Absent`.
    fn ensure_preconditioner(
        &mut self,
        matrix: &SparseMatrix,
        constant_modes: &[Vec<bool>],
        matrix_changed: bool,
    ) -> Result<bool, SolverError> {
        if matrix_changed {
            self.cache.invalidate();
        }
        if self.cache.state() == CacheState::Valid {
            return Ok(false);
        }
        self.cache = PreconditionerCache::Absent;
        let built = record(Phase::Preconditioner, || self.build(matrix, constant_modes))?;
        self.cache = PreconditionerCache::Valid(built);
        self.n_rebuilds += 1;
        debug!(solver = ?self.params.solver, rebuilds = self.n_rebuilds, "preconditioner rebuilt");
        Ok(true)
    }

    /// Solves `matrix * du = rhs` to `max(rel * |rhs|, abs)` and distributes
    /// the constraint set selected by `initial_step` into the result.
    pub fn solve(
        &mut self,
        matrix: &SparseMatrix,
        rhs: &DVector<f64>,
        constraints: &ConstraintSets,
        constant_modes: &[Vec<bool>],
        request: SolveRequest,
        comm: &dyn Communicator,
    ) -> Result<LinearSolveOutcome, SolverError> {
        let used = constraints.select(request.initial_step);
        let tolerance = (request.relative_tolerance * rhs.norm()).max(request.absolute_tolerance);
        let control = SolverControl {
            max_iterations: self.params.max_iterations,
            tolerance,
        };

        let rebuilt = self.ensure_preconditioner(matrix, constant_modes, request.matrix_changed)?;
        let restart = self.params.max_krylov_vectors;
        let method = match self.params.solver {
            LinearSolverType::Bicgstab => KrylovMethod::Bicgstab,
            LinearSolverType::Gmres | LinearSolverType::Amg => KrylovMethod::Gmres { restart },
        };
        let PreconditionerCache::Valid(pc) = &mut self.cache else {
            return Err(SolverError::LinearSolveFailed("preconditioner unavailable".into()));
        };

        let mut update = DVector::zeros(rhs.len());
        let universe = comm.universe();
        let stats = record(Phase::LinearSolve, || match pc {
            ActivePreconditioner::Ilu(ilu) => {
                kryst_solve(method, matrix, rhs, &mut update, Some(ilu), control, &universe)
            }
            ActivePreconditioner::Amg(amg) => gmres(matrix, rhs, &mut update, &*amg, control, restart),
        })?;

        if self.params.verbosity == Verbosity::Verbose {
            let p = self.params.residual_precision;
            info!(
                "  -Iterative solver took : {} iterations, residual {:.p$e} (target {:.p$e})",
                stats.iterations, stats.residual, tolerance
            );
        }

        used.distribute(&mut update);
        Ok(LinearSolveOutcome {
            update,
            stats,
            preconditioner_rebuilt: rebuilt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::krylov::tests::convection_diffusion;
    use crate::numerics::parallel::NoComm;
    use crate::physics::constraints::AffineConstraints;

    fn request(matrix_changed: bool) -> SolveRequest {
        SolveRequest {
            initial_step: false,
            absolute_tolerance: 1e-12,
            relative_tolerance: 1e-10,
            matrix_changed,
        }
    }

    fn free_constraints() -> ConstraintSets {
        ConstraintSets::new(AffineConstraints::new(), AffineConstraints::new())
    }

    #[test]
    fn unknown_tag_fails_before_factorization() {
        let err = LinearSolveDispatcher::from_tag("direct", LinearSolverParameters::default())
            .err()
            .unwrap();
        assert_eq!(err, ConfigurationError::UnknownLinearSolver("direct".into()));
    }

    #[test]
    fn preconditioner_is_reused_until_matrix_changes() {
        let a = convection_diffusion(50);
        let b = DVector::from_element(50, 1.0);
        let constraints = free_constraints();
        let mut dispatcher = LinearSolveDispatcher::new(LinearSolverParameters::default());
        assert_eq!(dispatcher.cache_state(), CacheState::Absent);

        let first = dispatcher.solve(&a, &b, &constraints, &[], request(true), &NoComm {}).unwrap();
        assert!(first.preconditioner_rebuilt);
        let second = dispatcher.solve(&a, &b, &constraints, &[], request(false), &NoComm {}).unwrap();
        assert!(!second.preconditioner_rebuilt);
        assert_eq!(dispatcher.n_rebuilds(), 1);
        dispatcher.solve(&a, &b, &constraints, &[], request(true), &NoComm {}).unwrap();
        assert_eq!(dispatcher.n_rebuilds(), 2);
        assert_eq!(dispatcher.cache_state(), CacheState::Valid);
        assert!(a.residual(&b, &second.update).norm() < 1e-9);
    }

    #[test]
    fn every_solver_tag_reaches_tolerance() {
        let a = convection_diffusion(120);
        let b = DVector::from_fn(120, |i, _| (i as f64).cos());
        for tag in ["gmres", "bicgstab", "amg"] {
            let mut d = LinearSolveDispatcher::from_tag(tag, LinearSolverParameters::default()).unwrap();
            let out = d.solve(&a, &b, &free_constraints(), &[], request(true), &NoComm {}).unwrap();
            assert!(a.residual(&b, &out.update).norm() <= 1e-9 * b.norm() + 1e-12, "{tag}");
        }
    }

    #[test]
    fn iteration_cap_surfaces_as_divergence() {
        let a = convection_diffusion(200);
        let b = DVector::from_element(200, 1.0);
        let params = LinearSolverParameters {
            max_iterations: 1,
            ilu_precond_rtol: 2.0,
            ..LinearSolverParameters::default()
        };
        let mut d = LinearSolveDispatcher::new(params);
        let req = SolveRequest {
            absolute_tolerance: 1e-30,
            relative_tolerance: 1e-30,
            ..request(true)
        };
        let err = d.solve(&a, &b, &free_constraints(), &[], req, &NoComm {}).unwrap_err();
        assert!(matches!(err, SolverError::SolverDivergence { .. }));
        assert!(err.is_recoverable());
    }
}

use crate::discretization::mapping::MappingError;
use crate::numerics::krylov::KrylovError;
use crate::numerics::preconditioner::PreconditionerError;
use crate::numerics::sparse::SparseError;
use crate::physics::constraints::ConstraintError;
use thiserror::Error;

/// Invalid or unsupported selections. Raised before any numerical work starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("unknown linear solver '{0}' (expected gmres, bicgstab or amg)")]
    UnknownLinearSolver(String),
    #[error("unknown initial condition '{0}' (expected restart, L2projection, nodal or viscous)")]
    UnknownInitialCondition(String),
    #[error("unknown time stepping method '{0}'")]
    UnknownTimeSteppingMethod(String),
    #[error("unknown non-linear solver '{0}'")]
    UnknownNonLinearSolver(String),
    #[error("unknown {kind} '{tag}'")]
    UnknownTag { kind: &'static str, tag: String },
    #[error("velocity order {velocity} and pressure order {pressure} must be equal and in 1..=2")]
    UnsupportedElementOrder { velocity: usize, pressure: usize },
    #[error("invalid immersed boundary: {0}")]
    ImmersedBoundary(String),
    #[error("checkpoint holds {found} dofs but the current dof handler has {expected}")]
    CheckpointSize { expected: usize, found: usize },
    #[error("restart requested but no checkpoint source was provided")]
    MissingCheckpoint,
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("linear solver diverged after {iterations} iterations (residual {residual:.3e}, target {tolerance:.3e})")]
    SolverDivergence {
        iterations: usize,
        residual: f64,
        tolerance: f64,
    },
    #[error("Newton stalled after {iterations} iterations (residual {residual:.3e}, target {tolerance:.3e})")]
    NewtonStall {
        iterations: usize,
        residual: f64,
        tolerance: f64,
    },
    #[error("linear solve failed: {0}")]
    LinearSolveFailed(String),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Sparse(#[from] SparseError),
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
}

impl From<KrylovError> for SolverError {
    fn from(e: KrylovError) -> Self {
        match e {
            KrylovError::NotConverged {
                iterations,
                residual,
                tolerance,
            } => SolverError::SolverDivergence {
                iterations,
                residual,
                tolerance,
            },
            other => SolverError::LinearSolveFailed(other.to_string()),
        }
    }
}

impl From<PreconditionerError> for SolverError {
    fn from(e: PreconditionerError) -> Self {
        SolverError::LinearSolveFailed(e.to_string())
    }
}

impl SolverError {
    /// Failures the time loop may answer by shrinking the step.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SolverError::SolverDivergence { .. } | SolverError::NewtonStall { .. }
        )
    }
}

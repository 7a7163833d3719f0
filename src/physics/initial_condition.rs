//! Initial states: checkpoints, nodal interpolation and L2 projection.
//!
//! The viscous start-up needs the full Newton machinery and lives in
//! `NavierStokesSolver::set_initial_condition`.

use crate::config::{LinearSolverParameters, LinearSolverType, Verbosity};
use crate::discretization::dof_handler::DofHandler;
use crate::discretization::mesh::Mesh;
use crate::error::{ConfigurationError, SolverError};
use crate::numerics::linear_solver::{LinearSolveDispatcher, SolveRequest};
use crate::numerics::parallel::Communicator;
use crate::numerics::sparse::SparseMatrix;
use crate::physics::assembler::{GlobalAssembler, make_sparsity_pattern};
use crate::physics::bc::VectorFunction;
use crate::physics::constraints::ConstraintSets;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Everything needed to resume a run at a saved time level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub time: f64,
    pub iteration: usize,
    /// Most recent step first.
    pub step_history: Vec<f64>,
    pub present: Vec<f64>,
    /// `[m1, m2, m3]`.
    pub history: Vec<Vec<f64>>,
}

impl Checkpoint {
    /// Checks the stored vectors against the current dof layout.
    pub fn validate(&self, n_dofs: usize) -> Result<(), ConfigurationError> {
        for v in std::iter::once(&self.present).chain(&self.history) {
            if v.len() != n_dofs {
                return Err(ConfigurationError::CheckpointSize {
                    expected: n_dofs,
                    found: v.len(),
                });
            }
        }
        Ok(())
    }
}

/// Where checkpoints come from. Storage formats are up to the implementor.
pub trait CheckpointSource {
    fn load(&self) -> Result<Checkpoint, ConfigurationError>;
}

impl CheckpointSource for Checkpoint {
    fn load(&self) -> Result<Checkpoint, ConfigurationError> {
        Ok(self.clone())
    }
}

/// Interpolates the `DIM + 1` components of `function` at the support points
/// and imposes the boundary data.
pub fn interpolate_nodal<const DIM: usize>(
    dofs: &DofHandler<DIM>,
    function: &VectorFunction<DIM>,
    constraints: &ConstraintSets,
) -> DVector<f64> {
    let mut v = DVector::from_fn(dofs.n_dofs(), |dof, _| {
        let comp = dofs.component_of(dof);
        if comp < function.components.len() {
            function.value(comp, dofs.support_point(dof), 0.0)
        } else {
            0.0
        }
    });
    constraints.nonzero.distribute(&mut v);
    v
}

/// Mass-matrix projection of `function` onto every component, with the
/// boundary data imposed through the nonzero constraints.
pub fn l2_projection<const DIM: usize>(
    mesh: &Mesh<DIM>,
    dofs: &DofHandler<DIM>,
    assembler: &GlobalAssembler<DIM>,
    function: &VectorFunction<DIM>,
    constraints: &ConstraintSets,
    comm: &dyn Communicator,
    rank: usize,
) -> Result<DVector<f64>, SolverError> {
    let pattern = make_sparsity_pattern(mesh, dofs, &constraints.nonzero, None);
    let mut matrix = SparseMatrix::from_pattern(&pattern);
    let mut rhs = DVector::zeros(dofs.n_dofs());

    for cell in mesh.locally_owned_cells(rank) {
        let values = assembler.fe_values(mesh, cell.id)?;
        let cell_dofs = dofs.cell_dofs(cell.id);
        let n = cell_dofs.len();
        let mut local_matrix = DMatrix::zeros(n, n);
        let mut local_rhs = DVector::zeros(n);
        for (q, shape) in values.shape.iter().enumerate() {
            let jxw = values.jxw[q];
            let x = &values.points[q];
            for i in 0..n {
                let (ci, ni) = (i % (DIM + 1), i / (DIM + 1));
                let phi_i = shape[ni].value;
                if ci < function.components.len() {
                    local_rhs[i] += function.value(ci, x, 0.0) * phi_i * jxw;
                }
                for j in (ci..n).step_by(DIM + 1) {
                    local_matrix[(i, j)] += phi_i * shape[j / (DIM + 1)].value * jxw;
                }
            }
        }
        constraints
            .nonzero
            .distribute_local_to_global(&local_matrix, &local_rhs, &cell_dofs, &mut matrix, &mut rhs)?;
    }
    comm.compress_matrix(&mut matrix);
    comm.compress_vector(&mut rhs);

    let mut dispatcher = LinearSolveDispatcher::new(LinearSolverParameters {
        solver: LinearSolverType::Gmres,
        verbosity: Verbosity::Quiet,
        ..LinearSolverParameters::default()
    });
    let outcome = dispatcher.solve(
        &matrix,
        &rhs,
        constraints,
        &[],
        SolveRequest {
            initial_step: true,
            absolute_tolerance: 1e-14,
            relative_tolerance: 1e-12,
            matrix_changed: true,
        },
        comm,
    )?;
    Ok(outcome.update)
}

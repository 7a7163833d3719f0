//! Global assembly of the Jacobian and residual.
//!
//! Cells are evaluated in parallel with rayon; the scatter through the
//! constraints stays serial so the accumulation order is fixed.

use crate::discretization::dof_handler::DofHandler;
use crate::discretization::fe::{FeSystem, FeValues, ShapeTable};
use crate::discretization::mapping::MappingError;
use crate::discretization::mesh::{Mesh, Point};
use crate::discretization::quadrature::QGauss;
use crate::error::SolverError;
use crate::numerics::parallel::Communicator;
use crate::numerics::sparse::{SparseMatrix, SparsityPattern};
use crate::numerics::timing::{Phase, record};
use crate::physics::bc::VectorFunction;
use crate::physics::constraints::AffineConstraints;
use crate::physics::immersed::ImmersedBoundary;
use crate::physics::weak_form::{CellInput, GlsParameters, LocalSystem, TimeTerms, evaluate_cell};
use nalgebra::DVector;
use rayon::prelude::*;

/// Cells evaluated per parallel batch; bounds the memory held by local systems.
const CELL_BATCH: usize = 512;

/// Coefficients of `v` on `dofs`.
pub fn gather(v: &DVector<f64>, dofs: &[usize]) -> Vec<f64> {
    dofs.iter().map(|&d| v[d]).collect()
}

/// Couplings of every cell folded through `constraints`, plus the immersed
/// boundary stencils when present.
pub fn make_sparsity_pattern<const DIM: usize>(
    mesh: &Mesh<DIM>,
    dofs: &DofHandler<DIM>,
    constraints: &AffineConstraints,
    immersed: Option<&ImmersedBoundary<DIM>>,
) -> SparsityPattern {
    let mut pattern = SparsityPattern::new(dofs.n_dofs());
    for cell in &mesh.cells {
        constraints.add_cell_couplings(&mut pattern, &dofs.cell_dofs(cell.id));
    }
    if let Some(ib) = immersed {
        ib.add_sparsity_couplings(&mut pattern);
    }
    pattern
}

/// State one assembly pass reads.
pub struct AssemblyInput<'a, const DIM: usize> {
    pub mesh: &'a Mesh<DIM>,
    pub dofs: &'a DofHandler<DIM>,
    pub constraints: &'a AffineConstraints,
    pub gls: GlsParameters,
    pub time: &'a TimeTerms,
    pub evaluation: &'a DVector<f64>,
    /// `[m1, m2, m3]`, as many as the scheme reads.
    pub history: &'a [DVector<f64>],
    pub forcing: Option<&'a VectorFunction<DIM>>,
    pub time_value: f64,
    pub rank: usize,
}

/// Quadrature and reference shape data shared by every cell.
#[derive(Debug, Clone)]
pub struct GlobalAssembler<const DIM: usize> {
    quadrature: QGauss<DIM>,
    table: ShapeTable<DIM>,
}

impl<const DIM: usize> GlobalAssembler<DIM> {
    pub fn new(fe: &FeSystem<DIM>, n_quadrature_points: usize) -> Self {
        let quadrature = QGauss::new(n_quadrature_points);
        let table = fe.tabulate(&quadrature);
        Self { quadrature, table }
    }

    pub fn quadrature(&self) -> &QGauss<DIM> {
        &self.quadrature
    }

    pub fn fe_values(&self, mesh: &Mesh<DIM>, cell: usize) -> Result<FeValues<DIM>, MappingError> {
        FeValues::reinit(&self.table, &self.quadrature, &mesh.cell_vertices(cell))
    }

    /// `with_matrix` asks for the local Jacobian; it is also evaluated when the
    /// constraints fold an inhomogeneity out of this cell or the cell reaches
    /// one of the `diagonal_rows`.
    fn local_system(
        &self,
        input: &AssemblyInput<'_, DIM>,
        cell: usize,
        with_matrix: bool,
        diagonal_rows: Option<&[bool]>,
    ) -> Result<(Vec<usize>, LocalSystem), MappingError> {
        let fe_values = self.fe_values(input.mesh, cell)?;
        let dofs = input.dofs.cell_dofs(cell);
        let assemble_matrix = with_matrix
            || input.constraints.needs_local_matrix(&dofs)
            || diagonal_rows.is_some_and(|rows| input.constraints.reaches_any(&dofs, rows));
        let present = gather(input.evaluation, &dofs);
        let n_history = input.time.weights.len().saturating_sub(1);
        let history: Vec<Vec<f64>> = input
            .history
            .iter()
            .take(n_history)
            .map(|v| gather(v, &dofs))
            .collect();
        let forcing: Vec<Point<DIM>> = match input.forcing {
            Some(f) => fe_values.points.iter().map(|p| f.vector(p, input.time_value)).collect(),
            None => Vec::new(),
        };
        let local = evaluate_cell(
            &input.gls,
            input.time,
            &CellInput {
                fe_values: &fe_values,
                measure: input.mesh.measure(cell),
                present: &present,
                history: &history,
                forcing: &forcing,
            },
            assemble_matrix,
        );
        Ok((dofs, local))
    }

    /// Zeroes and assembles `rhs` (and `matrix` when given) over the locally
    /// owned cells. The immersed boundary rows are rewritten after the
    /// distributed compress: with a matrix, the Jacobian rows are replaced;
    /// without one, only the residual rows, scaled by the diagonal this pass
    /// accumulates for them.
    pub fn assemble(
        &self,
        input: &AssemblyInput<'_, DIM>,
        mut matrix: Option<&mut SparseMatrix>,
        rhs: &mut DVector<f64>,
        immersed: Option<&mut ImmersedBoundary<DIM>>,
        comm: &dyn Communicator,
    ) -> Result<(), SolverError> {
        let assemble_matrix = matrix.is_some();
        let cells: Vec<usize> = input.mesh.locally_owned_cells(input.rank).map(|c| c.id).collect();
        let diagonal_rows = match &immersed {
            Some(ib) if !assemble_matrix => Some(ib.row_mask(rhs.len())),
            _ => None,
        };
        let mut stencil_diagonal = DVector::zeros(rhs.len());

        record(Phase::Assembly, || -> Result<(), SolverError> {
            if let Some(m) = matrix.as_deref_mut() {
                m.zero();
            }
            rhs.fill(0.0);

            for batch in cells.chunks(CELL_BATCH) {
                let locals = batch
                    .par_iter()
                    .map(|&cell| self.local_system(input, cell, assemble_matrix, diagonal_rows.as_deref()))
                    .collect::<Result<Vec<_>, MappingError>>()?;

                for (dofs, local) in &locals {
                    match (matrix.as_deref_mut(), &local.matrix) {
                        (Some(m), Some(local_matrix)) => {
                            input
                                .constraints
                                .distribute_local_to_global(local_matrix, &local.rhs, dofs, m, rhs)?;
                        }
                        (_, local_matrix) => {
                            input
                                .constraints
                                .distribute_local_rhs(local_matrix.as_ref(), &local.rhs, dofs, rhs)?;
                            if let (Some(rows), Some(k)) = (&diagonal_rows, local_matrix) {
                                input
                                    .constraints
                                    .distribute_local_diagonal(k, dofs, rows, &mut stencil_diagonal);
                            }
                        }
                    }
                }
            }
            Ok(())
        })?;

        if let Some(m) = matrix.as_deref_mut() {
            comm.compress_matrix(m);
        }
        comm.compress_vector(rhs);

        if let Some(ib) = immersed {
            record(Phase::ImmersedBoundary, || match matrix {
                Some(m) => ib.apply_to_system(m, rhs, input.evaluation),
                None => {
                    comm.compress_vector(&mut stencil_diagonal);
                    ib.apply_to_rhs(rhs, input.evaluation, &stencil_diagonal);
                    Ok(())
                }
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::generator::hyper_cube;
    use crate::numerics::parallel::NoComm;
    use crate::numerics::time_integration::TimeSteppingMethod;

    struct Fixture {
        mesh: Mesh<2>,
        dofs: DofHandler<2>,
        assembler: GlobalAssembler<2>,
        constraints: AffineConstraints,
        state: DVector<f64>,
    }

    fn fixture() -> Fixture {
        let mesh = hyper_cube::<2>(4, 0.0, 1.0, true);
        let fe = FeSystem::<2>::new(1);
        let dofs = DofHandler::distribute(&mesh, &fe);
        let mut constraints = AffineConstraints::new();
        for node in dofs.boundary_nodes(&mesh, &fe, 0) {
            constraints.constrain_value(dofs.dof(node, 0), 0.0);
        }
        constraints.close().unwrap();
        let state = DVector::from_fn(dofs.n_dofs(), |i, _| ((i * 13 % 7) as f64 - 3.0) * 0.1);
        Fixture {
            assembler: GlobalAssembler::new(&fe, 2),
            mesh,
            dofs,
            constraints,
            state,
        }
    }

    fn input<'a>(f: &'a Fixture, time: &'a TimeTerms, history: &'a [DVector<f64>]) -> AssemblyInput<'a, 2> {
        AssemblyInput {
            mesh: &f.mesh,
            dofs: &f.dofs,
            constraints: &f.constraints,
            gls: GlsParameters {
                viscosity: 0.05,
                velocity_scale: 1.0,
                supg: true,
                degree: 1,
            },
            time,
            evaluation: &f.state,
            history,
            forcing: None,
            time_value: 0.0,
            rank: 0,
        }
    }

    #[test]
    fn residual_only_pass_matches_full_assembly() {
        let f = fixture();
        let time = TimeTerms::new(TimeSteppingMethod::Bdf1, &[0.1]).unwrap();
        let history = vec![f.state.map(|v| 0.5 * v)];
        let input = input(&f, &time, &history);
        let pattern = make_sparsity_pattern(&f.mesh, &f.dofs, &f.constraints, None);
        let mut matrix = SparseMatrix::from_pattern(&pattern);

        let mut rhs_only = DVector::zeros(f.dofs.n_dofs());
        f.assembler.assemble(&input, None, &mut rhs_only, None, &NoComm {}).unwrap();
        let mut rhs_full = DVector::zeros(f.dofs.n_dofs());
        f.assembler
            .assemble(&input, Some(&mut matrix), &mut rhs_full, None, &NoComm {})
            .unwrap();

        assert!((rhs_only - &rhs_full).amax() < 1e-12 * rhs_full.amax().max(1.0));
        assert!(matrix.frobenius_norm() > 0.0);
    }

    #[test]
    fn constrained_rows_are_decoupled() {
        let f = fixture();
        let time = TimeTerms::default();
        let input = input(&f, &time, &[]);
        let pattern = make_sparsity_pattern(&f.mesh, &f.dofs, &f.constraints, None);
        let mut matrix = SparseMatrix::from_pattern(&pattern);
        let mut rhs = DVector::zeros(f.dofs.n_dofs());
        f.assembler
            .assemble(&input, Some(&mut matrix), &mut rhs, None, &NoComm {})
            .unwrap();
        for dof in f.constraints.constrained_dofs() {
            assert_eq!(rhs[dof], 0.0);
            assert!(matrix.diagonal(dof) > 0.0);
            let off: f64 = matrix
                .row_cols(dof)
                .iter()
                .zip(matrix.row_values(dof))
                .filter(|(c, _)| **c != dof)
                .map(|(_, v)| v.abs())
                .sum();
            assert_eq!(off, 0.0);
        }
    }
}

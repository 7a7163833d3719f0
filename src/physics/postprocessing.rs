//! Derived quantities of a converged state.

use crate::discretization::dof_handler::DofHandler;
use crate::discretization::fe::FeSystem;
use crate::discretization::mapping::{MappingError, is_inside_unit_cell, transform_real_to_unit_cell};
use crate::discretization::mesh::{Mesh, Point};
use crate::numerics::parallel::Communicator;
use crate::physics::assembler::{GlobalAssembler, gather};
use crate::physics::weak_form::{PointFields, cell_size, velocity_at};
use nalgebra::DVector;

/// Sums `f` over every quadrature point of the owned cells, together with
/// the owned volume, both reduced over all ranks.
fn integrate<const DIM: usize, F>(
    mesh: &Mesh<DIM>,
    dofs: &DofHandler<DIM>,
    assembler: &GlobalAssembler<DIM>,
    solution: &DVector<f64>,
    comm: &dyn Communicator,
    f: F,
) -> Result<(f64, f64), MappingError>
where
    F: Fn(&PointFields<DIM>) -> f64,
{
    let mut integral = 0.0;
    let mut volume = 0.0;
    for cell in mesh.locally_owned_cells(comm.rank()) {
        let values = assembler.fe_values(mesh, cell.id)?;
        let local = gather(solution, &dofs.cell_dofs(cell.id));
        for (shape, jxw) in values.shape.iter().zip(&values.jxw) {
            integral += f(&PointFields::interpolate(shape, &local)) * jxw;
            volume += jxw;
        }
    }
    Ok((comm.sum(integral), comm.sum(volume)))
}

/// `max |u| dt / h` over the quadrature points of every cell.
pub fn calculate_cfl<const DIM: usize>(
    mesh: &Mesh<DIM>,
    dofs: &DofHandler<DIM>,
    assembler: &GlobalAssembler<DIM>,
    degree: usize,
    solution: &DVector<f64>,
    dt: f64,
    comm: &dyn Communicator,
) -> Result<f64, MappingError> {
    let mut cfl: f64 = 0.0;
    for cell in mesh.locally_owned_cells(comm.rank()) {
        let values = assembler.fe_values(mesh, cell.id)?;
        let local = gather(solution, &dofs.cell_dofs(cell.id));
        let h = cell_size::<DIM>(mesh.measure(cell.id), degree);
        for shape in &values.shape {
            cfl = cfl.max(velocity_at(shape, &local).norm() * dt / h);
        }
    }
    Ok(comm.max(cfl))
}

/// `0.5 * integral(|u|^2) / V`.
pub fn average_kinetic_energy<const DIM: usize>(
    mesh: &Mesh<DIM>,
    dofs: &DofHandler<DIM>,
    assembler: &GlobalAssembler<DIM>,
    solution: &DVector<f64>,
    comm: &dyn Communicator,
) -> Result<f64, MappingError> {
    let (energy, volume) = integrate(mesh, dofs, assembler, solution, comm, |f| {
        0.5 * f.velocity.norm_squared()
    })?;
    Ok(if volume > 0.0 { energy / volume } else { 0.0 })
}

/// `0.5 * integral(|curl u|^2) / V`.
pub fn average_enstrophy<const DIM: usize>(
    mesh: &Mesh<DIM>,
    dofs: &DofHandler<DIM>,
    assembler: &GlobalAssembler<DIM>,
    solution: &DVector<f64>,
    comm: &dyn Communicator,
) -> Result<f64, MappingError> {
    let (enstrophy, volume) = integrate(mesh, dofs, assembler, solution, comm, |f| {
        0.5 * f.vorticity().iter().map(|w| w * w).sum::<f64>()
    })?;
    Ok(if volume > 0.0 { enstrophy / volume } else { 0.0 })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointSample<const DIM: usize> {
    pub cell: usize,
    pub velocity: Point<DIM>,
    pub pressure: f64,
}

/// Velocity and pressure at `p`, from the first cell containing it. `None`
/// when no cell of the mesh does.
pub fn evaluate_at_point<const DIM: usize>(
    mesh: &Mesh<DIM>,
    fe: &FeSystem<DIM>,
    dofs: &DofHandler<DIM>,
    solution: &DVector<f64>,
    p: &Point<DIM>,
) -> Option<PointSample<DIM>> {
    mesh.cells.iter().find_map(|cell| {
        let xi = transform_real_to_unit_cell(&mesh.cell_vertices(cell.id), p).ok()?;
        if !is_inside_unit_cell(&xi, 1e-10) {
            return None;
        }
        let mut velocity = Point::zeros();
        let mut pressure = 0.0;
        for (node_local, &node) in dofs.cell_nodes(cell.id).iter().enumerate() {
            let phi = fe.shape_value(node_local, &xi);
            for c in 0..DIM {
                velocity[c] += solution[dofs.dof(node, c)] * phi;
            }
            pressure += solution[dofs.dof(node, DIM)] * phi;
        }
        Some(PointSample {
            cell: cell.id,
            velocity,
            pressure,
        })
    })
}

#![allow(dead_code)]

use glsns_rs::config::{NavierStokesParameters, Verbosity};
use glsns_rs::discretization::mesh::Point;
use glsns_rs::numerics::time_integration::TimeSteppingMethod;
use glsns_rs::physics::bc::{BoundaryCondition, BoundaryConditions, PressureReference, VectorFunction};

pub fn quiet_parameters(method: TimeSteppingMethod, viscosity: f64) -> NavierStokesParameters {
    let mut p = NavierStokesParameters::default();
    p.simulation_control.method = method;
    p.physical_properties.viscosity = viscosity;
    p.non_linear_solver.verbosity = Verbosity::Quiet;
    p.non_linear_solver.tolerance = 1e-10;
    p.non_linear_solver.max_iterations = 20;
    p.linear_solver.relative_residual = 1e-12;
    p.linear_solver.minimum_residual = 1e-13;
    p.linear_solver.max_iterations = 3000;
    p.linear_solver.max_krylov_vectors = 200;
    p
}

/// No-slip on boundaries 0-2, unit lid velocity on boundary 3, pressure
/// pinned at the center of the unit square.
pub fn cavity_conditions() -> BoundaryConditions<2> {
    let mut bcs = BoundaryConditions::new();
    for id in 0..3 {
        bcs.add(id, BoundaryCondition::NoSlip);
    }
    bcs.add(3, BoundaryCondition::Function(VectorFunction::constant([1.0, 0.0])));
    bcs.pressure_reference = Some(PressureReference {
        point: Point::<2>::new(0.5, 0.5),
        value: 0.0,
    });
    bcs
}

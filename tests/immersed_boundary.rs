mod common;

use common::quiet_parameters;
use glsns_rs::config::NavierStokesParameters;
use glsns_rs::discretization::generator::hyper_cube;
use glsns_rs::discretization::mesh::Point;
use glsns_rs::numerics::time_integration::TimeSteppingMethod;
use glsns_rs::physics::bc::{BoundaryCondition, BoundaryConditions, PressureReference};
use glsns_rs::physics::navier_stokes::NavierStokesSolver;
use nalgebra::DVector;
use std::collections::BTreeSet;

fn walls(pressure_point: Point<2>) -> BoundaryConditions<2> {
    let mut bcs = BoundaryConditions::new();
    for id in 0..4 {
        bcs.add(id, BoundaryCondition::NoSlip);
    }
    bcs.pressure_reference = Some(PressureReference {
        point: pressure_point,
        value: 0.0,
    });
    bcs
}

fn with_cylinder(mut params: NavierStokesParameters, couette: bool) -> NavierStokesParameters {
    let ib = &mut params.immersed_boundary;
    ib.enabled = true;
    ib.center = vec![0.0, 0.0];
    ib.inner_radius = 0.25;
    ib.outer_radius = 0.8;
    ib.couette = couette;
    ib.tangential_speed = 1.0;
    params
}

#[test]
fn rewrite_leaves_uncut_rows_untouched() {
    let base = quiet_parameters(TimeSteppingMethod::Steady, 0.1);
    let mesh = hyper_cube::<2>(12, -1.0, 1.0, true);
    let origin = Point::<2>::new(0.5, 0.0);

    let mut plain = NavierStokesSolver::new(base.clone(), mesh.clone(), walls(origin)).unwrap();
    let mut cut = NavierStokesSolver::new(with_cylinder(base, false), mesh, walls(origin)).unwrap();

    let n = plain.dofs().n_dofs();
    let state = DVector::from_fn(n, |i, _| ((i * 13) % 17) as f64 / 17.0 - 0.5);
    plain.set_solution(state.clone());
    cut.set_solution(state);
    plain.assemble_system(true, false).unwrap();
    cut.assemble_system(true, false).unwrap();

    let ib = cut.immersed_boundary().unwrap();
    assert!(ib.report().cut_cells > 0);
    let rewritten: BTreeSet<usize> = ib.rows().iter().map(|r| r.dof).collect();
    assert_eq!(rewritten.len(), ib.rows().len(), "a dof was rewritten twice");

    let (a, b) = (plain.system_matrix(), cut.system_matrix());
    for row in 0..n {
        if rewritten.contains(&row) {
            continue;
        }
        for (&col, &value) in a.row_cols(row).iter().zip(a.row_values(row)) {
            assert_eq!(b.get(row, col), value, "entry ({row}, {col})");
        }
        assert_eq!(plain.system_rhs()[row], cut.system_rhs()[row]);
    }

    // stencil rows no longer carry their assembled couplings
    for r in ib.rows() {
        let stencil: BTreeSet<usize> = r.coefficients.iter().map(|&(c, _)| c).collect();
        for (&col, &value) in b.row_cols(r.dof).iter().zip(b.row_values(r.dof)) {
            if !stencil.contains(&col) {
                assert_eq!(value, 0.0, "row {} keeps column {col}", r.dof);
            }
        }
    }
}

/// Steady flow between a rotating inner cylinder and a fixed outer one:
/// `u_theta(r) = A r + B / r` with `u_theta(r1) = 1` and `u_theta(r2) = 0`.
#[test]
fn couette_profile_is_recovered() {
    let (r1, r2) = (0.25, 0.8);
    let a = r1 / (r1 * r1 - r2 * r2);
    let b = -a * r2 * r2;
    let exact = |r: f64| a * r + b / r;

    let params = with_cylinder(quiet_parameters(TimeSteppingMethod::Steady, 1.0), true);
    let mesh = hyper_cube::<2>(32, -1.0, 1.0, true);
    let mut solver = NavierStokesSolver::new(params, mesh, walls(Point::<2>::new(0.5, 0.0))).unwrap();
    assert!(solver.immersed_boundary().unwrap().report().cut_cells > 0);

    solver.initialize(None).unwrap();
    let reports = solver.solve().unwrap();
    assert!(reports[0].final_residual < 1e-8);

    for r in [0.4, 0.5, 0.6] {
        for k in 0..8 {
            let theta = k as f64 * std::f64::consts::FRAC_PI_4 + 0.1;
            let (s, c) = theta.sin_cos();
            let sample = solver.evaluate_at(&Point::<2>::new(r * c, r * s)).unwrap();
            let u_theta = -sample.velocity[0] * s + sample.velocity[1] * c;
            let u_r = sample.velocity[0] * c + sample.velocity[1] * s;
            assert!(
                (u_theta - exact(r)).abs() < 0.06,
                "r = {r}, theta = {theta}: {u_theta} vs {}",
                exact(r)
            );
            assert!(u_r.abs() < 0.06, "radial leak {u_r} at r = {r}");
        }
    }
}

use glsns_rs::config::{ContactForceModel, DemParameters, InsertionMethod, InsertionParameters, IntegrationMethod};
use glsns_rs::dem::solver::DemSolver;
use glsns_rs::discretization::generator::hyper_cube;

fn hopper(model: ContactForceModel, integration: IntegrationMethod) -> DemParameters {
    DemParameters {
        dt: 1e-5,
        n_steps: 20_000,
        gravity: vec![0.0, -9.81],
        insertion: InsertionParameters {
            method: InsertionMethod::NonUniform,
            n_particles: 40,
            inserted_per_step: 20,
            insertion_frequency: 10_000,
            box_min: vec![0.01, 0.05],
            box_max: vec![0.09, 0.09],
            ..InsertionParameters::default()
        },
        contact_force: model,
        integration,
        contact_detection_frequency: 2,
        output_frequency: 10_000,
        ..DemParameters::default()
    }
}

/// Gravitational plus kinetic energy of every particle.
fn mechanical_energy(solver: &DemSolver<2>) -> f64 {
    solver
        .particles()
        .iter()
        .map(|p| p.kinetic_energy() + p.mass * 9.81 * p.position[1])
        .sum()
}

#[test]
fn particles_stay_in_the_container_and_lose_energy() {
    for (model, integration) in [
        (ContactForceModel::Linear, IntegrationMethod::VelocityVerlet),
        (ContactForceModel::Nonlinear, IntegrationMethod::ExplicitEuler),
    ] {
        let mut solver = DemSolver::<2>::new(hopper(model, integration), hyper_cube::<2>(10, 0.0, 0.1, true)).unwrap();
        // first batch only
        for _ in 0..10_000 {
            solver.step();
        }
        assert_eq!(solver.particles().len(), 20);
        let first_batch: f64 = solver
            .particles()
            .iter()
            .map(|p| p.mass * 9.81 * 0.07)
            .sum();
        assert!(mechanical_energy(&solver) < first_batch);

        let report = solver.solve();
        assert_eq!(report.n_particles, 40, "{model:?} lost particles");
        assert_eq!(report.steps, 30_000);
        for p in solver.particles() {
            let r = p.radius();
            assert!(p.position.iter().all(|&x| x > 0.5 * r && x < 0.1 - 0.5 * r), "{:?}", p.position);
        }
        let released: f64 = solver.particles().iter().map(|p| p.mass * 9.81 * 0.07).sum();
        assert!(mechanical_energy(&solver) < released);
    }
}

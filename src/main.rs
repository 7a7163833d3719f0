use glsns_rs::config::{DemParameters, InsertionParameters, NavierStokesParameters};
use glsns_rs::dem::solver::DemSolver;
use glsns_rs::discretization::generator::hyper_cube;
use glsns_rs::discretization::mesh::Point;
use glsns_rs::numerics::solver::write_hist_to_file;
use glsns_rs::numerics::time_integration::TimeSteppingMethod;
use glsns_rs::physics::bc::{BoundaryCondition, BoundaryConditions, PressureReference, VectorFunction};
use glsns_rs::physics::navier_stokes::NavierStokesSolver;
use glsns_rs::processing::csv_writer;
use glsns_rs::processing::summary::SimulationSummary;
use std::error::Error;
use std::fs;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

const OUTPUT: &str = "output/main";

fn main() -> Result<(), Box<dyn Error>> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    fs::create_dir_all(OUTPUT)?;

    lid_driven_cavity()?;
    hopper_fill()?;
    Ok(())
}

/// Re = 100 cavity on a 32x32 Q1 grid, marched to steady state with BDF2.
fn lid_driven_cavity() -> Result<(), Box<dyn Error>> {
    let mut params = NavierStokesParameters::default();
    params.physical_properties.viscosity = 0.01;
    params.simulation_control.method = TimeSteppingMethod::Bdf2;
    params.simulation_control.dt = 0.05;
    params.simulation_control.time_end = 2.0;
    params.simulation_control.output_frequency = 10;

    let mut bcs = BoundaryConditions::new();
    for id in 0..3 {
        bcs.add(id, BoundaryCondition::NoSlip);
    }
    bcs.add(3, BoundaryCondition::Function(VectorFunction::constant([1.0, 0.0])));
    bcs.pressure_reference = Some(PressureReference {
        point: Point::<2>::new(0.5, 0.5),
        value: 0.0,
    });

    let mesh = hyper_cube::<2>(32, 0.0, 1.0, true);
    let mut solver = NavierStokesSolver::new(params, mesh, bcs)?;
    let mut summary = SimulationSummary::from_solver(&solver);

    solver.initialize(None)?;
    let reports = solver.solve()?;
    csv_writer::write_step_reports(format!("{OUTPUT}/steps.csv"), &reports)?;

    let centerline: Vec<_> = (0..=100)
        .map(|i| {
            let p = Point::<2>::new(0.5, i as f64 / 100.0);
            (p, solver.evaluate_at(&p))
        })
        .collect();
    csv_writer::write_profile(format!("{OUTPUT}/centerline.csv"), &centerline)?;

    // one more steady correction to record a Newton history
    solver.set_time_stepping_method(TimeSteppingMethod::Steady);
    let result = solver.newton_solve()?;
    write_hist_to_file(format!("{OUTPUT}/newton_history.csv"), &result.history)?;

    summary.add_step_reports(&reports);
    summary.add_statistics(solver.kinetic_energy()?, solver.enstrophy()?);
    summary.write_to_file(format!("{OUTPUT}/simulation_summary.txt"))?;
    summary.print_to_console();
    info!("cavity results saved to {OUTPUT}");
    Ok(())
}

/// Particles released in a box settle on the floor of a 2D container.
fn hopper_fill() -> Result<(), Box<dyn Error>> {
    let params = DemParameters {
        dt: 1e-5,
        n_steps: 20_000,
        gravity: vec![0.0, -9.81],
        insertion: InsertionParameters {
            n_particles: 40,
            inserted_per_step: 20,
            insertion_frequency: 5_000,
            box_min: vec![0.01, 0.05],
            box_max: vec![0.09, 0.09],
            ..InsertionParameters::default()
        },
        output_frequency: 5_000,
        ..DemParameters::default()
    };
    let mut solver = DemSolver::<2>::new(params, hyper_cube::<2>(10, 0.0, 0.1, true))?;
    let report = solver.solve();

    let heights: Vec<f64> = solver.particles().iter().map(|p| p.position[1]).collect();
    let ids: Vec<f64> = solver.particles().iter().map(|p| p.id as f64).collect();
    csv_writer::write_xy(format!("{OUTPUT}/particle_heights.csv"), "id", "y", &ids, &heights)?;
    info!(
        particles = report.n_particles,
        kinetic_energy = report.kinetic_energy,
        wall_contacts = report.pw_contacts,
        "hopper fill finished"
    );
    Ok(())
}

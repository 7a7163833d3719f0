use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use glsns_rs::config::{DemParameters, InsertionParameters, NavierStokesParameters, Verbosity};
use glsns_rs::dem::solver::DemSolver;
use glsns_rs::discretization::generator::hyper_cube;
use glsns_rs::discretization::mesh::Point;
use glsns_rs::numerics::time_integration::TimeSteppingMethod;
use glsns_rs::physics::bc::{BoundaryCondition, BoundaryConditions, PressureReference, VectorFunction};
use glsns_rs::physics::navier_stokes::NavierStokesSolver;
use nalgebra::DVector;

fn grid_sizes() -> Vec<usize> {
    vec![8, 16]
}

fn cavity(n: usize) -> NavierStokesSolver<2> {
    let mut params = NavierStokesParameters::default();
    params.simulation_control.method = TimeSteppingMethod::Steady;
    params.physical_properties.viscosity = 0.1;
    params.non_linear_solver.verbosity = Verbosity::Quiet;

    let mut bcs = BoundaryConditions::new();
    for id in 0..3 {
        bcs.add(id, BoundaryCondition::NoSlip);
    }
    bcs.add(3, BoundaryCondition::Function(VectorFunction::constant([1.0, 0.0])));
    bcs.pressure_reference = Some(PressureReference {
        point: Point::<2>::new(0.5, 0.5),
        value: 0.0,
    });
    NavierStokesSolver::new(params, hyper_cube::<2>(n, 0.0, 1.0, true), bcs).unwrap()
}

fn bench_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("gls_assembly");
    for &n in &grid_sizes() {
        let mut solver = cavity(n);
        let dofs = solver.dofs().n_dofs();
        solver.set_solution(DVector::from_fn(dofs, |i, _| ((i * 7) % 11) as f64 / 11.0));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &_| {
            b.iter(|| {
                solver.assemble_system(true, false).unwrap();
                std::hint::black_box(solver.system_rhs().norm());
            });
        });
    }
    group.finish();
}

fn bench_residual(c: &mut Criterion) {
    let mut group = c.benchmark_group("gls_residual");
    for &n in &grid_sizes() {
        let mut solver = cavity(n);
        let dofs = solver.dofs().n_dofs();
        solver.set_solution(DVector::from_fn(dofs, |i, _| ((i * 7) % 11) as f64 / 11.0));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &_| {
            b.iter(|| {
                solver.assemble_system(false, false).unwrap();
                std::hint::black_box(solver.system_rhs().norm());
            });
        });
    }
    group.finish();
}

fn bench_steady_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("steady_cavity");
    group.sample_size(10);
    for &n in &grid_sizes() {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || {
                    let mut solver = cavity(n);
                    solver.initialize(None).unwrap();
                    solver
                },
                |mut solver| {
                    let _ = solver.solve();
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_dem_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("dem_steps");
    for &count in &[40usize, 100] {
        let params = DemParameters {
            dt: 1e-5,
            n_steps: 0,
            gravity: vec![0.0, -9.81],
            insertion: InsertionParameters {
                n_particles: count,
                inserted_per_step: count,
                box_min: vec![0.01, 0.01],
                box_max: vec![0.09, 0.09],
                ..InsertionParameters::default()
            },
            ..DemParameters::default()
        };
        let mut solver = DemSolver::<2>::new(params, hyper_cube::<2>(10, 0.0, 0.1, true)).unwrap();
        // fill and let the pile form before timing
        for _ in 0..2_000 {
            solver.step();
        }
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &_| {
            b.iter(|| {
                solver.step();
                std::hint::black_box(solver.kinetic_energy());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_assembly, bench_residual, bench_steady_solve, bench_dem_steps);
criterion_main!(benches);

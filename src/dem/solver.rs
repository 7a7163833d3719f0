//! Time loop of the discrete-element engine.

use crate::config::DemParameters;
use crate::dem::contact_force::ContactLaw;
use crate::dem::insertion::Insertion;
use crate::dem::integrator::integrate;
use crate::dem::particles::Particle;
use crate::dem::search::{
    BoundaryFace, PpContact, PwContact, TangentialHistory, cell_bounding_boxes, find_boundary_faces,
    find_cell_neighbors, locate_particles, particles_per_cell, pp_broad_search, pp_fine_search,
    pw_broad_search, pw_fine_search,
};
use crate::discretization::mesh::{Mesh, Point};
use crate::error::ConfigurationError;
use tracing::{debug, info};

/// State after the last step.
#[derive(Debug, Clone, PartialEq)]
pub struct DemReport {
    pub steps: usize,
    pub time: f64,
    pub n_particles: usize,
    pub kinetic_energy: f64,
    pub pp_contacts: usize,
    pub pw_contacts: usize,
}

pub struct DemSolver<const DIM: usize> {
    params: DemParameters,
    mesh: Mesh<DIM>,
    gravity: Point<DIM>,
    law: ContactLaw,
    insertion: Insertion<DIM>,
    particles: Vec<Particle<DIM>>,

    neighbors: Vec<Vec<usize>>,
    boxes: Vec<(Point<DIM>, Point<DIM>)>,
    faces: Vec<BoundaryFace<DIM>>,
    pp_candidates: Vec<(usize, usize)>,
    pw_candidates: Vec<(usize, usize)>,
    /// Set when particles were added outside an insertion step.
    outdated: bool,

    pp_history: TangentialHistory<(u64, u64), DIM>,
    pw_history: TangentialHistory<(u64, usize), DIM>,
    pp_contacts: usize,
    pw_contacts: usize,

    step: usize,
    time: f64,
}

impl<const DIM: usize> DemSolver<DIM> {
    pub fn new(params: DemParameters, mesh: Mesh<DIM>) -> Result<Self, ConfigurationError> {
        params.validate(DIM)?;
        let gravity = if params.gravity.is_empty() {
            Point::zeros()
        } else {
            Point::<DIM>::from_fn(|i, _| params.gravity[i])
        };
        let neighbors = find_cell_neighbors(&mesh);
        let boxes = cell_bounding_boxes(&mesh);
        let faces = find_boundary_faces(&mesh);
        info!(
            cells = mesh.n_cells(),
            boundary_faces = faces.len(),
            model = ?params.contact_force,
            integration = ?params.integration,
            "DEM setup"
        );
        Ok(Self {
            law: ContactLaw::new(params.contact_force, &params.properties),
            insertion: Insertion::new(&params.insertion, params.properties.diameter),
            params,
            mesh,
            gravity,
            particles: Vec::new(),
            neighbors,
            boxes,
            faces,
            pp_candidates: Vec::new(),
            pw_candidates: Vec::new(),
            outdated: false,
            pp_history: TangentialHistory::new(),
            pw_history: TangentialHistory::new(),
            pp_contacts: 0,
            pw_contacts: 0,
            step: 0,
            time: 0.0,
        })
    }

    pub fn particles(&self) -> &[Particle<DIM>] {
        &self.particles
    }

    /// Mutable access for prescribing initial velocities.
    pub fn particles_mut(&mut self) -> &mut [Particle<DIM>] {
        &mut self.particles
    }

    /// Adds a particle by hand; the next step rebuilds the candidate lists.
    pub fn add_particle(&mut self, particle: Particle<DIM>) {
        self.particles.push(particle);
        self.outdated = true;
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.particles.iter().map(Particle::kinetic_energy).sum()
    }

    /// Drops the particles that left the mesh and rebuilds both candidate
    /// lists.
    fn detect(&mut self) {
        let located = locate_particles(&self.mesh, &self.boxes, &self.particles);
        let mut cells = Vec::with_capacity(located.len());
        let mut kept = Vec::with_capacity(self.particles.len());
        for (particle, cell) in self.particles.drain(..).zip(located) {
            match cell {
                Some(c) => {
                    cells.push(c);
                    kept.push(particle);
                }
                None => debug!(id = particle.id, "particle left the domain"),
            }
        }
        self.particles = kept;
        let cell_particles = particles_per_cell(self.mesh.n_cells(), &cells);
        self.pp_candidates = pp_broad_search(&cell_particles, &self.neighbors);
        self.pw_candidates = pw_broad_search(&cell_particles, &self.faces);
        self.outdated = false;
    }

    /// One explicit step.
    pub fn step(&mut self) {
        let inserted = self.insertion.insert(self.step, &mut self.particles, &self.params.properties);
        if inserted > 0 || self.outdated || self.step % self.params.contact_detection_frequency.max(1) == 0 {
            self.detect();
        }

        for p in &mut self.particles {
            p.reset_force();
        }
        let mut pp: Vec<PpContact<DIM>> = pp_fine_search(&self.particles, &self.pp_candidates, &self.pp_history);
        let mut pw: Vec<PwContact<DIM>> =
            pw_fine_search(&self.particles, &self.faces, &self.pw_candidates, &self.pw_history);

        let dt = self.params.dt;
        self.law.apply_pp(&mut self.particles, &mut pp, dt);
        self.law.apply_pw(&mut self.particles, &mut pw, dt);

        // separated pairs lose their history
        self.pp_history = pp.iter().map(|c| (c.key(&self.particles), c.tangential_overlap)).collect();
        self.pw_history = pw
            .iter()
            .map(|c| ((self.particles[c.particle].id, c.face), c.tangential_overlap))
            .collect();
        self.pp_contacts = pp.len();
        self.pw_contacts = pw.len();

        integrate(self.params.integration, &mut self.particles, &self.gravity, dt);
        self.step += 1;
        self.time += dt;

        if self.step % self.params.output_frequency.max(1) == 0 {
            info!(
                step = self.step,
                time = self.time,
                particles = self.particles.len(),
                pp_contacts = self.pp_contacts,
                pw_contacts = self.pw_contacts,
                kinetic_energy = self.kinetic_energy(),
                "DEM step"
            );
        }
    }

    pub fn report(&self) -> DemReport {
        DemReport {
            steps: self.step,
            time: self.time,
            n_particles: self.particles.len(),
            kinetic_energy: self.kinetic_energy(),
            pp_contacts: self.pp_contacts,
            pw_contacts: self.pw_contacts,
        }
    }

    /// Runs the configured number of steps.
    pub fn solve(&mut self) -> DemReport {
        for _ in 0..self.params.n_steps {
            self.step();
        }
        self.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContactForceModel, InsertionParameters, IntegrationMethod};
    use crate::discretization::generator::hyper_cube;

    fn params(n_particles: usize) -> DemParameters {
        DemParameters {
            dt: 1e-5,
            n_steps: 0,
            gravity: vec![0.0, -9.81],
            insertion: InsertionParameters {
                n_particles,
                inserted_per_step: n_particles,
                insertion_frequency: 1,
                box_min: vec![0.02, 0.02],
                box_max: vec![0.08, 0.08],
                ..InsertionParameters::default()
            },
            contact_force: ContactForceModel::Nonlinear,
            integration: IntegrationMethod::VelocityVerlet,
            output_frequency: 10_000,
            ..DemParameters::default()
        }
    }

    #[test]
    fn gravity_must_match_the_dimension() {
        let mut p = params(1);
        p.gravity = vec![0.0, 0.0, -9.81];
        assert!(DemSolver::<2>::new(p, hyper_cube::<2>(4, 0.0, 0.1, true)).is_err());
    }

    #[test]
    fn a_dropped_particle_settles_on_the_floor() {
        let mut p = params(0);
        p.properties.restitution_coefficient_wall = 0.3;
        let mut solver = DemSolver::<2>::new(p, hyper_cube::<2>(4, 0.0, 0.1, true)).unwrap();
        solver.add_particle(Particle::new(0, 0.005, 2500.0, Point::<2>::new(0.05, 0.01)));
        for _ in 0..60_000 {
            solver.step();
        }
        let p = &solver.particles()[0];
        let r = p.radius();
        assert!(p.position[1] < r && p.position[1] > 0.9 * r, "height {}", p.position[1]);
        assert!(p.velocity.norm() < 0.05, "speed {}", p.velocity.norm());
        assert!((p.position[0] - 0.05).abs() < 1e-9);
        assert_eq!(solver.report().pw_contacts, 1);
    }

    #[test]
    fn colliding_particles_conserve_momentum() {
        let mut p = params(0);
        p.gravity.clear();
        let mut solver = DemSolver::<2>::new(p, hyper_cube::<2>(4, 0.0, 0.1, true)).unwrap();
        solver.add_particle(Particle::new(0, 0.005, 2500.0, Point::<2>::new(0.045, 0.04)));
        solver.add_particle(Particle::new(1, 0.005, 2500.0, Point::<2>::new(0.0555, 0.04)));
        solver.particles_mut()[0].velocity = Point::<2>::new(0.5, 0.0);
        let momentum = |s: &DemSolver<2>| s.particles().iter().map(|p| p.velocity * p.mass).sum::<Point<2>>();
        let before = momentum(&solver);
        let energy = solver.kinetic_energy();
        for _ in 0..2_000 {
            solver.step();
        }
        let after = momentum(&solver);
        assert!((after - before).norm() < 1e-12 * before.norm().max(1.0));
        // the pair bounced apart with some loss
        let (a, b) = (&solver.particles()[0], &solver.particles()[1]);
        assert!(b.velocity[0] > a.velocity[0]);
        assert!(solver.kinetic_energy() < energy);
        assert_eq!(solver.report().pp_contacts, 0);
    }

    #[test]
    fn particles_leaving_the_mesh_are_removed() {
        let mut p = params(0);
        p.gravity.clear();
        let mut solver = DemSolver::<2>::new(p, hyper_cube::<2>(2, 0.0, 0.1, true)).unwrap();
        solver.add_particle(Particle::new(0, 0.005, 2500.0, Point::<2>::new(0.2, 0.05)));
        solver.add_particle(Particle::new(1, 0.005, 2500.0, Point::<2>::new(0.03, 0.07)));
        solver.step();
        assert_eq!(solver.particles().len(), 1);
        assert_eq!(solver.particles()[0].id, 1);
    }

    #[test]
    fn insertion_feeds_the_solver() {
        let mut p = params(4);
        p.n_steps = 10;
        let mut solver = DemSolver::<2>::new(p, hyper_cube::<2>(4, 0.0, 0.1, true)).unwrap();
        let report = solver.solve();
        assert_eq!(report.n_particles, 4);
        assert_eq!(report.steps, 10);
        assert!((report.time - 1e-4).abs() < 1e-15);
        assert!(report.kinetic_energy > 0.0);
    }
}

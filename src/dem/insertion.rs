//! Lattice insertion of new particles inside a box.

use crate::config::{InsertionMethod, InsertionParameters, ParticleProperties};
use crate::dem::particles::Particle;
use crate::discretization::mesh::Point;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

pub struct Insertion<const DIM: usize> {
    method: InsertionMethod,
    box_min: Point<DIM>,
    spacing: f64,
    per_axis: [usize; DIM],
    n_particles: usize,
    per_step: usize,
    frequency: usize,
    offset: Uniform<f64>,
    rng: StdRng,
    inserted: usize,
}

impl<const DIM: usize> Insertion<DIM> {
    /// Sizes the lattice. When the box holds fewer points than requested per
    /// step, each insertion is reduced to the box capacity.
    pub fn new(params: &InsertionParameters, diameter: f64) -> Self {
        let box_min = Point::<DIM>::from_fn(|i, _| params.box_min[i]);
        let box_max = Point::<DIM>::from_fn(|i, _| params.box_max[i]);
        let spacing = params.distance_factor * diameter;
        let mut per_axis = [0usize; DIM];
        for (a, n) in per_axis.iter_mut().enumerate() {
            *n = ((box_max[a] - box_min[a]) / spacing).floor().max(0.0) as usize;
        }
        let capacity: usize = per_axis.iter().product();
        let mut per_step = params.inserted_per_step;
        if capacity < per_step {
            warn!(
                requested = per_step,
                capacity, "insertion box too small, inserting fewer particles per step"
            );
            per_step = capacity;
        }
        if params.method == InsertionMethod::NonUniform && params.random_number_range >= params.distance_factor - 1.0 {
            warn!(
                range = params.random_number_range,
                distance_factor = params.distance_factor,
                "random offsets may create initial overlaps"
            );
        }
        let half = 0.5 * params.random_number_range * diameter;
        Self {
            method: params.method,
            box_min,
            spacing,
            per_axis,
            n_particles: params.n_particles,
            per_step,
            frequency: params.insertion_frequency.max(1),
            offset: Uniform::new_inclusive(-half, half),
            rng: StdRng::seed_from_u64(params.random_number_seed),
            inserted: 0,
        }
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn remaining(&self) -> usize {
        self.n_particles.saturating_sub(self.inserted)
    }

    pub fn is_insertion_step(&self, step: usize) -> bool {
        self.remaining() > 0 && self.per_step > 0 && step % self.frequency == 0
    }

    fn lattice_point(&self, index: usize) -> Point<DIM> {
        let mut p = self.box_min;
        let mut rem = index;
        for a in 0..DIM {
            p[a] += self.spacing * ((rem % self.per_axis[a]) as f64 + 0.5);
            rem /= self.per_axis[a];
        }
        p
    }

    /// Adds the particles due at `step`; returns how many were inserted.
    pub fn insert(&mut self, step: usize, particles: &mut Vec<Particle<DIM>>, properties: &ParticleProperties) -> usize {
        if !self.is_insertion_step(step) {
            return 0;
        }
        let count = self.per_step.min(self.remaining());
        for k in 0..count {
            let mut position = self.lattice_point(k);
            if self.method == InsertionMethod::NonUniform {
                for a in 0..DIM {
                    position[a] += self.rng.sample(self.offset);
                }
            }
            let id = self.inserted as u64;
            particles.push(Particle::new(id, properties.diameter, properties.density, position));
            self.inserted += 1;
        }
        info!(step, count, total = self.inserted, "particles inserted");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(method: InsertionMethod) -> InsertionParameters {
        InsertionParameters {
            method,
            n_particles: 10,
            inserted_per_step: 6,
            insertion_frequency: 5,
            box_min: vec![0.0, 0.0],
            box_max: vec![0.06, 0.03],
            distance_factor: 1.5,
            random_number_range: 0.25,
            random_number_seed: 7,
        }
    }

    #[test]
    fn uniform_insertion_fills_the_lattice_in_batches() {
        let props = ParticleProperties::default();
        let mut ins = Insertion::<2>::new(&params(InsertionMethod::Uniform), props.diameter);
        let mut particles = Vec::new();
        assert_eq!(ins.insert(0, &mut particles, &props), 6);
        assert_eq!(ins.insert(3, &mut particles, &props), 0);
        assert_eq!(ins.insert(5, &mut particles, &props), 4);
        assert_eq!(ins.insert(10, &mut particles, &props), 0);
        assert_eq!(particles.len(), 10);

        let first = &particles[0].position;
        assert!((first[0] - 0.00375).abs() < 1e-12 && (first[1] - 0.00375).abs() < 1e-12);
        let ids: Vec<u64> = particles.iter().map(|p| p.id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn non_uniform_offsets_are_bounded_and_reproducible() {
        let props = ParticleProperties::default();
        let run = || {
            let mut ins = Insertion::<2>::new(&params(InsertionMethod::NonUniform), props.diameter);
            let mut particles = Vec::new();
            ins.insert(0, &mut particles, &props);
            particles
        };
        let a = run();
        let b = run();
        assert_eq!(a, b);

        let uniform = {
            let mut ins = Insertion::<2>::new(&params(InsertionMethod::Uniform), props.diameter);
            let mut particles = Vec::new();
            ins.insert(0, &mut particles, &props);
            particles
        };
        let half = 0.5 * 0.25 * props.diameter;
        for (p, q) in a.iter().zip(&uniform) {
            assert!((p.position - q.position).amax() <= half + 1e-15);
        }
        assert!(a.iter().zip(&uniform).any(|(p, q)| p.position != q.position));
    }
}

//! Explicit time integration of the particle motion.

use crate::config::IntegrationMethod;
use crate::dem::particles::Particle;
use crate::discretization::mesh::Point;
use rayon::prelude::*;

pub fn integrate<const DIM: usize>(
    method: IntegrationMethod,
    particles: &mut [Particle<DIM>],
    gravity: &Point<DIM>,
    dt: f64,
) {
    match method {
        IntegrationMethod::ExplicitEuler => explicit_euler(particles, gravity, dt),
        IntegrationMethod::VelocityVerlet => velocity_verlet(particles, gravity, dt),
    }
}

/// Semi-implicit: velocities take the acceleration first, positions then
/// move with the new velocity.
pub fn explicit_euler<const DIM: usize>(particles: &mut [Particle<DIM>], gravity: &Point<DIM>, dt: f64) {
    particles.par_iter_mut().for_each(|p| {
        let acceleration = p.force / p.mass + gravity;
        p.velocity += acceleration * dt;
        p.position += p.velocity * dt;
        p.angular_velocity += p.torque * (dt / p.moment_of_inertia);
    });
}

/// Half kick, drift, half kick with the acceleration of the current forces.
/// Exact for forces that stay constant over a step.
pub fn velocity_verlet<const DIM: usize>(particles: &mut [Particle<DIM>], gravity: &Point<DIM>, dt: f64) {
    particles.par_iter_mut().for_each(|p| {
        let acceleration = p.force / p.mass + gravity;
        p.position += p.velocity * dt + acceleration * (0.5 * dt * dt);
        p.velocity += acceleration * dt;
        p.angular_velocity += p.torque * (dt / p.moment_of_inertia);
    });
}

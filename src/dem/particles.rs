//! Spherical particles of the discrete-element engine.

use crate::discretization::mesh::Point;
use nalgebra::Vector3;
use std::f64::consts::PI;

/// Rotational quantities are always three-dimensional; a 2D run only uses
/// the z component.
pub type Spin = Vector3<f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct Particle<const DIM: usize> {
    pub id: u64,
    pub diameter: f64,
    pub density: f64,
    pub mass: f64,
    pub moment_of_inertia: f64,
    pub position: Point<DIM>,
    pub velocity: Point<DIM>,
    pub angular_velocity: Spin,
    pub force: Point<DIM>,
    pub torque: Spin,
}

impl<const DIM: usize> Particle<DIM> {
    /// Particle at rest; mass and inertia of a solid sphere.
    pub fn new(id: u64, diameter: f64, density: f64, position: Point<DIM>) -> Self {
        let mass = density * PI * diameter.powi(3) / 6.0;
        Self {
            id,
            diameter,
            density,
            mass,
            moment_of_inertia: 0.1 * mass * diameter * diameter,
            position,
            velocity: Point::zeros(),
            angular_velocity: Spin::zeros(),
            force: Point::zeros(),
            torque: Spin::zeros(),
        }
    }

    pub fn radius(&self) -> f64 {
        0.5 * self.diameter
    }

    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.velocity.norm_squared()
            + 0.5 * self.moment_of_inertia * self.angular_velocity.norm_squared()
    }

    pub fn reset_force(&mut self) {
        self.force = Point::zeros();
        self.torque = Spin::zeros();
    }
}

/// `v` in three dimensions, padded with zeros.
pub fn embed<const DIM: usize>(v: &Point<DIM>) -> Vector3<f64> {
    Vector3::from_fn(|i, _| if i < DIM { v[i] } else { 0.0 })
}

/// First `DIM` components of `v`.
pub fn project<const DIM: usize>(v: &Vector3<f64>) -> Point<DIM> {
    Point::<DIM>::from_fn(|i, _| v[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sphere_mass_and_inertia() {
        let p = Particle::<3>::new(0, 0.1, 1000.0, Point::<3>::zeros());
        assert_relative_eq!(p.mass, 1000.0 * PI * 1e-3 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(p.moment_of_inertia, 0.4 * p.mass * 0.05 * 0.05, epsilon = 1e-15);
        assert_eq!(p.kinetic_energy(), 0.0);
    }

    #[test]
    fn planar_vectors_round_trip_through_three_dimensions() {
        let v = Point::<2>::new(1.0, -2.0);
        let e = embed(&v);
        assert_eq!(e[2], 0.0);
        assert_eq!(project::<2>(&e), v);
    }
}

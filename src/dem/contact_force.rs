//! Spring-dashpot contact forces with a Coulomb limit on the tangential part.
//!
//! `linear` uses constant stiffnesses sized from a characteristic impact
//! velocity; `nonlinear` is Hertz-Mindlin, whose stiffnesses grow with the
//! square root of the overlap.

use crate::config::{ContactForceModel, ParticleProperties};
use crate::dem::particles::{Particle, embed, project};
use crate::dem::search::{PpContact, PwContact};
use crate::discretization::mesh::Point;
use nalgebra::Vector3;
use std::f64::consts::PI;

/// Effective elastic and dissipative properties of one kind of contact.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Material {
    youngs_modulus: f64,
    shear_modulus: f64,
    /// `ln e / sqrt(ln^2 e + pi^2)`, zero for perfectly elastic contacts.
    damping_ratio: f64,
    friction: f64,
}

fn damping_ratio(restitution: f64) -> f64 {
    if restitution >= 1.0 {
        return 0.0;
    }
    let ln_e = restitution.max(1e-12).ln();
    ln_e / (ln_e * ln_e + PI * PI).sqrt()
}

#[derive(Debug, Clone, Copy)]
struct Coefficients {
    kn: f64,
    eta_n: f64,
    kt: f64,
    eta_t: f64,
}

/// Relative kinematics at the contact point.
struct ContactKinematics {
    normal: Vector3<f64>,
    overlap: f64,
    relative_velocity: Vector3<f64>,
    effective_mass: f64,
    effective_radius: f64,
}

#[derive(Debug, Clone)]
pub struct ContactLaw {
    model: ContactForceModel,
    characteristic_velocity: f64,
    particle: Material,
    wall: Material,
}

impl ContactLaw {
    pub fn new(model: ContactForceModel, props: &ParticleProperties) -> Self {
        let (e, nu) = (props.youngs_modulus, props.poisson_ratio);
        let (ew, nuw) = (props.youngs_modulus_wall, props.poisson_ratio_wall);
        Self {
            model,
            characteristic_velocity: props.characteristic_velocity,
            particle: Material {
                youngs_modulus: e / (2.0 * (1.0 - nu * nu)),
                shear_modulus: e / (4.0 * (2.0 - nu) * (1.0 + nu)),
                damping_ratio: damping_ratio(props.restitution_coefficient),
                friction: props.friction_coefficient,
            },
            wall: Material {
                youngs_modulus: 1.0 / ((1.0 - nu * nu) / e + (1.0 - nuw * nuw) / ew),
                shear_modulus: 1.0 / (2.0 * (2.0 - nu) * (1.0 + nu) / e + 2.0 * (2.0 - nuw) * (1.0 + nuw) / ew),
                damping_ratio: damping_ratio(props.restitution_coefficient_wall),
                friction: props.friction_coefficient_wall,
            },
        }
    }

    pub fn model(&self) -> ContactForceModel {
        self.model
    }

    fn coefficients(&self, material: &Material, m: f64, r: f64, overlap: f64) -> Coefficients {
        let damping = -2.0 * (5.0f64 / 6.0).sqrt() * material.damping_ratio;
        match self.model {
            ContactForceModel::Linear => {
                let e = material.youngs_modulus;
                let v = self.characteristic_velocity;
                let kn = 16.0 / 15.0
                    * r.sqrt()
                    * e
                    * (15.0 * m * v * v / (16.0 * r.sqrt() * e)).powf(0.2);
                let kt = 0.4 * kn;
                Coefficients {
                    kn,
                    eta_n: damping * (m * kn).sqrt(),
                    kt,
                    eta_t: damping * (m * kt).sqrt(),
                }
            }
            ContactForceModel::Nonlinear => {
                let root = (r * overlap).sqrt();
                let sn = 2.0 * material.youngs_modulus * root;
                let st = 8.0 * material.shear_modulus * root;
                Coefficients {
                    kn: 4.0 / 3.0 * material.youngs_modulus * root,
                    eta_n: damping * (sn * m).sqrt(),
                    kt: st,
                    eta_t: damping * (st * m).sqrt(),
                }
            }
        }
    }

    /// Force on the first body of the contact; updates the tangential overlap.
    fn force(&self, material: &Material, c: &ContactKinematics, tangential: &mut Vector3<f64>, dt: f64) -> Vector3<f64> {
        let k = self.coefficients(material, c.effective_mass, c.effective_radius, c.overlap);
        let n = c.normal;
        let vn = c.relative_velocity.dot(&n);
        let vt = c.relative_velocity - n * vn;

        let normal_force = -n * (k.kn * c.overlap + k.eta_n * vn);

        // keep the history in the current tangent plane
        *tangential -= n * tangential.dot(&n);
        *tangential += vt * dt;
        let mut tangential_force = -*tangential * k.kt - vt * k.eta_t;
        let limit = material.friction * normal_force.norm();
        let magnitude = tangential_force.norm();
        if magnitude > limit {
            tangential_force *= limit / magnitude;
            if k.kt > 0.0 {
                *tangential = -(tangential_force + vt * k.eta_t) / k.kt;
            }
        }
        normal_force + tangential_force
    }

    /// Accumulates the particle-particle forces and torques.
    pub fn apply_pp<const DIM: usize>(&self, particles: &mut [Particle<DIM>], contacts: &mut [PpContact<DIM>], dt: f64) {
        for contact in contacts.iter_mut() {
            let (a, b) = (&particles[contact.i], &particles[contact.j]);
            let n = embed(&contact.normal);
            let (ra, rb) = (a.radius(), b.radius());
            let kinematics = ContactKinematics {
                normal: n,
                overlap: contact.overlap,
                relative_velocity: embed(&a.velocity) - embed(&b.velocity)
                    + (a.angular_velocity * ra + b.angular_velocity * rb).cross(&n),
                effective_mass: a.mass * b.mass / (a.mass + b.mass),
                effective_radius: ra * rb / (ra + rb),
            };
            let mut tangential = embed(&contact.tangential_overlap);
            let f = self.force(&self.particle, &kinematics, &mut tangential, dt);
            contact.tangential_overlap = project(&tangential);

            let tangential_force = f - n * f.dot(&n);
            let force: Point<DIM> = project(&f);
            particles[contact.i].force += force;
            particles[contact.i].torque += (n * ra).cross(&tangential_force);
            particles[contact.j].force -= force;
            particles[contact.j].torque += (n * rb).cross(&tangential_force);
        }
    }

    /// Accumulates the particle-wall forces and torques. Walls are fixed.
    pub fn apply_pw<const DIM: usize>(&self, particles: &mut [Particle<DIM>], contacts: &mut [PwContact<DIM>], dt: f64) {
        for contact in contacts.iter_mut() {
            let p = &particles[contact.particle];
            let n = embed(&contact.normal);
            let r = p.radius();
            let kinematics = ContactKinematics {
                normal: n,
                overlap: contact.overlap,
                relative_velocity: embed(&p.velocity) + (p.angular_velocity * r).cross(&n),
                effective_mass: p.mass,
                effective_radius: r,
            };
            let mut tangential = embed(&contact.tangential_overlap);
            let f = self.force(&self.wall, &kinematics, &mut tangential, dt);
            contact.tangential_overlap = project(&tangential);

            let tangential_force = f - n * f.dot(&n);
            let particle = &mut particles[contact.particle];
            particle.force += project::<DIM>(&f);
            particle.torque += (n * r).cross(&tangential_force);
        }
    }
}

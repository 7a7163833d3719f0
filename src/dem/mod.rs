//! Discrete-element engine for spherical particles on the background mesh.

pub mod contact_force;
pub mod insertion;
pub mod integrator;
pub mod particles;
pub mod search;
pub mod solver;

pub mod config;
pub mod dem;
pub mod discretization;
pub mod error;
pub mod numerics;
pub mod physics;
pub mod processing;

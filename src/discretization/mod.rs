pub mod dof_handler;
pub mod fe;
pub mod generator;
pub mod mapping;
pub mod mesh;
pub mod quadrature;

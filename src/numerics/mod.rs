pub mod krylov;
pub mod linear_solver;
pub mod parallel;
pub mod preconditioner;
pub mod simulation_control;
pub mod solver;
pub mod sparse;
pub mod time_integration;
pub mod timing;

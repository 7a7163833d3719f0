pub mod assembler;
pub mod bc;
pub mod constraints;
pub mod immersed;
pub mod initial_condition;
pub mod navier_stokes;
pub mod postprocessing;
pub mod weak_form;

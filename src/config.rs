//! Run parameters. File ingestion is left to the caller; every struct
//! deserializes with serde and falls back to the defaults below.

use crate::error::ConfigurationError;
use crate::numerics::time_integration::TimeSteppingMethod;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Quiet,
    Verbose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationControlParameters {
    pub method: TimeSteppingMethod,
    pub dt: f64,
    pub time_end: f64,
    /// CFL-driven step adaptation.
    pub adapt: bool,
    pub max_cfl: f64,
    /// Step scaling applied while BDF2/BDF3 start up with lower orders.
    pub startup_timestep_scaling: f64,
    /// Halvings allowed for one step before the run is aborted.
    pub max_step_retries: usize,
    pub output_frequency: usize,
}

impl Default for SimulationControlParameters {
    fn default() -> Self {
        Self {
            method: TimeSteppingMethod::Steady,
            dt: 1.0,
            time_end: 1.0,
            adapt: false,
            max_cfl: 1.0,
            startup_timestep_scaling: 1.0,
            max_step_retries: 4,
            output_frequency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalProperties {
    pub viscosity: f64,
}

impl Default for PhysicalProperties {
    fn default() -> Self {
        Self { viscosity: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FemParameters {
    pub velocity_order: usize,
    pub pressure_order: usize,
    /// Gauss points per direction; `velocity_order + 1` when unset.
    pub quadrature_points: Option<usize>,
}

impl Default for FemParameters {
    fn default() -> Self {
        Self {
            velocity_order: 1,
            pressure_order: 1,
            quadrature_points: None,
        }
    }
}

impl FemParameters {
    pub fn n_quadrature_points(&self) -> usize {
        self.quadrature_points.unwrap_or(self.velocity_order + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationParameters {
    pub supg: bool,
    /// Reference velocity flooring `|u|` in the stabilization parameter.
    pub velocity_scale: f64,
}

impl Default for StabilizationParameters {
    fn default() -> Self {
        Self {
            supg: true,
            velocity_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonLinearSolverType {
    #[default]
    Newton,
    SkipNewton,
    AdaptativeNewton,
}

impl FromStr for NonLinearSolverType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newton" => Ok(Self::Newton),
            "skip_newton" => Ok(Self::SkipNewton),
            "adaptative_newton" => Ok(Self::AdaptativeNewton),
            other => Err(ConfigurationError::UnknownNonLinearSolver(other.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonLinearSolverParameters {
    pub solver: NonLinearSolverType,
    pub verbosity: Verbosity,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub display_precision: usize,
    /// Iterations reusing the Jacobian between reassemblies (`skip_newton`).
    pub skip_iterations: usize,
}

impl Default for NonLinearSolverParameters {
    fn default() -> Self {
        Self {
            solver: NonLinearSolverType::Newton,
            verbosity: Verbosity::Verbose,
            tolerance: 1e-6,
            max_iterations: 10,
            display_precision: 4,
            skip_iterations: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinearSolverType {
    #[default]
    Gmres,
    Bicgstab,
    Amg,
}

impl FromStr for LinearSolverType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gmres" => Ok(Self::Gmres),
            "bicgstab" => Ok(Self::Bicgstab),
            "amg" => Ok(Self::Amg),
            other => Err(ConfigurationError::UnknownLinearSolver(other.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearSolverParameters {
    pub solver: LinearSolverType,
    pub verbosity: Verbosity,
    pub residual_precision: usize,
    pub relative_residual: f64,
    pub minimum_residual: f64,
    pub max_iterations: usize,
    pub max_krylov_vectors: usize,
    pub ilu_precond_fill: f64,
    pub ilu_precond_atol: f64,
    pub ilu_precond_rtol: f64,
    pub amg_precond_ilu_fill: f64,
    pub amg_precond_ilu_atol: f64,
    pub amg_precond_ilu_rtol: f64,
    pub amg_aggregation_threshold: f64,
    pub amg_n_cycles: usize,
    pub amg_w_cycles: bool,
    pub amg_smoother_sweeps: usize,
    pub amg_smoother_overlap: usize,
}

impl Default for LinearSolverParameters {
    fn default() -> Self {
        Self {
            solver: LinearSolverType::Gmres,
            verbosity: Verbosity::Quiet,
            residual_precision: 6,
            relative_residual: 1e-3,
            minimum_residual: 1e-8,
            max_iterations: 1000,
            max_krylov_vectors: 100,
            ilu_precond_fill: 1.0,
            ilu_precond_atol: 1e-6,
            ilu_precond_rtol: 1.0,
            amg_precond_ilu_fill: 1.0,
            amg_precond_ilu_atol: 1e-12,
            amg_precond_ilu_rtol: 1.0,
            amg_aggregation_threshold: 1e-14,
            amg_n_cycles: 1,
            amg_w_cycles: false,
            amg_smoother_sweeps: 2,
            amg_smoother_overlap: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitialConditionType {
    #[serde(rename = "restart")]
    Restart,
    #[serde(rename = "L2projection")]
    L2Projection,
    #[default]
    #[serde(rename = "nodal")]
    Nodal,
    #[serde(rename = "viscous")]
    Viscous,
}

impl FromStr for InitialConditionType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(Self::Restart),
            "L2projection" => Ok(Self::L2Projection),
            "nodal" => Ok(Self::Nodal),
            "viscous" => Ok(Self::Viscous),
            other => Err(ConfigurationError::UnknownInitialCondition(other.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialConditionParameters {
    #[serde(rename = "type")]
    pub kind: InitialConditionType,
    /// Viscosity of the steady pre-solve used by the viscous start.
    pub viscosity: f64,
}

impl Default for InitialConditionParameters {
    fn default() -> Self {
        Self {
            kind: InitialConditionType::Nodal,
            viscosity: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartParameters {
    pub restart: bool,
}

/// Circular (2D) or spherical (3D) interface, optionally paired with an outer
/// wall for the two-boundary Couette configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImmersedBoundaryParameters {
    pub enabled: bool,
    pub center: Vec<f64>,
    pub inner_radius: f64,
    pub outer_radius: f64,
    pub couette: bool,
    /// Tangential speed imposed on the inner surface in Couette mode.
    pub tangential_speed: f64,
}

impl Default for ImmersedBoundaryParameters {
    fn default() -> Self {
        Self {
            enabled: false,
            center: Vec::new(),
            inner_radius: 0.0,
            outer_radius: 0.0,
            couette: false,
            tangential_speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavierStokesParameters {
    pub simulation_control: SimulationControlParameters,
    pub physical_properties: PhysicalProperties,
    pub fem: FemParameters,
    pub stabilization: StabilizationParameters,
    pub non_linear_solver: NonLinearSolverParameters,
    pub linear_solver: LinearSolverParameters,
    pub immersed_boundary: ImmersedBoundaryParameters,
    pub initial_condition: InitialConditionParameters,
    pub restart: RestartParameters,
}

impl NavierStokesParameters {
    /// Cross-field checks; run before any setup work.
    pub fn validate(&self, dim: usize) -> Result<(), ConfigurationError> {
        let fem = &self.fem;
        if fem.velocity_order != fem.pressure_order || !(1..=2).contains(&fem.velocity_order) {
            return Err(ConfigurationError::UnsupportedElementOrder {
                velocity: fem.velocity_order,
                pressure: fem.pressure_order,
            });
        }
        if self.physical_properties.viscosity <= 0.0 {
            return Err(ConfigurationError::InvalidParameter {
                name: "viscosity",
                reason: "must be positive".into(),
            });
        }
        let sc = &self.simulation_control;
        if !sc.method.is_steady() && (sc.dt <= 0.0 || sc.time_end <= 0.0) {
            return Err(ConfigurationError::InvalidParameter {
                name: "dt",
                reason: "transient runs need positive dt and time_end".into(),
            });
        }
        if sc.method.sdirk_stage().is_some() {
            return Err(ConfigurationError::InvalidParameter {
                name: "method",
                reason: format!("{} is a stage of a scheme; select sdirk2 or sdirk3", sc.method),
            });
        }
        let ib = &self.immersed_boundary;
        if ib.enabled {
            if ib.center.len() != dim {
                return Err(ConfigurationError::ImmersedBoundary(format!(
                    "center has {} coordinates in a {dim}D run",
                    ib.center.len()
                )));
            }
            if ib.inner_radius <= 0.0 {
                return Err(ConfigurationError::ImmersedBoundary(
                    "inner radius must be positive".into(),
                ));
            }
            if ib.couette && ib.outer_radius <= ib.inner_radius {
                return Err(ConfigurationError::ImmersedBoundary(
                    "outer radius must exceed the inner radius".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Particle insertion strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionMethod {
    #[default]
    Uniform,
    NonUniform,
}

impl FromStr for InsertionMethod {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "non_uniform" => Ok(Self::NonUniform),
            other => Err(ConfigurationError::UnknownTag {
                kind: "insertion method",
                tag: other.into(),
            }),
        }
    }
}

/// Contact force law shared by particle-particle and particle-wall contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactForceModel {
    #[default]
    Linear,
    Nonlinear,
}

impl FromStr for ContactForceModel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "nonlinear" => Ok(Self::Nonlinear),
            other => Err(ConfigurationError::UnknownTag {
                kind: "contact force model",
                tag: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMethod {
    ExplicitEuler,
    #[default]
    VelocityVerlet,
}

impl FromStr for IntegrationMethod {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit_euler" => Ok(Self::ExplicitEuler),
            "velocity_verlet" => Ok(Self::VelocityVerlet),
            other => Err(ConfigurationError::UnknownTag {
                kind: "integration method",
                tag: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertionParameters {
    pub method: InsertionMethod,
    /// Particles wanted in total.
    pub n_particles: usize,
    pub inserted_per_step: usize,
    /// Steps between two insertions.
    pub insertion_frequency: usize,
    pub box_min: Vec<f64>,
    pub box_max: Vec<f64>,
    /// Lattice spacing in diameters.
    pub distance_factor: f64,
    /// Amplitude of the `non_uniform` offsets, in diameters.
    pub random_number_range: f64,
    pub random_number_seed: u64,
}

impl Default for InsertionParameters {
    fn default() -> Self {
        Self {
            method: InsertionMethod::Uniform,
            n_particles: 0,
            inserted_per_step: 0,
            insertion_frequency: 1,
            box_min: Vec::new(),
            box_max: Vec::new(),
            distance_factor: 1.5,
            random_number_range: 0.25,
            random_number_seed: 19,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleProperties {
    pub diameter: f64,
    pub density: f64,
    pub youngs_modulus: f64,
    pub poisson_ratio: f64,
    pub restitution_coefficient: f64,
    pub friction_coefficient: f64,
    pub youngs_modulus_wall: f64,
    pub poisson_ratio_wall: f64,
    pub restitution_coefficient_wall: f64,
    pub friction_coefficient_wall: f64,
    /// Impact velocity setting the stiffness of the linear law.
    pub characteristic_velocity: f64,
}

impl Default for ParticleProperties {
    fn default() -> Self {
        Self {
            diameter: 0.005,
            density: 2500.0,
            youngs_modulus: 1e7,
            poisson_ratio: 0.3,
            restitution_coefficient: 0.9,
            friction_coefficient: 0.3,
            youngs_modulus_wall: 1e7,
            poisson_ratio_wall: 0.3,
            restitution_coefficient_wall: 0.9,
            friction_coefficient_wall: 0.3,
            characteristic_velocity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemParameters {
    pub dt: f64,
    pub n_steps: usize,
    pub gravity: Vec<f64>,
    pub insertion: InsertionParameters,
    pub properties: ParticleProperties,
    pub contact_force: ContactForceModel,
    pub integration: IntegrationMethod,
    /// Steps between two particle locations and broad searches.
    pub contact_detection_frequency: usize,
    pub output_frequency: usize,
}

impl Default for DemParameters {
    fn default() -> Self {
        Self {
            dt: 1e-5,
            n_steps: 1000,
            gravity: Vec::new(),
            insertion: InsertionParameters::default(),
            properties: ParticleProperties::default(),
            contact_force: ContactForceModel::Linear,
            integration: IntegrationMethod::VelocityVerlet,
            contact_detection_frequency: 1,
            output_frequency: 100,
        }
    }
}

impl DemParameters {
    pub fn validate(&self, dim: usize) -> Result<(), ConfigurationError> {
        let ins = &self.insertion;
        if ins.box_min.len() != dim || ins.box_max.len() != dim {
            return Err(ConfigurationError::InvalidParameter {
                name: "insertion box",
                reason: format!("corners need {dim} coordinates"),
            });
        }
        if ins.box_min.iter().zip(&ins.box_max).any(|(lo, hi)| hi <= lo) {
            return Err(ConfigurationError::InvalidParameter {
                name: "insertion box",
                reason: "box_max must exceed box_min on every axis".into(),
            });
        }
        if !self.gravity.is_empty() && self.gravity.len() != dim {
            return Err(ConfigurationError::InvalidParameter {
                name: "gravity",
                reason: format!("{} components in a {dim}D run", self.gravity.len()),
            });
        }
        if self.dt <= 0.0 || self.properties.diameter <= 0.0 || self.properties.density <= 0.0 {
            return Err(ConfigurationError::InvalidParameter {
                name: "dt",
                reason: "time step, diameter and density must be positive".into(),
            });
        }
        Ok(())
    }
}

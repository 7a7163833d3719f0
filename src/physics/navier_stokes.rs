//! Stabilized incompressible Navier-Stokes solver with an optional sharp-edge
//! immersed boundary.
//!
//! The solver owns the discrete state and implements [`NonLinearProblem`], so
//! the generic Newton driver runs each steady solve, time step or SDIRK stage.
//! The first Newton iteration of every solve constrains the correction so that
//! `present + du` meets the boundary data; later corrections are homogeneous.

use crate::config::{InitialConditionType, NavierStokesParameters};
use crate::discretization::dof_handler::DofHandler;
use crate::discretization::fe::FeSystem;
use crate::discretization::mesh::{Mesh, Point};
use crate::error::{ConfigurationError, SolverError};
use crate::numerics::krylov::SolveStats;
use crate::numerics::linear_solver::{LinearSolveDispatcher, SolveRequest};
use crate::numerics::parallel::{Communicator, NoComm, global_norm};
use crate::numerics::simulation_control::SimulationControl;
use crate::numerics::solver::{NewtonSolver, NonLinearProblem, SolverResult};
use crate::numerics::sparse::{SparseMatrix, SparsityPattern};
use crate::numerics::time_integration::TimeSteppingMethod;
use crate::physics::assembler::{AssemblyInput, GlobalAssembler, make_sparsity_pattern};
use crate::physics::bc::{BoundaryConditions, VectorFunction};
use crate::physics::constraints::ConstraintSets;
use crate::physics::immersed::{ImmersedBoundary, ImmersedGeometry};
use crate::physics::initial_condition::{Checkpoint, CheckpointSource, interpolate_nodal, l2_projection};
use crate::physics::postprocessing::{
    PointSample, average_enstrophy, average_kinetic_energy, calculate_cfl, evaluate_at_point,
};
use crate::physics::weak_form::{GlsParameters, TimeTerms};
use nalgebra::DVector;
use tracing::{debug, info, warn};

/// Previous time levels kept: `m1`, `m2`, `m3`.
const HISTORY_LEVELS: usize = 3;

/// Outcome of one accepted steady solve or time step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub iteration: usize,
    pub time: f64,
    pub dt: f64,
    pub newton_iterations: usize,
    pub linear_iterations: usize,
    pub jacobian_assemblies: usize,
    pub final_residual: f64,
    /// Step halvings needed before the step was accepted.
    pub retries: usize,
    pub cfl: f64,
}

pub struct NavierStokesSolver<const DIM: usize> {
    params: NavierStokesParameters,
    mesh: Mesh<DIM>,
    fe: FeSystem<DIM>,
    dofs: DofHandler<DIM>,
    assembler: GlobalAssembler<DIM>,
    bcs: BoundaryConditions<DIM>,
    forcing: Option<VectorFunction<DIM>>,
    initial_function: VectorFunction<DIM>,
    constraints: ConstraintSets,
    /// Sets used by the running Newton solve: `nonzero` is relative to the
    /// state the solve started from.
    newton_constraints: ConstraintSets,
    immersed: Option<ImmersedBoundary<DIM>>,
    constant_modes: Vec<Vec<bool>>,
    matrix: SparseMatrix,
    rhs: DVector<f64>,
    present: DVector<f64>,
    evaluation: DVector<f64>,
    newton_update: DVector<f64>,
    history: Vec<DVector<f64>>,
    simulation_control: SimulationControl,
    dispatcher: LinearSolveDispatcher,
    comm: Box<dyn Communicator>,
    current_method: TimeSteppingMethod,
    viscosity: f64,
}

impl<const DIM: usize> NavierStokesSolver<DIM> {
    /// Validates the configuration and builds the discrete system. Nothing
    /// numerical happens before the parameters pass validation.
    pub fn new(
        params: NavierStokesParameters,
        mesh: Mesh<DIM>,
        bcs: BoundaryConditions<DIM>,
    ) -> Result<Self, SolverError> {
        params.validate(DIM)?;
        bcs.validate(&mesh)?;

        let fe = FeSystem::new(params.fem.velocity_order);
        let dofs = DofHandler::distribute(&mesh, &fe);
        let assembler = GlobalAssembler::new(&fe, params.fem.n_quadrature_points());
        let n = dofs.n_dofs();
        let method = params.simulation_control.method;

        let mut solver = Self {
            simulation_control: SimulationControl::new(params.simulation_control.clone()),
            dispatcher: LinearSolveDispatcher::new(params.linear_solver.clone()),
            viscosity: params.physical_properties.viscosity,
            constant_modes: dofs.constant_modes(),
            params,
            fe,
            assembler,
            bcs,
            forcing: None,
            initial_function: VectorFunction::zero(),
            constraints: ConstraintSets::default(),
            newton_constraints: ConstraintSets::default(),
            immersed: None,
            matrix: SparseMatrix::from_pattern(&SparsityPattern::new(0)),
            rhs: DVector::zeros(n),
            present: DVector::zeros(n),
            evaluation: DVector::zeros(n),
            newton_update: DVector::zeros(n),
            history: vec![DVector::zeros(n); HISTORY_LEVELS],
            comm: Box::new(NoComm {}),
            current_method: method,
            mesh,
            dofs,
        };
        solver.setup_system()?;
        Ok(solver)
    }

    pub fn with_forcing(mut self, forcing: VectorFunction<DIM>) -> Self {
        self.forcing = Some(forcing);
        self
    }

    /// Field used by the nodal and L2 initial conditions; zero by default.
    pub fn with_initial_condition(mut self, function: VectorFunction<DIM>) -> Self {
        self.initial_function = function;
        self
    }

    /// Switches to a distributed communicator. The immersed boundary and the
    /// sparsity pattern depend on the owned cells and are rebuilt.
    pub fn with_communicator(mut self, comm: Box<dyn Communicator>) -> Result<Self, SolverError> {
        self.comm = comm;
        self.setup_system()?;
        Ok(self)
    }

    fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Constraints at `t = 0`, immersed stencils, pattern and matrix.
    fn setup_system(&mut self) -> Result<(), SolverError> {
        self.constraints = self.bcs.make_constraints(&self.mesh, &self.fe, &self.dofs, 0.0)?;
        self.newton_constraints = self.constraints.clone();

        self.immersed = if self.params.immersed_boundary.enabled {
            let geometry = ImmersedGeometry::from_parameters(&self.params.immersed_boundary)?;
            let ib = ImmersedBoundary::setup(
                geometry,
                &self.mesh,
                &self.fe,
                &self.dofs,
                &self.constraints.nonzero,
                self.rank(),
            );
            let report = ib.report();
            info!(
                cut_cells = report.cut_cells,
                rows = report.rows,
                zero_offset = report.zero_offset_rows,
                misses = report.misses.len(),
                "immersed boundary stencils built"
            );
            Some(ib)
        } else {
            None
        };

        let pattern = make_sparsity_pattern(
            &self.mesh,
            &self.dofs,
            &self.constraints.nonzero,
            self.immersed.as_ref(),
        );
        self.matrix = SparseMatrix::from_pattern(&pattern);
        self.dispatcher.reset();
        info!(
            cells = self.mesh.n_cells(),
            dofs = self.dofs.n_dofs(),
            nonzeros = self.matrix.nnz(),
            "system set up"
        );
        Ok(())
    }

    pub fn parameters(&self) -> &NavierStokesParameters {
        &self.params
    }

    pub fn mesh(&self) -> &Mesh<DIM> {
        &self.mesh
    }

    pub fn fe(&self) -> &FeSystem<DIM> {
        &self.fe
    }

    pub fn dofs(&self) -> &DofHandler<DIM> {
        &self.dofs
    }

    pub fn assembler(&self) -> &GlobalAssembler<DIM> {
        &self.assembler
    }

    pub fn constraints(&self) -> &ConstraintSets {
        &self.constraints
    }

    pub fn immersed_boundary(&self) -> Option<&ImmersedBoundary<DIM>> {
        self.immersed.as_ref()
    }

    pub fn present_solution(&self) -> &DVector<f64> {
        &self.present
    }

    /// `[m1, m2, m3]`.
    pub fn history(&self) -> &[DVector<f64>] {
        &self.history
    }

    pub fn system_matrix(&self) -> &SparseMatrix {
        &self.matrix
    }

    pub fn system_rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    pub fn simulation_control(&self) -> &SimulationControl {
        &self.simulation_control
    }

    pub fn linear_solver(&self) -> &LinearSolveDispatcher {
        &self.dispatcher
    }

    /// Overwrites the state, e.g. to evaluate the residual of a known field.
    pub fn set_solution(&mut self, solution: DVector<f64>) {
        self.evaluation.copy_from(&solution);
        self.present = solution;
    }

    /// Sets one history level (`0` is `m1`).
    pub fn set_history(&mut self, level: usize, solution: DVector<f64>) {
        self.history[level] = solution;
    }

    /// Scheme used by the next assembly. The time loop manages it; callers
    /// assembling by hand pick the scheme here.
    pub fn set_time_stepping_method(&mut self, method: TimeSteppingMethod) {
        self.current_method = method;
    }

    fn gls_parameters(&self) -> GlsParameters {
        GlsParameters {
            viscosity: self.viscosity,
            velocity_scale: self.params.stabilization.velocity_scale,
            supg: self.params.stabilization.supg,
            degree: self.fe.degree,
        }
    }

    /// Assembles the rhs, and the Jacobian when `with_matrix`, at the
    /// evaluation point with the constraint set of `initial_step`.
    pub fn assemble_system(&mut self, with_matrix: bool, initial_step: bool) -> Result<(), SolverError> {
        let gls = self.gls_parameters();
        // before the first step, assemble with the configured step
        let steps = match self.simulation_control.step_history() {
            [] => vec![self.simulation_control.dt()],
            history => history.to_vec(),
        };
        let time = TimeTerms::new(self.current_method, &steps)?;
        let time_value = self.simulation_control.time();
        let rank = self.rank();
        let Self {
            ref mesh,
            ref dofs,
            ref assembler,
            ref newton_constraints,
            ref evaluation,
            ref history,
            ref forcing,
            ref comm,
            ref mut matrix,
            ref mut rhs,
            ref mut immersed,
            ..
        } = *self;

        let input = AssemblyInput {
            mesh,
            dofs,
            constraints: newton_constraints.select(initial_step),
            gls,
            time: &time,
            evaluation,
            history,
            forcing: forcing.as_ref(),
            time_value,
            rank,
        };
        assembler.assemble(
            &input,
            with_matrix.then_some(matrix),
            rhs,
            immersed.as_mut(),
            comm.as_ref(),
        )
    }

    /// Current state as a resumable checkpoint.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            time: self.simulation_control.time(),
            iteration: self.simulation_control.iteration(),
            step_history: self.simulation_control.step_history().to_vec(),
            present: self.present.as_slice().to_vec(),
            history: self.history.iter().map(|h| h.as_slice().to_vec()).collect(),
        }
    }

    /// Applies the configured initial condition; `restart.restart` takes
    /// precedence over the configured type.
    pub fn initialize(&mut self, checkpoint: Option<&dyn CheckpointSource>) -> Result<(), SolverError> {
        let kind = if self.params.restart.restart {
            InitialConditionType::Restart
        } else {
            self.params.initial_condition.kind
        };
        self.set_initial_condition(kind, checkpoint)
    }

    /// Sets the present solution and fills every history level with it.
    pub fn set_initial_condition(
        &mut self,
        kind: InitialConditionType,
        checkpoint: Option<&dyn CheckpointSource>,
    ) -> Result<(), SolverError> {
        info!(kind = ?kind, "setting initial condition");
        match kind {
            InitialConditionType::Restart => {
                let source = checkpoint.ok_or(ConfigurationError::MissingCheckpoint)?;
                let cp = source.load()?;
                cp.validate(self.dofs.n_dofs())?;
                self.present = DVector::from_vec(cp.present);
                self.history = cp.history.into_iter().map(DVector::from_vec).collect();
                self.history.resize(HISTORY_LEVELS, self.present.clone());
                self.evaluation.copy_from(&self.present);
                self.simulation_control.resume(cp.time, cp.iteration, &cp.step_history);
                return Ok(());
            }
            InitialConditionType::Nodal => {
                self.present = interpolate_nodal(&self.dofs, &self.initial_function, &self.constraints);
            }
            InitialConditionType::L2Projection => {
                self.present = l2_projection(
                    &self.mesh,
                    &self.dofs,
                    &self.assembler,
                    &self.initial_function,
                    &self.constraints,
                    self.comm.as_ref(),
                    self.rank(),
                )?;
            }
            InitialConditionType::Viscous => {
                self.present = interpolate_nodal(&self.dofs, &self.initial_function, &self.constraints);
                self.viscosity = self.params.initial_condition.viscosity;
                self.current_method = TimeSteppingMethod::Steady;
                let result = self.newton_solve();
                self.viscosity = self.params.physical_properties.viscosity;
                self.current_method = self.params.simulation_control.method;
                let result = result?;
                info!(
                    iterations = result.iterations,
                    residual = result.final_residual,
                    "viscous start-up converged"
                );
            }
        }
        self.evaluation.copy_from(&self.present);
        for level in &mut self.history {
            level.copy_from(&self.present);
        }
        Ok(())
    }

    /// One Newton solve from the present state with the current scheme.
    pub fn newton_solve(&mut self) -> Result<SolverResult, SolverError> {
        self.newton_constraints =
            ConstraintSets::new(self.constraints.nonzero.relative_to(&self.present), self.constraints.zero.clone());
        let newton = NewtonSolver::new(self.params.non_linear_solver.clone());
        newton.solve(self, true)
    }

    /// Solves every stage of the current step. SDIRK stage results other than
    /// the last go to history levels `m2`, `m3`.
    fn solve_stages(&mut self) -> Result<SolverResult, SolverError> {
        self.constraints =
            self.bcs
                .make_constraints(&self.mesh, &self.fe, &self.dofs, self.simulation_control.time())?;

        let mut total: Option<SolverResult> = None;
        for method in self.simulation_control.assembly_methods() {
            self.current_method = method;
            debug!(method = %method, "solving stage");
            let result = self.newton_solve()?;
            if let Some((order, stage)) = method.sdirk_stage() {
                if stage + 1 < order {
                    self.history[1 + stage].copy_from(&self.present);
                }
            }
            total = Some(match total {
                None => result,
                Some(mut acc) => {
                    acc.iterations += result.iterations;
                    acc.linear_iterations += result.linear_iterations;
                    acc.jacobian_assemblies += result.jacobian_assemblies;
                    acc.final_residual = result.final_residual;
                    acc.history.extend(result.history);
                    acc
                }
            });
        }
        total.ok_or_else(|| SolverError::LinearSolveFailed("time step without stages".into()))
    }

    /// Solves the current step, halving it on recoverable failures. The state
    /// is restored before every retry.
    fn advance(&mut self) -> Result<StepReport, SolverError> {
        let start = self.present.clone();
        let max_retries = self.params.simulation_control.max_step_retries;
        let mut retries = 0;
        let result = loop {
            match self.solve_stages() {
                Ok(result) => break result,
                Err(e) if e.is_recoverable() && !self.simulation_control.is_steady() && retries < max_retries => {
                    retries += 1;
                    let dt = self.simulation_control.retry_with_half_step();
                    warn!(error = %e, dt, retries, "time step rejected, retrying with half the step");
                    self.present.copy_from(&start);
                    self.evaluation.copy_from(&start);
                }
                Err(e) => return Err(e),
            }
        };

        let mut cfl = 0.0;
        if !self.simulation_control.is_steady() {
            cfl = calculate_cfl(
                &self.mesh,
                &self.dofs,
                &self.assembler,
                self.fe.degree,
                &self.present,
                self.simulation_control.dt(),
                self.comm.as_ref(),
            )?;
            self.simulation_control.set_cfl(cfl);
            self.history.rotate_right(1);
            self.history[0].copy_from(&self.present);
        }

        Ok(StepReport {
            iteration: self.simulation_control.iteration(),
            time: self.simulation_control.time(),
            dt: self.simulation_control.dt(),
            newton_iterations: result.iterations,
            linear_iterations: result.linear_iterations,
            jacobian_assemblies: result.jacobian_assemblies,
            final_residual: result.final_residual,
            retries,
            cfl,
        })
    }

    /// Runs the steady solve or the whole time loop.
    pub fn solve(&mut self) -> Result<Vec<StepReport>, SolverError> {
        let mut reports = Vec::new();
        while self.simulation_control.integrate() {
            let sc = &self.simulation_control;
            if sc.is_steady() {
                info!("steady solve");
            } else {
                info!(
                    iteration = sc.iteration(),
                    time = sc.time(),
                    dt = sc.dt(),
                    cfl = sc.cfl(),
                    "transient iteration"
                );
            }
            let report = self.advance()?;
            if self.simulation_control.is_output_iteration() {
                let energy = self.kinetic_energy()?;
                let enstrophy = self.enstrophy()?;
                info!(kinetic_energy = energy, enstrophy, "flow statistics");
            }
            reports.push(report);
        }
        Ok(reports)
    }

    pub fn kinetic_energy(&self) -> Result<f64, SolverError> {
        Ok(average_kinetic_energy(
            &self.mesh,
            &self.dofs,
            &self.assembler,
            &self.present,
            self.comm.as_ref(),
        )?)
    }

    pub fn enstrophy(&self) -> Result<f64, SolverError> {
        Ok(average_enstrophy(
            &self.mesh,
            &self.dofs,
            &self.assembler,
            &self.present,
            self.comm.as_ref(),
        )?)
    }

    pub fn evaluate_at(&self, p: &Point<DIM>) -> Option<PointSample<DIM>> {
        evaluate_at_point(&self.mesh, &self.fe, &self.dofs, &self.present, p)
    }
}

impl<const DIM: usize> NonLinearProblem for NavierStokesSolver<DIM> {
    fn n_dofs(&self) -> usize {
        self.dofs.n_dofs()
    }

    fn assemble_matrix_and_rhs(&mut self, initial_step: bool) -> Result<(), SolverError> {
        self.assemble_system(true, initial_step)
    }

    fn assemble_rhs(&mut self, initial_step: bool) -> Result<(), SolverError> {
        self.assemble_system(false, initial_step)
    }

    fn system_rhs_norm(&self) -> f64 {
        global_norm(
            self.comm.as_ref(),
            &self.rhs,
            self.dofs.locally_owned_dofs(self.rank()),
        )
    }

    fn solve_linear_system(&mut self, initial_step: bool, matrix_changed: bool) -> Result<SolveStats, SolverError> {
        let lp = &self.params.linear_solver;
        let request = SolveRequest {
            initial_step,
            absolute_tolerance: lp.minimum_residual,
            relative_tolerance: lp.relative_residual,
            matrix_changed,
        };
        let outcome = self.dispatcher.solve(
            &self.matrix,
            &self.rhs,
            &self.newton_constraints,
            &self.constant_modes,
            request,
            self.comm.as_ref(),
        )?;
        self.newton_update = outcome.update;
        Ok(outcome.stats)
    }

    fn reset_evaluation_point(&mut self) {
        self.evaluation.copy_from(&self.present);
    }

    fn set_trial_evaluation_point(&mut self, alpha: f64) {
        self.evaluation.copy_from(&self.present);
        self.evaluation.axpy(alpha, &self.newton_update, 1.0);
        self.constraints.nonzero.distribute(&mut self.evaluation);
    }

    fn accept_evaluation_point(&mut self) {
        self.present.copy_from(&self.evaluation);
    }
}

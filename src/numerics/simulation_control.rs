//! Time and step bookkeeping for steady and transient runs.

use crate::config::SimulationControlParameters;
use crate::numerics::time_integration::TimeSteppingMethod;

/// Largest factor by which an adaptive step may grow between two steps.
pub const MAX_DT_GROWTH: f64 = 1.2;

#[derive(Debug, Clone)]
pub struct SimulationControl {
    params: SimulationControlParameters,
    time: f64,
    iteration: usize,
    dt: f64,
    /// Most recent step first.
    step_history: Vec<f64>,
    cfl: f64,
}

impl SimulationControl {
    pub fn new(params: SimulationControlParameters) -> Self {
        let dt = params.dt;
        Self {
            params,
            time: 0.0,
            iteration: 0,
            dt,
            step_history: Vec::with_capacity(3),
            cfl: 0.0,
        }
    }

    pub fn parameters(&self) -> &SimulationControlParameters {
        &self.params
    }

    pub fn method(&self) -> TimeSteppingMethod {
        self.params.method
    }

    pub fn is_steady(&self) -> bool {
        self.params.method.is_steady()
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn step_history(&self) -> &[f64] {
        &self.step_history
    }

    pub fn cfl(&self) -> f64 {
        self.cfl
    }

    pub fn set_cfl(&mut self, cfl: f64) {
        self.cfl = cfl;
    }

    /// Continues a run from a checkpointed time level.
    pub fn resume(&mut self, time: f64, iteration: usize, step_history: &[f64]) {
        self.time = time;
        self.iteration = iteration;
        self.step_history = step_history.iter().copied().take(3).collect();
        if let Some(&dt) = self.step_history.first() {
            self.dt = dt;
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.time >= self.params.time_end * (1.0 - 1e-12)
    }

    fn bdf_startup_order(&self) -> Option<usize> {
        let order = self.params.method.bdf_order()?;
        (self.iteration < order).then_some(self.iteration.max(1))
    }

    fn next_dt(&self) -> f64 {
        let mut dt = self.dt;
        if self.params.adapt && self.iteration > 0 && self.cfl > 0.0 {
            dt = (dt * self.params.max_cfl / self.cfl).min(dt * MAX_DT_GROWTH);
        }
        if self.bdf_startup_order().is_some() {
            dt = self.params.dt * self.params.startup_timestep_scaling;
        }
        let remaining = self.params.time_end - self.time;
        if remaining > 0.0 && dt > remaining {
            dt = remaining;
        }
        dt
    }

    /// Advances to the next step; `false` once the run is complete. A steady
    /// run integrates exactly once.
    pub fn integrate(&mut self) -> bool {
        if self.is_steady() {
            if self.iteration > 0 {
                return false;
            }
            self.iteration = 1;
            return true;
        }
        if self.is_at_end() {
            return false;
        }
        self.iteration += 1;
        self.dt = self.next_dt();
        self.step_history.insert(0, self.dt);
        self.step_history.truncate(3);
        self.time += self.dt;
        true
    }

    /// Schemes to assemble, in order, to complete the current step. BDF2 and
    /// BDF3 fall back to lower orders until enough history exists.
    pub fn assembly_methods(&self) -> Vec<TimeSteppingMethod> {
        match self.bdf_startup_order() {
            Some(1) => vec![TimeSteppingMethod::Bdf1],
            Some(2) => vec![TimeSteppingMethod::Bdf2],
            _ => self.params.method.stages(),
        }
    }

    /// Rejects the current step and retries it with half the step size.
    pub fn retry_with_half_step(&mut self) -> f64 {
        self.time -= self.dt;
        self.dt *= 0.5;
        self.time += self.dt;
        if let Some(first) = self.step_history.first_mut() {
            *first = self.dt;
        }
        self.dt
    }

    pub fn is_output_iteration(&self) -> bool {
        self.params.output_frequency > 0 && self.iteration % self.params.output_frequency == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn transient(method: TimeSteppingMethod, dt: f64, time_end: f64) -> SimulationControl {
        SimulationControl::new(SimulationControlParameters {
            method,
            dt,
            time_end,
            ..SimulationControlParameters::default()
        })
    }

    #[test]
    fn steady_runs_once() {
        let mut sc = SimulationControl::new(SimulationControlParameters::default());
        assert!(sc.integrate());
        assert!(!sc.integrate());
        assert_eq!(sc.assembly_methods(), vec![TimeSteppingMethod::Steady]);
    }

    #[test]
    fn bdf3_starts_with_lower_orders() {
        let mut sc = transient(TimeSteppingMethod::Bdf3, 0.1, 1.0);
        sc.integrate();
        assert_eq!(sc.assembly_methods(), vec![TimeSteppingMethod::Bdf1]);
        sc.integrate();
        assert_eq!(sc.assembly_methods(), vec![TimeSteppingMethod::Bdf2]);
        sc.integrate();
        assert_eq!(sc.assembly_methods(), vec![TimeSteppingMethod::Bdf3]);
        assert_eq!(sc.step_history().len(), 3);
    }

    #[test]
    fn last_step_lands_on_time_end() {
        let mut sc = transient(TimeSteppingMethod::Bdf1, 0.3, 1.0);
        let mut steps = 0;
        while sc.integrate() {
            steps += 1;
        }
        assert_eq!(steps, 4);
        assert_relative_eq!(sc.time(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(sc.step_history()[0], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn adaptive_growth_is_capped() {
        let mut sc = SimulationControl::new(SimulationControlParameters {
            method: TimeSteppingMethod::Bdf1,
            dt: 0.01,
            time_end: 10.0,
            adapt: true,
            max_cfl: 1.0,
            ..SimulationControlParameters::default()
        });
        sc.integrate();
        sc.set_cfl(0.01);
        sc.integrate();
        assert_relative_eq!(sc.dt(), 0.012, epsilon = 1e-12);
        sc.set_cfl(2.4);
        sc.integrate();
        assert_relative_eq!(sc.dt(), 0.005, epsilon = 1e-12);
    }

    #[test]
    fn resumed_run_continues_from_checkpoint() {
        let mut sc = transient(TimeSteppingMethod::Bdf2, 0.1, 1.0);
        sc.resume(0.5, 5, &[0.1, 0.1]);
        assert!(sc.integrate());
        assert_eq!(sc.iteration(), 6);
        assert_eq!(sc.assembly_methods(), vec![TimeSteppingMethod::Bdf2]);
        assert_relative_eq!(sc.time(), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn rejected_step_is_halved_in_place() {
        let mut sc = transient(TimeSteppingMethod::Sdirk2, 0.2, 1.0);
        sc.integrate();
        assert_eq!(sc.assembly_methods().len(), 2);
        sc.retry_with_half_step();
        assert_relative_eq!(sc.time(), 0.1, epsilon = 1e-12);
        assert_relative_eq!(sc.step_history()[0], 0.1, epsilon = 1e-12);
    }
}

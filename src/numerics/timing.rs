//! Per-phase wall clock accounting for a Newton solve, compiled in with the
//! `timing` feature. Without it every call is a passthrough.

#[cfg(feature = "timing")]
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Assembly,
    ImmersedBoundary,
    Preconditioner,
    LinearSolve,
}

impl Phase {
    const ALL: [Phase; 4] = [
        Phase::Assembly,
        Phase::ImmersedBoundary,
        Phase::Preconditioner,
        Phase::LinearSolve,
    ];

    fn label(self) -> &'static str {
        match self {
            Phase::Assembly => "Assembly",
            Phase::ImmersedBoundary => "Sharp edge",
            Phase::Preconditioner => "Preconditioner",
            Phase::LinearSolve => "Linear solve",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct TimingStats {
    samples: [Vec<Duration>; 4],
    pub total_time: Duration,
}

impl TimingStats {
    pub fn samples(&self, phase: Phase) -> &[Duration] {
        &self.samples[phase as usize]
    }

    pub fn phase_total(&self, phase: Phase) -> Duration {
        self.samples(phase).iter().sum()
    }

    fn average_ms(&self, phase: Phase) -> f64 {
        let n = self.samples(phase).len();
        if n == 0 {
            0.0
        } else {
            self.phase_total(phase).as_secs_f64() * 1000.0 / n as f64
        }
    }

    pub fn print_summary(&self) {
        if self.samples(Phase::Assembly).is_empty() {
            return;
        }
        let accounted: Duration = Phase::ALL.iter().map(|&p| self.phase_total(p)).sum();
        let overhead = self.total_time.saturating_sub(accounted);

        println!("\n{}", "=".repeat(60));
        println!("{:^60}", "NEWTON SOLVE TIMING");
        println!("{}", "=".repeat(60));
        println!("Total solver time:             {:.3}s", self.total_time.as_secs_f64());
        println!("{}", "-".repeat(60));
        for phase in Phase::ALL {
            println!(
                "  {:<24} {:>9.3}ms  (avg: {:>9.3}ms, {} calls)",
                format!("{}:", phase.label()),
                self.phase_total(phase).as_secs_f64() * 1000.0,
                self.average_ms(phase),
                self.samples(phase).len()
            );
        }
        println!("{}", "-".repeat(60));
        println!("Overhead/Other:                {:>9.3}ms\n", overhead.as_secs_f64() * 1000.0);
    }
}

#[cfg(feature = "timing")]
thread_local! {
    static TIMING_STATS: RefCell<TimingStats> = RefCell::new(TimingStats::default());
}

#[cfg(feature = "timing")]
pub fn reset_timing() {
    TIMING_STATS.with(|stats| *stats.borrow_mut() = TimingStats::default());
}

#[cfg(not(feature = "timing"))]
pub fn reset_timing() {}

#[cfg(feature = "timing")]
pub fn record<F: FnOnce() -> R, R>(phase: Phase, f: F) -> R {
    let start = std::time::Instant::now();
    let result = f();
    let elapsed = start.elapsed();
    TIMING_STATS.with(|stats| stats.borrow_mut().samples[phase as usize].push(elapsed));
    result
}

#[cfg(not(feature = "timing"))]
pub fn record<F: FnOnce() -> R, R>(_phase: Phase, f: F) -> R {
    f()
}

#[cfg(feature = "timing")]
pub fn finalize_timing(total_time: Duration) -> TimingStats {
    TIMING_STATS.with(|stats| {
        let mut s = stats.borrow_mut();
        s.total_time = total_time;
        s.clone()
    })
}

#[cfg(not(feature = "timing"))]
pub fn finalize_timing(total_time: Duration) -> TimingStats {
    TimingStats {
        total_time,
        ..TimingStats::default()
    }
}

pub fn finalize_and_print(total_time: Duration) {
    finalize_timing(total_time).print_summary();
}

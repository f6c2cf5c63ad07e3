//! Per-solver statistics, printed with `--stats`.

use std::time::Duration;

/// Counters and timings accumulated over the setups and solves of one solver.
#[derive(Debug, Clone, Default)]
pub struct SolverStats {
    pub n_setups: u32,
    pub n_solves: u32,
    pub n_iterations_last: u32,
    pub n_iterations_min: u32,
    pub n_iterations_max: u32,
    pub n_iterations_total: u64,
    pub setup_time: Duration,
    pub solve_time: Duration,
    // Device counters (read from the device by the caller)
    pub dispatches: u32,
    pub readbacks: u32,
}

impl SolverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_setup(&mut self, elapsed: Duration) {
        self.n_setups += 1;
        self.setup_time += elapsed;
    }

    pub fn record_solve(&mut self, n_iterations: u32, elapsed: Duration) {
        if self.n_solves == 0 {
            self.n_iterations_min = n_iterations;
            self.n_iterations_max = n_iterations;
        } else {
            self.n_iterations_min = self.n_iterations_min.min(n_iterations);
            self.n_iterations_max = self.n_iterations_max.max(n_iterations);
        }
        self.n_solves += 1;
        self.n_iterations_last = n_iterations;
        self.n_iterations_total += u64::from(n_iterations);
        self.solve_time += elapsed;
    }

    pub fn mean_iterations(&self) -> f64 {
        if self.n_solves == 0 {
            0.0
        } else {
            self.n_iterations_total as f64 / self.n_solves as f64
        }
    }

    /// Print the stats table to stderr.
    pub fn display(&self, name: &str) {
        eprintln!();
        eprintln!("=== Linear solver stats: {} ===", name);
        eprintln!("  Setups:                 {}", self.n_setups);
        eprintln!(
            "  Setup time:             {:>8.3}s",
            self.setup_time.as_secs_f64()
        );
        eprintln!("  Solves:                 {}", self.n_solves);
        if self.n_solves > 0 {
            eprintln!(
                "  Iterations:             last={}  min={}  max={}  mean={:.1}",
                self.n_iterations_last,
                self.n_iterations_min,
                self.n_iterations_max,
                self.mean_iterations()
            );
        }
        eprintln!(
            "  Solve time:             {:>8.3}s",
            self.solve_time.as_secs_f64()
        );
        eprintln!("  ─────────────────────────────────");
        eprintln!("  Dispatches:             {}", self.dispatches);
        eprintln!("  Readbacks:              {}", self.readbacks);
    }
}

//! Solve states and convergence policies.

use std::fmt;

/// State of a relaxation solve. Only `Iterating` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveState {
    Iterating,
    Converged,
    MaxIteration,
    Diverged,
    Stalled,
}

impl SolveState {
    pub fn is_terminal(self) -> bool {
        self != Self::Iterating
    }
}

impl fmt::Display for SolveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Iterating => "iterating",
            Self::Converged => "converged",
            Self::MaxIteration => "max iteration",
            Self::Diverged => "diverged",
            Self::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// Convergence bookkeeping for one solve call, kept current by the solver
/// before each policy query.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    pub name: String,
    pub verbosity: u8,
    pub n_iterations: u32,
    pub n_iterations_max: u32,
    pub precision: f64,
    /// Residual normalization supplied by the caller.
    pub r_norm: f64,
    /// Last residual, `+∞` until the first iteration completes.
    pub residual: f64,
    /// Residual of iteration 1.
    pub initial_residual: Option<f64>,
}

impl ConvergenceInfo {
    pub fn new(
        name: &str,
        verbosity: u8,
        n_iterations_max: u32,
        precision: f64,
        r_norm: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            verbosity,
            n_iterations: 0,
            n_iterations_max,
            precision,
            r_norm,
            residual: f64::INFINITY,
            initial_residual: None,
        }
    }
}

/// Decides the next state from the iteration count and global residual.
///
/// Must be deterministic in its inputs: every rank evaluates it on the same
/// globally reduced residual and has to reach the same answer.
pub trait ConvergencePolicy {
    fn test(&mut self, iteration: u32, residual: f64, info: &mut ConvergenceInfo) -> SolveState;
}

impl<F> ConvergencePolicy for F
where
    F: FnMut(u32, f64, &ConvergenceInfo) -> SolveState,
{
    fn test(&mut self, iteration: u32, residual: f64, info: &mut ConvergenceInfo) -> SolveState {
        self(iteration, residual, info)
    }
}

/// Residual at or above this multiple of the initial residual may be divergence.
const DIVERGENCE_FACTOR: f64 = 1.0e4;
/// Absolute floor for divergence detection.
const DIVERGENCE_FLOOR: f64 = 100.0;

/// Default policy: relative precision, iteration cap, divergence guard and
/// an optional stall window.
#[derive(Debug, Clone)]
pub struct ResidualPolicy {
    stall_window: Option<u32>,
    best_residual: f64,
    best_iteration: u32,
}

impl ResidualPolicy {
    pub fn new(stall_window: Option<u32>) -> Self {
        Self {
            stall_window,
            best_residual: f64::INFINITY,
            best_iteration: 0,
        }
    }
}

impl Default for ResidualPolicy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ConvergencePolicy for ResidualPolicy {
    fn test(&mut self, iteration: u32, residual: f64, info: &mut ConvergenceInfo) -> SolveState {
        // A new solve call starts over.
        if iteration <= 1 {
            self.best_residual = f64::INFINITY;
            self.best_iteration = 0;
        }
        if residual <= info.precision * info.r_norm {
            return SolveState::Converged;
        }
        if iteration >= info.n_iterations_max {
            return SolveState::MaxIteration;
        }
        let initial = info.initial_residual.unwrap_or(residual);
        let grown = residual > DIVERGENCE_FACTOR * initial && residual > DIVERGENCE_FLOOR;
        if !residual.is_finite() || grown {
            return SolveState::Diverged;
        }
        if residual < self.best_residual {
            self.best_residual = residual;
            self.best_iteration = iteration;
        } else if let Some(window) = self.stall_window {
            if iteration - self.best_iteration >= window {
                return SolveState::Stalled;
            }
        }
        SolveState::Iterating
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(n_max: u32, precision: f64, r_norm: f64) -> ConvergenceInfo {
        ConvergenceInfo::new("test", 0, n_max, precision, r_norm)
    }

    #[test]
    fn test_info_starts_unknown() {
        let info = info(10, 1e-5, 1.0);
        assert_eq!(info.residual, f64::INFINITY);
        assert_eq!(info.initial_residual, None);
        assert_eq!(info.n_iterations, 0);
    }

    #[test]
    fn test_converged_before_max_iteration() {
        let mut policy = ResidualPolicy::default();
        let mut info = info(1, 1e-3, 10.0);
        assert_eq!(policy.test(1, 0.01, &mut info), SolveState::Converged);
        assert_eq!(policy.test(1, 0.5, &mut info), SolveState::MaxIteration);
    }

    #[test]
    fn test_divergence() {
        let mut policy = ResidualPolicy::default();
        let mut info = info(100, 1e-8, 1.0);
        info.initial_residual = Some(1.0);
        assert_eq!(policy.test(2, 50.0, &mut info), SolveState::Iterating);
        assert_eq!(policy.test(3, 2.0e4, &mut info), SolveState::Diverged);
        assert_eq!(policy.test(4, f64::NAN, &mut info), SolveState::Diverged);
        assert_eq!(
            policy.test(5, f64::INFINITY, &mut info),
            SolveState::Diverged
        );
    }

    #[test]
    fn test_small_growth_is_not_divergence() {
        // Above 1e4 x initial but under the absolute floor.
        let mut policy = ResidualPolicy::default();
        let mut info = info(100, 1e-12, 1.0);
        info.initial_residual = Some(1e-6);
        assert_eq!(policy.test(2, 50.0, &mut info), SolveState::Iterating);
    }

    #[test]
    fn test_stall_window() {
        let mut policy = ResidualPolicy::new(Some(3));
        let mut info = info(100, 1e-12, 1.0);
        info.initial_residual = Some(1.0);
        assert_eq!(policy.test(1, 1.0, &mut info), SolveState::Iterating);
        assert_eq!(policy.test(2, 0.5, &mut info), SolveState::Iterating);
        assert_eq!(policy.test(3, 0.6, &mut info), SolveState::Iterating);
        assert_eq!(policy.test(4, 0.5, &mut info), SolveState::Iterating);
        assert_eq!(policy.test(5, 0.7, &mut info), SolveState::Stalled);
    }

    #[test]
    fn test_closure_policy() {
        let mut calls = 0;
        let mut policy = |iteration: u32, _residual: f64, _info: &ConvergenceInfo| {
            calls += 1;
            if iteration >= 2 {
                SolveState::Converged
            } else {
                SolveState::Iterating
            }
        };
        let mut info = info(10, 0.0, 0.0);
        assert_eq!(policy.test(1, 1.0, &mut info), SolveState::Iterating);
        assert_eq!(policy.test(2, 1.0, &mut info), SolveState::Converged);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SolveState::Iterating.is_terminal());
        assert!(SolveState::Converged.is_terminal());
        assert!(SolveState::Stalled.is_terminal());
    }
}

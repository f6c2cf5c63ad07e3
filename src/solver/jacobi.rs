//! Jacobi and block-Jacobi relaxation driver.
//!
//! Each iteration applies the off-diagonal operator to the previous iterate,
//! issues the fused relax-and-reduce kernels, reads back the local squared
//! residual, sums it across ranks and asks the convergence policy whether
//! to continue. The same loop runs with direct launches or a captured graph.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{RelaxError, Result};
use crate::stats::SolverStats;

use super::comm::{CommunicationBackend, SingleProcessComm};
use super::convergence::{ConvergenceInfo, ConvergencePolicy, ResidualPolicy, SolveState};
use super::device::{RelaxDevice, RelaxSweep};
use super::factorize::{check_block_size, DiagonalInverse};
use super::graph::{KernelLauncher, LaunchMode, Launcher};
use super::kernels::RelaxKernel;
use super::SystemMatrix;

/// Norms at or below this are treated as zero.
const EPZERO: f64 = 1.0e-30;

/// Solver settings, fixed at setup.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub n_max_iter: u32,
    /// Relative precision: converged when `residual <= precision * r_norm`.
    pub precision: f64,
    /// 0 silent, 1 summary per solve, 2 and above one event per iteration.
    pub verbosity: u8,
    pub launch: LaunchMode,
    /// Stop as `Stalled` after this many iterations without a new minimum.
    pub stall_window: Option<u32>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            n_max_iter: 10_000,
            precision: 1.0e-5,
            verbosity: 0,
            launch: LaunchMode::Direct,
            stall_window: None,
        }
    }
}

/// Where the previous-iterate scratch of a solve call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchOrigin {
    Borrowed,
    Allocated,
}

/// Previous-iterate scratch: a caller buffer on loan, or owned and dropped
/// when the solve returns.
pub enum ScratchBuffer<'a, B> {
    Borrowed(&'a B),
    Owned(B),
}

impl<B> ScratchBuffer<'_, B> {
    pub fn buffer(&self) -> &B {
        match self {
            Self::Borrowed(b) => b,
            Self::Owned(b) => b,
        }
    }

    pub fn origin(&self) -> ScratchOrigin {
        match self {
            Self::Borrowed(_) => ScratchOrigin::Borrowed,
            Self::Owned(_) => ScratchOrigin::Allocated,
        }
    }
}

/// Buffers and normalization for one solve call.
pub struct SolveRequest<'a, B> {
    pub rhs: &'a B,
    /// Initial guess on entry, last iterate on exit.
    pub vx: &'a B,
    /// Residual normalization; must be identical on every rank.
    pub r_norm: f64,
    /// Optional scratch, used when it holds at least `n_cols_ext * block_size` values.
    pub aux: Option<&'a B>,
}

/// Result of a solve call. Non-convergence is a state, not an error.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub state: SolveState,
    pub n_iterations: u32,
    pub residual: f64,
    pub initial_residual: Option<f64>,
    /// Global residual of each iteration.
    pub history: Vec<f64>,
    /// `None` when the call returned before the loop.
    pub scratch: Option<ScratchOrigin>,
}

/// Jacobi solver bound to one matrix shape and one device.
pub struct JacobiSolver<D: RelaxDevice> {
    name: String,
    config: SolverConfig,
    kernel: RelaxKernel,
    n_rows: usize,
    ad: D::Buffer,
    ad_inv: D::Buffer,
    comm: Arc<dyn CommunicationBackend>,
    stats: SolverStats,
}

impl<D: RelaxDevice> JacobiSolver<D> {
    /// Factorize the diagonal of `matrix` and upload it to `device`.
    pub fn setup<M>(name: &str, device: &D, matrix: &M, config: SolverConfig) -> Result<Self>
    where
        M: SystemMatrix<D> + ?Sized,
    {
        let block_size = matrix.diag_block_size();
        check_block_size(block_size)?;
        let inverse = DiagonalInverse::factorize(matrix.diagonal(), block_size)?;
        Self::setup_with_inverse(name, device, matrix, config, &inverse)
    }

    /// Set up from a caller-computed inverse diagonal.
    pub fn setup_with_inverse<M>(
        name: &str,
        device: &D,
        matrix: &M,
        config: SolverConfig,
        inverse: &DiagonalInverse,
    ) -> Result<Self>
    where
        M: SystemMatrix<D> + ?Sized,
    {
        let _span = tracing::info_span!("jacobi_setup", name).entered();
        let start = Instant::now();

        let block_size = matrix.diag_block_size();
        check_block_size(block_size)?;
        let n_rows = matrix.n_rows();
        if inverse.block_size() != block_size || inverse.n_rows() != n_rows {
            return Err(RelaxError::Precondition(format!(
                "inverse diagonal is {} rows of block size {}, matrix is {} rows of block size {}",
                inverse.n_rows(),
                inverse.block_size(),
                n_rows,
                block_size
            )));
        }
        if matrix.diagonal().len() != n_rows * block_size * block_size {
            return Err(RelaxError::Precondition(format!(
                "matrix diagonal has {} values for {} rows of block size {}",
                matrix.diagonal().len(),
                n_rows,
                block_size
            )));
        }
        if matrix.n_cols_ext() < n_rows {
            return Err(RelaxError::Precondition(
                "matrix has fewer extended columns than rows".into(),
            ));
        }

        let kernel = RelaxKernel::for_inverse(inverse);
        let ad = device.upload(matrix.diagonal())?;
        let ad_inv = device.upload(inverse.values())?;

        let elapsed = start.elapsed();
        let mut stats = SolverStats::new();
        stats.record_setup(elapsed);
        tracing::debug!(
            kernel = kernel.name(),
            n_rows,
            block_size,
            device = device.label(),
            setup_us = elapsed.as_micros() as u64,
            "relaxation setup"
        );

        Ok(Self {
            name: name.to_string(),
            config,
            kernel,
            n_rows,
            ad,
            ad_inv,
            comm: Arc::new(SingleProcessComm),
            stats,
        })
    }

    /// Aggregate residuals over `comm` instead of the local process only.
    pub fn with_comm(mut self, comm: Arc<dyn CommunicationBackend>) -> Self {
        self.comm = comm;
        self
    }

    pub fn kernel(&self) -> RelaxKernel {
        self.kernel
    }

    pub fn stats(&self) -> &SolverStats {
        &self.stats
    }

    /// Default policy for this solver's configuration.
    pub fn default_policy(&self) -> ResidualPolicy {
        ResidualPolicy::new(self.config.stall_window)
    }

    /// Relax `request.vx` until `policy` reaches a terminal state.
    ///
    /// Preconditions are checked before `vx` is touched. Once iterating,
    /// `vx` holds the latest iterate whatever the outcome.
    pub fn solve<M, P>(
        &mut self,
        device: &D,
        matrix: &M,
        request: SolveRequest<'_, D::Buffer>,
        policy: &mut P,
    ) -> Result<SolveOutcome>
    where
        M: SystemMatrix<D> + ?Sized,
        P: ConvergencePolicy + ?Sized,
    {
        let _span = tracing::info_span!(
            "jacobi_solve",
            name = %self.name,
            kernel = self.kernel.name(),
            device = device.label()
        )
        .entered();
        let start = Instant::now();

        let b = self.kernel.block_size();
        self.validate(device, matrix, &request)?;
        let n_owned = self.n_rows * b;
        let n_ext = matrix.n_cols_ext() * b;

        let mut info = ConvergenceInfo::new(
            &self.name,
            self.config.verbosity,
            self.config.n_max_iter,
            self.config.precision,
            request.r_norm,
        );

        if request.r_norm <= EPZERO && !self.needs_solving(device, request.rhs, n_owned)? {
            self.stats.record_solve(0, start.elapsed());
            if self.config.verbosity >= 1 {
                tracing::info!("zero right-hand side, nothing to solve");
            }
            return Ok(SolveOutcome {
                state: SolveState::Converged,
                n_iterations: 0,
                residual: 0.0,
                initial_residual: None,
                history: Vec::new(),
                scratch: None,
            });
        }

        let scratch = match request.aux {
            Some(aux) if device.buffer_len(aux) >= n_ext => ScratchBuffer::Borrowed(aux),
            aux => {
                if let Some(aux) = aux {
                    tracing::debug!(
                        aux_len = device.buffer_len(aux),
                        needed = n_ext,
                        "auxiliary buffer too small, allocating scratch"
                    );
                }
                ScratchBuffer::Owned(device.alloc(n_ext)?)
            }
        };
        let rk = scratch.buffer();
        device.copy(request.vx, rk, n_owned)?;

        let geometry = device.geometry(self.n_rows);
        let partials = device.alloc(geometry.n_blocks)?;
        let residual_buf = device.alloc(1)?;
        let sweep = RelaxSweep {
            kernel: self.kernel,
            n_rows: self.n_rows,
            geometry,
            ad: &self.ad,
            ad_inv: &self.ad_inv,
            rhs: request.rhs,
            vx: request.vx,
            rk,
            partials: &partials,
            residual: &residual_buf,
        };
        let mut launcher = Launcher::<D>::new(self.config.launch);
        let mut history = Vec::new();

        let mut iteration = 0u32;
        let state = loop {
            iteration += 1;

            matrix.apply_off_diagonal(device, rk, request.vx)?;
            launcher.issue(device, &sweep)?;
            let local = device.read_scalar(&residual_buf)?;
            let residual = self.comm.all_reduce_sum(local).sqrt();

            if iteration == 1 {
                info.initial_residual = Some(residual);
            }
            info.n_iterations = iteration;
            info.residual = residual;
            history.push(residual);

            let state = policy.test(iteration, residual, &mut info);
            if self.config.verbosity >= 2 {
                tracing::debug!(iteration, residual, "relaxation sweep");
            }
            if state.is_terminal() {
                break state;
            }
        };

        self.stats.record_solve(iteration, start.elapsed());
        if self.config.verbosity >= 1 {
            tracing::info!(
                state = %state,
                iterations = iteration,
                residual = info.residual,
                "relaxation finished"
            );
        }

        Ok(SolveOutcome {
            state,
            n_iterations: iteration,
            residual: info.residual,
            initial_residual: info.initial_residual,
            history,
            scratch: Some(scratch.origin()),
        })
    }

    fn validate<M>(
        &self,
        device: &D,
        matrix: &M,
        request: &SolveRequest<'_, D::Buffer>,
    ) -> Result<()>
    where
        M: SystemMatrix<D> + ?Sized,
    {
        let b = self.kernel.block_size();
        if matrix.n_rows() != self.n_rows || matrix.diag_block_size() != b {
            return Err(RelaxError::Precondition(format!(
                "matrix has {} rows of block size {}, solver expects {} rows of block size {}",
                matrix.n_rows(),
                matrix.diag_block_size(),
                self.n_rows,
                b
            )));
        }
        let n_owned = self.n_rows * b;
        for (what, buf) in [("rhs", request.rhs), ("vx", request.vx)] {
            let len = device.buffer_len(buf);
            if len < n_owned {
                return Err(RelaxError::Precondition(format!(
                    "{what} holds {len} values, {n_owned} required"
                )));
            }
        }
        if device.same_buffer(request.rhs, request.vx) {
            return Err(RelaxError::Precondition(
                "vx and rhs are the same buffer".into(),
            ));
        }
        if let Some(aux) = request.aux {
            if device.same_buffer(aux, request.vx) || device.same_buffer(aux, request.rhs) {
                return Err(RelaxError::Precondition(
                    "auxiliary buffer aliases vx or rhs".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether the global right-hand side norm exceeds `EPZERO`.
    fn needs_solving(&self, device: &D, rhs: &D::Buffer, n_owned: usize) -> Result<bool> {
        let mut host = vec![0.0; n_owned];
        device.download(rhs, &mut host)?;
        let local: f64 = host.iter().map(|v| v * v).sum();
        let norm = self.comm.all_reduce_sum(local).sqrt();
        Ok(norm > EPZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::host::HostDevice;
    use crate::sparse::MsrMatrix;

    fn diag_matrix(n: usize, d: f64) -> MsrMatrix {
        MsrMatrix::from_triplets(n, n, 1, vec![d; n], &[]).unwrap()
    }

    #[test]
    fn test_single_sweep_diagonal_system() {
        let dev = HostDevice::new();
        let m = diag_matrix(4, 2.0);
        let config = SolverConfig {
            n_max_iter: 1,
            precision: 0.0,
            ..Default::default()
        };
        let mut solver = JacobiSolver::setup("diag", &dev, &m, config).unwrap();
        let rhs = dev.upload(&[2.0; 4]).unwrap();
        let vx = dev.alloc(4).unwrap();
        let mut policy = solver.default_policy();
        let outcome = solver
            .solve(
                &dev,
                &m,
                SolveRequest {
                    rhs: &rhs,
                    vx: &vx,
                    r_norm: 1.0,
                    aux: None,
                },
                &mut policy,
            )
            .unwrap();
        assert_eq!(vx.to_vec(), vec![1.0; 4]);
        assert_eq!(outcome.residual, 4.0);
        assert_eq!(outcome.initial_residual, Some(4.0));
        assert_eq!(outcome.state, SolveState::MaxIteration);
        assert_eq!(outcome.scratch, Some(ScratchOrigin::Allocated));
    }

    #[test]
    fn test_precondition_leaves_vx_untouched() {
        let dev = HostDevice::new();
        let m = diag_matrix(4, 2.0);
        let mut solver = JacobiSolver::setup("diag", &dev, &m, SolverConfig::default()).unwrap();
        let rhs = dev.upload(&[2.0; 3]).unwrap();
        let vx = dev.upload(&[7.0; 4]).unwrap();
        let mut policy = solver.default_policy();
        let err = solver.solve(
            &dev,
            &m,
            SolveRequest {
                rhs: &rhs,
                vx: &vx,
                r_norm: 1.0,
                aux: None,
            },
            &mut policy,
        );
        assert!(matches!(err, Err(RelaxError::Precondition(_))));
        assert_eq!(vx.to_vec(), vec![7.0; 4]);
    }

    #[test]
    fn test_inverse_shape_checked() {
        let dev = HostDevice::new();
        let m = diag_matrix(4, 2.0);
        let inverse = DiagonalInverse::factorize(&[2.0; 3], 1).unwrap();
        let config = SolverConfig::default();
        let err = JacobiSolver::setup_with_inverse("diag", &dev, &m, config, &inverse);
        assert!(matches!(err, Err(RelaxError::Precondition(_))));
    }

    #[test]
    fn test_stats_recorded() {
        let dev = HostDevice::new();
        let m = diag_matrix(2, 2.0);
        let mut solver = JacobiSolver::setup("diag", &dev, &m, SolverConfig::default()).unwrap();
        let rhs = dev.upload(&[2.0; 2]).unwrap();
        let vx = dev.alloc(2).unwrap();
        let mut policy = solver.default_policy();
        for _ in 0..2 {
            solver
                .solve(
                    &dev,
                    &m,
                    SolveRequest {
                        rhs: &rhs,
                        vx: &vx,
                        r_norm: 1.0,
                        aux: None,
                    },
                    &mut policy,
                )
                .unwrap();
        }
        assert_eq!(solver.stats().n_setups, 1);
        assert_eq!(solver.stats().n_solves, 2);
    }
}

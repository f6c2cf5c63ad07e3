//! Relaxation solvers and their execution layer.

pub mod comm;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod convergence;
pub mod device;
pub mod factorize;
pub mod gpu;
pub mod gpu_shaders;
pub mod graph;
pub mod host;
pub mod jacobi;
pub mod kernels;
pub mod reduction;

use crate::error::Result;

use device::RelaxDevice;

pub use convergence::{ConvergenceInfo, ConvergencePolicy, ResidualPolicy, SolveState};
pub use factorize::{DiagonalInverse, MAX_BLOCK_SIZE};
pub use graph::LaunchMode;
pub use jacobi::{JacobiSolver, ScratchOrigin, SolveOutcome, SolveRequest, SolverConfig};
pub use kernels::RelaxKernel;

/// System matrix as seen by the relaxation loop, on device `D`.
///
/// The solver only reads the diagonal at setup and applies the
/// off-diagonal part once per iteration; it never modifies the matrix.
pub trait SystemMatrix<D: RelaxDevice> {
    /// Owned block rows.
    fn n_rows(&self) -> usize;

    /// Owned plus ghost block rows.
    fn n_cols_ext(&self) -> usize;

    fn diag_block_size(&self) -> usize;

    /// Diagonal blocks on the host, `n_rows * b²` values, row-major blocks.
    fn diagonal(&self) -> &[f64];

    /// `y = E * x` for the off-diagonal part `E`, on `device`'s queue.
    ///
    /// May refresh the ghost part of `x` from neighbor ranks first.
    fn apply_off_diagonal(&self, device: &D, x: &D::Buffer, y: &D::Buffer) -> Result<()>;
}

//! Execution device abstraction for relaxation sweeps.
//!
//! A device owns buffers and runs the two kernels of a sweep (fused
//! relax-and-reduce, then the partial reduction) on a single in-order queue.
//! `read_scalar` is the only point where the host waits for the device.

use crate::error::Result;

use super::kernels::RelaxKernel;

/// Thread-block layout of a fused kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub threads_per_block: usize,
    /// Always at least one, so the reduction has a partial to read.
    pub n_blocks: usize,
}

impl LaunchGeometry {
    pub fn new(n_rows: usize, threads_per_block: usize) -> Self {
        Self {
            threads_per_block,
            n_blocks: n_rows.div_ceil(threads_per_block).max(1),
        }
    }
}

/// Buffers and shape of one relaxation sweep.
///
/// The same sweep is issued every iteration of a solve call, which is what
/// allows it to be captured once and replayed.
pub struct RelaxSweep<'a, B> {
    pub kernel: RelaxKernel,
    pub n_rows: usize,
    pub geometry: LaunchGeometry,
    pub ad: &'a B,
    pub ad_inv: &'a B,
    pub rhs: &'a B,
    /// Off-diagonal product on entry, new iterate on exit.
    pub vx: &'a B,
    /// Previous iterate on entry, new iterate on exit.
    pub rk: &'a B,
    /// One squared-residual partial per thread block.
    pub partials: &'a B,
    /// Single value: local sum of squared residuals.
    pub residual: &'a B,
}

/// Device executing relaxation sweeps.
///
/// Implementations: `HostDevice` (f64, rayon thread blocks) and
/// `WgpuDevice` (f32 compute shaders).
pub trait RelaxDevice {
    type Buffer;
    /// A captured `{relax, reduce}` launch sequence.
    type Graph;

    fn label(&self) -> &'static str;

    /// Zero-initialized buffer of `len` values.
    fn alloc(&self, len: usize) -> Result<Self::Buffer>;

    /// New buffer holding `data`.
    fn upload(&self, data: &[f64]) -> Result<Self::Buffer>;

    /// Copy the first `out.len()` values of `buffer` to the host.
    fn download(&self, buffer: &Self::Buffer, out: &mut [f64]) -> Result<()>;

    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    /// Whether two handles refer to the same storage.
    fn same_buffer(&self, a: &Self::Buffer, b: &Self::Buffer) -> bool;

    /// `dst[..len] = src[..len]`, ordered with later launches.
    fn copy(&self, src: &Self::Buffer, dst: &Self::Buffer, len: usize) -> Result<()>;

    fn geometry(&self, n_rows: usize) -> LaunchGeometry;

    /// Fused update and first-level reduction.
    fn launch_relax(&self, sweep: &RelaxSweep<'_, Self::Buffer>) -> Result<()>;

    /// Collapse `partials` into `residual`.
    fn launch_reduce(&self, sweep: &RelaxSweep<'_, Self::Buffer>) -> Result<()>;

    /// Record the two launches of `sweep` without running them.
    fn capture(&self, sweep: &RelaxSweep<'_, Self::Buffer>) -> Result<Self::Graph>;

    /// Run a captured graph; equivalent to `launch_relax` then `launch_reduce`.
    fn replay(&self, graph: &Self::Graph) -> Result<()>;

    /// Wait for queued work and read the first value of `buffer`.
    fn read_scalar(&self, buffer: &Self::Buffer) -> Result<f64>;
}

//! Kernel issue strategies for the relaxation loop.
//!
//! The loop calls `issue` once per iteration after the operator. A
//! `DirectLauncher` enqueues the relax and reduce kernels one by one; a
//! `GraphLauncher` captures them on first use and replays the graph on
//! every iteration of the same solve. Both leave identical results.

use crate::error::Result;

use super::device::{RelaxDevice, RelaxSweep};

/// How the per-iteration kernels reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    #[default]
    Direct,
    Graph,
}

/// Strategy for issuing `{relax, reduce}` for one iteration.
pub trait KernelLauncher<D: RelaxDevice> {
    fn issue(&mut self, device: &D, sweep: &RelaxSweep<'_, D::Buffer>) -> Result<()>;
}

pub struct DirectLauncher;

impl<D: RelaxDevice> KernelLauncher<D> for DirectLauncher {
    fn issue(&mut self, device: &D, sweep: &RelaxSweep<'_, D::Buffer>) -> Result<()> {
        device.launch_relax(sweep)?;
        device.launch_reduce(sweep)
    }
}

/// Captures the sweep once, then replays it.
///
/// A launcher is bound to the buffers of the first sweep it sees, so it
/// must not outlive one solve call.
pub struct GraphLauncher<D: RelaxDevice> {
    graph: Option<D::Graph>,
}

impl<D: RelaxDevice> GraphLauncher<D> {
    pub fn new() -> Self {
        Self { graph: None }
    }
}

impl<D: RelaxDevice> Default for GraphLauncher<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RelaxDevice> KernelLauncher<D> for GraphLauncher<D> {
    fn issue(&mut self, device: &D, sweep: &RelaxSweep<'_, D::Buffer>) -> Result<()> {
        let graph = match self.graph.take() {
            Some(graph) => graph,
            None => {
                tracing::debug!(device = device.label(), "capturing relaxation graph");
                device.capture(sweep)?
            }
        };
        let result = device.replay(&graph);
        self.graph = Some(graph);
        result
    }
}

/// Launcher chosen from a `LaunchMode`.
pub enum Launcher<D: RelaxDevice> {
    Direct(DirectLauncher),
    Graph(GraphLauncher<D>),
}

impl<D: RelaxDevice> Launcher<D> {
    pub fn new(mode: LaunchMode) -> Self {
        match mode {
            LaunchMode::Direct => Self::Direct(DirectLauncher),
            LaunchMode::Graph => Self::Graph(GraphLauncher::new()),
        }
    }
}

impl<D: RelaxDevice> KernelLauncher<D> for Launcher<D> {
    fn issue(&mut self, device: &D, sweep: &RelaxSweep<'_, D::Buffer>) -> Result<()> {
        match self {
            Self::Direct(launcher) => launcher.issue(device, sweep),
            Self::Graph(launcher) => launcher.issue(device, sweep),
        }
    }
}

//! Host execution device.
//!
//! Runs the device kernels on the CPU in f64: each launch executes
//! immediately, with thread blocks spread over the rayon pool. Work is
//! therefore complete when a launch returns and `read_scalar` only counts
//! the readback.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::error::{RelaxError, Result};
use crate::sparse::MsrMatrix;

use super::device::{LaunchGeometry, RelaxDevice, RelaxSweep};
use super::kernels::{self, RelaxKernel};
use super::reduction::reduce_partials;
use super::SystemMatrix;

/// Default thread-block width, matching the GPU workgroup size.
pub const DEFAULT_THREADS_PER_BLOCK: usize = 256;

/// Shared handle to a host vector. Clones alias the same storage.
#[derive(Debug, Clone)]
pub struct HostBuffer(Rc<RefCell<Vec<f64>>>);

impl HostBuffer {
    fn new(data: Vec<f64>) -> Self {
        Self(Rc::new(RefCell::new(data)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.0.borrow().clone()
    }

    fn read(&self, what: &str) -> Result<Ref<'_, Vec<f64>>> {
        self.0.try_borrow().map_err(|_| {
            RelaxError::Precondition(format!("{what} buffer is aliased with an output"))
        })
    }

    fn write(&self, what: &str) -> Result<RefMut<'_, Vec<f64>>> {
        self.0
            .try_borrow_mut()
            .map_err(|_| RelaxError::Precondition(format!("{what} buffer is aliased")))
    }
}

#[derive(Debug, Clone, Copy)]
enum HostNode {
    Relax,
    Reduce,
}

/// Captured sweep: buffer handles and launch order, replayed as a unit.
#[derive(Debug)]
pub struct HostGraph {
    kernel: RelaxKernel,
    n_rows: usize,
    geometry: LaunchGeometry,
    buffers: [HostBuffer; 7],
    nodes: Vec<HostNode>,
}

impl HostGraph {
    fn sweep(&self) -> RelaxSweep<'_, HostBuffer> {
        let [ad, ad_inv, rhs, vx, rk, partials, residual] = &self.buffers;
        RelaxSweep {
            kernel: self.kernel,
            n_rows: self.n_rows,
            geometry: self.geometry,
            ad,
            ad_inv,
            rhs,
            vx,
            rk,
            partials,
            residual,
        }
    }
}

/// CPU device with rayon-parallel thread blocks.
pub struct HostDevice {
    threads_per_block: usize,
    dispatch_count: Cell<u32>,
    readback_count: Cell<u32>,
    graph_captures: Cell<u32>,
    graph_replays: Cell<u32>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            threads_per_block: DEFAULT_THREADS_PER_BLOCK,
            dispatch_count: Cell::new(0),
            readback_count: Cell::new(0),
            graph_captures: Cell::new(0),
            graph_replays: Cell::new(0),
        }
    }

    /// Use a different thread-block width: a power of two in 64..=1024.
    pub fn with_threads_per_block(threads_per_block: usize) -> Result<Self> {
        if !threads_per_block.is_power_of_two() || !(64..=1024).contains(&threads_per_block) {
            return Err(RelaxError::Precondition(format!(
                "threads per block must be a power of two in 64..=1024, got {threads_per_block}"
            )));
        }
        Ok(Self {
            threads_per_block,
            ..Self::new()
        })
    }

    /// Direct kernel launches since creation (operator, relax, reduce).
    pub fn dispatch_count(&self) -> u32 {
        self.dispatch_count.get()
    }

    pub fn readback_count(&self) -> u32 {
        self.readback_count.get()
    }

    pub fn graph_captures(&self) -> u32 {
        self.graph_captures.get()
    }

    pub fn graph_replays(&self) -> u32 {
        self.graph_replays.get()
    }

    fn count_dispatch(&self) {
        self.dispatch_count.set(self.dispatch_count.get() + 1);
    }

    fn run_relax(&self, sweep: &RelaxSweep<'_, HostBuffer>) -> Result<()> {
        let b = sweep.kernel.block_size();
        let n_values = sweep.n_rows * b;
        let ad = sweep.ad.read("diagonal")?;
        let ad_inv = sweep.ad_inv.read("inverse diagonal")?;
        let rhs = sweep.rhs.read("rhs")?;
        let mut vx = sweep.vx.write("vx")?;
        let mut rk = sweep.rk.write("rk")?;
        let mut partials = sweep.partials.write("partials")?;

        let inv_len = match sweep.kernel {
            RelaxKernel::Scalar => sweep.n_rows,
            _ => n_values * b,
        };
        if ad.len() < n_values * b
            || ad_inv.len() < inv_len
            || rhs.len() < n_values
            || vx.len() < n_values
            || rk.len() < n_values
            || partials.len() < sweep.geometry.n_blocks
        {
            return Err(RelaxError::Precondition(
                "relaxation buffers smaller than the launch".into(),
            ));
        }

        kernels::fused_relax(
            sweep.kernel,
            sweep.geometry,
            sweep.n_rows,
            &ad,
            &ad_inv,
            &rhs,
            &mut vx,
            &mut rk,
            &mut partials,
        );
        Ok(())
    }

    fn run_reduce(&self, sweep: &RelaxSweep<'_, HostBuffer>) -> Result<()> {
        let partials = sweep.partials.read("partials")?;
        let mut residual = sweep.residual.write("residual")?;
        let n_blocks = sweep.geometry.n_blocks.min(partials.len());
        residual[0] = reduce_partials(&partials[..n_blocks], sweep.geometry.threads_per_block);
        Ok(())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RelaxDevice for HostDevice {
    type Buffer = HostBuffer;
    type Graph = HostGraph;

    fn label(&self) -> &'static str {
        "host"
    }

    fn alloc(&self, len: usize) -> Result<HostBuffer> {
        Ok(HostBuffer::new(vec![0.0; len.max(1)]))
    }

    fn upload(&self, data: &[f64]) -> Result<HostBuffer> {
        if data.is_empty() {
            return self.alloc(0);
        }
        Ok(HostBuffer::new(data.to_vec()))
    }

    fn download(&self, buffer: &HostBuffer, out: &mut [f64]) -> Result<()> {
        self.readback_count.set(self.readback_count.get() + 1);
        let data = buffer.read("download")?;
        if out.len() > data.len() {
            return Err(RelaxError::Precondition(format!(
                "download of {} values from a buffer of {}",
                out.len(),
                data.len()
            )));
        }
        out.copy_from_slice(&data[..out.len()]);
        Ok(())
    }

    fn buffer_len(&self, buffer: &HostBuffer) -> usize {
        buffer.len()
    }

    fn same_buffer(&self, a: &HostBuffer, b: &HostBuffer) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    fn copy(&self, src: &HostBuffer, dst: &HostBuffer, len: usize) -> Result<()> {
        if self.same_buffer(src, dst) {
            return Ok(());
        }
        let src = src.read("copy source")?;
        let mut dst = dst.write("copy destination")?;
        if len > src.len() || len > dst.len() {
            return Err(RelaxError::Precondition(format!(
                "copy of {len} values out of range"
            )));
        }
        dst[..len].copy_from_slice(&src[..len]);
        Ok(())
    }

    fn geometry(&self, n_rows: usize) -> LaunchGeometry {
        LaunchGeometry::new(n_rows, self.threads_per_block)
    }

    fn launch_relax(&self, sweep: &RelaxSweep<'_, HostBuffer>) -> Result<()> {
        self.count_dispatch();
        self.run_relax(sweep)
    }

    fn launch_reduce(&self, sweep: &RelaxSweep<'_, HostBuffer>) -> Result<()> {
        self.count_dispatch();
        self.run_reduce(sweep)
    }

    fn capture(&self, sweep: &RelaxSweep<'_, HostBuffer>) -> Result<HostGraph> {
        self.graph_captures.set(self.graph_captures.get() + 1);
        Ok(HostGraph {
            kernel: sweep.kernel,
            n_rows: sweep.n_rows,
            geometry: sweep.geometry,
            buffers: [
                sweep.ad.clone(),
                sweep.ad_inv.clone(),
                sweep.rhs.clone(),
                sweep.vx.clone(),
                sweep.rk.clone(),
                sweep.partials.clone(),
                sweep.residual.clone(),
            ],
            nodes: vec![HostNode::Relax, HostNode::Reduce],
        })
    }

    fn replay(&self, graph: &HostGraph) -> Result<()> {
        self.graph_replays.set(self.graph_replays.get() + 1);
        let sweep = graph.sweep();
        for node in &graph.nodes {
            match node {
                HostNode::Relax => self.run_relax(&sweep)?,
                HostNode::Reduce => self.run_reduce(&sweep)?,
            }
        }
        Ok(())
    }

    fn read_scalar(&self, buffer: &HostBuffer) -> Result<f64> {
        self.readback_count.set(self.readback_count.get() + 1);
        let data = buffer.read("scalar")?;
        Ok(data.first().copied().unwrap_or(0.0))
    }
}

impl SystemMatrix<HostDevice> for MsrMatrix {
    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn n_cols_ext(&self) -> usize {
        self.n_cols_ext
    }

    fn diag_block_size(&self) -> usize {
        self.block_size
    }

    fn diagonal(&self) -> &[f64] {
        &self.diag
    }

    fn apply_off_diagonal(
        &self,
        device: &HostDevice,
        x: &HostBuffer,
        y: &HostBuffer,
    ) -> Result<()> {
        let b = self.block_size;
        let mut x = x.write("operator input")?;
        let mut y = y.write("operator output")?;
        if x.len() < self.n_cols_ext * b || y.len() < self.n_rows * b {
            return Err(RelaxError::Precondition(format!(
                "operator buffers ({}, {}) too short for {} x {} block rows",
                x.len(),
                y.len(),
                self.n_rows,
                self.n_cols_ext
            )));
        }
        if let Some(halo) = &self.halo {
            halo.sync(&mut x, self.n_rows);
        }
        device.count_dispatch();
        self.spmv_off_diagonal(&x, &mut y);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::factorize::DiagonalInverse;

    #[test]
    fn test_threads_per_block_validated() {
        assert!(HostDevice::with_threads_per_block(128).is_ok());
        assert!(HostDevice::with_threads_per_block(96).is_err());
        assert!(HostDevice::with_threads_per_block(32).is_err());
        assert!(HostDevice::with_threads_per_block(2048).is_err());
    }

    #[test]
    fn test_copy_and_download() {
        let dev = HostDevice::new();
        let src = dev.upload(&[1.0, 2.0, 3.0]).unwrap();
        let dst = dev.alloc(4).unwrap();
        dev.copy(&src, &dst, 2).unwrap();
        assert_eq!(dst.to_vec(), vec![1.0, 2.0, 0.0, 0.0]);
        let mut out = [0.0; 3];
        dev.download(&src, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert!(dev.copy(&src, &dst, 5).is_err());
    }

    #[test]
    fn test_replay_matches_direct() {
        let n = 300;
        let ad: Vec<f64> = (0..n).map(|i| 2.0 + (i % 7) as f64).collect();
        let DiagonalInverse::Scalar(inv) = DiagonalInverse::factorize(&ad, 1).unwrap() else {
            unreachable!()
        };
        let rhs: Vec<f64> = (0..n).map(|i| (i as f64).sqrt()).collect();

        let dev = HostDevice::with_threads_per_block(64).unwrap();
        let run = |graph: bool| {
            let ad_b = dev.upload(&ad).unwrap();
            let inv_b = dev.upload(&inv).unwrap();
            let rhs_b = dev.upload(&rhs).unwrap();
            let vx = dev.alloc(n).unwrap();
            let rk = dev.alloc(n).unwrap();
            let g = dev.geometry(n);
            let partials = dev.alloc(g.n_blocks).unwrap();
            let residual = dev.alloc(1).unwrap();
            let sweep = RelaxSweep {
                kernel: RelaxKernel::Scalar,
                n_rows: n,
                geometry: g,
                ad: &ad_b,
                ad_inv: &inv_b,
                rhs: &rhs_b,
                vx: &vx,
                rk: &rk,
                partials: &partials,
                residual: &residual,
            };
            if graph {
                let captured = dev.capture(&sweep).unwrap();
                dev.replay(&captured).unwrap();
            } else {
                dev.launch_relax(&sweep).unwrap();
                dev.launch_reduce(&sweep).unwrap();
            }
            (vx.to_vec(), dev.read_scalar(&residual).unwrap())
        };
        let (vx_direct, r_direct) = run(false);
        let (vx_graph, r_graph) = run(true);
        assert_eq!(vx_direct, vx_graph);
        assert_eq!(r_direct.to_bits(), r_graph.to_bits());
        assert_eq!(dev.dispatch_count(), 2);
        assert_eq!(dev.graph_captures(), 1);
        assert_eq!(dev.graph_replays(), 1);
    }

    #[test]
    fn test_aliased_outputs_rejected() {
        let dev = HostDevice::new();
        let ad = dev.upload(&[2.0]).unwrap();
        let inv = dev.upload(&[0.5]).unwrap();
        let rhs = dev.upload(&[2.0]).unwrap();
        let vx = dev.alloc(1).unwrap();
        let partials = dev.alloc(1).unwrap();
        let residual = dev.alloc(1).unwrap();
        let sweep = RelaxSweep {
            kernel: RelaxKernel::Scalar,
            n_rows: 1,
            geometry: dev.geometry(1),
            ad: &ad,
            ad_inv: &inv,
            rhs: &rhs,
            vx: &vx,
            rk: &vx,
            partials: &partials,
            residual: &residual,
        };
        let err = dev.launch_relax(&sweep);
        assert!(matches!(err, Err(RelaxError::Precondition(_))));
    }

    #[test]
    fn test_operator_applies_off_diagonal() {
        let coupling = [(0, 1, -1.0), (1, 0, -2.0)];
        let m = MsrMatrix::from_triplets(2, 2, 1, vec![4.0, 4.0], &coupling).unwrap();
        let dev = HostDevice::new();
        let x = dev.upload(&[3.0, 5.0]).unwrap();
        let y = dev.alloc(2).unwrap();
        m.apply_off_diagonal(&dev, &x, &y).unwrap();
        assert_eq!(y.to_vec(), vec![-5.0, -6.0]);
        assert!(m.apply_off_diagonal(&dev, &x, &x).is_err());
    }
}

//! GPU relaxation device using wgpu.
//!
//! Uses f32 precision on the GPU with f64 interface for compatibility.
//! Every queue submission is ordered, so launches, copies and uploads
//! execute in issue order; `read_scalar` maps a staging buffer and blocks
//! until the queue has drained.

use std::cell::Cell;

use wgpu::util::DeviceExt;

use crate::error::{RelaxError, Result};
use crate::sparse::MsrMatrix;

use super::comm::Halo;
use super::device::{LaunchGeometry, RelaxDevice, RelaxSweep};
use super::gpu_shaders;
use super::kernels::RelaxKernel;
use super::SystemMatrix;

pub const WORKGROUP_SIZE: u32 = gpu_shaders::SHADER_WORKGROUP_SIZE;
const MAX_WORKGROUPS: u32 = 65_535;

fn workgroup_count(n: usize) -> Result<u32> {
    let groups = n.div_ceil(WORKGROUP_SIZE as usize).max(1);
    if groups > MAX_WORKGROUPS as usize {
        return Err(RelaxError::Device(format!(
            "{n} rows need {groups} workgroups, dispatch limit is {MAX_WORKGROUPS}"
        )));
    }
    Ok(groups as u32)
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| RelaxError::Device(format!("{what} {value} exceeds u32 range")))
}

// Shader KernelParams layout: { n_rows, db_size, n_blocks, _pad }, 16 bytes.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct KernelParams {
    n_rows: u32,
    db_size: u32,
    n_blocks: u32,
    _pad: u32,
}

/// A GPU buffer of f32 values with its logical length.
///
/// The underlying buffer always holds at least one value, since empty
/// storage bindings are invalid.
pub struct WgpuBuffer {
    pub(crate) buffer: wgpu::Buffer,
    pub(crate) n: usize,
}

#[derive(Debug, Clone, Copy)]
enum PipelineKind {
    JacobiScalar,
    JacobiBlock3,
    JacobiBlockN,
    ReducePartials,
}

struct Pipelines {
    spmv_offdiag: wgpu::ComputePipeline,
    jacobi_scalar: wgpu::ComputePipeline,
    jacobi_block3: wgpu::ComputePipeline,
    jacobi_block_n: wgpu::ComputePipeline,
    reduce_partials: wgpu::ComputePipeline,
}

/// One recorded dispatch: bind group and parameters are built once.
struct GraphNode {
    label: &'static str,
    kind: PipelineKind,
    bind_group: wgpu::BindGroup,
    _params: wgpu::Buffer,
    workgroups: u32,
}

/// Captured `{relax, reduce}` pair, submitted as one command buffer.
pub struct WgpuGraph {
    nodes: Vec<GraphNode>,
}

/// wgpu compute device for relaxation sweeps.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipes: Pipelines,
    dispatch_count: Cell<u32>,
    readback_count: Cell<u32>,
    graph_captures: Cell<u32>,
    graph_replays: Cell<u32>,
}

impl WgpuDevice {
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| RelaxError::Device("no GPU adapter found".into()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("relaxor_gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| RelaxError::Device(format!("failed to get GPU device: {e}")))?;

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("relaxor_shaders"),
            source: wgpu::ShaderSource::Wgsl(gpu_shaders::SHADER_SOURCE.into()),
        });

        let make_pipeline = |entry_point: &str| -> wgpu::ComputePipeline {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let pipes = Pipelines {
            spmv_offdiag: make_pipeline("spmv_offdiag"),
            jacobi_scalar: make_pipeline("jacobi_scalar"),
            jacobi_block3: make_pipeline("jacobi_block3"),
            jacobi_block_n: make_pipeline("jacobi_block_n"),
            reduce_partials: make_pipeline("reduce_partials"),
        };

        Ok(Self {
            device,
            queue,
            pipes,
            dispatch_count: Cell::new(0),
            readback_count: Cell::new(0),
            graph_captures: Cell::new(0),
            graph_replays: Cell::new(0),
        })
    }

    /// Get total GPU dispatch count since creation.
    pub fn dispatch_count(&self) -> u32 {
        self.dispatch_count.get()
    }

    /// Get total GPU readback count since creation.
    pub fn readback_count(&self) -> u32 {
        self.readback_count.get()
    }

    pub fn graph_captures(&self) -> u32 {
        self.graph_captures.get()
    }

    pub fn graph_replays(&self) -> u32 {
        self.graph_replays.get()
    }

    fn pipeline(&self, kind: PipelineKind) -> &wgpu::ComputePipeline {
        match kind {
            PipelineKind::JacobiScalar => &self.pipes.jacobi_scalar,
            PipelineKind::JacobiBlock3 => &self.pipes.jacobi_block3,
            PipelineKind::JacobiBlockN => &self.pipes.jacobi_block_n,
            PipelineKind::ReducePartials => &self.pipes.reduce_partials,
        }
    }

    fn storage_buffer(&self, label: &str, data: &[f32]) -> WgpuBuffer {
        let n = data.len();
        let contents: &[f32] = if data.is_empty() { &[0.0] } else { data };
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(contents),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
        });
        WgpuBuffer { buffer, n }
    }

    fn index_buffer(&self, label: &str, data: &[u32]) -> wgpu::Buffer {
        let contents: &[u32] = if data.is_empty() { &[0] } else { data };
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(contents),
            usage: wgpu::BufferUsages::STORAGE,
        })
    }

    fn params_buffer(&self, params: KernelParams) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: None,
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    /// Overwrite `buffer[offset..offset + data.len()]` through the queue.
    fn write_at(&self, buffer: &WgpuBuffer, offset: usize, data: &[f64]) -> Result<()> {
        if offset + data.len() > buffer.n {
            return Err(RelaxError::Precondition(format!(
                "write of {} values at {offset} into a buffer of {}",
                data.len(),
                buffer.n
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        let values: Vec<f32> = data.iter().map(|&v| v as f32).collect();
        let byte_offset = (offset * std::mem::size_of::<f32>()) as u64;
        self.queue
            .write_buffer(&buffer.buffer, byte_offset, bytemuck::cast_slice(&values));
        Ok(())
    }

    fn relax_node(&self, sweep: &RelaxSweep<'_, WgpuBuffer>) -> Result<GraphNode> {
        let workgroups = workgroup_count(sweep.n_rows)?;
        let kind = match sweep.kernel {
            RelaxKernel::Scalar => PipelineKind::JacobiScalar,
            RelaxKernel::Block3 => PipelineKind::JacobiBlock3,
            RelaxKernel::BlockN(_) => PipelineKind::JacobiBlockN,
        };
        let params = self.params_buffer(KernelParams {
            n_rows: to_u32(sweep.n_rows, "row count")?,
            db_size: to_u32(sweep.kernel.block_size(), "block size")?,
            n_blocks: workgroups,
            _pad: 0,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.pipeline(kind).get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: sweep.ad.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: sweep.ad_inv.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: sweep.rhs.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: sweep.vx.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: sweep.rk.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: sweep.partials.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        Ok(GraphNode {
            label: sweep.kernel.name(),
            kind,
            bind_group,
            _params: params,
            workgroups,
        })
    }

    fn reduce_node(&self, sweep: &RelaxSweep<'_, WgpuBuffer>) -> Result<GraphNode> {
        // Partials are written per workgroup, so the fused launch fixes their count.
        let n_blocks = workgroup_count(sweep.n_rows)?;
        let kind = PipelineKind::ReducePartials;
        let params = self.params_buffer(KernelParams {
            n_rows: to_u32(sweep.n_rows, "row count")?,
            db_size: to_u32(sweep.kernel.block_size(), "block size")?,
            n_blocks,
            _pad: 0,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.pipeline(kind).get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: sweep.partials.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: sweep.residual.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        Ok(GraphNode {
            label: "reduce_partials",
            kind,
            bind_group,
            _params: params,
            workgroups: 1,
        })
    }

    /// Encode `nodes` into one command buffer, one compute pass each.
    fn submit_nodes(&self, nodes: &[GraphNode]) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("relax_graph"),
            });
        for node in nodes {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(node.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(self.pipeline(node.kind));
            pass.set_bind_group(0, Some(&node.bind_group), &[]);
            pass.dispatch_workgroups(node.workgroups, 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    fn dispatch(&self, node: GraphNode) {
        self.dispatch_count.set(self.dispatch_count.get() + 1);
        self.submit_nodes(std::slice::from_ref(&node));
    }

    fn read_buffer(&self, src: &WgpuBuffer, count: usize) -> Result<Vec<f32>> {
        self.readback_count.set(self.readback_count.get() + 1);
        read_buffer_f32(&self.device, &self.queue, &src.buffer, count)
    }
}

/// Read a GPU buffer back to CPU as f32 values.
fn read_buffer_f32(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    count: usize,
) -> Result<Vec<f32>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let size = (count * std::mem::size_of::<f32>()) as u64;
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("read_staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&Default::default());
    encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
    queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = sender.send(r);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| RelaxError::Device(format!("device poll failed: {e}")))?;
    receiver
        .recv()
        .map_err(|e| RelaxError::Device(format!("buffer map callback dropped: {e}")))?
        .map_err(|e| RelaxError::Device(format!("buffer map failed: {e}")))?;

    let data = slice.get_mapped_range();
    let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();
    Ok(result)
}

impl RelaxDevice for WgpuDevice {
    type Buffer = WgpuBuffer;
    type Graph = WgpuGraph;

    fn label(&self) -> &'static str {
        "wgpu"
    }

    fn alloc(&self, len: usize) -> Result<WgpuBuffer> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("relax_buffer"),
            size: (len.max(1) * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(WgpuBuffer { buffer, n: len })
    }

    fn upload(&self, data: &[f64]) -> Result<WgpuBuffer> {
        let values: Vec<f32> = data.iter().map(|&v| v as f32).collect();
        Ok(self.storage_buffer("relax_upload", &values))
    }

    fn download(&self, buffer: &WgpuBuffer, out: &mut [f64]) -> Result<()> {
        if out.len() > buffer.n {
            return Err(RelaxError::Precondition(format!(
                "download of {} values from a buffer of {}",
                out.len(),
                buffer.n
            )));
        }
        let values = self.read_buffer(buffer, out.len())?;
        for (o, v) in out.iter_mut().zip(values) {
            *o = f64::from(v);
        }
        Ok(())
    }

    fn buffer_len(&self, buffer: &WgpuBuffer) -> usize {
        buffer.n
    }

    fn same_buffer(&self, a: &WgpuBuffer, b: &WgpuBuffer) -> bool {
        a.buffer == b.buffer
    }

    fn copy(&self, src: &WgpuBuffer, dst: &WgpuBuffer, len: usize) -> Result<()> {
        if len > src.n || len > dst.n {
            return Err(RelaxError::Precondition(format!(
                "copy of {len} values out of range"
            )));
        }
        if len == 0 || self.same_buffer(src, dst) {
            return Ok(());
        }
        let size = (len * std::mem::size_of::<f32>()) as u64;
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn geometry(&self, n_rows: usize) -> LaunchGeometry {
        LaunchGeometry::new(n_rows, WORKGROUP_SIZE as usize)
    }

    fn launch_relax(&self, sweep: &RelaxSweep<'_, WgpuBuffer>) -> Result<()> {
        let node = self.relax_node(sweep)?;
        self.dispatch(node);
        Ok(())
    }

    fn launch_reduce(&self, sweep: &RelaxSweep<'_, WgpuBuffer>) -> Result<()> {
        let node = self.reduce_node(sweep)?;
        self.dispatch(node);
        Ok(())
    }

    fn capture(&self, sweep: &RelaxSweep<'_, WgpuBuffer>) -> Result<WgpuGraph> {
        self.graph_captures.set(self.graph_captures.get() + 1);
        Ok(WgpuGraph {
            nodes: vec![self.relax_node(sweep)?, self.reduce_node(sweep)?],
        })
    }

    fn replay(&self, graph: &WgpuGraph) -> Result<()> {
        self.graph_replays.set(self.graph_replays.get() + 1);
        self.submit_nodes(&graph.nodes);
        Ok(())
    }

    fn read_scalar(&self, buffer: &WgpuBuffer) -> Result<f64> {
        let values = self.read_buffer(buffer, 1)?;
        Ok(values.first().copied().map(f64::from).unwrap_or(0.0))
    }
}

/// `MsrMatrix` uploaded to a `WgpuDevice`.
///
/// The diagonal stays on the host for setup. Ghost values are exchanged on
/// the host: the iterate is read back, the halo refreshed, and the ghost
/// part written again before the product.
pub struct GpuMsrMatrix {
    values: wgpu::Buffer,
    col_indices: wgpu::Buffer,
    row_pointers: wgpu::Buffer,
    params: wgpu::Buffer,
    n_rows: usize,
    n_cols_ext: usize,
    block_size: usize,
    diag: Vec<f64>,
    halo: Option<Halo>,
}

impl GpuMsrMatrix {
    pub fn upload(device: &WgpuDevice, matrix: &MsrMatrix) -> Result<Self> {
        let n_ext_values = matrix.n_cols_ext * matrix.block_size;
        to_u32(n_ext_values, "extended vector length")?;
        to_u32(matrix.nnz_extra(), "extra-diagonal count")?;
        workgroup_count(matrix.n_rows)?;

        let values: Vec<f32> = matrix.values.iter().map(|&v| v as f32).collect();
        let col_indices: Vec<u32> = matrix.col_indices.iter().map(|&c| c as u32).collect();
        let row_pointers: Vec<u32> = matrix.row_pointers.iter().map(|&p| p as u32).collect();

        Ok(Self {
            values: device.storage_buffer("msr_values", &values).buffer,
            col_indices: device.index_buffer("msr_col_indices", &col_indices),
            row_pointers: device.index_buffer("msr_row_pointers", &row_pointers),
            params: device.params_buffer(KernelParams {
                n_rows: matrix.n_rows as u32,
                db_size: matrix.block_size as u32,
                n_blocks: 0,
                _pad: 0,
            }),
            n_rows: matrix.n_rows,
            n_cols_ext: matrix.n_cols_ext,
            block_size: matrix.block_size,
            diag: matrix.diag.clone(),
            halo: matrix.halo.clone(),
        })
    }

    fn sync_halo(&self, device: &WgpuDevice, halo: &Halo, x: &WgpuBuffer) -> Result<()> {
        let b = self.block_size;
        let mut host = vec![0.0; self.n_cols_ext * b];
        device.download(x, &mut host)?;
        halo.sync(&mut host, self.n_rows);
        device.write_at(x, self.n_rows * b, &host[self.n_rows * b..])
    }
}

impl SystemMatrix<WgpuDevice> for GpuMsrMatrix {
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
        device: &WgpuDevice,
        x: &WgpuBuffer,
        y: &WgpuBuffer,
    ) -> Result<()> {
        let b = self.block_size;
        if x.n < self.n_cols_ext * b || y.n < self.n_rows * b {
            return Err(RelaxError::Precondition(format!(
                "operator buffers ({}, {}) too short for {} x {} block rows",
                x.n, y.n, self.n_rows, self.n_cols_ext
            )));
        }
        if device.same_buffer(x, y) {
            return Err(RelaxError::Precondition(
                "operator input and output alias".into(),
            ));
        }
        if let Some(halo) = &self.halo {
            self.sync_halo(device, halo, x)?;
        }

        let pipeline = &device.pipes.spmv_offdiag;
        let bind_group = device.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.values.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.col_indices.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.row_pointers.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: x.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: y.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: self.params.as_entire_binding(),
                },
            ],
        });
        let mut encoder = device.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, Some(&bind_group), &[]);
            pass.dispatch_workgroups(workgroup_count(self.n_rows)?, 1, 1);
        }
        device.queue.submit(Some(encoder.finish()));
        device.dispatch_count.set(device.dispatch_count.get() + 1);
        Ok(())
    }
}

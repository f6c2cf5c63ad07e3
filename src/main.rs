use clap::Parser;
use relaxor::error::Result;
use relaxor::model;
use relaxor::output;
use relaxor::solver::device::RelaxDevice;
use relaxor::solver::gpu::{GpuMsrMatrix, WgpuDevice};
use relaxor::solver::host::HostDevice;
use relaxor::solver::{
    JacobiSolver, LaunchMode, SolveOutcome, SolveRequest, SolverConfig, SystemMatrix,
};
use relaxor::stats::SolverStats;
use std::io;

/// Jacobi relaxation of a 2-D diffusion model problem
#[derive(Parser)]
#[command(name = "relaxor", version)]
struct Cli {
    /// Grid cells in x
    #[arg(long, default_value_t = 64)]
    nx: usize,

    /// Grid cells in y
    #[arg(long, default_value_t = 64)]
    ny: usize,

    /// Unknowns per cell (diagonal block size, at most 9)
    #[arg(short, long, default_value_t = 1)]
    block_size: usize,

    /// Maximum number of sweeps
    #[arg(long, default_value_t = 10_000)]
    max_iter: u32,

    /// Relative residual tolerance
    #[arg(long, default_value_t = 1e-5)]
    precision: f64,

    /// Stop after this many sweeps without a new minimum residual
    #[arg(long)]
    stall_window: Option<u32>,

    /// Use the host device instead of the GPU
    #[arg(long)]
    cpu: bool,

    /// Capture the sweep once and replay it
    #[arg(long)]
    graph: bool,

    /// Write the residual history instead of the solution
    #[arg(long)]
    history: bool,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,

    /// Per-solve summary (-v) or per-sweep residuals (-vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Set up and solve `matrix` on `device` from a zero start.
fn run<D, M>(
    device: &D,
    matrix: &M,
    rhs: &[f64],
    config: SolverConfig,
) -> Result<(SolveOutcome, Vec<f64>, SolverStats)>
where
    D: RelaxDevice,
    M: SystemMatrix<D>,
{
    let mut solver = JacobiSolver::setup("diffusion", device, matrix, config)?;
    let rhs_buf = device.upload(rhs)?;
    let vx = device.upload(&vec![0.0; rhs.len()])?;
    let r_norm = rhs.iter().map(|v| v * v).sum::<f64>().sqrt();

    let mut policy = solver.default_policy();
    let outcome = solver.solve(
        device,
        matrix,
        SolveRequest {
            rhs: &rhs_buf,
            vx: &vx,
            r_norm,
            aux: None,
        },
        &mut policy,
    )?;

    let mut solution = vec![0.0; rhs.len()];
    device.download(&vx, &mut solution)?;
    Ok((outcome, solution, solver.stats().clone()))
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let matrix = model::diffusion_2d(cli.nx, cli.ny, cli.block_size).unwrap_or_else(|e| {
        eprintln!("Model error: {}", e);
        std::process::exit(1);
    });
    let x_ref = model::reference_solution(matrix.n_rows * matrix.block_size);
    let rhs = matrix.spmv(&x_ref);

    let config = SolverConfig {
        n_max_iter: cli.max_iter,
        precision: cli.precision,
        verbosity: cli.verbose,
        launch: if cli.graph {
            LaunchMode::Graph
        } else {
            LaunchMode::Direct
        },
        stall_window: cli.stall_window,
    };

    let result = if cli.cpu {
        let device = HostDevice::new();
        run(&device, &matrix, &rhs, config).map(|(outcome, solution, mut stats)| {
            stats.dispatches = device.dispatch_count() + device.graph_replays();
            stats.readbacks = device.readback_count();
            (outcome, solution, stats, device.label())
        })
    } else {
        let device = WgpuDevice::new().unwrap_or_else(|e| {
            eprintln!("GPU device error: {}", e);
            std::process::exit(1);
        });
        GpuMsrMatrix::upload(&device, &matrix)
            .and_then(|gpu_matrix| run(&device, &gpu_matrix, &rhs, config))
            .map(|(outcome, solution, mut stats)| {
                stats.dispatches = device.dispatch_count() + device.graph_replays();
                stats.readbacks = device.readback_count();
                (outcome, solution, stats, device.label())
            })
    };
    let (outcome, solution, stats, label) = result.unwrap_or_else(|e| {
        eprintln!("Solve error: {}", e);
        std::process::exit(1);
    });

    eprintln!(
        "{}: {} after {} iterations, residual {:.3e}",
        label, outcome.state, outcome.n_iterations, outcome.residual
    );

    let mut stdout = io::stdout();
    let written = if cli.history {
        output::write_history_csv(&outcome.history, &mut stdout)
    } else {
        output::write_solution_csv(&solution, &mut stdout)
    };
    written.unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });

    if cli.stats {
        stats.display(&format!("jacobi ({})", label));
    }
}

//! Multi-process distributed solver tests.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 2 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.

#![cfg(feature = "distributed")]

use std::sync::Arc;

use relaxor::model;
use relaxor::solver::comm::CommunicationBackend;
use relaxor::solver::comm_mpi::MpiComm;
use relaxor::solver::device::RelaxDevice;
use relaxor::solver::host::HostDevice;
use relaxor::solver::{JacobiSolver, SolveRequest, SolveState, SolverConfig};

#[test]
fn distributed_chain_converges_on_every_rank() {
    // Also covers the degenerate single-rank launch without mpirun.
    let _universe = mpi::initialize().expect("MPI init failed");
    let comm: Arc<dyn CommunicationBackend> = Arc::new(MpiComm::new());

    let n_global = 120;
    let (matrix, rows) = model::chain_1d_subdomain(n_global, 2.5, -1.0, Arc::clone(&comm))
        .expect("subdomain failed");

    // Manufacture rhs = A * x_true on the owned rows.
    let x_true = model::reference_solution(n_global);
    let full = model::chain_1d(n_global, 2.5, -1.0).expect("chain failed");
    let rhs: Vec<f64> = full.spmv(&x_true)[rows.clone()].to_vec();
    let r_norm = comm.all_reduce_sum(rhs.iter().map(|v| v * v).sum()).sqrt();

    let dev = HostDevice::new();
    let config = SolverConfig {
        precision: 1e-10,
        ..Default::default()
    };
    let mut solver = JacobiSolver::setup("chain", &dev, &matrix, config)
        .expect("setup failed")
        .with_comm(Arc::clone(&comm));
    let rhs_buf = dev.upload(&rhs).unwrap();
    let vx = dev.alloc(rows.len()).unwrap();
    let mut policy = solver.default_policy();
    let outcome = solver
        .solve(
            &dev,
            &matrix,
            SolveRequest {
                rhs: &rhs_buf,
                vx: &vx,
                r_norm,
                aux: None,
            },
            &mut policy,
        )
        .expect("solve failed");

    assert_eq!(outcome.state, SolveState::Converged);
    for (x, t) in vx.to_vec().iter().zip(&x_true[rows]) {
        assert!((x - t).abs() < 1e-7, "x={x}, expected {t}");
    }
}

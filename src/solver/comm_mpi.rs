//! MPI communication backend for distributed solves.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```
//!
//! Halo exchange uses blocking send/recv ordered by rank: within each
//! neighbor pair the lower rank sends first.

use super::comm::{CommunicationBackend, HaloNeighbor};
use mpi::collective::SystemOperation;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

/// MPI world communicator as a `CommunicationBackend`.
///
/// Rank and world size are read once at construction.
pub struct MpiComm {
    rank: usize,
    n_ranks: usize,
}

impl MpiComm {
    pub fn new() -> Self {
        let world = SimpleCommunicator::world();
        Self {
            rank: world.rank() as usize,
            n_ranks: world.size() as usize,
        }
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationBackend for MpiComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        let world = SimpleCommunicator::world();
        let mut global = 0.0f64;
        world.all_reduce_into(&local, &mut global, SystemOperation::sum());
        global
    }

    fn halo_exchange(
        &self,
        neighbors: &[HaloNeighbor],
        local_data: &[f64],
        recv_halo: &mut [f64],
    ) {
        let world = SimpleCommunicator::world();
        for nbr in neighbors {
            assert!(
                nbr.rank != self.rank && nbr.rank < self.n_ranks,
                "rank {} has invalid halo neighbor {}",
                self.rank,
                nbr.rank
            );
            let send_data = nbr.gather(local_data);
            let peer = world.process_at_rank(nbr.rank as i32);
            let recv_slice = &mut recv_halo[nbr.recv_range()];
            if self.rank < nbr.rank {
                peer.send(&send_data[..]);
                peer.receive_into(recv_slice);
            } else {
                peer.receive_into(recv_slice);
                peer.send(&send_data[..]);
            }
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.n_ranks
    }
}

//! Communication backend abstraction for distributed relaxation.
//!
//! Provides a trait for cross-rank coordination (residual reductions, halo
//! exchange), a no-op single-process implementation, and an in-process
//! thread group where each rank is a thread.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};

/// Neighbor data for halo exchange: rank and the local indices to send/receive.
///
/// `recv_start` and `recv_count` address the ghost part of the vector.
#[derive(Debug, Clone, PartialEq)]
pub struct HaloNeighbor {
    pub rank: usize,
    pub send_indices: Vec<usize>,
    pub recv_start: usize,
    pub recv_count: usize,
}

impl HaloNeighbor {
    /// Values this neighbor needs from the owned part of the vector.
    pub fn gather(&self, local_data: &[f64]) -> Vec<f64> {
        self.send_indices.iter().map(|&i| local_data[i]).collect()
    }

    /// Slice of the ghost part filled by this neighbor.
    pub fn recv_range(&self) -> Range<usize> {
        self.recv_start..self.recv_start + self.recv_count
    }
}

/// Abstraction over inter-process communication for distributed solves.
///
/// Implementations: `SingleProcessComm` (no-op), `ThreadGroupComm`
/// (in-process ranks), `MpiComm` (via mpi crate). Every rank must enter each
/// collective in the same order; a mismatch is fatal and never retried.
pub trait CommunicationBackend: Send + Sync {
    /// Sum a local scalar across all ranks.
    fn all_reduce_sum(&self, local: f64) -> f64;

    /// Exchange halo boundary values with neighbor ranks.
    ///
    /// `local_data` holds the owned part of the vector, `recv_halo` its ghost
    /// part, filled in the order defined by the neighbor recv regions.
    fn halo_exchange(
        &self,
        neighbors: &[HaloNeighbor],
        local_data: &[f64],
        recv_halo: &mut [f64],
    );

    /// This process's rank (subdomain index).
    fn rank(&self) -> usize;

    /// Total number of ranks (subdomains).
    fn num_ranks(&self) -> usize;
}

/// No-op communication backend for single-device execution.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        local
    }

    fn halo_exchange(
        &self,
        _neighbors: &[HaloNeighbor],
        _local_data: &[f64],
        _recv_halo: &mut [f64],
    ) {
        // Single process: no neighbors, nothing to exchange.
    }

    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }
}

struct GroupShared {
    n_ranks: usize,
    barrier: Barrier,
    slots: Mutex<Vec<f64>>,
    mailbox: Mutex<HashMap<(usize, usize), Vec<f64>>>,
}

/// In-process communicator: each rank is a thread holding one handle.
///
/// Sums are accumulated in rank order, so every rank gets the same bits
/// regardless of arrival order.
pub struct ThreadGroupComm {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl ThreadGroupComm {
    /// Create handles for `n_ranks` ranks; hand handle `i` to the thread
    /// playing rank `i`.
    pub fn group(n_ranks: usize) -> Vec<Self> {
        let shared = Arc::new(GroupShared {
            n_ranks,
            barrier: Barrier::new(n_ranks),
            slots: Mutex::new(vec![0.0; n_ranks]),
            mailbox: Mutex::new(HashMap::new()),
        });
        (0..n_ranks)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<f64>> {
        self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mailbox(&self) -> MutexGuard<'_, HashMap<(usize, usize), Vec<f64>>> {
        self.shared.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommunicationBackend for ThreadGroupComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        self.slots()[self.rank] = local;
        self.shared.barrier.wait();
        let global = self.slots().iter().sum();
        // Nobody may overwrite a slot before every rank has read it.
        self.shared.barrier.wait();
        global
    }

    fn halo_exchange(
        &self,
        neighbors: &[HaloNeighbor],
        local_data: &[f64],
        recv_halo: &mut [f64],
    ) {
        {
            let mut mailbox = self.mailbox();
            for nbr in neighbors {
                mailbox.insert((self.rank, nbr.rank), nbr.gather(local_data));
            }
        }
        self.shared.barrier.wait();
        {
            let mut mailbox = self.mailbox();
            for nbr in neighbors {
                let Some(data) = mailbox.remove(&(nbr.rank, self.rank)) else {
                    panic!(
                        "rank {} expected halo data from rank {} but none was sent",
                        self.rank, nbr.rank
                    );
                };
                recv_halo[nbr.recv_range()].copy_from_slice(&data);
            }
        }
        self.shared.barrier.wait();
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.shared.n_ranks
    }
}

/// Halo of a block-row distributed vector.
///
/// Built from block-row neighbor lists; exchange indices are expanded per
/// component so a single exchange moves whole blocks.
#[derive(Clone)]
pub struct Halo {
    comm: Arc<dyn CommunicationBackend>,
    neighbors: Vec<HaloNeighbor>,
    block_size: usize,
    n_ghost_rows: usize,
}

impl Halo {
    pub fn new(
        comm: Arc<dyn CommunicationBackend>,
        block_neighbors: &[HaloNeighbor],
        block_size: usize,
    ) -> Self {
        let n_ghost_rows = block_neighbors
            .iter()
            .map(|n| n.recv_start + n.recv_count)
            .max()
            .unwrap_or(0);
        let neighbors = block_neighbors
            .iter()
            .map(|n| HaloNeighbor {
                rank: n.rank,
                send_indices: n
                    .send_indices
                    .iter()
                    .flat_map(|&row| (0..block_size).map(move |k| row * block_size + k))
                    .collect(),
                recv_start: n.recv_start * block_size,
                recv_count: n.recv_count * block_size,
            })
            .collect();
        Self {
            comm,
            neighbors,
            block_size,
            n_ghost_rows,
        }
    }

    /// Per-component neighbor lists.
    pub fn neighbors(&self) -> &[HaloNeighbor] {
        &self.neighbors
    }

    /// Ghost block rows this halo fills.
    pub fn n_ghost_rows(&self) -> usize {
        self.n_ghost_rows
    }

    /// Largest owned block row sent to any neighbor.
    pub fn max_send_row(&self) -> Option<usize> {
        self.neighbors
            .iter()
            .flat_map(|n| n.send_indices.iter())
            .max()
            .map(|&i| i / self.block_size)
    }

    /// Refresh the ghost part of `x` (rows `n_owned_rows..`) from neighbors.
    pub fn sync(&self, x: &mut [f64], n_owned_rows: usize) {
        let (owned, ghost) = x.split_at_mut(n_owned_rows * self.block_size);
        self.comm.halo_exchange(&self.neighbors, owned, ghost);
    }
}

impl fmt::Debug for Halo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Halo")
            .field("rank", &self.comm.rank())
            .field("neighbors", &self.neighbors)
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_process_all_reduce_sum() {
        let comm = SingleProcessComm;
        assert_eq!(comm.all_reduce_sum(42.0), 42.0);
        assert_eq!(comm.all_reduce_sum(-1.5), -1.5);
    }

    #[test]
    fn single_process_rank_and_size() {
        let comm = SingleProcessComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.num_ranks(), 1);
    }

    #[test]
    fn thread_group_all_reduce_sum() {
        let results: Vec<f64> = thread::scope(|s| {
            let handles: Vec<_> = ThreadGroupComm::group(4)
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let first = comm.all_reduce_sum(comm.rank() as f64 + 1.0);
                        let second = comm.all_reduce_sum(1.0);
                        first + second
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![14.0; 4]);
    }

    #[test]
    fn thread_group_halo_exchange() {
        // Two ranks of two rows each, one ghost row taken from the neighbor.
        let received: Vec<Vec<f64>> = thread::scope(|s| {
            let handles: Vec<_> = ThreadGroupComm::group(2)
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let rank = comm.rank();
                        let owned = [10.0 * rank as f64, 10.0 * rank as f64 + 1.0];
                        let nbr = HaloNeighbor {
                            rank: 1 - rank,
                            send_indices: vec![if rank == 0 { 1 } else { 0 }],
                            recv_start: 0,
                            recv_count: 1,
                        };
                        let mut ghost = [0.0];
                        comm.halo_exchange(&[nbr], &owned, &mut ghost);
                        ghost.to_vec()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(received, vec![vec![10.0], vec![1.0]]);
    }

    #[test]
    fn halo_expands_block_rows() {
        let nbr = HaloNeighbor {
            rank: 1,
            send_indices: vec![0, 2],
            recv_start: 1,
            recv_count: 2,
        };
        let halo = Halo::new(Arc::new(SingleProcessComm), &[nbr], 3);
        let expanded = &halo.neighbors()[0];
        assert_eq!(expanded.send_indices, vec![0, 1, 2, 6, 7, 8]);
        assert_eq!(expanded.recv_start, 3);
        assert_eq!(expanded.recv_count, 6);
        let owned: Vec<f64> = (0..9).map(|i| i as f64).collect();
        assert_eq!(expanded.gather(&owned), vec![0.0, 1.0, 2.0, 6.0, 7.0, 8.0]);
        assert_eq!(expanded.recv_range(), 3..9);
        assert_eq!(halo.n_ghost_rows(), 3);
        assert_eq!(halo.max_send_row(), Some(2));
    }
}

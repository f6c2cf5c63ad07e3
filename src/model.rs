//! Model problems for the demo binary and tests.
//!
//! Finite-volume style matrices: dominant diagonal blocks, `-1` face
//! coupling between neighboring cells.

use std::ops::Range;
use std::sync::Arc;

use crate::error::{RelaxError, Result};
use crate::solver::comm::{CommunicationBackend, Halo, HaloNeighbor};
use crate::sparse::MsrMatrix;

/// Diagonal value of the model diffusion operator.
const DIFFUSION_DIAG: f64 = 5.0;

/// 2-D five-point diffusion on an `nx × ny` grid with `block_size`
/// components per cell.
///
/// Diagonal blocks are `5·I` plus a small non-symmetric coupling between
/// components, so block and scalar Jacobi see different blocks.
pub fn diffusion_2d(nx: usize, ny: usize, block_size: usize) -> Result<MsrMatrix> {
    if nx == 0 || ny == 0 || block_size == 0 {
        return Err(RelaxError::Precondition(format!(
            "empty model grid {nx}x{ny} with block size {block_size}"
        )));
    }
    let n = nx * ny;
    let b = block_size;
    let upper = 0.5 / b as f64;
    let lower = 0.5 * upper;

    let mut diag = vec![0.0; n * b * b];
    for block in diag.chunks_mut(b * b) {
        for j in 0..b {
            for k in 0..b {
                block[j * b + k] = match j.cmp(&k) {
                    std::cmp::Ordering::Equal => DIFFUSION_DIAG,
                    std::cmp::Ordering::Less => upper,
                    std::cmp::Ordering::Greater => lower,
                };
            }
        }
    }

    let mut triplets = Vec::with_capacity(4 * n);
    for j in 0..ny {
        for i in 0..nx {
            let cell = j * nx + i;
            if i > 0 {
                triplets.push((cell, cell - 1, -1.0));
            }
            if i + 1 < nx {
                triplets.push((cell, cell + 1, -1.0));
            }
            if j > 0 {
                triplets.push((cell, cell - nx, -1.0));
            }
            if j + 1 < ny {
                triplets.push((cell, cell + nx, -1.0));
            }
        }
    }
    MsrMatrix::from_triplets(n, n, b, diag, &triplets)
}

/// Scalar 1-D chain: `diag` on the diagonal, `off` to both neighbors.
pub fn chain_1d(n: usize, diag: f64, off: f64) -> Result<MsrMatrix> {
    let mut triplets = Vec::with_capacity(2 * n);
    for i in 0..n {
        if i > 0 {
            triplets.push((i, i - 1, off));
        }
        if i + 1 < n {
            triplets.push((i, i + 1, off));
        }
    }
    MsrMatrix::from_triplets(n, n, 1, vec![diag; n], &triplets)
}

/// Rows of an `n_global` chain owned by `rank` out of `n_ranks`.
pub fn chain_partition(n_global: usize, rank: usize, n_ranks: usize) -> Range<usize> {
    (rank * n_global / n_ranks)..((rank + 1) * n_global / n_ranks)
}

/// This rank's slice of `chain_1d`, with ghost rows and a halo over `comm`.
///
/// Ghost rows follow the owned rows: the left neighbor's boundary row
/// first, then the right one's.
pub fn chain_1d_subdomain(
    n_global: usize,
    diag: f64,
    off: f64,
    comm: Arc<dyn CommunicationBackend>,
) -> Result<(MsrMatrix, Range<usize>)> {
    let rank = comm.rank();
    let n_ranks = comm.num_ranks();
    let rows = chain_partition(n_global, rank, n_ranks);
    let n_local = rows.len();
    if n_local == 0 {
        return Err(RelaxError::Precondition(format!(
            "rank {rank} owns no rows of a {n_global}-row chain over {n_ranks} ranks"
        )));
    }

    let has_left = rank > 0;
    let has_right = rank + 1 < n_ranks;
    let left_ghost = n_local;
    let right_ghost = n_local + usize::from(has_left);
    let n_ext = n_local + usize::from(has_left) + usize::from(has_right);

    let mut triplets = Vec::with_capacity(2 * n_local);
    for (i, global) in rows.clone().enumerate() {
        if global > 0 {
            let col = if i > 0 { i - 1 } else { left_ghost };
            triplets.push((i, col, off));
        }
        if global + 1 < n_global {
            let col = if i + 1 < n_local { i + 1 } else { right_ghost };
            triplets.push((i, col, off));
        }
    }

    let mut neighbors = Vec::new();
    if has_left {
        neighbors.push(HaloNeighbor {
            rank: rank - 1,
            send_indices: vec![0],
            recv_start: 0,
            recv_count: 1,
        });
    }
    if has_right {
        neighbors.push(HaloNeighbor {
            rank: rank + 1,
            send_indices: vec![n_local - 1],
            recv_start: usize::from(has_left),
            recv_count: 1,
        });
    }

    let halo = Halo::new(comm, &neighbors, 1);
    let matrix = MsrMatrix::from_triplets(n_local, n_ext, 1, vec![diag; n_local], &triplets)?
        .with_halo(halo)?;
    Ok((matrix, rows))
}

/// Smooth reference field of `n_values` values, used to manufacture
/// right-hand sides with a known solution.
pub fn reference_solution(n_values: usize) -> Vec<f64> {
    (0..n_values).map(|i| 1.0 + (0.1 * i as f64).sin()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::comm::SingleProcessComm;

    #[test]
    fn test_diffusion_structure() {
        let m = diffusion_2d(3, 2, 3).unwrap();
        assert_eq!(m.n_rows, 6);
        assert_eq!(m.block_size, 3);
        // 3x2 grid: 7 internal faces, each coupling two cells.
        assert_eq!(m.nnz_extra(), 14);
        let block = m.diag_block(0);
        assert_eq!(block[0], 5.0);
        assert!(block[1] > block[3]);
    }

    #[test]
    fn test_chain_partition_covers_rows() {
        let parts: Vec<_> = (0..3).map(|r| chain_partition(10, r, 3)).collect();
        assert_eq!(parts, vec![0..3, 3..6, 6..10]);
    }

    #[test]
    fn test_single_rank_subdomain_matches_chain() {
        let (sub, rows) = chain_1d_subdomain(5, 2.5, -1.0, Arc::new(SingleProcessComm)).unwrap();
        let full = chain_1d(5, 2.5, -1.0).unwrap();
        assert_eq!(rows, 0..5);
        assert_eq!(sub.n_cols_ext, 5);
        assert_eq!(sub.values, full.values);
        assert_eq!(sub.col_indices, full.col_indices);
    }
}

//! Fused update-and-reduce relaxation kernels.
//!
//! One launch performs the Jacobi update of every (block) row and the
//! first reduction level of the squared residual proxy:
//!
//! ```text
//! vx_i = D_i⁻¹ (rhs_i - vx_i)        vx holds the off-diagonal product on entry
//! r_i  = D_i (vx_i - rk_i)
//! partial[block] += |r_i|²
//! rk_i = vx_i
//! ```
//!
//! The residual is the diagonal-weighted increment, not `b - A·x`.

use rayon::prelude::*;

use super::device::LaunchGeometry;
use super::factorize::{fw_bw_lu, fw_bw_lu33, DiagonalInverse, MAX_BLOCK_SIZE};
use super::reduction::block_reduce;

/// Kernel variant, chosen once per solver from the diagonal block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaxKernel {
    /// Scalar Jacobi, `ad_inv` holds reciprocals.
    Scalar,
    /// 3x3 block Jacobi with unrolled substitution.
    Block3,
    /// Generic block Jacobi, block size at most `MAX_BLOCK_SIZE`.
    BlockN(usize),
}

impl RelaxKernel {
    pub fn for_inverse(inverse: &DiagonalInverse) -> Self {
        match inverse {
            DiagonalInverse::Scalar(_) => Self::Scalar,
            DiagonalInverse::Lu { block_size: 3, .. } => Self::Block3,
            DiagonalInverse::Lu { block_size, .. } => Self::BlockN(*block_size),
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Block3 => 3,
            Self::BlockN(n) => n,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Scalar => "jacobi",
            Self::Block3 => "block_jacobi_3",
            Self::BlockN(_) => "block_jacobi_n",
        }
    }
}

/// Host fused kernel: one rayon task per thread block, one partial per block.
///
/// Slices cover at least `n_rows * block_size` values (`partials` at least
/// `geometry.n_blocks`). Rows past `n_rows` in the last block contribute zero.
#[allow(clippy::too_many_arguments)]
pub fn fused_relax(
    kernel: RelaxKernel,
    geometry: LaunchGeometry,
    n_rows: usize,
    ad: &[f64],
    ad_inv: &[f64],
    rhs: &[f64],
    vx: &mut [f64],
    rk: &mut [f64],
    partials: &mut [f64],
) {
    let b = kernel.block_size();
    let tpb = geometry.threads_per_block;
    let n_values = n_rows * b;
    let partials = &mut partials[..geometry.n_blocks];
    partials.fill(0.0);

    vx[..n_values]
        .par_chunks_mut(tpb * b)
        .zip(rk[..n_values].par_chunks_mut(tpb * b))
        .zip(partials.par_iter_mut())
        .enumerate()
        .for_each(|(block, ((vx_blk, rk_blk), partial))| {
            let mut scratch = vec![0.0f64; tpb];
            let first_row = block * tpb;
            for (t, slot) in scratch.iter_mut().enumerate().take(vx_blk.len() / b) {
                let row = first_row + t;
                let vx_row = &mut vx_blk[t * b..(t + 1) * b];
                let rk_row = &mut rk_blk[t * b..(t + 1) * b];
                *slot = match kernel {
                    RelaxKernel::Scalar => {
                        relax_scalar(ad[row], ad_inv[row], rhs[row], vx_row, rk_row)
                    }
                    RelaxKernel::Block3 => relax_block3(
                        &ad[row * 9..row * 9 + 9],
                        &ad_inv[row * 9..row * 9 + 9],
                        &rhs[row * 3..row * 3 + 3],
                        vx_row,
                        rk_row,
                    ),
                    RelaxKernel::BlockN(n) => relax_block_n(
                        n,
                        &ad[row * n * n..(row + 1) * n * n],
                        &ad_inv[row * n * n..(row + 1) * n * n],
                        &rhs[row * n..(row + 1) * n],
                        vx_row,
                        rk_row,
                    ),
                };
            }
            *partial = block_reduce(&mut scratch);
        });
}

#[inline]
fn relax_scalar(ad: f64, ad_inv: f64, rhs: f64, vx: &mut [f64], rk: &mut [f64]) -> f64 {
    let v = (rhs - vx[0]) * ad_inv;
    let r = ad * (v - rk[0]);
    vx[0] = v;
    rk[0] = v;
    r * r
}

#[inline]
fn relax_block3(ad: &[f64], ad_inv: &[f64], rhs: &[f64], vx: &mut [f64], rk: &mut [f64]) -> f64 {
    let b = [rhs[0] - vx[0], rhs[1] - vx[1], rhs[2] - vx[2]];
    let mut x = [0.0f64; 3];
    fw_bw_lu33(ad_inv, &mut x, &b);

    let d = [x[0] - rk[0], x[1] - rk[1], x[2] - rk[2]];
    let mut sum = 0.0;
    for j in 0..3 {
        let r = ad[j * 3] * d[0] + ad[j * 3 + 1] * d[1] + ad[j * 3 + 2] * d[2];
        sum += r * r;
    }
    vx.copy_from_slice(&x);
    rk.copy_from_slice(&x);
    sum
}

#[inline]
fn relax_block_n(
    n: usize,
    ad: &[f64],
    ad_inv: &[f64],
    rhs: &[f64],
    vx: &mut [f64],
    rk: &mut [f64],
) -> f64 {
    let mut b = [0.0f64; MAX_BLOCK_SIZE];
    let mut x = [0.0f64; MAX_BLOCK_SIZE];
    for j in 0..n {
        b[j] = rhs[j] - vx[j];
    }
    fw_bw_lu(ad_inv, n, &mut x, &b);

    let mut sum = 0.0;
    for j in 0..n {
        let mut r = 0.0;
        for k in 0..n {
            r += ad[j * n + k] * (x[k] - rk[k]);
        }
        sum += r * r;
    }
    vx.copy_from_slice(&x[..n]);
    rk.copy_from_slice(&x[..n]);
    sum
}

//! Diagonal block factorization for (block) Jacobi relaxation.
//!
//! Scalar diagonals are inverted directly. Block diagonals are replaced by a
//! compact LU factorization without pivoting: `L` is unit lower triangular
//! and stored below the diagonal, `U` occupies the diagonal and above, both
//! in the row-major `b × b` slot of the original block.

use rayon::prelude::*;

use crate::error::{RelaxError, Result};

/// Largest diagonal block the generic block kernel supports.
pub const MAX_BLOCK_SIZE: usize = 9;

/// Reject block sizes the kernels cannot handle.
pub fn check_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(RelaxError::Precondition(format!(
            "diagonal block size {block_size} outside supported range 1..={MAX_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

/// Inverted (or factorized) diagonal, computed once at setup.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagonalInverse {
    /// One reciprocal per row.
    Scalar(Vec<f64>),
    /// One compact LU factor of `block_size²` values per block row.
    Lu { block_size: usize, factors: Vec<f64> },
}

impl DiagonalInverse {
    /// Factorize diagonal blocks `ad` (`n_rows * block_size²` values).
    /// Block size 1 yields reciprocals.
    pub fn factorize(ad: &[f64], block_size: usize) -> Result<Self> {
        if block_size == 1 {
            return Self::invert_scalar(ad);
        }
        Self::factorize_lu(ad, block_size)
    }

    /// Factorize as LU blocks even for block size 1, forcing the block kernel.
    pub fn factorize_lu(ad: &[f64], block_size: usize) -> Result<Self> {
        check_block_size(block_size)?;
        let bb = block_size * block_size;
        if ad.len() % bb != 0 {
            return Err(RelaxError::Precondition(format!(
                "diagonal length {} is not a multiple of {bb}",
                ad.len()
            )));
        }
        let mut factors = ad.to_vec();
        factors
            .par_chunks_mut(bb)
            .enumerate()
            .try_for_each(|(row, block)| {
                if block_size == 3 {
                    fact_lu33(block)
                } else {
                    fact_lu(block, block_size)
                }
                .map_err(|pivot| {
                    RelaxError::Precondition(format!(
                        "singular diagonal block at row {row} (pivot {pivot})"
                    ))
                })
            })?;
        Ok(Self::Lu {
            block_size,
            factors,
        })
    }

    fn invert_scalar(ad: &[f64]) -> Result<Self> {
        if let Some(row) = ad.iter().position(|&d| d == 0.0 || !d.is_finite()) {
            return Err(RelaxError::Precondition(format!(
                "zero or non-finite diagonal at row {row}"
            )));
        }
        Ok(Self::Scalar(ad.par_iter().map(|&d| 1.0 / d).collect()))
    }

    pub fn block_size(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Lu { block_size, .. } => *block_size,
        }
    }

    /// Number of (block) rows covered.
    pub fn n_rows(&self) -> usize {
        match self {
            Self::Scalar(inv) => inv.len(),
            Self::Lu {
                block_size,
                factors,
            } => factors.len() / (block_size * block_size),
        }
    }

    /// Flat storage, as uploaded to a device.
    pub fn values(&self) -> &[f64] {
        match self {
            Self::Scalar(inv) => inv,
            Self::Lu { factors, .. } => factors,
        }
    }
}

/// Unrolled compact LU of a 3x3 block. Returns the offending pivot on failure.
fn fact_lu33(m: &mut [f64]) -> std::result::Result<(), f64> {
    check_pivot(m[0])?;
    m[3] /= m[0];
    m[4] -= m[3] * m[1];
    m[5] -= m[3] * m[2];
    check_pivot(m[4])?;
    m[6] /= m[0];
    m[7] = (m[7] - m[6] * m[1]) / m[4];
    m[8] = m[8] - m[6] * m[2] - m[7] * m[5];
    check_pivot(m[8])
}

/// In-place Doolittle LU of an `n x n` block, no pivoting.
fn fact_lu(m: &mut [f64], n: usize) -> std::result::Result<(), f64> {
    for k in 0..n {
        let pivot = m[k * n + k];
        check_pivot(pivot)?;
        for i in k + 1..n {
            m[i * n + k] /= pivot;
            let l = m[i * n + k];
            for j in k + 1..n {
                m[i * n + j] -= l * m[k * n + j];
            }
        }
    }
    Ok(())
}

fn check_pivot(pivot: f64) -> std::result::Result<(), f64> {
    if pivot == 0.0 || !pivot.is_finite() {
        Err(pivot)
    } else {
        Ok(())
    }
}

/// Solve `L·U·x = b` for one 3x3 compact factor.
#[inline]
pub(crate) fn fw_bw_lu33(m: &[f64], x: &mut [f64], b: &[f64]) {
    let aux0 = b[0];
    let aux1 = b[1] - aux0 * m[3];
    let aux2 = b[2] - aux0 * m[6] - aux1 * m[7];

    x[2] = aux2 / m[8];
    x[1] = (aux1 - m[5] * x[2]) / m[4];
    x[0] = (aux0 - m[1] * x[1] - m[2] * x[2]) / m[0];
}

/// Solve `L·U·x = b` for one `n x n` compact factor, `n <= MAX_BLOCK_SIZE`.
#[inline]
pub(crate) fn fw_bw_lu(m: &[f64], n: usize, x: &mut [f64], b: &[f64]) {
    let mut aux = [0.0f64; MAX_BLOCK_SIZE];

    for i in 0..n {
        let mut s = b[i];
        for j in 0..i {
            s -= aux[j] * m[i * n + j];
        }
        aux[i] = s;
    }

    for i in (0..n).rev() {
        let mut s = aux[i];
        for j in i + 1..n {
            s -= x[j] * m[i * n + j];
        }
        x[i] = s / m[i * (n + 1)];
    }
}

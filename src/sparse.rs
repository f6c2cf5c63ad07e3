//! Modified Sparse Row (MSR) matrix.
//!
//! The diagonal is stored apart from the rest of the matrix as dense blocks
//! (one `b × b` block per row, row-major). The extra-diagonal part is a
//! scalar CSR structure whose coefficients couple each component of a block
//! row to the same component of the neighboring block row, which is what a
//! finite-volume assembly produces for vector unknowns with isotropic face
//! coupling.
//!
//! Rows `0..n_rows` are owned. Columns may reference ghost rows
//! `n_rows..n_cols_ext` whose values are filled by the optional halo before
//! each product.

use rayon::prelude::*;

use crate::error::{RelaxError, Result};
use crate::solver::comm::Halo;

/// Sparse matrix with separate diagonal blocks and scalar extra-diagonal CSR.
#[derive(Debug, Clone)]
pub struct MsrMatrix {
    /// Owned block rows.
    pub n_rows: usize,
    /// Owned plus ghost block rows (length of vectors the product reads).
    pub n_cols_ext: usize,
    pub block_size: usize,
    /// Diagonal blocks, `n_rows * block_size²` values.
    pub diag: Vec<f64>,
    /// Extra-diagonal coefficients, stored row by row.
    pub values: Vec<f64>,
    /// Block column index for each extra-diagonal coefficient.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]` is the index into values/col_indices where row i starts.
    pub row_pointers: Vec<usize>,
    pub halo: Option<Halo>,
}

impl MsrMatrix {
    /// Build from diagonal blocks and extra-diagonal `(row, col, value)` triplets.
    /// Duplicate entries at the same (row, col) are summed. Triplets on the
    /// diagonal are rejected: the diagonal lives in `diag` only.
    pub fn from_triplets(
        n_rows: usize,
        n_cols_ext: usize,
        block_size: usize,
        diag: Vec<f64>,
        triplets: &[(usize, usize, f64)],
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(RelaxError::Precondition(
                "block size must be at least 1".into(),
            ));
        }
        if n_cols_ext < n_rows {
            return Err(RelaxError::Precondition(format!(
                "extended column count {n_cols_ext} is smaller than row count {n_rows}"
            )));
        }
        if diag.len() != n_rows * block_size * block_size {
            return Err(RelaxError::Precondition(format!(
                "diagonal has {} values, expected {} for {} rows of {}x{} blocks",
                diag.len(),
                n_rows * block_size * block_size,
                n_rows,
                block_size,
                block_size
            )));
        }
        let misplaced = triplets
            .iter()
            .find(|t| t.0 >= n_rows || t.1 >= n_cols_ext || t.0 == t.1);
        if let Some(&(row, col, _)) = misplaced {
            return Err(RelaxError::Precondition(format!(
                "invalid extra-diagonal entry ({row}, {col}) in {n_rows}x{n_cols_ext} matrix"
            )));
        }

        let mut row_pointers = vec![0usize; n_rows + 1];
        if triplets.is_empty() {
            return Ok(Self {
                n_rows,
                n_cols_ext,
                block_size,
                diag,
                values: Vec::new(),
                col_indices: Vec::new(),
                row_pointers,
                halo: None,
            });
        }

        let mut order: Vec<usize> = (0..triplets.len()).collect();
        order.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut values = Vec::with_capacity(triplets.len());
        let mut col_indices = Vec::with_capacity(triplets.len());

        let (mut cur_row, mut cur_col, mut cur_val) = triplets[order[0]];
        for &idx in &order[1..] {
            let (row, col, val) = triplets[idx];
            if row == cur_row && col == cur_col {
                cur_val += val;
            } else {
                values.push(cur_val);
                col_indices.push(cur_col);
                row_pointers[cur_row + 1] += 1;
                cur_row = row;
                cur_col = col;
                cur_val = val;
            }
        }
        values.push(cur_val);
        col_indices.push(cur_col);
        row_pointers[cur_row + 1] += 1;

        for i in 1..=n_rows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Ok(Self {
            n_rows,
            n_cols_ext,
            block_size,
            diag,
            values,
            col_indices,
            row_pointers,
            halo: None,
        })
    }

    /// Attach a halo describing how ghost rows are refreshed before a product.
    pub fn with_halo(mut self, halo: Halo) -> Result<Self> {
        let n_ghost = self.n_cols_ext - self.n_rows;
        if halo.n_ghost_rows() > n_ghost {
            return Err(RelaxError::Precondition(format!(
                "halo receives {} ghost rows but the matrix has {}",
                halo.n_ghost_rows(),
                n_ghost
            )));
        }
        if halo.max_send_row().is_some_and(|row| row >= self.n_rows) {
            return Err(RelaxError::Precondition(
                "halo sends a row the matrix does not own".into(),
            ));
        }
        self.halo = Some(halo);
        Ok(self)
    }

    /// Number of extra-diagonal coefficients.
    pub fn nnz_extra(&self) -> usize {
        self.values.len()
    }

    /// Diagonal block of block row `row`.
    pub fn diag_block(&self, row: usize) -> &[f64] {
        let bb = self.block_size * self.block_size;
        &self.diag[row * bb..(row + 1) * bb]
    }

    /// Off-diagonal product `y = E * x` over owned rows.
    ///
    /// `x` covers owned and ghost rows; ghost values must already be current.
    pub(crate) fn spmv_off_diagonal(&self, x: &[f64], y: &mut [f64]) {
        let b = self.block_size;
        assert!(x.len() >= self.n_cols_ext * b, "spmv input too short");
        assert!(y.len() >= self.n_rows * b, "spmv output too short");
        y[..self.n_rows * b]
            .par_chunks_mut(b)
            .enumerate()
            .for_each(|(row, y_row)| {
                let start = self.row_pointers[row];
                let end = self.row_pointers[row + 1];
                for (k, y_k) in y_row.iter_mut().enumerate() {
                    let mut sum = 0.0;
                    for idx in start..end {
                        sum += self.values[idx] * x[self.col_indices[idx] * b + k];
                    }
                    *y_k = sum;
                }
            });
    }

    /// Full product `y = (D + E) * x` over owned rows. Ghost values of `x`
    /// must already be current.
    ///
    /// Panics unless `x` holds exactly `n_cols_ext * block_size` values.
    pub fn spmv(&self, x: &[f64]) -> Vec<f64> {
        let b = self.block_size;
        assert_eq!(x.len(), self.n_cols_ext * b, "spmv dimension mismatch");
        let mut y = vec![0.0; self.n_rows * b];
        self.spmv_off_diagonal(x, &mut y);
        for row in 0..self.n_rows {
            let block = self.diag_block(row);
            for j in 0..b {
                let mut sum = 0.0;
                for k in 0..b {
                    sum += block[j * b + k] * x[row * b + k];
                }
                y[row * b + j] += sum;
            }
        }
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_extra_diagonal() {
        let m = MsrMatrix::from_triplets(3, 3, 1, vec![1.0; 3], &[]).unwrap();
        assert_eq!(m.nnz_extra(), 0);
        assert_eq!(m.row_pointers, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_from_triplets_duplicates_summed() {
        let triplets = vec![(0, 1, -1.0), (0, 1, -0.5), (1, 0, -1.0)];
        let m = MsrMatrix::from_triplets(2, 2, 1, vec![4.0, 4.0], &triplets).unwrap();
        assert_eq!(m.nnz_extra(), 2);
        assert_eq!(m.values, vec![-1.5, -1.0]);
        assert_eq!(m.col_indices, vec![1, 0]);
        assert_eq!(m.row_pointers, vec![0, 1, 2]);
    }

    #[test]
    fn test_diagonal_triplet_rejected() {
        let err = MsrMatrix::from_triplets(2, 2, 1, vec![1.0, 1.0], &[(1, 1, 3.0)]);
        assert!(matches!(err, Err(RelaxError::Precondition(_))));
    }

    #[test]
    fn test_diag_length_checked() {
        let err = MsrMatrix::from_triplets(2, 2, 3, vec![1.0; 9], &[]);
        assert!(matches!(err, Err(RelaxError::Precondition(_))));
    }

    #[test]
    fn test_spmv_off_diagonal_block() {
        // Two block rows of size 2 coupled by -1 in both directions.
        let diag = vec![4.0, 0.0, 0.0, 4.0, 4.0, 0.0, 0.0, 4.0];
        let m = MsrMatrix::from_triplets(2, 2, 2, diag, &[(0, 1, -1.0), (1, 0, -1.0)]).unwrap();
        let x = [1.0, 2.0, 3.0, 4.0];
        let mut y = [0.0; 4];
        m.spmv_off_diagonal(&x, &mut y);
        assert_eq!(y, [-3.0, -4.0, -1.0, -2.0]);
    }

    #[test]
    fn test_spmv_full() {
        // [[2, 1], [0, 3]] * [1, 2] = [4, 6]
        let m = MsrMatrix::from_triplets(2, 2, 1, vec![2.0, 3.0], &[(0, 1, 1.0)]).unwrap();
        assert_eq!(m.spmv(&[1.0, 2.0]), vec![4.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "spmv dimension mismatch")]
    fn test_spmv_short_input_panics() {
        let m = MsrMatrix::from_triplets(2, 3, 1, vec![2.0, 3.0], &[(0, 2, 1.0)]).unwrap();
        m.spmv(&[1.0, 2.0]);
    }

    #[test]
    fn test_ghost_columns_allowed() {
        let m = MsrMatrix::from_triplets(1, 2, 1, vec![2.0], &[(0, 1, -1.0)]).unwrap();
        let mut y = [0.0];
        m.spmv_off_diagonal(&[5.0, 3.0], &mut y);
        assert_eq!(y, [-3.0]);
    }
}

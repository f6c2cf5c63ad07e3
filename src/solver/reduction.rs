//! Two-level sum reduction, host rendition of the device kernels.
//!
//! Level one runs inside a thread block: a shared scratch array is halved
//! with a tree until 64 values remain, then an unrolled warp tail finishes
//! with offsets 32, 16, 8, 4, 2, 1. Level two is a separate launch with a
//! single block: each thread accumulates block partials with a grid stride,
//! then the same tree collapses the block.
//!
//! Summation order is fixed by the launch geometry, so results are
//! reproducible for a given threads-per-block value. They differ from a
//! left-to-right sum, from other block sizes, and between the f64 host
//! device and the f32 GPU device.

/// Lanes that finish a reduction without a block barrier on the device.
pub const WARP_SIZE: usize = 32;

/// Tree-reduce a block's shared scratch in place and return the total.
///
/// `scratch.len()` is the block width: a power of two, at least `2 * WARP_SIZE`.
pub fn block_reduce(scratch: &mut [f64]) -> f64 {
    let width = scratch.len();
    debug_assert!(width.is_power_of_two() && width >= 2 * WARP_SIZE);
    let mut stride = width / 2;
    while stride > WARP_SIZE {
        tree_step(scratch, stride);
        stride /= 2;
    }
    warp_reduce(scratch);
    scratch[0]
}

#[inline(always)]
fn tree_step(s: &mut [f64], offset: usize) {
    let (low, high) = s.split_at_mut(offset);
    for (l, h) in low.iter_mut().zip(&high[..offset]) {
        *l += *h;
    }
}

/// Last six steps, one warp wide.
#[inline(always)]
fn warp_reduce(s: &mut [f64]) {
    tree_step(s, 32);
    tree_step(s, 16);
    tree_step(s, 8);
    tree_step(s, 4);
    tree_step(s, 2);
    tree_step(s, 1);
}

/// Second-level pass: collapse per-block partials with one block of `threads`.
pub fn reduce_partials(partials: &[f64], threads: usize) -> f64 {
    let mut scratch = vec![0.0f64; threads];
    for (t, slot) in scratch.iter_mut().enumerate() {
        let mut acc = 0.0;
        let mut i = t;
        while i < partials.len() {
            acc += partials[i];
            i += threads;
        }
        *slot = acc;
    }
    block_reduce(&mut scratch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_block_reduce_integers_exact() {
        let mut s: Vec<f64> = (1..=256).map(|i| i as f64).collect();
        assert_eq!(block_reduce(&mut s), 256.0 * 257.0 / 2.0);
    }

    #[test]
    fn test_block_reduce_minimum_width() {
        let mut s = vec![1.0; 64];
        assert_eq!(block_reduce(&mut s), 64.0);
    }

    #[test]
    fn test_reduce_partials_fewer_than_threads() {
        let partials = [1.5, 2.5, 3.0];
        assert_eq!(reduce_partials(&partials, 256), 7.0);
    }

    #[test]
    fn test_reduce_partials_grid_stride() {
        let partials: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        assert_eq!(reduce_partials(&partials, 64), 999.0 * 1000.0 / 2.0);
    }

    #[test]
    fn test_reduction_deterministic() {
        let partials: Vec<f64> = (0..5000).map(|i| ((i as f64) * 0.37).sin().powi(2)).collect();
        let a = reduce_partials(&partials, 128);
        let b = reduce_partials(&partials, 128);
        assert_eq!(a.to_bits(), b.to_bits());
        let naive: f64 = partials.iter().sum();
        assert_relative_eq!(a, naive, max_relative = 1e-12);
    }

    #[test]
    fn test_empty_partials() {
        assert_eq!(reduce_partials(&[], 64), 0.0);
    }
}

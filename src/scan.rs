//! Generic block-parallel associative scan.
//!
//! Given an associative operator `⊕` with identity `e` and inputs
//! `v_0..v_{T-1}`, `scan_left` produces `s_t = v_0 ⊕ … ⊕ v_t` for every
//! `t`. `scan_right` produces the mirrored suffix scan. Both have a
//! sequential implementation (used for small inputs and as the
//! oracle in tests) and a block-parallel one following a three-step
//! decomposition: local pass, reduce, finalize.
//!
//! The HMM core (`hmm::baum_welch`) instantiates this over
//! [`crate::numeric::Matrix`] with matrix multiplication as `⊕`; the
//! tests below instantiate it over plain numbers with `+`.

use rayon::prelude::*;

/// An associative operator with an identity element, as required by
/// `scan_left`/`scan_right`. `combine` must satisfy
/// `combine(a, combine(b, c)) == combine(combine(a, b), c)` for the
/// scan decomposition to be correct; this is a correctness
/// precondition on the caller, not something this module can check.
pub trait Associative: Sized + Clone + Send + Sync {
    /// The identity element `e` such that `combine(e, x) == x` and
    /// `combine(x, e) == x`.
    fn identity() -> Self;

    /// `a ⊕ b`.
    fn combine(a: &Self, b: &Self) -> Self;
}

/// Sequential left-scan: `s_t = v_0 ⊕ … ⊕ v_t`. This is the
/// definition every other implementation must agree with.
pub fn scan_left_sequential<T: Associative>(values: &[T]) -> Vec<T> {
    let mut acc = T::identity();
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        acc = T::combine(&acc, v);
        out.push(acc.clone());
    }
    out
}

/// Sequential right-scan: `s_t = v_t ⊕ … ⊕ v_{T-1}`.
pub fn scan_right_sequential<T: Associative>(values: &[T]) -> Vec<T> {
    let mut acc = T::identity();
    let mut out = vec![T::identity(); values.len()];
    for (t, v) in values.iter().enumerate().rev() {
        acc = T::combine(v, &acc);
        out[t] = acc.clone();
    }
    out
}

/// Block-parallel left-scan, following the local-pass/reduce/finalize
/// decomposition above. Produces results bit-identical in the usual
/// floating-point sense to `scan_left_sequential` for an
/// associative, side-effect-free `combine`.
///
/// `block_size` of 0 is treated as "one block" (fully sequential).
pub fn scan_left_blocked<T: Associative>(values: &[T], block_size: usize) -> Vec<T> {
    let t = values.len();
    if t == 0 {
        return Vec::new();
    }
    let block_size = if block_size == 0 { t } else { block_size };

    // Step 1: local pass. Each block computes its own prefix scan
    // independently; `local[k]` holds the in-block prefix scan,
    // `last[k]` its final (whole-block-combined) element.
    let blocks: Vec<&[T]> = values.chunks(block_size).collect();
    let local: Vec<Vec<T>> = blocks
        .par_iter()
        .map(|block| scan_left_sequential(block))
        .collect();

    // Step 2: reduce. Sequential scan over block summaries produces
    // the offset each block must premultiply by.
    let last_per_block: Vec<T> = local
        .iter()
        .map(|l| l.last().cloned().unwrap_or_else(T::identity))
        .collect();
    let mut offsets = Vec::with_capacity(blocks.len());
    let mut running = T::identity();
    for r in &last_per_block {
        offsets.push(running.clone());
        running = T::combine(&running, r);
    }

    // Step 3: finalize. Each block premultiplies its local prefixes
    // by its offset.
    local
        .into_par_iter()
        .zip(offsets.into_par_iter())
        .flat_map(|(block_local, offset)| {
            block_local
                .into_par_iter()
                .map(move |partial| T::combine(&offset, &partial))
        })
        .collect()
}

/// Block-parallel right-scan (suffix scan), mirroring
/// [`scan_left_blocked`].
pub fn scan_right_blocked<T: Associative>(values: &[T], block_size: usize) -> Vec<T> {
    let t = values.len();
    if t == 0 {
        return Vec::new();
    }
    let block_size = if block_size == 0 { t } else { block_size };

    let blocks: Vec<&[T]> = values.chunks(block_size).collect();
    let local: Vec<Vec<T>> = blocks
        .par_iter()
        .map(|block| scan_right_sequential(block))
        .collect();

    let first_per_block: Vec<T> = local
        .iter()
        .map(|l| l.first().cloned().unwrap_or_else(T::identity))
        .collect();

    // Suffix reduce: offsets[k] = combine(first[k+1], ..., first[B-1]).
    let mut offsets = vec![T::identity(); blocks.len()];
    let mut running = T::identity();
    for k in (0..blocks.len()).rev() {
        offsets[k] = running.clone();
        if k > 0 {
            running = T::combine(&first_per_block[k], &running);
        }
    }

    local
        .into_par_iter()
        .zip(offsets.into_par_iter())
        .flat_map(|(block_local, offset)| {
            block_local
                .into_par_iter()
                .map(move |partial| T::combine(&partial, &offset))
        })
        .collect()
}

// A trivial `Associative` instance for plain sums
// (`scan_left([1,2,3,4,5], +, 0)`), exercised in `tests/integration.rs`.
impl Associative for f64 {
    fn identity() -> Self {
        0.0
    }

    fn combine(a: &Self, b: &Self) -> Self {
        a + b
    }
}

// `Matrix::identity()` needs a known dimension, which this trait's
// `identity()` cannot supply; `Option<Matrix>` sidesteps that by using
// `None` as the identity sentinel (`combine` with `None` is a no-op).
// The HMM core's matrix-chain scans (`hmm::baum_welch`) use this
// instance.
impl Associative for Option<crate::numeric::Matrix> {
    fn identity() -> Self {
        None
    }

    fn combine(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (None, x) => x.clone(),
            (x, None) => x.clone(),
            (Some(a), Some(b)) => {
                let mut out = crate::numeric::Matrix::zeros(a.rows(), b.cols());
                a.mul_into(b, &mut out);
                Some(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::Matrix;

    #[test]
    fn scan_left_sums_plain_numbers() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = scan_left_sequential(&values);
        assert_eq!(result, vec![1.0, 3.0, 6.0, 10.0, 15.0]);
    }

    #[test]
    fn blocked_scan_matches_sequential_for_sums() {
        let values: Vec<f64> = (0..137).map(|i| i as f64 * 0.5).collect();
        let seq = scan_left_sequential(&values);
        for block_size in [1, 2, 7, 16, 64, 200] {
            let blocked = scan_left_blocked(&values, block_size);
            assert_eq!(blocked.len(), seq.len());
            for (a, b) in seq.iter().zip(blocked.iter()) {
                assert!((a - b).abs() < 1e-9, "block_size={block_size}");
            }
        }
    }

    #[test]
    fn blocked_right_scan_matches_sequential() {
        let values: Vec<f64> = (0..97).map(|i| (i as f64).sin()).collect();
        let seq = scan_right_sequential(&values);
        for block_size in [1, 3, 10, 50] {
            let blocked = scan_right_blocked(&values, block_size);
            for (a, b) in seq.iter().zip(blocked.iter()) {
                assert!((a - b).abs() < 1e-9, "block_size={block_size}");
            }
        }
    }

    fn random_2x2(seed: u64) -> Matrix {
        // Small deterministic PRNG-free generator; good enough for a
        // handful of fixed matrices in a unit test.
        let a = ((seed * 37 + 11) % 97) as f64 / 97.0 + 0.1;
        let b = ((seed * 53 + 7) % 89) as f64 / 89.0 + 0.1;
        let c = ((seed * 61 + 3) % 83) as f64 / 83.0 + 0.1;
        let d = ((seed * 71 + 13) % 101) as f64 / 101.0 + 0.1;
        Matrix::from_row_major(2, 2, vec![a, b, c, d])
    }

    #[test]
    fn scan_left_matrix_mul_matches_manual_prefix_product() {
        // Uses the `Option<Matrix>` identity-sentinel instance (see
        // impl note above).
        let values: Vec<Option<Matrix>> = (0..20).map(|i| Some(random_2x2(i))).collect();
        let seq = scan_left_sequential(&values);

        // Manual sequential prefix product, independent of the scan
        // engine, as the oracle.
        let mut manual = Vec::with_capacity(values.len());
        let mut acc = Matrix::identity(2);
        for v in &values {
            let mut out = Matrix::zeros(2, 2);
            acc.mul_into(v.as_ref().unwrap(), &mut out);
            acc = out;
            manual.push(acc.clone());
        }

        for (s, m) in seq.iter().zip(manual.iter()) {
            assert!(s.as_ref().unwrap().l1_distance(m) < 1e-12);
        }

        let blocked = scan_left_blocked(&values, 3);
        for (b, m) in blocked.iter().zip(manual.iter()) {
            assert!(b.as_ref().unwrap().l1_distance(m) < 1e-12);
        }
    }

    #[test]
    fn empty_input_scans_to_empty_output() {
        let values: Vec<f64> = vec![];
        assert!(scan_left_blocked(&values, 4).is_empty());
        assert!(scan_right_blocked(&values, 4).is_empty());
    }
}

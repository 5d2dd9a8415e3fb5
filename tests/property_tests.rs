//! Property tests for index shuffling and entry weighting

use fast_pmf::sparse::glove_weight;
use fast_pmf::{Entry, FactorModel, Layout, PermutationPair, SparseMatrix};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Up to 40 entries on a grid of at most 12 x 9, coordinates and values drawn
/// independently; duplicates are allowed.
fn sparse_matrix() -> impl Strategy<Value = SparseMatrix> {
    (1usize..12, 1usize..9).prop_flat_map(|(rows, cols)| {
        prop::collection::vec((0..rows, 0..cols, -5.0f64..5.0), 0..40).prop_map(
            move |entries| {
                let entries = entries.into_iter().map(|(r, c, v)| Entry::new(r, c, v));
                SparseMatrix::from_triplets(rows, cols, entries).unwrap()
            },
        )
    })
}

fn sorted_triplets(m: &SparseMatrix) -> Vec<(usize, usize, i64)> {
    let mut out: Vec<_> = m
        .triplets()
        .map(|e| (e.row, e.col, (e.value * 1e9).round() as i64))
        .collect();
    out.sort_unstable();
    out
}

proptest! {
    #[test]
    fn prop_shuffle_then_restore_is_identity(m in sparse_matrix(), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows = PermutationPair::generate(m.rows(), &mut rng);
        let cols = PermutationPair::generate(m.cols(), &mut rng);

        let mut shuffled = m.clone();
        shuffled.apply_permutation(rows.perm(), cols.perm()).unwrap();
        prop_assert_eq!(shuffled.nnz(), m.nnz());
        for r in 0..m.rows() {
            prop_assert_eq!(shuffled.row_nnz(rows.perm()[r]), m.row_nnz(r));
        }
        for c in 0..m.cols() {
            prop_assert_eq!(shuffled.col_nnz(cols.perm()[c]), m.col_nnz(c));
        }

        shuffled.apply_permutation(rows.inverse(), cols.inverse()).unwrap();
        prop_assert_eq!(sorted_triplets(&shuffled), sorted_triplets(&m));
    }

    #[test]
    fn prop_predictions_follow_the_shuffle(m in sparse_matrix(), seed in any::<u64>()) {
        let mut model = FactorModel::new(m.rows(), m.cols(), 3, Layout::RowMajor);
        for ((r, t), x) in model.w.indexed_iter_mut() {
            *x = (r as f64 + 1.0) * 0.1 - t as f64 * 0.3;
        }
        for ((c, t), x) in model.h.indexed_iter_mut() {
            *x = (c as f64) * 0.2 + t as f64 * 0.05;
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let rows = PermutationPair::generate(m.rows(), &mut rng);
        let cols = PermutationPair::generate(m.cols(), &mut rng);
        let mut shuffled = model.clone();
        shuffled.apply_permutation(rows.inverse(), cols.inverse()).unwrap();

        for e in m.triplets() {
            let moved = shuffled.predict(rows.perm()[e.row], cols.perm()[e.col]);
            prop_assert!((moved - model.predict(e.row, e.col)).abs() < 1e-12);
        }

        shuffled.apply_permutation(rows.perm(), cols.perm()).unwrap();
        prop_assert_eq!(shuffled.w, model.w);
        prop_assert_eq!(shuffled.h, model.h);
    }

    #[test]
    fn prop_glove_weight_is_bounded_and_monotone(
        a in 1e-6f64..1e4,
        b in 1e-6f64..1e4,
        x_max in 1.0f64..200.0,
        alpha in 0.1f64..1.0,
    ) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let w_lo = glove_weight(lo, x_max, alpha);
        let w_hi = glove_weight(hi, x_max, alpha);
        prop_assert!(w_lo > 0.0 && w_lo <= 1.0);
        prop_assert!(w_hi > 0.0 && w_hi <= 1.0);
        prop_assert!(w_lo <= w_hi);
    }
}

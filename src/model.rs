//! Dense factor matrices `W` (rows x k) and `H` (cols x k).
//!
//! The storage order is picked per solver: CCDR1 walks one feature (column) at a
//! time, ALS and SGD walk one index (row) at a time. Indexing is layout-agnostic,
//! so the choice never changes numerical results.

use std::io::Write;
use std::path::Path;

use ndarray::{Array2, ArrayView1, Axis, ShapeBuilder};
use ndarray_npy::{read_npy, write_npy};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::BiasMode;
use crate::error::{PmfError, Result};
use crate::sparse::SparseMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// each index's k features are contiguous
    RowMajor,
    /// each feature's column is contiguous
    ColMajor,
}

#[derive(Debug, Clone)]
pub struct FactorModel {
    rows: usize,
    cols: usize,
    k: usize,
    layout: Layout,
    pub w: Array2<f64>,
    pub h: Array2<f64>,
    /// Mean removed from the training values before factorization
    pub global_bias: f64,
    bias_features: bool,
}

fn zeros(n: usize, k: usize, layout: Layout) -> Array2<f64> {
    match layout {
        Layout::RowMajor => Array2::zeros((n, k)),
        Layout::ColMajor => Array2::zeros((n, k).f()),
    }
}

impl FactorModel {
    pub fn new(rows: usize, cols: usize, k: usize, layout: Layout) -> Self {
        Self {
            rows,
            cols,
            k,
            layout,
            w: zeros(rows, k, layout),
            h: zeros(cols, k, layout),
            global_bias: 0.0,
            bias_features: false,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Whether the last two features are the reserved row-bias / column-bias pair.
    pub fn bias_features(&self) -> bool {
        self.bias_features
    }

    pub fn set_bias_features(&mut self, enabled: bool) {
        self.bias_features = enabled && self.k >= 2;
    }

    /// Number of features not reserved for bias.
    pub fn free_rank(&self) -> usize {
        if self.bias_features {
            self.k - 2
        } else {
            self.k
        }
    }

    /// Fill `W` with `U(0, scale)` draws.
    pub fn randomize_w<R: Rng + ?Sized>(&mut self, scale: f64, rng: &mut R) {
        let draw = Array2::random_using((self.rows, self.k), Uniform::new(0.0, scale), rng);
        self.w.assign(&draw);
    }

    /// Fill `H` with `U(0, scale)` draws.
    pub fn randomize_h<R: Rng + ?Sized>(&mut self, scale: f64, rng: &mut R) {
        let draw = Array2::random_using((self.cols, self.k), Uniform::new(0.0, scale), rng);
        self.h.assign(&draw);
    }

    /// Same factors stored in another layout.
    pub fn to_layout(&self, layout: Layout) -> FactorModel {
        let mut out = FactorModel::new(self.rows, self.cols, self.k, layout);
        out.w.assign(&self.w);
        out.h.assign(&self.h);
        out.global_bias = self.global_bias;
        out.bias_features = self.bias_features;
        out
    }

    /// Inner product of the factors, without the global bias.
    pub fn score(&self, r: usize, c: usize) -> f64 {
        self.w.row(r).dot(&self.h.row(c))
    }

    pub fn predict(&self, r: usize, c: usize) -> f64 {
        self.global_bias + self.score(r, c)
    }

    /// Root mean squared error of `predict` over the entries of `m`.
    pub fn rmse(&self, m: &SparseMatrix) -> f64 {
        if m.nnz() == 0 {
            return 0.0;
        }
        let sse: f64 = (0..m.rows())
            .into_par_iter()
            .map(|r| {
                m.row(r)
                    .iter()
                    .map(|(c, value, _)| {
                        let err = value - self.predict(r, c);
                        err * err
                    })
                    .sum::<f64>()
            })
            .sum();
        (sse / m.nnz() as f64).sqrt()
    }

    /// Reorder both factor matrices so that index `i` receives the factors
    /// currently stored at `row_perm[i]` / `col_perm[i]`.
    ///
    /// A model trained on a matrix permuted with `perm` is brought back to the
    /// original index order by calling this with the same `perm`.
    pub fn apply_permutation(&mut self, row_perm: &[usize], col_perm: &[usize]) -> Result<()> {
        if row_perm.len() != self.rows || col_perm.len() != self.cols {
            return Err(PmfError::InvalidPermutation(format!(
                "model is {}x{} but permutations have lengths {} and {}",
                self.rows,
                self.cols,
                row_perm.len(),
                col_perm.len()
            )));
        }
        let mut w = zeros(self.rows, self.k, self.layout);
        w.assign(&self.w.select(Axis(0), row_perm));
        let mut h = zeros(self.cols, self.k, self.layout);
        h.assign(&self.h.select(Axis(0), col_perm));
        self.w = w;
        self.h = h;
        Ok(())
    }

    /// Write one line per row to `words` and one line per column to `contexts`.
    ///
    /// With reserved bias features, `BiasMode::ComputeOnly` drops them and
    /// `BiasMode::Persist` keeps them and appends a constant `1`.
    pub fn save_embedding<A: Write, B: Write>(
        &self,
        words: &mut A,
        contexts: &mut B,
        mode: BiasMode,
    ) -> Result<()> {
        let (features, constant) = match mode {
            BiasMode::Persist => (self.k, true),
            _ => (self.free_rank(), false),
        };
        write_factor_lines(words, &self.w, features, constant)?;
        write_factor_lines(contexts, &self.h, features, constant)?;
        Ok(())
    }

    pub fn save_npy(&self, w_path: &Path, h_path: &Path) -> Result<()> {
        write_npy(w_path, &self.w)
            .map_err(|e| PmfError::Npy(format!("{}: {}", w_path.display(), e)))?;
        write_npy(h_path, &self.h)
            .map_err(|e| PmfError::Npy(format!("{}: {}", h_path.display(), e)))?;
        Ok(())
    }

    /// Load factors written by `save_npy`.
    pub fn load_npy(w_path: &Path, h_path: &Path, layout: Layout) -> Result<FactorModel> {
        let w: Array2<f64> =
            read_npy(w_path).map_err(|e| PmfError::Npy(format!("{}: {}", w_path.display(), e)))?;
        let h: Array2<f64> =
            read_npy(h_path).map_err(|e| PmfError::Npy(format!("{}: {}", h_path.display(), e)))?;
        if w.ncols() != h.ncols() {
            return Err(PmfError::ShapeMismatch(format!(
                "W has {} features but H has {}",
                w.ncols(),
                h.ncols()
            )));
        }
        let mut model = FactorModel::new(w.nrows(), h.nrows(), w.ncols(), layout);
        model.w.assign(&w);
        model.h.assign(&h);
        Ok(model)
    }
}

fn write_factor_lines<W: Write>(
    out: &mut W,
    factors: &Array2<f64>,
    features: usize,
    constant: bool,
) -> Result<()> {
    for row in factors.axis_iter(Axis(0)) {
        write_line(out, row, features, constant)?;
    }
    out.flush()?;
    Ok(())
}

fn write_line<W: Write>(
    out: &mut W,
    row: ArrayView1<f64>,
    features: usize,
    constant: bool,
) -> Result<()> {
    let mut line = row
        .iter()
        .take(features)
        .map(|x| format!("{:.6}", x))
        .collect::<Vec<_>>()
        .join(" ");
    if constant {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&format!("{:.6}", 1.0));
    }
    writeln!(out, "{}", line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::Entry;
    use ndarray::array;
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;

    fn small_model(layout: Layout) -> FactorModel {
        let mut model = FactorModel::new(3, 2, 2, layout);
        model.w.assign(&array![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]]);
        model.h.assign(&array![[3.0, 1.0], [0.5, -1.0]]);
        model
    }

    #[test]
    fn test_layouts_agree() {
        let row = small_model(Layout::RowMajor);
        let col = small_model(Layout::ColMajor);
        assert!(row.w.is_standard_layout());
        assert!(col.w.t().is_standard_layout());
        assert!(col.w.column(1).as_slice().is_some());
        for r in 0..3 {
            for c in 0..2 {
                assert_eq!(row.predict(r, c), col.predict(r, c));
            }
        }
        let converted = col.to_layout(Layout::RowMajor);
        assert_eq!(converted.w, row.w);
        assert_eq!(converted.layout(), Layout::RowMajor);
    }

    #[test]
    fn test_random_fill_keeps_layout() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = FactorModel::new(4, 5, 3, Layout::ColMajor);
        model.randomize_w(1.0, &mut rng);
        model.randomize_h(0.5, &mut rng);
        assert!(model.w.column(0).as_slice().is_some());
        assert!(model.w.iter().all(|&x| (0.0..1.0).contains(&x)));
        assert!(model.h.iter().all(|&x| (0.0..0.5).contains(&x)));
    }

    #[test]
    fn test_apply_permutation_restores_original_order() {
        let original = small_model(Layout::ColMajor);
        // a model trained on permuted data stores row r at perm[r]
        let row_perm = vec![2, 0, 1];
        let col_perm = vec![1, 0];
        let mut permuted = original.clone();
        let row_inv = vec![1, 2, 0];
        let col_inv = vec![1, 0];
        permuted.apply_permutation(&row_inv, &col_inv).unwrap();
        assert_eq!(permuted.w.row(row_perm[0]), original.w.row(0));

        permuted.apply_permutation(&row_perm, &col_perm).unwrap();
        assert_eq!(permuted.w, original.w);
        assert_eq!(permuted.h, original.h);
        assert!(permuted.apply_permutation(&[0, 1], &col_perm).is_err());
    }

    #[test]
    fn test_rmse() {
        let mut model = small_model(Layout::RowMajor);
        let m = SparseMatrix::from_triplets(
            3,
            2,
            vec![Entry::new(0, 0, 4.0), Entry::new(1, 1, -1.0)],
        )
        .unwrap();
        assert_eq!(model.rmse(&m), 1.0);
        model.global_bias = 1.0;
        assert_eq!(model.predict(0, 0), 4.0);
    }

    #[test]
    fn test_save_embedding_modes() {
        let mut model = FactorModel::new(1, 1, 3, Layout::RowMajor);
        model.w.assign(&array![[0.5, 0.25, 1.0]]);
        model.h.assign(&array![[2.0, 1.0, 0.75]]);

        let (mut words, mut contexts) = (Vec::new(), Vec::new());
        model
            .save_embedding(&mut words, &mut contexts, BiasMode::None)
            .unwrap();
        assert_eq!(
            String::from_utf8(words).unwrap(),
            "0.500000 0.250000 1.000000\n"
        );

        model.set_bias_features(true);
        let (mut words, mut contexts) = (Vec::new(), Vec::new());
        model
            .save_embedding(&mut words, &mut contexts, BiasMode::ComputeOnly)
            .unwrap();
        assert_eq!(String::from_utf8(words).unwrap(), "0.500000\n");
        assert_eq!(String::from_utf8(contexts).unwrap(), "2.000000\n");

        let (mut words, mut contexts) = (Vec::new(), Vec::new());
        model
            .save_embedding(&mut words, &mut contexts, BiasMode::Persist)
            .unwrap();
        assert_eq!(
            String::from_utf8(words).unwrap(),
            "0.500000 0.250000 1.000000 1.000000\n"
        );
        assert_eq!(
            String::from_utf8(contexts).unwrap(),
            "2.000000 1.000000 0.750000 1.000000\n"
        );
    }

    #[test]
    fn test_npy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let model = small_model(Layout::ColMajor);
        let w_path = dir.path().join("m.W.npy");
        let h_path = dir.path().join("m.H.npy");
        model.save_npy(&w_path, &h_path).unwrap();
        let loaded = FactorModel::load_npy(&w_path, &h_path, Layout::RowMajor).unwrap();
        assert_eq!(loaded.w, model.w);
        assert_eq!(loaded.h, model.h);
        assert_eq!(loaded.k(), 2);
    }
}

//! Sparse matrix with dual compressed storage.
//!
//! Every nonzero is stored twice: once in row-major order (CSR) and once in
//! column-major order (CSC). Coordinate descent and ALS need "all entries of row r"
//! in one phase and "all entries of column c" in the next; keeping both orderings
//! makes either access a contiguous slice. All mutations update both copies.

/**
 * File: /src/sparse.rs
 * Created Date: Thursday November 23rd 2023
 * Author: Zihan
 * -----
 * HISTORY:
 * Date      		By   	Comments
 * ----------		------	---------------------------------------------------------
 */

use ndarray::ArrayView1;
use rayon::prelude::*;

use crate::error::{PmfError, Result};
use crate::util::split_segments_mut;

/// One observed entry. `weight` defaults to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub row: usize,
    pub col: usize,
    pub value: f64,
    pub weight: f64,
}

impl Entry {
    pub fn new(row: usize, col: usize, value: f64) -> Self {
        Self {
            row,
            col,
            value,
            weight: 1.0,
        }
    }

    pub fn weighted(row: usize, col: usize, value: f64, weight: f64) -> Self {
        Self {
            row,
            col,
            value,
            weight,
        }
    }
}

/// Which compressed ordering to traverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Rows,
    Cols,
}

/// The entries of one row (or column): the other-side indices with their values
/// and weights, position-aligned.
#[derive(Debug, Clone, Copy)]
pub struct SparseVec<'a> {
    pub indices: &'a [usize],
    pub values: &'a [f64],
    pub weights: &'a [f64],
}

impl<'a> SparseVec<'a> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// `(index, value, weight)` triples
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64, f64)> + 'a {
        let indices = self.indices;
        let values = self.values;
        let weights = self.weights;
        indices
            .iter()
            .enumerate()
            .map(move |(pos, &idx)| (idx, values[pos], weights[pos]))
    }
}

#[derive(Debug, Clone)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    // row-major
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    val: Vec<f64>,
    weight: Vec<f64>,
    // column-major
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    val_t: Vec<f64>,
    weight_t: Vec<f64>,
}

impl SparseMatrix {
    /// A `rows x cols` matrix without entries.
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            row_ptr: vec![0; rows + 1],
            col_idx: Vec::new(),
            val: Vec::new(),
            weight: Vec::new(),
            col_ptr: vec![0; cols + 1],
            row_idx: Vec::new(),
            val_t: Vec::new(),
            weight_t: Vec::new(),
        }
    }

    /// Build both orderings from a stream of entries. Entries with equal
    /// coordinates are kept as separate nonzeros.
    pub fn from_triplets<I>(rows: usize, cols: usize, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = Entry>,
    {
        Self::from_entries(rows, cols, entries.into_iter().collect())
    }

    fn from_entries(rows: usize, cols: usize, mut entries: Vec<Entry>) -> Result<Self> {
        if let Some(bad) = entries.iter().find(|e| e.row >= rows || e.col >= cols) {
            return Err(PmfError::IndexOutOfRange {
                row: bad.row,
                col: bad.col,
                rows,
                cols,
            });
        }
        let nnz = entries.len();

        // stable sorts keep duplicates in input order in both views
        entries.par_sort_by_key(|e| (e.row, e.col));
        let mut row_ptr = vec![0usize; rows + 1];
        for e in &entries {
            row_ptr[e.row + 1] += 1;
        }
        for r in 0..rows {
            row_ptr[r + 1] += row_ptr[r];
        }
        let col_idx = entries.iter().map(|e| e.col).collect();
        let val = entries.iter().map(|e| e.value).collect();
        let weight = entries.iter().map(|e| e.weight).collect();

        entries.par_sort_by_key(|e| (e.col, e.row));
        let mut col_ptr = vec![0usize; cols + 1];
        for e in &entries {
            col_ptr[e.col + 1] += 1;
        }
        for c in 0..cols {
            col_ptr[c + 1] += col_ptr[c];
        }
        let row_idx = entries.iter().map(|e| e.row).collect();
        let val_t = entries.iter().map(|e| e.value).collect();
        let weight_t = entries.iter().map(|e| e.weight).collect();

        let matrix = Self {
            rows,
            cols,
            row_ptr,
            col_idx,
            val,
            weight,
            col_ptr,
            row_idx,
            val_t,
            weight_t,
        };
        matrix.check_consistency(nnz)?;
        Ok(matrix)
    }

    fn check_consistency(&self, nnz: usize) -> Result<()> {
        let by_rows = self.row_ptr[self.rows];
        let by_cols = self.col_ptr[self.cols];
        if by_rows != nnz || by_cols != nnz || self.val.len() != nnz || self.val_t.len() != nnz
        {
            return Err(PmfError::Format(format!(
                "row view holds {} entries, column view holds {}, expected {}",
                by_rows, by_cols, nnz
            )));
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.val.len()
    }

    pub fn row(&self, r: usize) -> SparseVec<'_> {
        let range = self.row_ptr[r]..self.row_ptr[r + 1];
        SparseVec {
            indices: &self.col_idx[range.clone()],
            values: &self.val[range.clone()],
            weights: &self.weight[range],
        }
    }

    pub fn col(&self, c: usize) -> SparseVec<'_> {
        let range = self.col_ptr[c]..self.col_ptr[c + 1];
        SparseVec {
            indices: &self.row_idx[range.clone()],
            values: &self.val_t[range.clone()],
            weights: &self.weight_t[range],
        }
    }

    pub fn line(&self, orientation: Orientation, i: usize) -> SparseVec<'_> {
        match orientation {
            Orientation::Rows => self.row(i),
            Orientation::Cols => self.col(i),
        }
    }

    /// Number of rows (or columns) for the given orientation.
    pub fn lines(&self, orientation: Orientation) -> usize {
        match orientation {
            Orientation::Rows => self.rows,
            Orientation::Cols => self.cols,
        }
    }

    pub fn row_nnz(&self, r: usize) -> usize {
        self.row_ptr[r + 1] - self.row_ptr[r]
    }

    pub fn col_nnz(&self, c: usize) -> usize {
        self.col_ptr[c + 1] - self.col_ptr[c]
    }

    /// Values in row-major order.
    pub fn values(&self) -> &[f64] {
        &self.val
    }

    /// Weights in row-major order.
    pub fn weights(&self) -> &[f64] {
        &self.weight
    }

    /// All entries in row-major order.
    pub fn triplets(&self) -> impl Iterator<Item = Entry> + '_ {
        (0..self.rows).flat_map(move |r| {
            self.row(r)
                .iter()
                .map(move |(c, value, weight)| Entry::weighted(r, c, value, weight))
        })
    }

    /// Relabel every entry `(r, c)` as `(row_perm[r], col_perm[c])` and rebuild
    /// both orderings. Values, weights and nnz are preserved.
    pub fn apply_permutation(&mut self, row_perm: &[usize], col_perm: &[usize]) -> Result<()> {
        check_bijection(row_perm, self.rows, "row")?;
        check_bijection(col_perm, self.cols, "column")?;
        let entries: Vec<Entry> = self
            .triplets()
            .map(|e| Entry::weighted(row_perm[e.row], col_perm[e.col], e.value, e.weight))
            .collect();
        *self = Self::from_entries(self.rows, self.cols, entries)?;
        Ok(())
    }

    /// `value(r, c) += scale * u[r] * v[c]` for every stored entry, in both views.
    ///
    /// Rows (then columns) are processed in parallel; each task owns the value
    /// segment of its row, so the writes are disjoint.
    pub fn add_rank_one(&mut self, u: ArrayView1<f64>, v: ArrayView1<f64>, scale: f64) {
        let col_idx = &self.col_idx;
        let row_ptr = &self.row_ptr;
        split_segments_mut(&mut self.val, row_ptr)
            .into_par_iter()
            .enumerate()
            .for_each(|(r, segment)| {
                let cols = &col_idx[row_ptr[r]..row_ptr[r + 1]];
                for (x, &c) in segment.iter_mut().zip(cols) {
                    *x += scale * u[r] * v[c];
                }
            });

        let row_idx = &self.row_idx;
        let col_ptr = &self.col_ptr;
        split_segments_mut(&mut self.val_t, col_ptr)
            .into_par_iter()
            .enumerate()
            .for_each(|(c, segment)| {
                let rows = &row_idx[col_ptr[c]..col_ptr[c + 1]];
                for (x, &r) in segment.iter_mut().zip(rows) {
                    *x += scale * u[r] * v[c];
                }
            });
    }

    /// Derive entry weights from a co-occurrence count matrix with the same
    /// sparsity pattern: `1` above `x_max`, `(count / x_max)^alpha` otherwise.
    pub fn apply_glove_weights(&mut self, counts: &SparseMatrix, x_max: f64, alpha: f64) -> Result<()> {
        if counts.rows != self.rows
            || counts.cols != self.cols
            || counts.row_ptr != self.row_ptr
            || counts.col_idx != self.col_idx
            || counts.col_ptr != self.col_ptr
        {
            return Err(PmfError::ShapeMismatch(format!(
                "count matrix ({}x{}, nnz {}) does not share the pattern of the {}x{} matrix with nnz {}",
                counts.rows,
                counts.cols,
                counts.nnz(),
                self.rows,
                self.cols,
                self.nnz()
            )));
        }
        self.weight
            .par_iter_mut()
            .zip(counts.val.par_iter())
            .for_each(|(w, &count)| *w = glove_weight(count, x_max, alpha));
        self.weight_t
            .par_iter_mut()
            .zip(counts.val_t.par_iter())
            .for_each(|(w, &count)| *w = glove_weight(count, x_max, alpha));
        Ok(())
    }

    pub fn global_mean(&self) -> f64 {
        if self.val.is_empty() {
            0.0
        } else {
            self.val.iter().sum::<f64>() / self.val.len() as f64
        }
    }

    /// Add `delta` to every stored value.
    pub fn shift_values(&mut self, delta: f64) {
        self.val.par_iter_mut().for_each(|x| *x += delta);
        self.val_t.par_iter_mut().for_each(|x| *x += delta);
    }
}

/// GloVe weighting function.
pub fn glove_weight(count: f64, x_max: f64, alpha: f64) -> f64 {
    if count > x_max {
        1.0
    } else {
        (count / x_max).powf(alpha)
    }
}

fn check_bijection(perm: &[usize], n: usize, what: &str) -> Result<()> {
    if perm.len() != n {
        return Err(PmfError::InvalidPermutation(format!(
            "{} permutation has length {}, expected {}",
            what,
            perm.len(),
            n
        )));
    }
    let mut seen = vec![false; n];
    for &p in perm {
        if p >= n || std::mem::replace(&mut seen[p], true) {
            return Err(PmfError::InvalidPermutation(format!(
                "{} permutation is not a bijection of [0, {})",
                what, n
            )));
        }
    }
    Ok(())
}

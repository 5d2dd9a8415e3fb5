//! `B x B` partition of a sparse matrix into row-range x column-range blocks.
//!
//! Blocks `(b, (b + s) mod B)` for `b in 0..B` share no row and no column, so one
//! stratum `s` can be processed fully in parallel without synchronizing on `W` or `H`.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::sparse::{Entry, SparseMatrix};

#[derive(Debug, Clone)]
pub struct BlockGrid {
    nr_blocks: usize,
    row_bounds: Vec<usize>,
    col_bounds: Vec<usize>,
    /// Row-block-major: block `(bi, bj)` at `bi * nr_blocks + bj`
    blocks: Vec<Vec<Entry>>,
}

/// `B + 1` boundaries splitting `[0, n)` into near-equal ranges.
pub fn block_bounds(n: usize, nr_blocks: usize) -> Vec<usize> {
    (0..=nr_blocks).map(|b| b * n / nr_blocks).collect()
}

/// Index of the range of `bounds` that contains `i`.
pub fn block_of(bounds: &[usize], i: usize) -> usize {
    bounds.partition_point(|&x| x <= i) - 1
}

impl BlockGrid {
    /// Distribute the entries of `m` over the grid. Entries inside a block are
    /// shuffled once so that an epoch does not walk a row in index order.
    pub fn new<R: Rng + ?Sized>(m: &SparseMatrix, nr_blocks: usize, rng: &mut R) -> Self {
        let nr_blocks = nr_blocks.max(1);
        let row_bounds = block_bounds(m.rows(), nr_blocks);
        let col_bounds = block_bounds(m.cols(), nr_blocks);
        let mut blocks = vec![Vec::new(); nr_blocks * nr_blocks];
        for entry in m.triplets() {
            let bi = block_of(&row_bounds, entry.row);
            let bj = block_of(&col_bounds, entry.col);
            blocks[bi * nr_blocks + bj].push(entry);
        }
        for block in blocks.iter_mut() {
            block.shuffle(rng);
        }
        Self {
            nr_blocks,
            row_bounds,
            col_bounds,
            blocks,
        }
    }

    pub fn nr_blocks(&self) -> usize {
        self.nr_blocks
    }

    pub fn row_bounds(&self) -> &[usize] {
        &self.row_bounds
    }

    pub fn col_bounds(&self) -> &[usize] {
        &self.col_bounds
    }

    pub fn block(&self, bi: usize, bj: usize) -> &[Entry] {
        &self.blocks[bi * self.nr_blocks + bj]
    }

    pub fn nnz(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// `(row block, column block)` pairs of stratum `s`.
    pub fn stratum(&self, s: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.nr_blocks).map(move |b| (b, (b + s) % self.nr_blocks))
    }
}

//! Random relabeling of row/column indices used to balance per-thread work.
//!
//! Real co-occurrence and rating matrices are skewed: a handful of rows or columns
//! carry most of the nonzeros. Scrambling the index order before the solvers split
//! index ranges across threads evens out the nonzero count per range.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{PmfError, Result};

/// A bijection of `[0, n)` together with its inverse.
///
/// `perm[inverse[i]] == i` and `inverse[perm[i]] == i` for every `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermutationPair {
    perm: Vec<usize>,
    inverse: Vec<usize>,
}

impl PermutationPair {
    /// Uniformly random permutation (Fisher–Yates) and its inverse.
    pub fn generate<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Self {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(rng);
        let inverse = invert(&perm);
        Self { perm, inverse }
    }

    pub fn identity(n: usize) -> Self {
        let perm: Vec<usize> = (0..n).collect();
        Self {
            inverse: perm.clone(),
            perm,
        }
    }

    /// Wrap a caller-provided permutation, checking that it is a bijection.
    pub fn from_perm(perm: Vec<usize>) -> Result<Self> {
        let n = perm.len();
        let mut seen = vec![false; n];
        for &p in &perm {
            if p >= n {
                return Err(PmfError::InvalidPermutation(format!(
                    "index {} out of range for length {}",
                    p, n
                )));
            }
            if std::mem::replace(&mut seen[p], true) {
                return Err(PmfError::InvalidPermutation(format!(
                    "index {} appears twice",
                    p
                )));
            }
        }
        let inverse = invert(&perm);
        Ok(Self { perm, inverse })
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    /// `perm[old] = new`
    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    /// `inverse[new] = old`
    pub fn inverse(&self) -> &[usize] {
        &self.inverse
    }

    /// The pair with both directions swapped.
    pub fn inverted(&self) -> Self {
        Self {
            perm: self.inverse.clone(),
            inverse: self.perm.clone(),
        }
    }
}

fn invert(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

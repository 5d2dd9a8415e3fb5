//! Alternating least squares.
//!
//! With `H` fixed, each row of `W` is the solution of a `k x k` ridge system built
//! from the row's observed entries; then the roles swap. Each solve reads only the
//! fixed side, so a half-sweep is one parallel pass over the rows of the updated side.

extern crate nalgebra as na;

use log::warn;
use na::{DMatrix, DVector};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use rayon::prelude::*;

use super::{gram, Progress, Solver, TrainingMonitor, TrainingReport};
use crate::config::TrainingParameters;
use crate::error::Result;
use crate::model::{FactorModel, Layout};
use crate::sparse::{Orientation, SparseMatrix, SparseVec};
use crate::util::clone_to_dmatrix;

pub struct AlsSolver {
    params: TrainingParameters,
    positive_unlabeled: bool,
}

/// Solve `a x = b`, Cholesky first and LU when `a` is not positive definite.
fn solve_spd(a: DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    if let Some(chol) = a.clone().cholesky() {
        let x = chol.solve(b);
        if x.iter().all(|v| v.is_finite()) {
            return Some(x);
        }
    }
    a.lu().solve(b).filter(|x| x.iter().all(|v| v.is_finite()))
}

impl AlsSolver {
    pub fn new(params: TrainingParameters, positive_unlabeled: bool) -> Self {
        Self {
            params,
            positive_unlabeled,
        }
    }

    fn rho(&self) -> Option<f64> {
        self.positive_unlabeled.then_some(self.params.rho)
    }

    /// Normal equations of line `i`: `(Σ weight·f fᵗ + λI) x = Σ weight·r·f`, with
    /// the PU correction `Σ (weight − ρ) f fᵗ + ρ FᵗF` when `gram` is given.
    fn normal_equations(
        &self,
        line: SparseVec<'_>,
        fixed: ArrayView2<f64>,
        gram: Option<&DMatrix<f64>>,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let k = fixed.ncols();
        let rho = self.rho().unwrap_or(0.0);
        let mut a = match gram {
            Some(g) => g.scale(rho),
            None => DMatrix::zeros(k, k),
        };
        for d in 0..k {
            a[(d, d)] += self.params.lambda;
        }
        let mut b = DVector::zeros(k);
        for (j, value, weight) in line.iter() {
            let f: ArrayView1<f64> = fixed.row(j);
            let coeff = if gram.is_some() { weight - rho } else { weight };
            for p in 0..k {
                b[p] += weight * value * f[p];
                for q in 0..k {
                    a[(p, q)] += coeff * f[p] * f[q];
                }
            }
        }
        (a, b)
    }

    /// Recompute every row of `own` from `fixed`. Returns the number of rows whose
    /// system could not be solved and were reset to zero.
    fn solve_side(
        &self,
        m: &SparseMatrix,
        orientation: Orientation,
        fixed: ArrayView2<f64>,
        own: &mut Array2<f64>,
    ) -> usize {
        let gram = self
            .positive_unlabeled
            .then(|| clone_to_dmatrix(gram(fixed).view()));
        let nmf = self.params.do_nmf;

        own.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(i, mut row)| {
                let (a, b) = self.normal_equations(m.line(orientation, i), fixed, gram.as_ref());
                match solve_spd(a, &b) {
                    Some(x) => {
                        for (dst, &v) in row.iter_mut().zip(x.iter()) {
                            *dst = if nmf && v < 0.0 { 0.0 } else { v };
                        }
                        0
                    }
                    None => {
                        row.fill(0.0);
                        1
                    }
                }
            })
            .sum()
    }
}

impl Solver for AlsSolver {
    fn name(&self) -> &'static str {
        if self.positive_unlabeled {
            "PU-ALS"
        } else {
            "ALS"
        }
    }

    fn layout(&self) -> Layout {
        Layout::RowMajor
    }

    fn initialize(&self, model: &mut FactorModel, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        model.randomize_h(1.0, &mut rng);
        model.w.fill(0.0);
    }

    fn fit(
        &self,
        train: &SparseMatrix,
        test: &SparseMatrix,
        model: &mut FactorModel,
        monitor: &mut dyn TrainingMonitor,
    ) -> Result<TrainingReport> {
        let mut progress = Progress::new(self.name(), &self.params, train, test, self.rho());
        for iter in 1..=self.params.maxiter {
            let failed_w = self.solve_side(train, Orientation::Rows, model.h.view(), &mut model.w);
            let failed_h = self.solve_side(train, Orientation::Cols, model.w.view(), &mut model.h);
            if failed_w + failed_h > 0 {
                warn!(
                    "[{}] iter {}: {} singular systems reset to zero",
                    self.name(),
                    iter,
                    failed_w + failed_h
                );
            }
            progress.record(iter, model, 0, model.k(), None, monitor)?;
        }
        Ok(progress.finish(model.k()))
    }
}

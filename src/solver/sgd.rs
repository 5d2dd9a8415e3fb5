//! Stratified block stochastic gradient descent.
//!
//! An epoch walks the `B` strata of a [`BlockGrid`] in a random order. The blocks
//! of one stratum touch disjoint row ranges of `W` and disjoint row ranges of `H`,
//! so each block gets its own `&mut` slices and runs plain sequential SGD on them.

extern crate nalgebra as na;

use log::{debug, warn};
use na::DMatrix;
use ndarray::Array2;
use ndarray_rand::rand::rngs::StdRng as InitRng;
use ndarray_rand::rand::SeedableRng as _;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use super::{gram, objective, Progress, Solver, TrainingMonitor, TrainingReport};
use crate::blocks::BlockGrid;
use crate::config::{LrateMethod, PuType, TrainingParameters};
use crate::error::{PmfError, Result};
use crate::model::{FactorModel, Layout};
use crate::sparse::{Entry, SparseMatrix};
use crate::util::{clone_to_dmatrix, dmatrix_to_array, dot, split_rows_mut};

/// Bisection steps of the PU6 line search
const BISECTION_STEPS: usize = 20;

pub struct SgdSolver {
    params: TrainingParameters,
    pu: Option<PuType>,
}

/// PU state refreshed once per epoch: `ρ` and the flattened `WᵗW` / `HᵗH`.
struct PuEpoch<'a> {
    rho: f64,
    gram_w: Vec<f64>,
    gram_h: Vec<f64>,
    train: &'a SparseMatrix,
}

/// Per-block buffers for the PU6 line search
struct Scratch {
    dw: Vec<f64>,
    dh: Vec<f64>,
    tw: Vec<f64>,
    th: Vec<f64>,
    gw: Vec<f64>,
    gh: Vec<f64>,
}

impl Scratch {
    fn new(k: usize) -> Self {
        Self {
            dw: vec![0.0; k],
            dh: vec![0.0; k],
            tw: vec![0.0; k],
            th: vec![0.0; k],
            gw: vec![0.0; k],
            gh: vec![0.0; k],
        }
    }
}

impl SgdSolver {
    pub fn new(params: TrainingParameters, pu: Option<PuType>) -> Self {
        Self { params, pu }
    }

    fn rho(&self) -> Option<f64> {
        self.pu.map(|_| self.params.rho)
    }

    fn next_learning_rate(&self, lr: f64, epoch: usize, improved: bool) -> f64 {
        match self.params.lrate_method {
            LrateMethod::BoldDriver if improved => lr * self.params.betaup,
            LrateMethod::BoldDriver => lr * self.params.betadown,
            LrateMethod::InverseScaling => {
                self.params.eta0 / (1.0 + self.params.betadown * epoch as f64)
            }
        }
    }

    /// Plain SGD step on one entry.
    fn plain_step(&self, e: &Entry, w: &mut [f64], h: &mut [f64], lr: f64) {
        let lambda = self.params.lambda;
        let err = e.value - dot(w, h);
        for d in 0..w.len() {
            let (wd, hd) = (w[d], h[d]);
            w[d] += lr * (e.weight * err * hd - lambda * wd);
            h[d] += lr * (e.weight * err * wd - lambda * hd);
        }
    }

    /// PU2 entry step on `weight(r − p)² − ρp²`. The `ρ Σ p²` and `λ` terms are
    /// handled by the proximal step at the end of the epoch.
    fn reformulated_step(&self, e: &Entry, w: &mut [f64], h: &mut [f64], lr: f64, rho: f64) {
        let p = dot(w, h);
        let coeff = e.weight * (e.value - p) + rho * p;
        for d in 0..w.len() {
            let (wd, hd) = (w[d], h[d]);
            w[d] += lr * coeff * hd;
            h[d] += lr * coeff * wd;
        }
    }

    /// Negative half-gradient of the entry-local PU objective
    ///
    /// `weight(r − p)² − ρp² + (ρ wᵗ(HᵗH)w + λ|w|²)/n_i + (ρ hᵗ(WᵗW)h + λ|h|²)/n_j`
    ///
    /// where `n_i` / `n_j` are the observed counts of the entry's row and column.
    #[allow(clippy::too_many_arguments)]
    fn pu_direction(
        &self,
        e: &Entry,
        w: &[f64],
        h: &[f64],
        pu: &PuEpoch<'_>,
        shares: (f64, f64),
        out_w: &mut [f64],
        out_h: &mut [f64],
    ) {
        let k = w.len();
        let lambda = self.params.lambda;
        let p = dot(w, h);
        let coeff = e.weight * (e.value - p) + pu.rho * p;
        for d in 0..k {
            let gw = pu.rho * dot(&pu.gram_h[d * k..(d + 1) * k], w) + lambda * w[d];
            let gh = pu.rho * dot(&pu.gram_w[d * k..(d + 1) * k], h) + lambda * h[d];
            out_w[d] = coeff * h[d] - gw / shares.0;
            out_h[d] = coeff * w[d] - gh / shares.1;
        }
    }

    /// Sign-carrying slope of the local objective at `(w, h) + eta·(dw, dh)`;
    /// positive once the objective starts increasing along the direction.
    #[allow(clippy::too_many_arguments)]
    fn slope(
        &self,
        eta: f64,
        e: &Entry,
        w: &[f64],
        h: &[f64],
        pu: &PuEpoch<'_>,
        shares: (f64, f64),
        scratch: &mut Scratch,
    ) -> f64 {
        let Scratch {
            dw,
            dh,
            tw,
            th,
            gw,
            gh,
        } = scratch;
        for d in 0..w.len() {
            tw[d] = w[d] + eta * dw[d];
            th[d] = h[d] + eta * dh[d];
        }
        self.pu_direction(e, tw, th, pu, shares, gw, gh);
        -(dot(gw, dw) + dot(gh, dh))
    }

    /// PU6 entry step: move along the local PU descent direction by the step in
    /// `[0, lr]` found by bisection on the directional derivative.
    fn line_search_step(
        &self,
        e: &Entry,
        w: &mut [f64],
        h: &mut [f64],
        lr: f64,
        pu: &PuEpoch<'_>,
        scratch: &mut Scratch,
    ) {
        let shares = (
            pu.train.row_nnz(e.row).max(1) as f64,
            pu.train.col_nnz(e.col).max(1) as f64,
        );
        {
            let Scratch { dw, dh, .. } = &mut *scratch;
            self.pu_direction(e, w, h, pu, shares, dw, dh);
        }

        let eta = if self.slope(lr, e, w, h, pu, shares, scratch) <= 0.0 {
            lr
        } else {
            let (mut lo, mut hi) = (0.0, lr);
            for _ in 0..BISECTION_STEPS {
                let mid = 0.5 * (lo + hi);
                if self.slope(mid, e, w, h, pu, shares, scratch) > 0.0 {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            lo
        };
        for d in 0..w.len() {
            w[d] += eta * scratch.dw[d];
            h[d] += eta * scratch.dh[d];
        }
    }

    /// Process the `B` blocks of stratum `s` in parallel.
    fn run_stratum(
        &self,
        grid: &BlockGrid,
        s: usize,
        model: &mut FactorModel,
        lr: f64,
        pu: Option<&PuEpoch<'_>>,
    ) -> Result<()> {
        let k = model.k();
        let nr_blocks = grid.nr_blocks();
        let w = model
            .w
            .as_slice_mut()
            .ok_or(PmfError::Layout {
                layout: Layout::ColMajor,
                solver: "SGD",
            })?;
        let h = model
            .h
            .as_slice_mut()
            .ok_or(PmfError::Layout {
                layout: Layout::ColMajor,
                solver: "SGD",
            })?;
        let w_parts = split_rows_mut(w, grid.row_bounds(), k);
        let mut h_parts = split_rows_mut(h, grid.col_bounds(), k);
        // after rotation h_parts[b] is column block (b + s) mod B
        h_parts.rotate_left(s % nr_blocks);

        let pairs: Vec<(usize, usize)> = grid.stratum(s).collect();

        w_parts
            .into_par_iter()
            .zip(h_parts.into_par_iter())
            .zip(pairs.into_par_iter())
            .for_each(|((w_part, h_part), (bi, bj))| {
                let row0 = grid.row_bounds()[bi];
                let col0 = grid.col_bounds()[bj];
                let mut scratch = Scratch::new(k);
                for e in grid.block(bi, bj) {
                    let r = (e.row - row0) * k;
                    let c = (e.col - col0) * k;
                    let wi = &mut w_part[r..r + k];
                    let hj = &mut h_part[c..c + k];
                    match (self.pu, pu) {
                        (Some(PuType::Reformulation), Some(pu)) => {
                            self.reformulated_step(e, wi, hj, lr, pu.rho)
                        }
                        (Some(PuType::BinarySearch), Some(pu)) => {
                            self.line_search_step(e, wi, hj, lr, pu, &mut scratch)
                        }
                        _ => self.plain_step(e, wi, hj, lr),
                    }
                }
            });
        Ok(())
    }

    /// Closed-form proximal step of the PU2 reformulation:
    /// `W ← W (I + lr(ρHᵗH + λI))⁻¹`, then the same for `H` with the new `W`.
    fn proximal_step(&self, model: &mut FactorModel, lr: f64, rho: f64) {
        let lambda = self.params.lambda;
        let shrink = |other: &Array2<f64>| -> Option<Array2<f64>> {
            let k = other.ncols();
            let g = clone_to_dmatrix(gram(other.view()).view());
            let a = DMatrix::identity(k, k) + (g * rho + DMatrix::identity(k, k) * lambda) * lr;
            a.try_inverse().map(|inv| dmatrix_to_array(&inv))
        };
        match shrink(&model.h) {
            Some(m) => {
                let updated = model.w.dot(&m);
                model.w.assign(&updated);
            }
            None => warn!("[PU-SGD] proximal system for W is singular, step skipped"),
        }
        match shrink(&model.w) {
            Some(m) => {
                let updated = model.h.dot(&m);
                model.h.assign(&updated);
            }
            None => warn!("[PU-SGD] proximal system for H is singular, step skipped"),
        }
    }

    fn pu_epoch<'a>(&self, train: &'a SparseMatrix, model: &FactorModel) -> Option<PuEpoch<'a>> {
        self.rho().map(|rho| PuEpoch {
            rho,
            gram_w: gram(model.w.view()).iter().copied().collect(),
            gram_h: gram(model.h.view()).iter().copied().collect(),
            train,
        })
    }
}

impl Solver for SgdSolver {
    fn name(&self) -> &'static str {
        match self.pu {
            Some(_) => "PU-SGD",
            None => "SGD",
        }
    }

    fn layout(&self) -> Layout {
        Layout::RowMajor
    }

    fn initialize(&self, model: &mut FactorModel, seed: u64) {
        let mut rng = InitRng::seed_from_u64(seed);
        let scale = 1.0 / (model.k().max(1) as f64).sqrt();
        model.randomize_w(scale, &mut rng);
        model.randomize_h(scale, &mut rng);
    }

    fn fit(
        &self,
        train: &SparseMatrix,
        test: &SparseMatrix,
        model: &mut FactorModel,
        monitor: &mut dyn TrainingMonitor,
    ) -> Result<TrainingReport> {
        let original_layout = model.layout();
        let standard = model.w.is_standard_layout() && model.h.is_standard_layout();
        if !standard {
            *model = model.to_layout(Layout::RowMajor);
        }

        let rho = self.rho();
        let mut progress = Progress::new(self.name(), &self.params, train, test, rho);
        let mut rng = StdRng::seed_from_u64(self.params.seed.unwrap_or_default());
        let grid = BlockGrid::new(train, self.params.blocks(), &mut rng);
        debug!(
            "[{}] {} x {} block grid over {} entries",
            self.name(),
            grid.nr_blocks(),
            grid.nr_blocks(),
            grid.nnz()
        );

        let mut lr = self.params.eta0;
        let mut previous = objective(train, model, self.params.lambda, rho);
        let mut strata: Vec<usize> = (0..grid.nr_blocks()).collect();
        for epoch in 1..=self.params.maxiter {
            strata.shuffle(&mut rng);
            let pu = self.pu_epoch(train, model);
            for &s in &strata {
                self.run_stratum(&grid, s, model, lr, pu.as_ref())?;
            }
            if let (Some(PuType::Reformulation), Some(rho)) = (self.pu, rho) {
                self.proximal_step(model, lr, rho);
            }

            let current = progress.record(epoch, model, 0, model.k(), Some(lr), monitor)?;
            let next = self.next_learning_rate(lr, epoch, current < previous);
            debug!("[{}] learning rate {:.3e} -> {:.3e}", self.name(), lr, next);
            lr = next;
            previous = current;
        }

        if !standard {
            *model = model.to_layout(original_layout);
        }
        Ok(progress.finish(model.k()))
    }
}

//! Rank-one cyclic coordinate descent (CCDR1).
//!
//! The model is refined one latent feature `t` at a time. The contribution of
//! `W[:,t]·H[:,t]ᵗ` is added back into the residual, the pair is re-fitted by a few
//! alternating closed-form sweeps, and the result is subtracted again. Every index
//! of a sweep solves a one-dimensional problem that only reads the residual and the
//! fixed side, so the sweeps are embarrassingly parallel.

use log::debug;
use ndarray::{Array1, ArrayView2};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use rayon::prelude::*;

use super::{centered_rmse, gram_row, Progress, Solver, TrainingMonitor, TrainingReport};
use crate::config::TrainingParameters;
use crate::error::Result;
use crate::model::{FactorModel, Layout};
use crate::sparse::{Orientation, SparseMatrix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcdVariant {
    Standard,
    /// Grow the number of active features while the held-out error improves
    AdaptiveRank,
    /// Penalize predictions on unobserved entries with weight `rho`
    PositiveUnlabeled,
}

pub struct Ccdr1Solver {
    params: TrainingParameters,
    variant: CcdVariant,
}

impl Ccdr1Solver {
    pub fn new(params: TrainingParameters, variant: CcdVariant) -> Self {
        Self { params, variant }
    }

    fn rho(&self) -> Option<f64> {
        (self.variant == CcdVariant::PositiveUnlabeled).then_some(self.params.rho)
    }

    /// Which of `W[:,t]` / `H[:,t]` may change. The reserved bias pair keeps its
    /// constant side fixed.
    fn free_sides(model: &FactorModel, t: usize) -> (bool, bool) {
        let k = model.k();
        if model.bias_features() && t + 2 == k {
            (true, false)
        } else if model.bias_features() && t + 1 == k {
            (false, true)
        } else {
            (true, true)
        }
    }

    /// Closed-form update of column `t` of `own` for every line of `orientation`,
    /// with column `t` of `fixed` held constant. Returns the new column and the
    /// summed objective decrease.
    fn solve_side(
        &self,
        orientation: Orientation,
        residual: &SparseMatrix,
        train: &SparseMatrix,
        fixed: ArrayView2<f64>,
        own: ArrayView2<f64>,
        t: usize,
    ) -> (Array1<f64>, f64) {
        let lambda = self.params.lambda;
        let nmf = self.params.do_nmf;
        let rho = self.rho();
        let u = fixed.column(t);
        let gram = rho.map(|_| gram_row(fixed, t));

        let updates: Vec<(f64, f64)> = (0..residual.lines(orientation))
            .into_par_iter()
            .map(|i| {
                let line = residual.line(orientation, i);
                let mut hh = lambda;
                let mut g = 0.0;
                match (rho, &gram) {
                    (Some(rho), Some(gram)) => {
                        // q = R - residual is the prediction of the other features
                        let original = train.line(orientation, i).values;
                        for ((j, res, weight), &r) in line.iter().zip(original) {
                            let uj = u[j];
                            hh += (weight - rho) * uj * uj;
                            g += weight * res * uj + rho * (r - res) * uj;
                        }
                        hh += rho * gram[t];
                        let cross: f64 = own
                            .row(i)
                            .iter()
                            .zip(gram.iter())
                            .enumerate()
                            .filter(|(s, _)| *s != t)
                            .map(|(_, (x, gs))| x * gs)
                            .sum();
                        g -= rho * cross;
                    }
                    _ => {
                        for (j, res, weight) in line.iter() {
                            let uj = u[j];
                            hh += weight * uj * uj;
                            g += weight * res * uj;
                        }
                    }
                }
                if hh <= 0.0 {
                    return (0.0, 0.0);
                }
                let cur = own[[i, t]];
                let mut new = g / hh;
                if nmf && new < 0.0 {
                    new = 0.0;
                }
                // f(x) = hh x² - 2 g x
                let decrease = ((cur - new) * (hh * (cur + new) - 2.0 * g)).max(0.0);
                (new, decrease)
            })
            .collect();

        let decrease = updates.iter().map(|&(_, d)| d).sum();
        let column = updates.into_iter().map(|(x, _)| x).collect();
        (column, decrease)
    }

    /// Re-fit feature `t` against the residual. Returns the number of sweeps run.
    fn update_feature(
        &self,
        t: usize,
        train: &SparseMatrix,
        residual: &mut SparseMatrix,
        model: &mut FactorModel,
    ) -> usize {
        let (update_w, update_h) = Self::free_sides(model, t);
        residual.add_rank_one(model.w.column(t), model.h.column(t), 1.0);

        let mut first_decrease = None;
        let mut sweeps = 0;
        for _ in 0..self.params.maxinneriter {
            let mut decrease = 0.0;
            if update_h {
                let (column, d) = self.solve_side(
                    Orientation::Cols,
                    residual,
                    train,
                    model.w.view(),
                    model.h.view(),
                    t,
                );
                model.h.column_mut(t).assign(&column);
                decrease += d;
            }
            if update_w {
                let (column, d) = self.solve_side(
                    Orientation::Rows,
                    residual,
                    train,
                    model.h.view(),
                    model.w.view(),
                    t,
                );
                model.w.column_mut(t).assign(&column);
                decrease += d;
            }
            sweeps += 1;
            match first_decrease {
                None => first_decrease = Some(decrease),
                Some(first) if decrease < self.params.eps * first => break,
                Some(_) => {}
            }
        }

        residual.add_rank_one(model.w.column(t), model.h.column(t), -1.0);
        debug!("feature {}: {} sweeps", t, sweeps);
        sweeps
    }

    /// Remove feature `t` from the model, restoring its share of the residual.
    fn drop_feature(t: usize, residual: &mut SparseMatrix, model: &mut FactorModel) {
        residual.add_rank_one(model.w.column(t), model.h.column(t), 1.0);
        model.w.column_mut(t).fill(0.0);
        model.h.column_mut(t).fill(0.0);
    }

    fn fit_fixed_rank(
        &self,
        train: &SparseMatrix,
        residual: &mut SparseMatrix,
        model: &mut FactorModel,
        progress: &mut Progress<'_>,
        monitor: &mut dyn TrainingMonitor,
    ) -> Result<usize> {
        for iter in 1..=self.params.maxiter {
            let mut sweeps = 0;
            for t in 0..model.k() {
                sweeps += self.update_feature(t, train, residual, model);
            }
            progress.record(iter, model, sweeps, model.free_rank(), None, monitor)?;
        }
        Ok(model.free_rank())
    }

    fn fit_adaptive(
        &self,
        train: &SparseMatrix,
        test: &SparseMatrix,
        residual: &mut SparseMatrix,
        model: &mut FactorModel,
        progress: &mut Progress<'_>,
        monitor: &mut dyn TrainingMonitor,
    ) -> Result<usize> {
        let free = model.free_rank();
        let held_out = if test.nnz() > 0 { test } else { train };
        let mut active = free.min(1);
        let mut last_added: Option<usize> = None;
        let mut frozen = false;
        let mut best = f64::INFINITY;
        let mut rank = active;

        for iter in 1..=self.params.maxiter {
            let mut sweeps = 0;
            for t in (0..active).chain(free..model.k()) {
                sweeps += self.update_feature(t, train, residual, model);
            }

            let trained = active;
            if !frozen {
                let err = centered_rmse(model, held_out);
                if err < best {
                    best = err;
                    // the feature added last pass is now validated
                    last_added = None;
                    if active < free {
                        last_added = Some(active);
                        active += 1;
                    }
                } else {
                    if let Some(t) = last_added.take() {
                        Self::drop_feature(t, residual, model);
                        active -= 1;
                    }
                    frozen = true;
                    debug!("rank frozen at {} (held-out rmse {:.6})", active, best);
                }
            }
            // a feature grown this pass has not been trained yet
            rank = trained.min(active);
            progress.record(iter, model, sweeps, rank, None, monitor)?;
        }

        // features never trained keep their random W; clear them
        for t in rank..free {
            model.w.column_mut(t).fill(0.0);
            model.h.column_mut(t).fill(0.0);
        }
        Ok(rank)
    }
}

impl Solver for Ccdr1Solver {
    fn name(&self) -> &'static str {
        match self.variant {
            CcdVariant::Standard => "CCDR1",
            CcdVariant::AdaptiveRank => "CCDR1-adaptive",
            CcdVariant::PositiveUnlabeled => "PU-CCDR1",
        }
    }

    fn layout(&self) -> Layout {
        Layout::ColMajor
    }

    fn initialize(&self, model: &mut FactorModel, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        model.randomize_w(1.0, &mut rng);
        model.h.fill(0.0);
        if model.bias_features() {
            let k = model.k();
            model.w.column_mut(k - 2).fill(0.0);
            model.h.column_mut(k - 2).fill(1.0);
            model.w.column_mut(k - 1).fill(1.0);
        }
    }

    fn fit(
        &self,
        train: &SparseMatrix,
        test: &SparseMatrix,
        model: &mut FactorModel,
        monitor: &mut dyn TrainingMonitor,
    ) -> Result<TrainingReport> {
        let mut progress = Progress::new(self.name(), &self.params, train, test, self.rho());

        let mut residual = train.clone();
        for t in 0..model.k() {
            let active = model.w.column(t).iter().any(|&x| x != 0.0)
                && model.h.column(t).iter().any(|&x| x != 0.0);
            if active {
                residual.add_rank_one(model.w.column(t), model.h.column(t), -1.0);
            }
        }

        let final_rank = match self.variant {
            CcdVariant::AdaptiveRank => {
                self.fit_adaptive(train, test, &mut residual, model, &mut progress, monitor)?
            }
            _ => self.fit_fixed_rank(train, &mut residual, model, &mut progress, monitor)?,
        };
        Ok(progress.finish(final_rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::NoopMonitor;
    use crate::sparse::Entry;

    fn params(k: usize) -> TrainingParameters {
        TrainingParameters {
            k,
            lambda: 0.01,
            ..Default::default()
        }
    }

    /// Rank-2 values on a checkerboard pattern of a 12 x 10 matrix
    fn checkerboard() -> SparseMatrix {
        let mut entries = Vec::new();
        for r in 0..12 {
            for c in 0..10 {
                if (r + c) % 2 == 0 {
                    let value = (r % 3 + 1) as f64 * (c % 4 + 1) as f64 * 0.25
                        + (r % 2) as f64 * (c % 3) as f64;
                    entries.push(Entry::new(r, c, value));
                }
            }
        }
        SparseMatrix::from_triplets(12, 10, entries).unwrap()
    }

    fn run(
        params: TrainingParameters,
        variant: CcdVariant,
        train: &SparseMatrix,
        bias: bool,
    ) -> (FactorModel, TrainingReport) {
        let solver = Ccdr1Solver::new(params.clone(), variant);
        let mut model = FactorModel::new(
            train.rows(),
            train.cols(),
            params.effective_rank(),
            solver.layout(),
        );
        model.set_bias_features(bias);
        solver.initialize(&mut model, 42);
        let test = SparseMatrix::empty(train.rows(), train.cols());
        let report = solver
            .fit(train, &test, &mut model, &mut NoopMonitor)
            .unwrap();
        (model, report)
    }

    #[test]
    fn test_zero_eps_runs_every_inner_sweep() {
        let mut p = params(3);
        p.eps = 0.0;
        p.maxinneriter = 4;
        let (_, report) = run(p, CcdVariant::Standard, &checkerboard(), false);
        assert_eq!(report.iterations(), 5);
        for stats in &report.history {
            assert_eq!(stats.inner_sweeps, 3 * 4);
        }
    }

    #[test]
    fn test_inner_sweeps_never_exceed_limit() {
        let mut p = params(4);
        p.eps = 0.5;
        p.maxinneriter = 6;
        let (_, report) = run(p, CcdVariant::Standard, &checkerboard(), false);
        for stats in &report.history {
            assert!(stats.inner_sweeps <= 4 * 6);
            assert!(stats.inner_sweeps >= 4);
        }
    }

    #[test]
    fn test_diagonal_reconstruction() {
        let train = SparseMatrix::from_triplets(
            3,
            3,
            vec![
                Entry::new(0, 0, 5.0),
                Entry::new(1, 1, 3.0),
                Entry::new(2, 2, 4.0),
            ],
        )
        .unwrap();
        let mut p = params(1);
        p.maxiter = 10;
        let (model, _) = run(p, CcdVariant::Standard, &train, false);
        for (i, expected) in [5.0, 3.0, 4.0].into_iter().enumerate() {
            let got = model.predict(i, i);
            assert!(
                (got - expected).abs() < 0.05 * expected,
                "({}, {}) = {}",
                i,
                i,
                got
            );
        }
    }

    #[test]
    fn test_training_error_decreases() {
        let train = checkerboard();
        let mut p = params(2);
        p.maxiter = 8;
        let (_, report) = run(p, CcdVariant::Standard, &train, false);
        let first = report.history[0].objective;
        let last = report.last().unwrap().objective;
        assert!(last <= first + 1e-9, "{} > {}", last, first);
    }

    #[test]
    fn test_nmf_keeps_factors_non_negative() {
        let entries = (0..6)
            .flat_map(|r| {
                (0..5).map(move |c| {
                    let value = if (r + c) % 3 == 0 { -2.0 } else { 1.5 };
                    Entry::new(r, c, value)
                })
            })
            .collect::<Vec<_>>();
        let train = SparseMatrix::from_triplets(6, 5, entries).unwrap();
        let mut p = params(3);
        p.do_nmf = true;
        let (model, _) = run(p, CcdVariant::Standard, &train, false);
        assert!(model.w.iter().all(|&x| x >= 0.0));
        assert!(model.h.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn test_bias_features_keep_constant_side() {
        let mut p = params(2);
        p.bias_mode = crate::config::BiasMode::ComputeOnly;
        let (model, _) = run(p, CcdVariant::Standard, &checkerboard(), true);
        assert_eq!(model.k(), 4);
        assert!(model.h.column(2).iter().all(|&x| x == 1.0));
        assert!(model.w.column(3).iter().all(|&x| x == 1.0));
        assert!(model.w.column(2).iter().any(|&x| x != 0.0));
        assert!(model.h.column(3).iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_pu_with_zero_rho_matches_standard() {
        let train = checkerboard();
        let mut p = params(2);
        p.rho = 0.0;
        let (standard, _) = run(p.clone(), CcdVariant::Standard, &train, false);
        let (pu, _) = run(p, CcdVariant::PositiveUnlabeled, &train, false);
        assert_eq!(standard.w, pu.w);
        assert_eq!(standard.h, pu.h);
    }

    #[test]
    fn test_adaptive_rank_stays_within_bounds() {
        let mut p = params(5);
        p.maxiter = 10;
        let (model, report) = run(p, CcdVariant::AdaptiveRank, &checkerboard(), false);
        assert!(report.final_rank >= 1 && report.final_rank <= 5);
        for stats in &report.history {
            assert!(stats.rank <= 5);
        }
        for t in report.final_rank..5 {
            assert!(model.h.column(t).iter().all(|&x| x == 0.0));
        }
    }

    /// Planted rank-2 values; train on even `r + c`, noisy held-out on odd `r + c`
    fn noisy_split() -> (SparseMatrix, SparseMatrix) {
        let value = |r: usize, c: usize| 1.0 + (r % 3) as f64 * 0.5 + (c % 4) as f64 * 0.3;
        let mut train = Vec::new();
        let mut test = Vec::new();
        for r in 0..14 {
            for c in 0..12 {
                if (r + c) % 2 == 0 {
                    train.push(Entry::new(r, c, value(r, c)));
                } else {
                    let noise = 0.3 * ((r * 7 + c * 3) as f64).sin();
                    test.push(Entry::new(r, c, value(r, c) + noise));
                }
            }
        }
        (
            SparseMatrix::from_triplets(14, 12, train).unwrap(),
            SparseMatrix::from_triplets(14, 12, test).unwrap(),
        )
    }

    #[test]
    fn test_adaptive_rank_keeps_validated_features() {
        let (train, test) = noisy_split();
        let mut p = params(2);
        p.lambda = 0.0;
        p.maxiter = 40;
        let solver = Ccdr1Solver::new(p.clone(), CcdVariant::AdaptiveRank);
        let mut model = FactorModel::new(14, 12, 2, solver.layout());
        solver.initialize(&mut model, 7);
        let report = solver
            .fit(&train, &test, &mut model, &mut NoopMonitor)
            .unwrap();

        // only feature 0 is trained in the first pass
        assert_eq!(report.history[0].rank, 1);
        assert_eq!(report.history[1].rank, 2);
        // a rank that improved the held-out error is never given back
        for pair in report.history.windows(2) {
            assert!(pair[1].rank >= pair[0].rank, "{} -> {}", pair[0].rank, pair[1].rank);
        }
        assert_eq!(report.final_rank, 2);
        assert_eq!(report.last().unwrap().rank, report.final_rank);
    }
}

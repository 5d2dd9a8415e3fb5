//! # Solvers
//!
//! Every solver refines a [`FactorModel`] in place against a training matrix whose
//! values are already centered (see the driver). Three families share one trait:
//!
//! - [`ccdr1`]: rank-one coordinate descent, one latent feature at a time
//! - [`als`]: alternating least squares over whole rows of `W` and `H`
//! - [`sgd`]: stratified block stochastic gradient descent
//!
//! Each family has a positive-unlabeled (PU) variant that treats unobserved entries
//! as weak zeros weighted by `rho`.

pub mod als;
pub mod ccdr1;
pub mod sgd;

use std::time::{Duration, Instant};

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;

use crate::config::{SolverType, TrainingParameters};
use crate::error::Result;
use crate::model::{FactorModel, Layout};
use crate::sparse::SparseMatrix;

pub use als::AlsSolver;
pub use ccdr1::{CcdVariant, Ccdr1Solver};
pub use sgd::SgdSolver;

/// Common interface of the factorization algorithms
pub trait Solver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Storage order matching the solver's access pattern
    fn layout(&self) -> Layout;

    /// Random starting point. Not called on warm starts.
    fn initialize(&self, model: &mut FactorModel, seed: u64);

    fn fit(
        &self,
        train: &SparseMatrix,
        test: &SparseMatrix,
        model: &mut FactorModel,
        monitor: &mut dyn TrainingMonitor,
    ) -> Result<TrainingReport>;
}

/// Pick the solver for `params.solver`.
pub fn build_solver(params: &TrainingParameters) -> Box<dyn Solver> {
    match params.solver {
        SolverType::Ccdr1 => Box::new(Ccdr1Solver::new(params.clone(), CcdVariant::Standard)),
        SolverType::Ccdr1Adaptive => {
            Box::new(Ccdr1Solver::new(params.clone(), CcdVariant::AdaptiveRank))
        }
        SolverType::PuCcdr1 => {
            Box::new(Ccdr1Solver::new(params.clone(), CcdVariant::PositiveUnlabeled))
        }
        SolverType::Als => Box::new(AlsSolver::new(params.clone(), false)),
        SolverType::PuAls => Box::new(AlsSolver::new(params.clone(), true)),
        SolverType::Sgd | SolverType::PuSgdOrig => Box::new(SgdSolver::new(params.clone(), None)),
        SolverType::PuSgd => Box::new(SgdSolver::new(params.clone(), Some(params.pu_type))),
    }
}

/// Statistics gathered after one outer iteration
#[derive(Debug, Clone)]
pub struct IterationStats {
    pub iteration: usize,
    pub objective: f64,
    pub train_rmse: f64,
    pub test_rmse: Option<f64>,
    /// Coordinate-descent sweeps run in this iteration, summed over features
    pub inner_sweeps: usize,
    /// Number of features in use
    pub rank: usize,
    pub learning_rate: Option<f64>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub history: Vec<IterationStats>,
    pub final_rank: usize,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&IterationStats> {
        self.history.last()
    }

    pub fn iterations(&self) -> usize {
        self.history.len()
    }
}

/// Hook invoked after every outer iteration, e.g. to save intermediate embeddings.
pub trait TrainingMonitor: Send {
    fn on_iteration(&mut self, stats: &IterationStats, model: &FactorModel) -> Result<()>;

    /// Whether `on_iteration` looks at the model. Lets callers skip preparing it.
    fn needs_model(&self) -> bool {
        true
    }
}

impl<F> TrainingMonitor for F
where
    F: FnMut(&IterationStats, &FactorModel) -> Result<()> + Send,
{
    fn on_iteration(&mut self, stats: &IterationStats, model: &FactorModel) -> Result<()> {
        self(stats, model)
    }
}

pub struct NoopMonitor;

impl TrainingMonitor for NoopMonitor {
    fn on_iteration(&mut self, _stats: &IterationStats, _model: &FactorModel) -> Result<()> {
        Ok(())
    }

    fn needs_model(&self) -> bool {
        false
    }
}

/// Per-run bookkeeping shared by the solvers: evaluates, logs and forwards
/// iteration statistics.
pub(crate) struct Progress<'a> {
    solver: &'static str,
    train: &'a SparseMatrix,
    test: &'a SparseMatrix,
    lambda: f64,
    rho: Option<f64>,
    evaluate_test: bool,
    verbose: bool,
    started: Instant,
    history: Vec<IterationStats>,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(
        solver: &'static str,
        params: &TrainingParameters,
        train: &'a SparseMatrix,
        test: &'a SparseMatrix,
        rho: Option<f64>,
    ) -> Self {
        info!(
            "[{}] {}x{} matrix, nnz {}, rank {}, lambda {}, {} iterations",
            solver,
            train.rows(),
            train.cols(),
            train.nnz(),
            params.effective_rank(),
            params.lambda,
            params.maxiter
        );
        Self {
            solver,
            train,
            test,
            lambda: params.lambda,
            rho,
            evaluate_test: params.do_predict && test.nnz() > 0,
            verbose: params.verbose,
            started: Instant::now(),
            history: Vec::new(),
        }
    }

    pub(crate) fn record(
        &mut self,
        iteration: usize,
        model: &FactorModel,
        inner_sweeps: usize,
        rank: usize,
        learning_rate: Option<f64>,
        monitor: &mut dyn TrainingMonitor,
    ) -> Result<f64> {
        let stats = IterationStats {
            iteration,
            objective: objective(self.train, model, self.lambda, self.rho),
            train_rmse: centered_rmse(model, self.train),
            test_rmse: self
                .evaluate_test
                .then(|| centered_rmse(model, self.test)),
            inner_sweeps,
            rank,
            learning_rate,
            elapsed: self.started.elapsed(),
        };
        let line = format!(
            "[{}] iter {} time {:.2}s obj {:.6e} rank {} train-rmse {:.6}{}",
            self.solver,
            iteration,
            stats.elapsed.as_secs_f64(),
            stats.objective,
            rank,
            stats.train_rmse,
            stats
                .test_rmse
                .map(|e| format!(" test-rmse {:.6}", e))
                .unwrap_or_default()
        );
        if self.verbose {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
        monitor.on_iteration(&stats, model)?;
        let objective = stats.objective;
        self.history.push(stats);
        Ok(objective)
    }

    pub(crate) fn finish(self, final_rank: usize) -> TrainingReport {
        info!(
            "[{}] finished {} iterations in {:.2}s",
            self.solver,
            self.history.len(),
            self.started.elapsed().as_secs_f64()
        );
        TrainingReport {
            history: self.history,
            final_rank,
        }
    }
}

/// RMSE of `W·Hᵗ` against values that already had the global bias removed.
pub fn centered_rmse(model: &FactorModel, m: &SparseMatrix) -> f64 {
    if m.nnz() == 0 {
        return 0.0;
    }
    let sse: f64 = (0..m.rows())
        .into_par_iter()
        .map(|r| {
            m.row(r)
                .iter()
                .map(|(c, value, _)| {
                    let err = value - model.score(r, c);
                    err * err
                })
                .sum::<f64>()
        })
        .sum();
    (sse / m.nnz() as f64).sqrt()
}

/// Regularized training objective
///
/// `Σ_Ω weight·(r − p)² + λ(‖W‖² + ‖H‖²)`, plus `ρ Σ_{Ωᶜ} p²` for PU solvers
/// computed as `ρ(tr(WᵗW·HᵗH) − Σ_Ω p²)`.
pub fn objective(train: &SparseMatrix, model: &FactorModel, lambda: f64, rho: Option<f64>) -> f64 {
    let (loss, observed_sq): (f64, f64) = (0..train.rows())
        .into_par_iter()
        .map(|r| {
            train
                .row(r)
                .iter()
                .fold((0.0, 0.0), |(loss, sq), (c, value, weight)| {
                    let p = model.score(r, c);
                    (loss + weight * (value - p) * (value - p), sq + p * p)
                })
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));
    let reg = lambda * (squared_norm(model.w.view()) + squared_norm(model.h.view()));
    let unobserved = match rho {
        Some(rho) => {
            let all_sq = (gram(model.w.view()) * gram(model.h.view())).sum();
            rho * (all_sq - observed_sq)
        }
        None => 0.0,
    };
    loss + reg + unobserved
}

fn squared_norm(a: ArrayView2<f64>) -> f64 {
    a.iter().map(|x| x * x).sum()
}

/// `AᵗA`
pub fn gram(a: ArrayView2<f64>) -> Array2<f64> {
    a.t().dot(&a)
}

/// Row `t` of `AᵗA`: `Σ_i a[i, t] · a[i, :]`
pub fn gram_row(a: ArrayView2<f64>, t: usize) -> Array1<f64> {
    a.t().dot(&a.column(t))
}

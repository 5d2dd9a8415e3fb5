//! One training run from loaded matrices to a model in the original index order.
//!
//! The steps, in order: GloVe weighting, bias removal, load-balancing shuffle,
//! model allocation, the solver inside a dedicated rayon pool, and finally undoing
//! the shuffle.

use std::time::{Duration, Instant};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::TrainingParameters;
use crate::error::{PmfError, Result};
use crate::model::FactorModel;
use crate::permutation::PermutationPair;
use crate::solver::{build_solver, IterationStats, NoopMonitor, TrainingMonitor, TrainingReport};
use crate::sparse::SparseMatrix;

/// Matrices of one run. `counts` holds the co-occurrence counts of the train and
/// test matrices, required for GloVe weighting.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub train: SparseMatrix,
    pub test: SparseMatrix,
    pub counts: Option<(SparseMatrix, SparseMatrix)>,
}

impl TrainingData {
    pub fn new(train: SparseMatrix, test: SparseMatrix) -> Self {
        Self {
            train,
            test,
            counts: None,
        }
    }

    pub fn with_counts(mut self, train_counts: SparseMatrix, test_counts: SparseMatrix) -> Self {
        self.counts = Some((train_counts, test_counts));
        self
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub model: FactorModel,
    pub report: TrainingReport,
    pub wall_time: Duration,
}

pub struct Trainer {
    params: TrainingParameters,
    warm_start: Option<FactorModel>,
}

/// Forwards iteration callbacks with the model mapped back to the original indices.
struct RestoringMonitor<'a> {
    inner: &'a mut dyn TrainingMonitor,
    permutations: Option<&'a (PermutationPair, PermutationPair)>,
}

impl TrainingMonitor for RestoringMonitor<'_> {
    fn on_iteration(&mut self, stats: &IterationStats, model: &FactorModel) -> Result<()> {
        match self.permutations {
            Some((rows, cols)) if self.inner.needs_model() => {
                let mut restored = model.clone();
                restored.apply_permutation(rows.perm(), cols.perm())?;
                self.inner.on_iteration(stats, &restored)
            }
            _ => self.inner.on_iteration(stats, model),
        }
    }

    fn needs_model(&self) -> bool {
        self.inner.needs_model()
    }
}

impl Trainer {
    pub fn new(params: TrainingParameters) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            warm_start: None,
        })
    }

    /// Start from `model` instead of a random initialization. Its features must
    /// match `effective_rank()`.
    pub fn with_warm_start(mut self, model: FactorModel) -> Self {
        self.params.warm_start = true;
        self.warm_start = Some(model);
        self
    }

    pub fn params(&self) -> &TrainingParameters {
        &self.params
    }

    pub fn train(&self, data: TrainingData) -> Result<TrainingOutcome> {
        self.train_with_monitor(data, &mut NoopMonitor)
    }

    pub fn train_with_monitor(
        &self,
        data: TrainingData,
        monitor: &mut dyn TrainingMonitor,
    ) -> Result<TrainingOutcome> {
        let started = Instant::now();
        let mut params = self.params.clone();
        if params.warm_start && self.warm_start.is_none() {
            return Err(PmfError::Config(
                "warm start requested without an initial model".into(),
            ));
        }
        let TrainingData {
            mut train,
            mut test,
            counts,
        } = data;
        if test.rows() != train.rows() || test.cols() != train.cols() {
            return Err(PmfError::ShapeMismatch(format!(
                "test matrix is {}x{} but training matrix is {}x{}",
                test.rows(),
                test.cols(),
                train.rows(),
                train.cols()
            )));
        }

        if params.glove_weight {
            let (train_counts, test_counts) = counts.as_ref().ok_or_else(|| {
                PmfError::Config("GloVe weighting needs the co-occurrence count matrices".into())
            })?;
            train.apply_glove_weights(train_counts, params.x_max, params.glove_alpha)?;
            if test.nnz() > 0 {
                test.apply_glove_weights(test_counts, params.x_max, params.glove_alpha)?;
            }
        } else if counts.is_some() {
            warn!("count matrices given without GloVe weighting; ignored");
        }

        let global_bias = if params.remove_bias {
            let mean = train.global_mean();
            train.shift_values(-mean);
            test.shift_values(-mean);
            info!("removed global bias {:.6}", mean);
            mean
        } else {
            0.0
        };

        let seed = params.seed.unwrap_or_else(rand::random);
        params.seed = Some(seed);
        let permutations = if params.shuffle {
            let mut rng = StdRng::seed_from_u64(seed);
            let rows = PermutationPair::generate(train.rows(), &mut rng);
            let cols = PermutationPair::generate(train.cols(), &mut rng);
            train.apply_permutation(rows.perm(), cols.perm())?;
            test.apply_permutation(rows.perm(), cols.perm())?;
            Some((rows, cols))
        } else {
            None
        };

        let solver = build_solver(&params);
        let mut model = self.starting_model(&params, &train, solver.layout())?;
        match (&self.warm_start, &permutations) {
            (Some(_), Some((rows, cols))) => {
                model.apply_permutation(rows.inverse(), cols.inverse())?
            }
            (None, _) => solver.initialize(&mut model, seed),
            _ => {}
        }
        model.global_bias = global_bias;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.threads)
            .build()?;
        info!(
            "training {} with {} threads (seed {})",
            solver.name(),
            params.threads,
            seed
        );
        let mut restoring = RestoringMonitor {
            inner: monitor,
            permutations: permutations.as_ref(),
        };
        let report =
            pool.install(|| solver.fit(&train, &test, &mut model, &mut restoring))?;

        if let Some((rows, cols)) = &permutations {
            model.apply_permutation(rows.perm(), cols.perm())?;
        }
        let wall_time = started.elapsed();
        info!("wall time {:.3}s", wall_time.as_secs_f64());
        Ok(TrainingOutcome {
            model,
            report,
            wall_time,
        })
    }

    fn starting_model(
        &self,
        params: &TrainingParameters,
        train: &SparseMatrix,
        layout: crate::model::Layout,
    ) -> Result<FactorModel> {
        let k = params.effective_rank();
        let mut model = match &self.warm_start {
            Some(warm) => {
                if warm.rows() != train.rows() || warm.cols() != train.cols() || warm.k() != k {
                    return Err(PmfError::ShapeMismatch(format!(
                        "warm-start model is {}x{} with {} features, expected {}x{} with {}",
                        warm.rows(),
                        warm.cols(),
                        warm.k(),
                        train.rows(),
                        train.cols(),
                        k
                    )));
                }
                warm.to_layout(layout)
            }
            None => FactorModel::new(train.rows(), train.cols(), k, layout),
        };
        model.set_bias_features(params.bias_mode.is_enabled());
        Ok(model)
    }
}

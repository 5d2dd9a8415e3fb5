/*
 * File: /main.rs
 * Created Date: Tuesday November 21st 2023
 * Author: Zihan
 * -----
 * HISTORY:
 * Date      		By   	Comments
 * ----------		------	---------------------------------------------------------
 */

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};

use fast_pmf::io::{
    default_model_name, final_output_paths, iteration_output_paths, load_dataset, npy_paths,
    params_path, write_embedding, write_params,
};
use fast_pmf::{
    BiasMode, FactorModel, InputFormat, IterationStats, Layout, LrateMethod, PuType, SolverType,
    Trainer, TrainingData, TrainingParameters,
};

#[derive(Parser, Debug)]
#[command(name = "pmf-train")]
#[command(about = "Train low-rank factor models and embeddings from sparse matrices")]
struct Cli {
    /// Solver: 0 CCDR1, 1 ALS, 2 SGD, 9 CCDR1 with adaptive rank, 10 PU-CCDR1,
    /// 11 PU-ALS, 12 PU-SGD, 22 PU-SGD-ORIG
    #[arg(short = 's', default_value_t = 0)]
    solver: u32,

    #[arg(short = 'k', default_value_t = 10)]
    rank: usize,

    #[arg(short = 'n', default_value_t = 4)]
    threads: usize,

    #[arg(short = 'l', default_value_t = 0.1)]
    lambda: f64,

    /// Weight of unobserved entries in the PU formulations
    #[arg(short = 'r', default_value_t = 0.01)]
    rho: f64,

    /// PU-SGD strategy: 2 reformulation, 6 binary search
    #[arg(short = 'P', default_value_t = 2)]
    pu_type: u32,

    #[arg(short = 't', default_value_t = 5)]
    maxiter: usize,

    /// Inner iterations of CCDR1
    #[arg(short = 'T', default_value_t = 5)]
    maxinneriter: usize,

    /// CCDR1 inner stopping threshold, also the initial SGD learning rate
    #[arg(short = 'e', default_value_t = 1e-3)]
    eps: f64,

    /// Initial SGD learning rate, overriding -e
    #[arg(long)]
    eta0: Option<f64>,

    /// SGD blocks per dimension (0: one per thread)
    #[arg(short = 'B', default_value_t = 0)]
    nr_blocks: usize,

    /// Learning rate schedule: 0 bold driver, 1 inverse scaling
    #[arg(short = 'm', default_value_t = 0)]
    lrate_method: u32,

    #[arg(short = 'u', default_value_t = 1.05)]
    betaup: f64,

    #[arg(short = 'd', default_value_t = 0.5)]
    betadown: f64,

    /// Start from `<prefix>.W.npy` / `<prefix>.H.npy`
    #[arg(short = 'w', long = "warm-start")]
    warm_start: Option<PathBuf>,

    /// Evaluate the test matrix every iteration (implies -q 1)
    #[arg(short = 'p', default_value_t = 0)]
    do_predict: u8,

    #[arg(short = 'q', default_value_t = 0)]
    verbose: u8,

    #[arg(short = 'N', default_value_t = 0)]
    do_nmf: u8,

    #[arg(short = 'S', default_value_t = 1)]
    shuffle: u8,

    /// Save the embedding after every iteration
    #[arg(short = 'E', default_value_t = 0)]
    save_each: u8,

    #[arg(short = 'b', default_value_t = 1)]
    remove_bias: u8,

    /// GloVe weighting cutoff
    #[arg(short = 'X', default_value_t = 10.0)]
    x_max: f64,

    /// Weight entries by their co-occurrence counts
    #[arg(short = 'W', default_value_t = 0)]
    glove_weight: u8,

    /// Row/column bias features: 0 none, 1 train only, 2 train and save with a trailing 1
    #[arg(short = 'G', default_value_t = 0)]
    glove_bias: u32,

    /// Input format: 0 text triplets, 1 PETSc binary
    #[arg(short = 'f', default_value_t = 0)]
    format: u32,

    #[arg(long)]
    seed: Option<u64>,

    /// Also write `<model>.W.npy` / `<model>.H.npy`
    #[arg(long)]
    npy: bool,

    data_dir: PathBuf,
    count_dir: PathBuf,
    output_folder: PathBuf,
    model_name: Option<String>,
}

impl Cli {
    fn parameters(&self) -> fast_pmf::Result<TrainingParameters> {
        Ok(TrainingParameters {
            solver: SolverType::from_id(self.solver)?,
            k: self.rank,
            threads: self.threads,
            lambda: self.lambda,
            rho: self.rho,
            pu_type: PuType::from_id(self.pu_type)?,
            maxiter: self.maxiter,
            maxinneriter: self.maxinneriter,
            eps: self.eps,
            eta0: self.eta0.unwrap_or(self.eps),
            nr_blocks: self.nr_blocks,
            lrate_method: LrateMethod::from_id(self.lrate_method)?,
            betaup: self.betaup,
            betadown: self.betadown,
            warm_start: self.warm_start.is_some(),
            do_predict: self.do_predict != 0,
            verbose: self.verbose != 0 || self.do_predict != 0,
            do_nmf: self.do_nmf != 0,
            shuffle: self.shuffle != 0,
            save_each: self.save_each != 0,
            remove_bias: self.remove_bias != 0,
            glove_weight: self.glove_weight != 0,
            x_max: self.x_max,
            glove_alpha: TrainingParameters::default().glove_alpha,
            bias_mode: BiasMode::from_id(self.glove_bias)?,
            format: InputFormat::from_id(self.format)?,
            seed: Some(self.seed.unwrap_or_else(rand::random)),
        })
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let params = cli.parameters()?;

    let level = if params.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    simple_logger::SimpleLogger::new().with_level(level).init()?;
    params.validate()?;

    fs::create_dir_all(&cli.output_folder)
        .with_context(|| format!("creating {}", cli.output_folder.display()))?;
    let model_name = cli
        .model_name
        .clone()
        .unwrap_or_else(|| default_model_name(&cli.output_folder));

    let data = load_dataset(&cli.data_dir, params.format)?;
    let mut training = TrainingData::new(data.train, data.test);
    if params.glove_weight {
        info!("GloVe weighting with x_max {}", params.x_max);
        let counts = load_dataset(&cli.count_dir, params.format)?;
        training = training.with_counts(counts.train, counts.test);
    }

    let mut trainer = Trainer::new(params.clone())?;
    if let Some(prefix) = &cli.warm_start {
        let (w, h) = npy_paths(prefix);
        let model = FactorModel::load_npy(&w, &h, Layout::RowMajor)
            .with_context(|| format!("loading warm-start model {}", prefix.display()))?;
        trainer = trainer.with_warm_start(model);
    }

    let outcome = if params.save_each {
        let output = cli.output_folder.clone();
        let name = model_name.clone();
        let mode = params.bias_mode;
        let mut save = move |stats: &IterationStats, model: &FactorModel| {
            let (words, contexts) = iteration_output_paths(&output, &name, stats.iteration);
            write_embedding(model, &words, &contexts, mode)
        };
        trainer.train_with_monitor(training, &mut save)?
    } else {
        trainer.train(training)?
    };

    let (words, contexts) =
        final_output_paths(&cli.output_folder, &model_name, params.solver, params.maxiter);
    write_embedding(&outcome.model, &words, &contexts, params.bias_mode)?;
    info!("wrote {} and {}", words.display(), contexts.display());
    if cli.npy {
        let (w, h) = npy_paths(&cli.output_folder.join(&model_name));
        outcome.model.save_npy(&w, &h)?;
        info!("wrote {} and {}", w.display(), h.display());
    }
    write_params(&params_path(&cli.output_folder, &model_name), trainer.params())?;

    if let Some(last) = outcome.report.last() {
        info!(
            "final: rank {} obj {:.6e} train-rmse {:.6}{}",
            outcome.report.final_rank,
            last.objective,
            last.train_rmse,
            last.test_rmse
                .map(|e| format!(" test-rmse {:.6}", e))
                .unwrap_or_default()
        );
    }
    info!("Wall-time: {:.3} secs", outcome.wall_time.as_secs_f64());
    Ok(())
}

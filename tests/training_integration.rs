//! End-to-end training runs through the public `Trainer` API
//!
//! Covers:
//! 1. Reconstruction of small planted matrices
//! 2. Results independent of the thread count and the model layout
//! 3. Positive-unlabeled weighting pulling unobserved entries down
//! 4. Loading a data directory and writing the embedding files

use approx::assert_abs_diff_eq;
use fast_pmf::io::{final_output_paths, load_dataset, write_embedding};
use fast_pmf::{
    BiasMode, Entry, FactorModel, InputFormat, Layout, LrateMethod, PuType, SolverType,
    SparseMatrix, Trainer, TrainingData, TrainingOutcome, TrainingParameters,
};
use std::fs;
use std::path::Path;

fn planted_value(r: usize, c: usize) -> f64 {
    1.0 + (r % 3) as f64 * 0.4 + (c % 4) as f64 * 0.25
}

/// Rank-two pattern observed where `(r + c) % 3 != 0`
fn planted_matrix(rows: usize, cols: usize) -> SparseMatrix {
    let entries = (0..rows).flat_map(|r| {
        (0..cols)
            .filter(move |c| (r + c) % 3 != 0)
            .map(move |c| Entry::new(r, c, planted_value(r, c)))
    });
    SparseMatrix::from_triplets(rows, cols, entries).unwrap()
}

fn dense_planted_matrix(rows: usize, cols: usize) -> SparseMatrix {
    let entries =
        (0..rows).flat_map(|r| (0..cols).map(move |c| Entry::new(r, c, planted_value(r, c))));
    SparseMatrix::from_triplets(rows, cols, entries).unwrap()
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run(params: TrainingParameters, train: &SparseMatrix) -> TrainingOutcome {
    init_logger();
    let test = SparseMatrix::empty(train.rows(), train.cols());
    Trainer::new(params)
        .unwrap()
        .train(TrainingData::new(train.clone(), test))
        .unwrap()
}

fn assert_same_factors(a: &FactorModel, b: &FactorModel) {
    assert_eq!(a.w.dim(), b.w.dim());
    assert_eq!(a.h.dim(), b.h.dim());
    for (x, y) in a.w.iter().zip(b.w.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
    }
    for (x, y) in a.h.iter().zip(b.h.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
    }
}

#[test]
fn test_ccdr1_fits_diagonal_matrix() {
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
    let params = TrainingParameters {
        solver: SolverType::Ccdr1,
        k: 1,
        lambda: 0.01,
        maxiter: 10,
        threads: 2,
        remove_bias: false,
        seed: Some(11),
        ..Default::default()
    };
    let outcome = run(params, &train);
    for (i, expected) in [5.0, 3.0, 4.0].into_iter().enumerate() {
        let got = outcome.model.predict(i, i);
        assert!(
            (got - expected).abs() < 0.05 * expected,
            "({}, {}) = {}",
            i,
            i,
            got
        );
    }
    assert_eq!(outcome.report.iterations(), 10);
}

#[test]
fn test_als_recovers_planted_matrix() {
    let train = dense_planted_matrix(12, 10);
    let params = TrainingParameters {
        solver: SolverType::Als,
        k: 2,
        lambda: 0.0,
        maxiter: 10,
        threads: 3,
        seed: Some(4),
        ..Default::default()
    };
    let outcome = run(params, &train);
    for e in train.triplets() {
        assert_abs_diff_eq!(outcome.model.predict(e.row, e.col), e.value, epsilon = 1e-6);
    }
    assert!(outcome.report.last().unwrap().train_rmse < 1e-6);
}

#[test]
fn test_ccdr1_is_independent_of_thread_count() {
    let train = planted_matrix(15, 11);
    let params = |threads| TrainingParameters {
        solver: SolverType::Ccdr1,
        k: 3,
        eps: 0.0,
        maxiter: 4,
        threads,
        seed: Some(21),
        ..Default::default()
    };
    let single = run(params(1), &train);
    let parallel = run(params(4), &train);
    assert_same_factors(&single.model, &parallel.model);
}

#[test]
fn test_sgd_is_independent_of_thread_count() {
    let train = planted_matrix(16, 12);
    let params = |threads| TrainingParameters {
        solver: SolverType::Sgd,
        k: 3,
        eta0: 0.02,
        lrate_method: LrateMethod::InverseScaling,
        nr_blocks: 4,
        maxiter: 5,
        threads,
        seed: Some(8),
        ..Default::default()
    };
    let single = run(params(1), &train);
    let parallel = run(params(3), &train);
    assert_same_factors(&single.model, &parallel.model);
}

#[test]
fn test_warm_start_layout_does_not_change_result() {
    let train = planted_matrix(9, 8);
    let params = TrainingParameters {
        solver: SolverType::Ccdr1,
        k: 2,
        maxiter: 2,
        threads: 2,
        shuffle: false,
        remove_bias: false,
        seed: Some(1),
        ..Default::default()
    };
    let start = run(params.clone(), &train).model;

    let continue_from = |model: FactorModel| {
        Trainer::new(params.clone())
            .unwrap()
            .with_warm_start(model)
            .train(TrainingData::new(train.clone(), SparseMatrix::empty(9, 8)))
            .unwrap()
    };
    let row_major = continue_from(start.to_layout(Layout::RowMajor));
    let col_major = continue_from(start.to_layout(Layout::ColMajor));
    assert_same_factors(&row_major.model, &col_major.model);
}

/// Mean prediction over the cells `planted_matrix` leaves unobserved, for each `rho`
fn mean_unobserved_by_rho(base: TrainingParameters, rhos: &[f64]) -> Vec<f64> {
    let train = planted_matrix(12, 12);
    rhos.iter()
        .map(|&rho| {
            let params = TrainingParameters {
                rho,
                ..base.clone()
            };
            let model = run(params, &train).model;
            let unobserved: Vec<f64> = (0..12)
                .flat_map(|r| (0..12).map(move |c| (r, c)))
                .filter(|(r, c)| (r + c) % 3 == 0)
                .map(|(r, c)| model.predict(r, c))
                .collect();
            unobserved.iter().sum::<f64>() / unobserved.len() as f64
        })
        .collect()
}

fn assert_decreasing(means: &[f64]) {
    for pair in means.windows(2) {
        assert!(pair[0] > pair[1], "{:?}", means);
    }
}

fn pu_params(solver: SolverType) -> TrainingParameters {
    TrainingParameters {
        solver,
        k: 2,
        maxiter: 10,
        threads: 2,
        remove_bias: false,
        seed: Some(17),
        ..Default::default()
    }
}

#[test]
fn test_pu_ccdr1_weight_pulls_unobserved_entries_down() {
    let means = mean_unobserved_by_rho(pu_params(SolverType::PuCcdr1), &[0.0, 0.1, 0.5]);
    assert_decreasing(&means);
}

#[test]
fn test_pu_als_weight_pulls_unobserved_entries_down() {
    let means = mean_unobserved_by_rho(pu_params(SolverType::PuAls), &[0.0, 0.1, 0.5]);
    assert_decreasing(&means);
}

#[test]
fn test_pu_sgd_weight_pulls_unobserved_entries_down() {
    for pu_type in [PuType::Reformulation, PuType::BinarySearch] {
        let base = TrainingParameters {
            pu_type,
            eta0: 0.02,
            lrate_method: LrateMethod::InverseScaling,
            nr_blocks: 2,
            maxiter: 30,
            ..pu_params(SolverType::PuSgd)
        };
        let means = mean_unobserved_by_rho(base, &[0.0, 0.1, 0.5]);
        assert_decreasing(&means);
    }
}

#[test]
fn test_bias_features_are_persisted_with_trailing_one() {
    let train = planted_matrix(6, 5);
    let params = TrainingParameters {
        solver: SolverType::Ccdr1,
        k: 2,
        maxiter: 3,
        threads: 2,
        bias_mode: BiasMode::Persist,
        seed: Some(2),
        ..Default::default()
    };
    let outcome = run(params, &train);
    assert_eq!(outcome.model.k(), 4);

    let dir = tempfile::tempdir().unwrap();
    let words = dir.path().join("m.words");
    let contexts = dir.path().join("m.contexts");
    write_embedding(&outcome.model, &words, &contexts, BiasMode::Persist).unwrap();
    let content = fs::read_to_string(&words).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 6);
    for line in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[4].parse::<f64>().unwrap(), 1.0);
    }
}

fn write_text_dataset(dir: &Path, train: &SparseMatrix) {
    let lines: Vec<String> = train
        .triplets()
        .map(|e| format!("{} {} {}", e.row + 1, e.col + 1, e.value))
        .collect();
    fs::write(dir.join("train.txt"), lines.join("\n")).unwrap();
    fs::write(
        dir.join("meta"),
        format!("{} {}\n{} train.txt\n", train.rows(), train.cols(), train.nnz()),
    )
    .unwrap();
}

#[test]
fn test_data_directory_to_embedding_files() {
    let data_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let train = planted_matrix(7, 6);
    write_text_dataset(data_dir.path(), &train);

    init_logger();
    let dataset = load_dataset(data_dir.path(), InputFormat::Text).unwrap();
    assert_eq!(dataset.train.nnz(), train.nnz());
    assert_eq!(dataset.test.nnz(), 0);

    let params = TrainingParameters {
        solver: SolverType::Ccdr1,
        k: 3,
        maxiter: 2,
        threads: 2,
        seed: Some(6),
        ..Default::default()
    };
    let outcome = Trainer::new(params.clone())
        .unwrap()
        .train(TrainingData::new(dataset.train, dataset.test))
        .unwrap();

    let (words, contexts) =
        final_output_paths(out_dir.path(), "toy.model", params.solver, params.maxiter);
    write_embedding(&outcome.model, &words, &contexts, params.bias_mode).unwrap();
    assert!(words.ends_with("toy.model.iter2.final.words"));
    let rows = fs::read_to_string(&words).unwrap().lines().count();
    let cols = fs::read_to_string(&contexts).unwrap().lines().count();
    assert_eq!((rows, cols), (7, 6));
}

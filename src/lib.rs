/*
 * File: /src/lib.rs
 * Created Date: Monday, January 22nd 2024
 * Author: Zihan
 * -----
 * HISTORY:
 * Date      		By   	Comments
 * ----------		------	---------------------------------------------------------
 */

//! Parallel low-rank factorization of sparse rating and co-occurrence matrices.
//!
//! ```no_run
//! use fast_pmf::{io, InputFormat, Trainer, TrainingData, TrainingParameters};
//! use std::path::Path;
//!
//! let data = io::load_dataset(Path::new("data/ml1m"), InputFormat::Text)?;
//! let params = TrainingParameters { k: 16, ..Default::default() };
//! let outcome = Trainer::new(params)?.train(TrainingData::new(data.train, data.test))?;
//! println!("{}", outcome.model.predict(0, 0));
//! # Ok::<(), fast_pmf::PmfError>(())
//! ```

pub mod blocks;
pub mod config;
pub mod driver;
pub mod error;
pub mod io;
pub mod model;
pub mod permutation;
pub mod solver;
pub mod sparse;
pub mod util;

pub use config::{BiasMode, InputFormat, LrateMethod, PuType, SolverType, TrainingParameters};
pub use driver::{Trainer, TrainingData, TrainingOutcome};
pub use error::{PmfError, Result};
pub use model::{FactorModel, Layout};
pub use permutation::PermutationPair;
pub use solver::{build_solver, IterationStats, Solver, TrainingMonitor, TrainingReport};
pub use sparse::{Entry, SparseMatrix};

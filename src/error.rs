//! Error types shared by the factorization engine and its I/O collaborators.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::Layout;

/// Every failure is fatal at the point of detection; nothing is retried.
#[derive(Error, Debug)]
pub enum PmfError {
    /// Rejected parameter values
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown solver type {0}")]
    UnknownSolver(u32),

    /// I/O failure on a named file
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure on an anonymous stream (embedding writers)
    #[error(transparent)]
    Stream(#[from] std::io::Error),

    /// Malformed matrix content
    #[error("format error: {0}")]
    Format(String),

    #[error("entry ({row}, {col}) out of range for a {rows}x{cols} matrix")]
    IndexOutOfRange {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    #[error("{solver} cannot train a {layout:?} model")]
    Layout {
        layout: Layout,
        solver: &'static str,
    },

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("npy error: {0}")]
    Npy(String),
}

impl PmfError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PmfError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PmfError>;

/**
 * File: /src/config.rs
 * Created Date: Friday, January 26th 2024
 * Author: Zihan
 * -----
 * HISTORY:
 * Date      		By   	Comments
 * ----------		------	---------------------------------------------------------
 */
use serde::{Deserialize, Serialize};

use crate::error::{PmfError, Result};

/// Solver selector. The discriminants are the ids accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverType {
    /// CCDR1 with fundec stopping condition
    Ccdr1 = 0,
    Als = 1,
    Sgd = 2,
    /// CCDR1 with adaptive ranking increasing
    Ccdr1Adaptive = 9,
    PuCcdr1 = 10,
    PuAls = 11,
    PuSgd = 12,
    /// Plain SGD routine kept under its PU id
    PuSgdOrig = 22,
}

impl SolverType {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(SolverType::Ccdr1),
            1 => Ok(SolverType::Als),
            2 => Ok(SolverType::Sgd),
            9 => Ok(SolverType::Ccdr1Adaptive),
            10 => Ok(SolverType::PuCcdr1),
            11 => Ok(SolverType::PuAls),
            12 => Ok(SolverType::PuSgd),
            22 => Ok(SolverType::PuSgdOrig),
            other => Err(PmfError::UnknownSolver(other)),
        }
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn is_ccdr1(self) -> bool {
        matches!(
            self,
            SolverType::Ccdr1 | SolverType::Ccdr1Adaptive | SolverType::PuCcdr1
        )
    }

    pub fn is_positive_unlabeled(self) -> bool {
        matches!(
            self,
            SolverType::PuCcdr1 | SolverType::PuAls | SolverType::PuSgd
        )
    }
}

/// PU strategy for the SGD family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PuType {
    /// SG with reformulation
    Reformulation = 2,
    /// SG with binary search
    BinarySearch = 6,
}

impl PuType {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            2 => Ok(PuType::Reformulation),
            6 => Ok(PuType::BinarySearch),
            other => Err(PmfError::Config(format!("unknown PU type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrateMethod {
    /// Grow by `betaup` after an improving epoch, shrink by `betadown` otherwise
    BoldDriver = 0,
    /// `eta0 / (1 + betadown * epoch)`
    InverseScaling = 1,
}

impl LrateMethod {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(LrateMethod::BoldDriver),
            1 => Ok(LrateMethod::InverseScaling),
            other => Err(PmfError::Config(format!(
                "unknown learning rate method {}",
                other
            ))),
        }
    }
}

/// Bias augmentation. Only changes what is persisted; training is identical for
/// `ComputeOnly` and `Persist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiasMode {
    None = 0,
    ComputeOnly = 1,
    Persist = 2,
}

impl BiasMode {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(BiasMode::None),
            1 => Ok(BiasMode::ComputeOnly),
            2 => Ok(BiasMode::Persist),
            other => Err(PmfError::Config(format!("unknown bias mode {}", other))),
        }
    }

    pub fn is_enabled(self) -> bool {
        self != BiasMode::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputFormat {
    Text = 0,
    Petsc = 1,
}

impl InputFormat {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(InputFormat::Text),
            1 => Ok(InputFormat::Petsc),
            other => Err(PmfError::Config(format!("unknown input format {}", other))),
        }
    }
}

/// Immutable configuration bundle handed to every component of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParameters {
    pub solver: SolverType,
    /// Rank requested by the user, without the reserved bias features
    pub k: usize,
    pub threads: usize,
    pub lambda: f64,
    pub rho: f64,
    pub pu_type: PuType,
    pub maxiter: usize,
    pub maxinneriter: usize,
    pub eps: f64,
    pub eta0: f64,
    /// 0 means one block per thread
    pub nr_blocks: usize,
    pub lrate_method: LrateMethod,
    pub betaup: f64,
    pub betadown: f64,
    pub warm_start: bool,
    pub do_predict: bool,
    pub verbose: bool,
    pub do_nmf: bool,
    pub shuffle: bool,
    pub save_each: bool,
    pub remove_bias: bool,
    pub glove_weight: bool,
    pub x_max: f64,
    pub glove_alpha: f64,
    pub bias_mode: BiasMode,
    pub format: InputFormat,
    pub seed: Option<u64>,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            solver: SolverType::Ccdr1,
            k: 10,
            threads: 4,
            lambda: 0.1,
            rho: 0.01,
            pu_type: PuType::Reformulation,
            maxiter: 5,
            maxinneriter: 5,
            eps: 1e-3,
            eta0: 1e-3,
            nr_blocks: 0,
            lrate_method: LrateMethod::BoldDriver,
            betaup: 1.05,
            betadown: 0.5,
            warm_start: false,
            do_predict: false,
            verbose: false,
            do_nmf: false,
            shuffle: true,
            save_each: false,
            remove_bias: true,
            glove_weight: false,
            x_max: 10.0,
            glove_alpha: 0.75,
            bias_mode: BiasMode::None,
            format: InputFormat::Text,
            seed: None,
        }
    }
}

impl TrainingParameters {
    /// Number of latent features actually stored: the reserved bias pair is
    /// appended after the user features.
    pub fn effective_rank(&self) -> usize {
        if self.bias_mode.is_enabled() {
            self.k + 2
        } else {
            self.k
        }
    }

    pub fn blocks(&self) -> usize {
        if self.nr_blocks == 0 {
            self.threads
        } else {
            self.nr_blocks
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(PmfError::Config("rank k must be at least 1".into()));
        }
        if self.threads == 0 {
            return Err(PmfError::Config("thread count must be at least 1".into()));
        }
        for (name, value) in [
            ("lambda", self.lambda),
            ("rho", self.rho),
            ("eps", self.eps),
            ("eta0", self.eta0),
        ] {
            if !(value >= 0.0) {
                return Err(PmfError::Config(format!(
                    "{} must be non-negative, got {}",
                    name, value
                )));
            }
        }
        if self.glove_weight && !(self.x_max > 0.0) {
            return Err(PmfError::Config(format!(
                "x_max must be positive, got {}",
                self.x_max
            )));
        }
        if self.bias_mode.is_enabled() && !self.solver.is_ccdr1() {
            return Err(PmfError::Config(format!(
                "bias augmentation requires a CCDR1 solver, got {:?}",
                self.solver
            )));
        }
        Ok(())
    }
}

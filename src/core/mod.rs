//! Core target-propagation implementation.
//!
//! This module provides the building blocks of a DTP network:
//! - Activation and batch-normalization primitives ([`activation`])
//! - Weight initialization schemes ([`init`])
//! - Forward/backward function objects ([`function`])
//! - Layers pairing a forward transform with its learned inverse ([`layer`])
//! - The network orchestrating the two-phase training step ([`network`])
//!
//! ## Target Propagation
//!
//! Instead of a global gradient, every non-output layer receives a *target*:
//! ```text
//! t^{d-1} = g_d(t^d) + h^{d-1} - g_d(f_d(h^{d-1}))
//! ```
//! where `f_d` is layer d's forward transform and `g_d` its approximate inverse.
//! Each layer then regresses its own output onto its target with a purely local loss.

pub mod activation;
pub mod function;
pub mod init;
pub mod layer;
pub mod network;

pub use activation::Activation;
pub use function::{Function, FunctionParams, Peer, Trace};
pub use init::Init;
pub use layer::Layer;
pub use network::{Network, NetworkState, StepMetrics};

use thiserror::Error;

/// Error type for target-propagation operations.
#[derive(Debug, Error)]
pub enum TPError {
    /// Unsupported activation, function kind, dataset or slot combination
    #[error("not supported: {0}")]
    Configuration(String),
    /// Declared but unimplemented option (e.g. initialization scheme)
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// Algorithm name outside the known families
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
    /// Caller broke a function or checkpoint contract
    #[error("contract violation: {0}")]
    ContractViolation(String),
    /// Shape mismatch in matrix operations
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Non-finite values during training
    #[error("numerical error: {0}")]
    Numerical(String),
    /// Malformed or missing dataset files
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TPError {
    /// True for the configuration family (raised before any training happens).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TPError::Configuration(_) | TPError::NotImplemented(_) | TPError::UnknownAlgorithm(_)
        )
    }
}

pub type TPResult<T> = Result<T, TPError>;

/// Check that `x` has `cols` columns, naming the caller in the error.
pub(crate) fn expect_cols(x: &ndarray::Array2<f32>, cols: usize, what: &str) -> TPResult<()> {
    if x.ncols() != cols {
        return Err(TPError::ShapeMismatch(format!(
            "{what}: expected {cols} columns, got {:?}",
            x.shape()
        )));
    }
    Ok(())
}

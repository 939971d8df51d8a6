//! # targetprop
//!
//! Difference Target Propagation (DTP) and its variants (TP, FWDTP, ITP, each
//! optionally batch-normalized) for feed-forward classifiers.
//!
//! ## Overview
//!
//! Every layer pairs a forward transform `f = ff2 ∘ ff1` with an approximate
//! inverse `g = bf2 ∘ bf1`. Per batch the network first trains the inverses on
//! noisy reconstructions, then turns the task-loss gradient at the output into
//! targets that are pulled down through the inverses. Each layer finally
//! regresses onto its own target with a purely local loss.
//!
//! ## Structure
//!
//! - [`core`] — Activations, function variants, layers, the network, errors
//! - [`config`] — Configuration tags, algorithm presets, `NetworkConfig`
//! - [`loss`] — Task losses (cross-entropy, label-augmented, squared error)
//! - [`data`] — MNIST / FashionMNIST / CIFAR loaders and batching
//! - [`training`] — Epoch loop, metrics and metric sinks
//! - [`checkpoint`] — JSON persistence of network state
//! - [`utils`] — Numeric helpers

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod data;
pub mod loss;
pub mod training;
pub mod utils;

pub use config::{Algorithm, LayerSpec, LossFeedback, NetworkConfig};
pub use crate::core::{Activation, Init, Layer, Network, NetworkState, StepMetrics, TPError, TPResult};
pub use loss::{Loss, Targets};
pub use training::{train, EpochMetrics, JsonlSink, MetricsSink, NullSink};

/// Training hyperparameters.
///
/// Used by [`Network::train_step`], [`Network::train_back_weights`] and [`train`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct Config {
    /// Forward learning rate (divided by the batch size)
    pub lr: f32,
    /// Backward learning rate (divided by the batch size)
    pub lr_backward: f32,
    /// Standard deviation of the reconstruction noise
    pub std_backward: f32,
    /// Step taken along the negative loss gradient to form output targets
    pub stepsize: f32,
    pub loss_feedback: LossFeedback,
    /// Backward repetitions per batch
    pub epochs_backward: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            lr_backward: 1e-3,
            std_backward: 1e-2,
            stepsize: 1e-2,
            loss_feedback: LossFeedback::Dtp,
            epochs_backward: 5,
            epochs: 100,
            batch_size: 256,
            seed: 1,
        }
    }
}

//! Epoch loop and metrics.
//!
//! Epoch 0 only trains the inverses (warm-up); epochs `1..=epochs` run the full
//! training step on every batch and then evaluate on the validation loader.

pub mod sink;

pub use sink::{JsonlSink, MetricsSink, NullSink};

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

use crate::core::{Network, TPResult};
use crate::data::BatchLoader;
use crate::Config;

/// Per-epoch summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean task loss per sample; `None` for the warm-up epoch
    pub train_loss: Option<f32>,
    pub train_accuracy: Option<f32>,
    pub valid_loss: f32,
    pub valid_accuracy: Option<f32>,
    /// Mean over batches of the last backward round's reconstruction loss
    pub reconstruction_loss: Option<f32>,
    pub elapsed_secs: f32,
}

fn mean(values: &[f32]) -> Option<f32> {
    (!values.is_empty()).then(|| values.iter().sum::<f32>() / values.len() as f32)
}

/// Train `network` for `config.epochs` epochs after one warm-up epoch.
///
/// # Errors
/// - `Numerical` as soon as a batch produces a non-finite loss
/// - any error from the network or loss on malformed batches
pub fn train(
    network: &mut Network,
    train_loader: &mut BatchLoader,
    valid_loader: &mut BatchLoader,
    config: &Config,
    sink: &mut dyn MetricsSink,
) -> TPResult<Vec<EpochMetrics>> {
    let mut history = Vec::with_capacity(config.epochs + 1);
    for epoch in 0..=config.epochs {
        let epoch_start = Instant::now();
        let mut reconstruction = Vec::new();
        let mut total_loss = 0.0f32;
        let mut correct = Some(0usize);
        let mut seen = 0usize;

        for (x, targets) in train_loader.batches() {
            if epoch == 0 {
                if let Some(r) = network.train_back_weights(&x, config)? {
                    reconstruction.push(r);
                }
                continue;
            }
            let step = network.train_step(&x, &targets, config)?;
            total_loss += step.loss;
            correct = correct.zip(step.correct).map(|(a, b)| a + b);
            seen += x.nrows();
            if let Some(r) = step.reconstruction_loss {
                reconstruction.push(r);
            }
        }

        let (valid_loss, valid_accuracy) = network.external_test(valid_loader)?;
        let (train_loss, train_accuracy) = if epoch == 0 || seen == 0 {
            (None, None)
        } else {
            let n = seen as f32;
            (Some(total_loss / n), correct.map(|c| c as f32 / n))
        };
        let metrics = EpochMetrics {
            epoch,
            train_loss,
            train_accuracy,
            valid_loss,
            valid_accuracy,
            reconstruction_loss: mean(&reconstruction),
            elapsed_secs: epoch_start.elapsed().as_secs_f32(),
        };
        info!(
            epoch,
            train_loss = ?metrics.train_loss,
            train_acc = ?metrics.train_accuracy,
            valid_loss = metrics.valid_loss,
            valid_acc = ?metrics.valid_accuracy,
            reconstruction = ?metrics.reconstruction_loss,
            secs = metrics.elapsed_secs,
            "epoch done"
        );
        sink.log_epoch(&metrics);
        history.push(metrics);
    }
    Ok(history)
}

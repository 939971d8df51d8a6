//! The layer chain and its two-phase training step.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{expect_cols, FunctionParams, Layer, TPError, TPResult};
use crate::config::{Device, FunctionKind, NetworkConfig, Slot};
use crate::data::BatchLoader;
use crate::loss::{Loss, Targets};
use crate::Config;

/// Weights keyed by `"layer_<i>.<slot>"`; `None` for parameter-free functions.
pub type NetworkState = BTreeMap<String, Option<Array2<f32>>>;

/// Outcome of one [`Network::train_step`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepMetrics {
    /// Task loss summed over the batch
    pub loss: f32,
    /// Correctly classified rows, if the targets are classes
    pub correct: Option<usize>,
    /// Summed reconstruction loss of the last backward repetition
    pub reconstruction_loss: Option<f32>,
}

/// A stack of target-propagation layers.
///
/// Layer 0 is input-adjacent. The last `direct_depth` layers get targets from
/// the task-loss gradient, every earlier layer from the inverse of the layer
/// above it.
#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Layer>,
    dims: Vec<usize>,
    direct_depth: usize,
    loss: Loss,
    device: Device,
    back_trainable: bool,
    rng: StdRng,
}

impl Network {
    /// Build the network described by `config`, drawing initial weights and all
    /// later perturbations from a generator seeded with `seed`.
    ///
    /// # Errors
    /// Any configuration error from [`NetworkConfig::validate`] or the layers.
    pub fn new(config: &NetworkConfig, loss: Loss, seed: u64) -> TPResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let dims = config.dims();
        let mut layers = Vec::with_capacity(config.depth);
        for d in 0..config.depth {
            let mut spec = config.layer.clone();
            if d + 1 == config.depth {
                spec.ff2.activation = config.last_activation;
            }
            layers.push(Layer::new(dims[d], dims[d + 1], dims[d + 1], &spec, &mut rng)?);
        }
        debug!(?dims, direct_depth = config.direct_depth, "network built");
        Ok(Self {
            layers,
            dims,
            direct_depth: config.direct_depth,
            loss,
            device: config.device,
            back_trainable: config.layer.bf1.kind == FunctionKind::Parameterized,
            rng,
        })
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn direct_depth(&self) -> usize {
        self.direct_depth
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// True iff bf1 is parameterized, i.e. the backward phase has work to do.
    pub fn back_trainable(&self) -> bool {
        self.back_trainable
    }

    /// Training forward pass, caching every layer's activations.
    pub fn forward(&mut self, x: &Array2<f32>) -> TPResult<Array2<f32>> {
        expect_cols(x, self.dims[0], "network input")?;
        let mut y = x.clone();
        for layer in &mut self.layers {
            y = layer.forward(&y)?.1;
        }
        Ok(y)
    }

    /// Forward pass without caching.
    pub fn predict(&self, x: &Array2<f32>) -> TPResult<Array2<f32>> {
        expect_cols(x, self.dims[0], "network input")?;
        let mut y = x.clone();
        for layer in &self.layers {
            y = layer.forward_eval(&y)?;
        }
        Ok(y)
    }

    /// Backward phase alone: `epochs_backward` rounds of inverse training for
    /// every layer whose inverse produces targets.
    ///
    /// Returns the summed reconstruction loss of the last round, or `None` when
    /// the inverses are not trainable.
    pub fn train_back_weights(&mut self, x: &Array2<f32>, config: &Config) -> TPResult<Option<f32>> {
        let top = self.depth() - self.direct_depth;
        if !self.back_trainable || config.epochs_backward == 0 || top == 0 {
            return Ok(None);
        }
        let lr = config.lr_backward / x.nrows().max(1) as f32;
        let mut first = None;
        let mut last = None;
        for round in 0..config.epochs_backward {
            self.forward(x)?;
            let mut total = 0.0;
            for d in (1..=top).rev() {
                let original = self.layers[d - 1].output().cloned().ok_or_else(|| {
                    TPError::ContractViolation(format!("layer {} has no cached output", d - 1))
                })?;
                total += self.layers[d].train_backward(
                    &original,
                    config.loss_feedback,
                    config.std_backward,
                    &mut self.rng,
                )?;
                self.layers[d].update_backward(lr);
            }
            debug!(round, reconstruction_loss = total, "backward round");
            first.get_or_insert(total);
            last = Some(total);
        }
        if let (Some(first), Some(last)) = (first, last) {
            if config.epochs_backward > 1 && (last >= first || last.is_nan()) {
                warn!(first, last, "numerical degeneracy: reconstruction loss did not decrease");
            }
        }
        Ok(last)
    }

    /// One training step on a batch: backward phase, target computation, then
    /// a local regression of every layer onto its target.
    ///
    /// # Errors
    /// - `Numerical` if the task loss is not finite
    /// - `ShapeMismatch` / `Configuration` from the loss on bad targets
    pub fn train_step(
        &mut self,
        x: &Array2<f32>,
        targets: &Targets,
        config: &Config,
    ) -> TPResult<StepMetrics> {
        let reconstruction_loss = self.train_back_weights(x, config)?;

        let output = self.forward(x)?;
        let eval = self.loss.evaluate(&output, targets)?;
        if !eval.loss.is_finite() {
            return Err(TPError::Numerical(format!("task loss {}", eval.loss)));
        }

        let depth = self.depth();
        let first_direct = depth - self.direct_depth;
        let mut grad = eval.grad;
        let mut layer_targets: Vec<Array2<f32>> = Vec::with_capacity(depth);
        for d in (0..depth).rev() {
            let target = if d >= first_direct {
                let y = self.layers[d].output().ok_or_else(|| {
                    TPError::ContractViolation(format!("layer {d} has no cached output"))
                })?;
                let target = y - &(config.stepsize * &grad);
                if d > first_direct {
                    grad = self.layers[d].output_grad_to_input(&grad)?;
                }
                target
            } else {
                let next = layer_targets.last().ok_or_else(|| {
                    TPError::ContractViolation(format!("no target above layer {d}"))
                })?;
                self.layers[d + 1].compute_target(next)?
            };
            layer_targets.push(target);
        }
        layer_targets.reverse();

        let lr = config.lr / x.nrows().max(1) as f32;
        for (d, (layer, target)) in self.layers.iter_mut().zip(&layer_targets).enumerate() {
            let local = layer.train_forward(target)?;
            layer.update_forward(lr);
            debug!(layer = d, local_loss = local, "forward update");
        }
        self.zero_grad();

        Ok(StepMetrics {
            loss: eval.loss,
            correct: eval.correct,
            reconstruction_loss,
        })
    }

    pub fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }

    fn state_key(layer: usize, slot: Slot) -> String {
        format!("layer_{layer}.{slot}")
    }

    /// Snapshot of every function's weight.
    pub fn get_state(&self) -> NetworkState {
        let mut state = NetworkState::new();
        for (i, layer) in self.layers.iter().enumerate() {
            for slot in Slot::ALL {
                state.insert(Self::state_key(i, slot), layer.params(slot).weight);
            }
        }
        state
    }

    /// Restore a snapshot taken by [`get_state`](Self::get_state).
    ///
    /// The network is left untouched unless every key and shape matches.
    ///
    /// # Errors
    /// - `ContractViolation` on a missing, unexpected or mis-shaped entry
    pub fn load_state(&mut self, state: &NetworkState) -> TPResult<()> {
        let expected = self.depth() * Slot::ALL.len();
        if state.len() != expected {
            return Err(TPError::ContractViolation(format!(
                "state has {} entries, network expects {expected}",
                state.len()
            )));
        }
        let mut layers = self.layers.clone();
        for (i, layer) in layers.iter_mut().enumerate() {
            for slot in Slot::ALL {
                let key = Self::state_key(i, slot);
                let weight = state
                    .get(&key)
                    .ok_or_else(|| TPError::ContractViolation(format!("missing state entry {key}")))?;
                layer
                    .load_params(slot, &FunctionParams { weight: weight.clone() })
                    .map_err(|e| TPError::ContractViolation(format!("{key}: {e}")))?;
            }
        }
        self.layers = layers;
        Ok(())
    }

    /// Mean loss per sample and accuracy over every batch of `loader`.
    ///
    /// Accuracy is `None` for value targets. An empty loader gives zero loss
    /// and, for a classification loss, zero accuracy.
    pub fn external_test(&self, loader: &mut BatchLoader) -> TPResult<(f32, Option<f32>)> {
        let mut total_loss = 0.0;
        let mut correct = Some(0usize);
        let mut seen = 0usize;
        for (x, targets) in loader.batches() {
            let output = self.predict(&x)?;
            let eval = self.loss.evaluate(&output, &targets)?;
            total_loss += eval.loss;
            correct = correct.zip(eval.correct).map(|(a, b)| a + b);
            seen += x.nrows();
        }
        if seen == 0 {
            return Ok((0.0, self.loss.is_classification().then_some(0.0)));
        }
        let n = seen as f32;
        Ok((total_loss / n, correct.map(|c| c as f32 / n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, NetworkConfig};
    use crate::core::{Activation, Init};
    use ndarray::array;

    fn config(algorithm: Algorithm) -> NetworkConfig {
        NetworkConfig {
            depth: 3,
            direct_depth: 1,
            in_dim: 4,
            hid_dim: 8,
            out_dim: 2,
            layer: algorithm.layer_spec(
                [Init::Orthogonal, Init::Orthogonal, Init::Uniform, Init::Orthogonal],
                -1.0,
            ),
            last_activation: Activation::Linear,
            device: Device::Cpu,
        }
    }

    #[test]
    fn test_dims_follow_config() {
        let net = Network::new(&config(Algorithm::Dtp { bn: false }), Loss::CrossEntropy, 1).unwrap();
        assert_eq!(net.dims(), &[4, 8, 8, 2]);
        assert_eq!(net.layers()[2].function(Slot::Ff2).activation(), Activation::Linear);
        assert_eq!(net.layers()[0].function(Slot::Ff2).activation(), Activation::Tanh);
        assert!(net.back_trainable());
    }

    #[test]
    fn test_fwdtp_backward_not_trainable() {
        let net = Network::new(&config(Algorithm::Fwdtp { bn: false }), Loss::CrossEntropy, 1).unwrap();
        assert!(!net.back_trainable());
    }

    #[test]
    fn test_state_keys() {
        let net = Network::new(&config(Algorithm::Dtp { bn: false }), Loss::CrossEntropy, 1).unwrap();
        let state = net.get_state();
        assert_eq!(state.len(), 12);
        assert!(state["layer_0.bf2"].is_none());
        assert_eq!(state["layer_1.ff1"].as_ref().unwrap().shape(), &[8, 8]);
        assert_eq!(state["layer_2.bf1"].as_ref().unwrap().shape(), &[8, 2]);
    }

    #[test]
    fn test_load_state_rejects_extra_key() {
        let mut net = Network::new(&config(Algorithm::Dtp { bn: false }), Loss::CrossEntropy, 1).unwrap();
        let mut state = net.get_state();
        state.remove("layer_0.ff1");
        state.insert("layer_9.ff1".into(), None);
        assert!(matches!(net.load_state(&state), Err(TPError::ContractViolation(_))));
    }

    #[test]
    fn test_train_step_returns_finite_loss() {
        let mut net = Network::new(&config(Algorithm::Dtp { bn: false }), Loss::CrossEntropy, 1).unwrap();
        let x = array![[0.1, 0.2, 0.3, 0.4], [0.5, -0.1, 0.0, 0.2]];
        let metrics = net
            .train_step(&x, &Targets::Classes(vec![0, 1]), &Config::default())
            .unwrap();
        assert!(metrics.loss.is_finite());
        assert!(metrics.reconstruction_loss.is_some());
    }
}

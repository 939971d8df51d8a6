//! A target-propagation layer.
//!
//! ```text
//!            ff1            ff2
//!   x (in) ------> h (hid) ------> y (out)
//!
//!            bf1            bf2
//!   t (out) -----> (in) ---------> target for x
//! ```
//!
//! bf1 approximates the inverse of `ff2 ∘ ff1`; bf2 either corrects it with the
//! observed reconstruction error (difference function) or passes it through.

use ndarray::Array2;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::Rng;
use tracing::debug;

use super::function::{Correction, Peer, Trace};
use super::{expect_cols, Function, FunctionParams, TPError, TPResult};
use crate::config::{FunctionKind, LayerSpec, LossFeedback, Slot};

/// Traces of the latest training forward pass.
#[derive(Debug, Clone)]
struct ForwardCache {
    ff1: Trace,
    ff2: Trace,
}

#[derive(Debug, Clone)]
pub struct Layer {
    in_dim: usize,
    hid_dim: usize,
    out_dim: usize,
    ff1: Function,
    ff2: Function,
    bf1: Function,
    bf2: Function,
    cache: Option<ForwardCache>,
}

/// Capability handle over a layer's ff1, ff2 and bf1.
struct LayerView<'a> {
    ff1: &'a Function,
    ff2: &'a Function,
    bf1: &'a Function,
}

impl Peer for LayerView<'_> {
    fn forward(&self, x: &Array2<f32>) -> TPResult<Array2<f32>> {
        let h = self.ff1.forward(x, None)?;
        self.ff2.forward(&h, None)
    }

    fn backward_1(&self, y: &Array2<f32>) -> TPResult<Array2<f32>> {
        self.bf1.forward(y, None)
    }
}

impl Layer {
    /// Build a layer `in_dim -> hid_dim -> out_dim` with its inverse `out_dim -> in_dim -> in_dim`.
    ///
    /// # Errors
    /// - `Configuration` if a difference function sits outside bf2, or any
    ///   function rejects its spec
    /// - `NotImplemented` for unimplemented init schemes
    pub fn new<R: Rng + ?Sized>(
        in_dim: usize,
        hid_dim: usize,
        out_dim: usize,
        spec: &LayerSpec,
        rng: &mut R,
    ) -> TPResult<Self> {
        for slot in [Slot::Ff1, Slot::Ff2, Slot::Bf1] {
            if spec.get(slot).kind == FunctionKind::Difference {
                return Err(TPError::Configuration(format!(
                    "difference function in slot {slot}"
                )));
            }
        }
        Ok(Self {
            in_dim,
            hid_dim,
            out_dim,
            ff1: Function::new(&spec.ff1, in_dim, hid_dim, rng)?,
            ff2: Function::new(&spec.ff2, hid_dim, out_dim, rng)?,
            bf1: Function::new(&spec.bf1, out_dim, in_dim, rng)?,
            bf2: Function::new(&spec.bf2, in_dim, in_dim, rng)?,
            cache: None,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn hid_dim(&self) -> usize {
        self.hid_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn function(&self, slot: Slot) -> &Function {
        match slot {
            Slot::Ff1 => &self.ff1,
            Slot::Ff2 => &self.ff2,
            Slot::Bf1 => &self.bf1,
            Slot::Bf2 => &self.bf2,
        }
    }

    pub fn function_mut(&mut self, slot: Slot) -> &mut Function {
        match slot {
            Slot::Ff1 => &mut self.ff1,
            Slot::Ff2 => &mut self.ff2,
            Slot::Bf1 => &mut self.bf1,
            Slot::Bf2 => &mut self.bf2,
        }
    }

    fn view(&self) -> LayerView<'_> {
        LayerView {
            ff1: &self.ff1,
            ff2: &self.ff2,
            bf1: &self.bf1,
        }
    }

    /// Training forward pass: `h = ff1(x)`, `y = ff2(h)`, caching both stages.
    pub fn forward(&mut self, x: &Array2<f32>) -> TPResult<(Array2<f32>, Array2<f32>)> {
        expect_cols(x, self.in_dim, "layer input")?;
        let (h, ff1) = self.ff1.forward_traced(x, None)?;
        let (y, ff2) = self.ff2.forward_traced(&h, None)?;
        self.cache = Some(ForwardCache { ff1, ff2 });
        Ok((h, y))
    }

    /// Forward pass without touching the cache.
    pub fn forward_eval(&self, x: &Array2<f32>) -> TPResult<Array2<f32>> {
        expect_cols(x, self.in_dim, "layer input")?;
        self.view().forward(x)
    }

    /// Input of the latest training forward pass.
    pub fn input(&self) -> Option<&Array2<f32>> {
        self.cache.as_ref().map(|c| &c.ff1.input)
    }

    /// Hidden activation of the latest training forward pass.
    pub fn hidden(&self) -> Option<&Array2<f32>> {
        self.cache.as_ref().map(|c| &c.ff1.output)
    }

    /// Output of the latest training forward pass.
    pub fn output(&self) -> Option<&Array2<f32>> {
        self.cache.as_ref().map(|c| &c.ff2.output)
    }

    fn cache(&self) -> TPResult<&ForwardCache> {
        self.cache.as_ref().ok_or_else(|| {
            TPError::ContractViolation("layer used before a training forward pass".into())
        })
    }

    /// Map `y` back to the input space: bf2(bf1(y)), with `original` feeding the
    /// difference correction.
    pub fn invert(&self, y: &Array2<f32>, original: &Array2<f32>) -> TPResult<Array2<f32>> {
        expect_cols(y, self.out_dim, "layer target")?;
        let view = self.view();
        let correction = Correction {
            original,
            peer: &view,
        };
        let h = self.bf1.forward(y, Some(correction))?;
        self.bf2.forward(&h, Some(correction))
    }

    /// Target for this layer's input given the target of its output, using the
    /// cached input as `original`.
    ///
    /// # Errors
    /// - `ContractViolation` if no training forward pass has been run
    pub fn compute_target(&self, next_target: &Array2<f32>) -> TPResult<Array2<f32>> {
        let original = &self.cache()?.ff1.input;
        self.invert(next_target, original)
    }

    /// Accumulate bf1 gradients for one round of inverse training around
    /// `original` (the true input of this layer). Returns the reconstruction loss.
    ///
    /// With `ε, η ~ N(0, std)` and `f` this layer's forward transform:
    /// ```text
    /// DTP    ‖bf1(f(h+ε)) − (h+ε)‖²
    /// DRL    ‖bf1(f(h+ε)) − bf1(f(h)) − ε‖²
    /// L-DRL  −2 Σ ε ⊙ bf1(f(h+ε)) + ‖bf1(f(h)+η) − bf1(f(h))‖²
    /// ```
    pub fn train_backward<R: Rng + ?Sized>(
        &mut self,
        original: &Array2<f32>,
        feedback: LossFeedback,
        std: f32,
        rng: &mut R,
    ) -> TPResult<f32> {
        expect_cols(original, self.in_dim, "backward training input")?;
        let noise = Normal::new(0.0f32, std)
            .map_err(|e| TPError::Configuration(format!("std_backward {std}: {e}")))?;
        let eps = Array2::random_using(original.dim(), noise, rng);
        let q = original + &eps;
        let upper_q = self.forward_eval(&q)?;

        let loss = match feedback {
            LossFeedback::Dtp => {
                let (rec, trace) = self.bf1.forward_traced(&upper_q, None)?;
                let diff = &rec - &q;
                self.bf1.backward(&trace, &(2.0 * &diff))?;
                diff.mapv(|v| v * v).sum()
            }
            LossFeedback::Drl => {
                let upper_h = self.forward_eval(original)?;
                let (rec_q, trace_q) = self.bf1.forward_traced(&upper_q, None)?;
                let (rec_h, trace_h) = self.bf1.forward_traced(&upper_h, None)?;
                let diff = &rec_q - &rec_h - &eps;
                let grad = 2.0 * &diff;
                self.bf1.backward(&trace_q, &grad)?;
                self.bf1.backward(&trace_h, &(-&grad))?;
                diff.mapv(|v| v * v).sum()
            }
            LossFeedback::LDrl => {
                let upper_h = self.forward_eval(original)?;
                let eta = Array2::random_using(upper_h.dim(), noise, rng);
                let (rec_q, trace_q) = self.bf1.forward_traced(&upper_q, None)?;
                let (rec_p, trace_p) = self.bf1.forward_traced(&(&upper_h + &eta), None)?;
                let (rec_h, trace_h) = self.bf1.forward_traced(&upper_h, None)?;
                let diff = &rec_p - &rec_h;
                let grad = 2.0 * &diff;
                self.bf1.backward(&trace_q, &(-2.0 * &eps))?;
                self.bf1.backward(&trace_p, &grad)?;
                self.bf1.backward(&trace_h, &(-&grad))?;
                -2.0 * (&eps * &rec_q).sum() + diff.mapv(|v| v * v).sum()
            }
        };
        debug!(?feedback, loss, "backward reconstruction");
        Ok(loss)
    }

    /// Step both backward functions.
    pub fn update_backward(&mut self, lr: f32) {
        self.bf1.update(lr);
        self.bf2.update(lr);
    }

    /// Accumulate ff1/ff2 gradients of the local loss `‖y − target‖²` on the
    /// cached forward pass. Returns the local loss.
    ///
    /// # Errors
    /// - `ContractViolation` if no training forward pass has been run
    /// - `ShapeMismatch` if `target` does not match the cached output
    pub fn train_forward(&mut self, target: &Array2<f32>) -> TPResult<f32> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            TPError::ContractViolation("train_forward before a training forward pass".into())
        })?;
        if cache.ff2.output.dim() != target.dim() {
            return Err(TPError::ShapeMismatch(format!(
                "target {:?} vs output {:?}",
                target.shape(),
                cache.ff2.output.shape()
            )));
        }
        let diff = &cache.ff2.output - target;
        let grad_h = self.ff2.backward(&cache.ff2, &(2.0 * &diff))?;
        self.ff1.backward(&cache.ff1, &grad_h)?;
        Ok(diff.mapv(|v| v * v).sum())
    }

    /// Step both forward functions.
    pub fn update_forward(&mut self, lr: f32) {
        self.ff1.update(lr);
        self.ff2.update(lr);
    }

    /// Gradient of a loss with respect to this layer's input, given its gradient
    /// with respect to the cached output. Weight gradients are left untouched.
    pub fn output_grad_to_input(&self, grad_y: &Array2<f32>) -> TPResult<Array2<f32>> {
        let cache = self.cache()?;
        let grad_h = self.ff2.input_grad(&cache.ff2, grad_y)?;
        self.ff1.input_grad(&cache.ff1, &grad_h)
    }

    pub fn zero_grad(&mut self) {
        for slot in Slot::ALL {
            self.function_mut(slot).zero_grad();
        }
    }

    pub fn params(&self, slot: Slot) -> FunctionParams {
        self.function(slot).params()
    }

    pub fn load_params(&mut self, slot: Slot, params: &FunctionParams) -> TPResult<()> {
        self.function_mut(slot).load_params(params)
    }
}

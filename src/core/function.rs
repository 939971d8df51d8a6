//! Function objects: the four variants filling a layer's ff1/ff2/bf1/bf2 slots.
//!
//! | variant | weight | trained | forward |
//! |---|---|---|---|
//! | identity | `eye(out, in)` | no | `act(x Wᵀ)` |
//! | parameterized | init scheme | yes | `act(x Wᵀ)` |
//! | random | init scheme | no | `act(x Wᵀ)` |
//! | difference | none | no | `act(x + h - g(f(h)))` |
//!
//! Gradients are computed explicitly: [`Function::forward_traced`] records the
//! input and pre-activation, and [`Function::backward`] turns an output
//! gradient into an input gradient while accumulating the weight gradient.
//! [`Function::update`] then builds a fresh weight and drops the gradient, so no
//! state carries over from one step to the next.

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{expect_cols, Activation, TPError, TPResult};
use crate::config::{FunctionKind, FunctionSpec};

/// Read-only view of the owning layer used by the difference correction.
///
/// Exposes exactly what the correction needs, so a function never holds a
/// reference to the layer that owns it.
pub trait Peer {
    /// Layer forward transform (ff1 then ff2), without caching.
    fn forward(&self, x: &Array2<f32>) -> TPResult<Array2<f32>>;
    /// The layer's first backward function.
    fn backward_1(&self, y: &Array2<f32>) -> TPResult<Array2<f32>>;
}

/// The `original` argument of a backward evaluation: the layer's true input and
/// a handle to the layer's own functions.
#[derive(Clone, Copy)]
pub struct Correction<'a> {
    pub original: &'a Array2<f32>,
    pub peer: &'a dyn Peer,
}

/// Values recorded by a traced forward pass.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Input batch, shape (batch, in_dim)
    pub input: Array2<f32>,
    /// Pre-activation, shape (batch, out_dim)
    pub pre: Array2<f32>,
    /// Output, shape (batch, out_dim)
    pub output: Array2<f32>,
}

/// Checkpoint payload of one function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParams {
    pub weight: Option<Array2<f32>>,
}

/// Fixed identity-like projection.
#[derive(Debug, Clone)]
pub struct Identity {
    activation: Activation,
    weight: Array2<f32>,
}

/// Trainable linear map followed by an activation.
#[derive(Debug, Clone)]
pub struct Parameterized {
    activation: Activation,
    weight: Array2<f32>,
    grad: Option<Array2<f32>>,
}

/// Fixed random linear map followed by an activation.
#[derive(Debug, Clone)]
pub struct Random {
    activation: Activation,
    weight: Array2<f32>,
}

/// Difference correction of the layer's first backward function.
#[derive(Debug, Clone)]
pub struct Difference {
    activation: Activation,
    dim: usize,
}

#[derive(Debug, Clone)]
pub enum Function {
    Identity(Identity),
    Parameterized(Parameterized),
    Random(Random),
    Difference(Difference),
}

impl Function {
    /// Build a function mapping `in_dim` to `out_dim` columns.
    ///
    /// # Errors
    /// - `Configuration` for an activation the variant does not support, a
    ///   difference function with `in_dim != out_dim`, or a sparsity ratio >= 1
    /// - `NotImplemented` for a declared but unimplemented init scheme
    pub fn new<R: Rng + ?Sized>(
        spec: &FunctionSpec,
        in_dim: usize,
        out_dim: usize,
        rng: &mut R,
    ) -> TPResult<Self> {
        let activation = spec.activation;
        match spec.kind {
            FunctionKind::Identity => {
                require_linear(activation, "identity")?;
                let mut weight = Array2::zeros((out_dim, in_dim));
                for i in 0..out_dim.min(in_dim) {
                    weight[[i, i]] = 1.0;
                }
                Ok(Function::Identity(Identity { activation, weight }))
            }
            FunctionKind::Parameterized => {
                let weight = sparsify(spec.init.weight(out_dim, in_dim, rng)?, spec.sparsity, rng)?;
                Ok(Function::Parameterized(Parameterized {
                    activation,
                    weight,
                    grad: None,
                }))
            }
            FunctionKind::Random => {
                let weight = sparsify(spec.init.weight(out_dim, in_dim, rng)?, spec.sparsity, rng)?;
                Ok(Function::Random(Random { activation, weight }))
            }
            FunctionKind::Difference => {
                require_linear(activation, "difference")?;
                if in_dim != out_dim {
                    return Err(TPError::Configuration(format!(
                        "difference function must be square, got {in_dim} -> {out_dim}"
                    )));
                }
                Ok(Function::Difference(Difference {
                    activation,
                    dim: in_dim,
                }))
            }
        }
    }

    pub fn kind(&self) -> FunctionKind {
        match self {
            Function::Identity(_) => FunctionKind::Identity,
            Function::Parameterized(_) => FunctionKind::Parameterized,
            Function::Random(_) => FunctionKind::Random,
            Function::Difference(_) => FunctionKind::Difference,
        }
    }

    pub fn activation(&self) -> Activation {
        match self {
            Function::Identity(f) => f.activation,
            Function::Parameterized(f) => f.activation,
            Function::Random(f) => f.activation,
            Function::Difference(f) => f.activation,
        }
    }

    /// Weight matrix of shape (out_dim, in_dim), if the variant has one.
    pub fn weight(&self) -> Option<&Array2<f32>> {
        match self {
            Function::Identity(f) => Some(&f.weight),
            Function::Parameterized(f) => Some(&f.weight),
            Function::Random(f) => Some(&f.weight),
            Function::Difference(_) => None,
        }
    }

    pub fn in_dim(&self) -> usize {
        match self {
            Function::Difference(f) => f.dim,
            _ => self.weight().map_or(0, |w| w.ncols()),
        }
    }

    pub fn out_dim(&self) -> usize {
        match self {
            Function::Difference(f) => f.dim,
            _ => self.weight().map_or(0, |w| w.nrows()),
        }
    }

    /// Evaluate the function on a batch of shape (batch, in_dim).
    ///
    /// `original` is ignored by the weighted variants and mandatory for the
    /// difference correction.
    ///
    /// # Errors
    /// - `ContractViolation` if a difference function gets no `original`
    /// - `ShapeMismatch` if `input` does not have `in_dim` columns
    pub fn forward(
        &self,
        input: &Array2<f32>,
        original: Option<Correction<'_>>,
    ) -> TPResult<Array2<f32>> {
        let pre = self.pre_activation(input, original)?;
        Ok(self.activation().apply(&pre))
    }

    /// Like [`forward`](Self::forward), also returning the values needed by
    /// [`backward`](Self::backward).
    pub fn forward_traced(
        &self,
        input: &Array2<f32>,
        original: Option<Correction<'_>>,
    ) -> TPResult<(Array2<f32>, Trace)> {
        let pre = self.pre_activation(input, original)?;
        let output = self.activation().apply(&pre);
        let trace = Trace {
            input: input.clone(),
            pre,
            output: output.clone(),
        };
        Ok((output, trace))
    }

    fn pre_activation(
        &self,
        input: &Array2<f32>,
        original: Option<Correction<'_>>,
    ) -> TPResult<Array2<f32>> {
        expect_cols(input, self.in_dim(), "function input")?;
        match self {
            Function::Difference(_) => {
                let c = original.ok_or_else(|| {
                    TPError::ContractViolation(
                        "difference function evaluated without `original`".into(),
                    )
                })?;
                if c.original.dim() != input.dim() {
                    return Err(TPError::ShapeMismatch(format!(
                        "difference input {:?} vs original {:?}",
                        input.shape(),
                        c.original.shape()
                    )));
                }
                let upper = c.peer.forward(c.original)?;
                let rec = c.peer.backward_1(&upper)?;
                if rec.dim() != input.dim() {
                    return Err(TPError::ShapeMismatch(format!(
                        "reconstruction {:?} vs input {:?}",
                        rec.shape(),
                        input.shape()
                    )));
                }
                Ok(input + &(c.original - &rec))
            }
            _ => {
                let w = self.weight().ok_or_else(|| {
                    TPError::ContractViolation("weighted function without weight".into())
                })?;
                Ok(input.dot(&w.t()))
            }
        }
    }

    /// Gradient with respect to the input, without touching any weight gradient.
    pub fn input_grad(&self, trace: &Trace, grad_out: &Array2<f32>) -> TPResult<Array2<f32>> {
        if grad_out.dim() != trace.pre.dim() {
            return Err(TPError::ShapeMismatch(format!(
                "output gradient {:?} vs output {:?}",
                grad_out.shape(),
                trace.pre.shape()
            )));
        }
        let grad_pre = self.activation().backward(&trace.pre, grad_out);
        Ok(match self.weight() {
            Some(w) => grad_pre.dot(w),
            None => grad_pre,
        })
    }

    /// Back-propagate `grad_out` through this function.
    ///
    /// Trainable variants add `(∂L/∂z)ᵀ x` to their accumulated gradient; all
    /// variants return the gradient with respect to the input.
    pub fn backward(&mut self, trace: &Trace, grad_out: &Array2<f32>) -> TPResult<Array2<f32>> {
        let grad_in = self.input_grad(trace, grad_out)?;
        if let Function::Parameterized(f) = self {
            let grad_pre = f.activation.backward(&trace.pre, grad_out);
            let grad_w = grad_pre.t().dot(&trace.input);
            match f.grad.as_mut() {
                Some(g) => *g += &grad_w,
                None => f.grad = Some(grad_w),
            }
        }
        Ok(grad_in)
    }

    /// One gradient-descent step: `W ← W − lr · ∇W`.
    ///
    /// The gradient is consumed; a step without an accumulated gradient, or on
    /// an untrained variant, changes nothing.
    pub fn update(&mut self, lr: f32) {
        if let Function::Parameterized(f) = self {
            if let Some(grad) = f.grad.take() {
                f.weight = &f.weight - &(lr * &grad);
            }
        }
    }

    pub fn zero_grad(&mut self) {
        if let Function::Parameterized(f) = self {
            if let Some(g) = f.grad.as_mut() {
                g.fill(0.0);
            }
        }
    }

    /// Accumulated weight gradient; always `None` for untrained variants.
    pub fn grad(&self) -> Option<&Array2<f32>> {
        match self {
            Function::Parameterized(f) => f.grad.as_ref(),
            _ => None,
        }
    }

    pub fn params(&self) -> FunctionParams {
        FunctionParams {
            weight: self.weight().cloned(),
        }
    }

    /// Restore the weight saved by [`params`](Self::params).
    ///
    /// # Errors
    /// - `ContractViolation` if the payload's presence or shape of a weight does
    ///   not match this function
    pub fn load_params(&mut self, params: &FunctionParams) -> TPResult<()> {
        let slot = match self {
            Function::Identity(f) => Some(&mut f.weight),
            Function::Parameterized(f) => {
                f.grad = None;
                Some(&mut f.weight)
            }
            Function::Random(f) => Some(&mut f.weight),
            Function::Difference(_) => None,
        };
        match (slot, params.weight.as_ref()) {
            (None, None) => Ok(()),
            (Some(w), Some(saved)) if w.dim() == saved.dim() => {
                w.assign(saved);
                Ok(())
            }
            (Some(w), Some(saved)) => Err(TPError::ContractViolation(format!(
                "saved weight {:?} does not fit {:?}",
                saved.shape(),
                w.shape()
            ))),
            (Some(_), None) => Err(TPError::ContractViolation(
                "missing weight for a weighted function".into(),
            )),
            (None, Some(_)) => Err(TPError::ContractViolation(
                "weight given for a parameter-free function".into(),
            )),
        }
    }
}

fn require_linear(activation: Activation, kind: &str) -> TPResult<()> {
    if activation.is_linear() {
        Ok(())
    } else {
        Err(TPError::Configuration(format!(
            "activation '{activation}' for a {kind} function"
        )))
    }
}

/// Zero a random `ratio` of the entries of `w`.
fn sparsify<R: Rng + ?Sized>(
    mut w: Array2<f32>,
    ratio: Option<f32>,
    rng: &mut R,
) -> TPResult<Array2<f32>> {
    match ratio {
        None => Ok(w),
        Some(r) if r <= 0.0 => Ok(w),
        Some(r) if r >= 1.0 => Err(TPError::Configuration(format!("sparse ratio {r}"))),
        Some(r) => {
            w.mapv_inplace(|v| if rng.gen::<f32>() < r { 0.0 } else { v });
            Ok(w)
        }
    }
}

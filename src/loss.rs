//! Task losses evaluated at the network output.
//!
//! All losses are summed over the batch. The network turns the output gradient
//! into targets for the last layers (`target = y − stepsize · ∂L/∂y`).

use ndarray::{Array2, Axis};

use crate::core::{TPError, TPResult};
use crate::utils::{argmax, log_sum_exp, softmax_rows};

/// Supervision for one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    /// One class index per row
    Classes(Vec<usize>),
    /// Regression targets, same shape as the output
    Values(Array2<f32>),
}

impl Targets {
    pub fn len(&self) -> usize {
        match self {
            Targets::Classes(c) => c.len(),
            Targets::Values(v) => v.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows `indices`, in order.
    pub fn select(&self, indices: &[usize]) -> Targets {
        match self {
            Targets::Classes(c) => Targets::Classes(indices.iter().map(|&i| c[i]).collect()),
            Targets::Values(v) => Targets::Values(v.select(Axis(0), indices)),
        }
    }
}

/// Loss value, output gradient and (for class targets) the correct count.
#[derive(Debug, Clone)]
pub struct LossEval {
    pub loss: f32,
    pub grad: Array2<f32>,
    pub correct: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    /// Softmax cross-entropy
    CrossEntropy,
    /// Label augmentation: output unit `j` votes for class `j % num_classes`
    Combined { num_classes: usize },
    /// `Σ (y − t)²`
    SquaredError,
}

impl Loss {
    /// Cross-entropy, switched to the combined loss under label augmentation.
    pub fn for_classes(label_augmentation: bool, num_classes: usize) -> Self {
        if label_augmentation {
            Loss::Combined { num_classes }
        } else {
            Loss::CrossEntropy
        }
    }

    /// True for losses on class targets, which also report accuracy.
    pub fn is_classification(&self) -> bool {
        !matches!(self, Loss::SquaredError)
    }

    /// Per-class logits seen by the loss.
    pub fn class_logits(&self, output: &Array2<f32>) -> Array2<f32> {
        match *self {
            Loss::Combined { num_classes } if num_classes > 0 => {
                let mut logits = Array2::zeros((output.nrows(), num_classes));
                for (j, col) in output.axis_iter(Axis(1)).enumerate() {
                    let mut dst = logits.column_mut(j % num_classes);
                    dst += &col;
                }
                logits
            }
            _ => output.clone(),
        }
    }

    /// Predicted class per row.
    pub fn predict_classes(&self, output: &Array2<f32>) -> Vec<usize> {
        self.class_logits(output)
            .axis_iter(Axis(0))
            .map(argmax)
            .collect()
    }

    /// # Errors
    /// - `ShapeMismatch` if the batch sizes or value shapes disagree
    /// - `Configuration` for value targets on a classification loss and vice versa,
    ///   or a class index outside the logits
    pub fn evaluate(&self, output: &Array2<f32>, targets: &Targets) -> TPResult<LossEval> {
        if targets.len() != output.nrows() {
            return Err(TPError::ShapeMismatch(format!(
                "{} targets for {} outputs",
                targets.len(),
                output.nrows()
            )));
        }
        match (self, targets) {
            (Loss::SquaredError, Targets::Values(t)) => {
                if t.dim() != output.dim() {
                    return Err(TPError::ShapeMismatch(format!(
                        "targets {:?} vs output {:?}",
                        t.shape(),
                        output.shape()
                    )));
                }
                let diff = output - t;
                Ok(LossEval {
                    loss: diff.mapv(|v| v * v).sum(),
                    grad: 2.0 * &diff,
                    correct: None,
                })
            }
            (Loss::Combined { num_classes: 0 }, _) => Err(TPError::Configuration(
                "combined loss needs at least one class".into(),
            )),
            (Loss::CrossEntropy | Loss::Combined { .. }, Targets::Classes(classes)) => {
                let logits = self.class_logits(output);
                let n_classes = logits.ncols();
                if let Some(bad) = classes.iter().find(|&&c| c >= n_classes) {
                    return Err(TPError::Configuration(format!(
                        "class {bad} outside {n_classes} logits"
                    )));
                }
                let mut loss = 0.0;
                let mut correct = 0;
                for (row, &c) in logits.axis_iter(Axis(0)).zip(classes) {
                    loss += log_sum_exp(row) - row[c];
                    if argmax(row) == c {
                        correct += 1;
                    }
                }
                let mut grad_logits = softmax_rows(&logits);
                for (i, &c) in classes.iter().enumerate() {
                    grad_logits[[i, c]] -= 1.0;
                }
                let grad = match *self {
                    Loss::Combined { num_classes } => {
                        let mut grad = Array2::zeros(output.dim());
                        for (j, mut col) in grad.axis_iter_mut(Axis(1)).enumerate() {
                            col.assign(&grad_logits.column(j % num_classes));
                        }
                        grad
                    }
                    _ => grad_logits,
                };
                Ok(LossEval {
                    loss,
                    grad,
                    correct: Some(correct),
                })
            }
            (loss, _) => Err(TPError::Configuration(format!(
                "{loss:?} does not accept these targets"
            ))),
        }
    }
}

//! Activation functions and batch-statistics normalization.
//!
//! Every function object ends in one of four activations:
//! ```text
//! linear     y = z
//! tanh       y = tanh(z)
//! linear-BN  y = BN(z)
//! tanh-BN    y = BN(tanh(z))
//! ```
//! `BN` normalizes each column with the statistics of the current batch and has
//! no learned affine parameters, so its backward pass couples all rows of a column.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::TPError;

/// Added to the batch variance before taking the square root.
pub const BN_EPS: f32 = 1e-5;

/// Elementwise nonlinearity, optionally followed by batch normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    #[serde(rename = "linear")]
    Linear,
    #[serde(rename = "tanh")]
    Tanh,
    #[serde(rename = "linear-BN")]
    LinearBn,
    #[serde(rename = "tanh-BN")]
    TanhBn,
}

impl Activation {
    /// Apply the activation to a pre-activation batch `z` of shape (batch, dim).
    pub fn apply(&self, z: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Linear => z.clone(),
            Activation::Tanh => z.mapv(f32::tanh),
            Activation::LinearBn => batch_normalization(z),
            Activation::TanhBn => batch_normalization(&z.mapv(f32::tanh)),
        }
    }

    /// Gradient with respect to `z`, given the gradient with respect to the output.
    pub fn backward(&self, z: &Array2<f32>, grad_y: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Linear => grad_y.clone(),
            Activation::Tanh => grad_y * &z.mapv(d_tanh),
            Activation::LinearBn => batch_normalization_backward(z, grad_y),
            Activation::TanhBn => {
                let t = z.mapv(f32::tanh);
                batch_normalization_backward(&t, grad_y) * &t.mapv(|v| 1.0 - v * v)
            }
        }
    }

    /// Linear activations (with or without BN) are the only ones accepted by
    /// identity and difference functions.
    pub fn is_linear(&self) -> bool {
        matches!(self, Activation::Linear | Activation::LinearBn)
    }

    /// Tag used on the command line and in checkpoints.
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Tanh => "tanh",
            Activation::LinearBn => "linear-BN",
            Activation::TanhBn => "tanh-BN",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = TPError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" | "identity" => Ok(Activation::Linear),
            "tanh" => Ok(Activation::Tanh),
            "linear-BN" => Ok(Activation::LinearBn),
            "tanh-BN" => Ok(Activation::TanhBn),
            other => Err(TPError::Configuration(format!("activation '{other}'"))),
        }
    }
}

#[inline]
fn d_tanh(x: f32) -> f32 {
    let t = x.tanh();
    1.0 - t * t
}

/// Per-column centred values, standard deviations and the variance denominator.
fn column_stats(x: &Array2<f32>) -> (Array2<f32>, Array1<f32>, f32) {
    let n = x.nrows();
    let mean = x
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()));
    let centered = x - &mean;
    // unbiased variance; a single-row batch centres to zero anyway
    let denom = (n.max(2) - 1) as f32;
    let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / denom;
    let std = var.mapv(|v| (v + BN_EPS).sqrt());
    (centered, std, denom)
}

/// Normalize each column of `x` to zero mean and unit (unbiased) variance.
pub fn batch_normalization(x: &Array2<f32>) -> Array2<f32> {
    if x.nrows() == 0 {
        return x.clone();
    }
    let (centered, std, _) = column_stats(x);
    centered / &std
}

/// Backward pass of [`batch_normalization`].
///
/// With `y = c / s` per column:
/// ```text
/// dL/dx = (g - mean(g) - y * Σ(g ⊙ y) / (n - 1)) / s
/// ```
pub fn batch_normalization_backward(x: &Array2<f32>, grad_y: &Array2<f32>) -> Array2<f32> {
    if x.nrows() == 0 {
        return grad_y.clone();
    }
    let (centered, std, denom) = column_stats(x);
    let y = &centered / &std;
    let g_mean = grad_y
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()));
    let gy = (grad_y * &y).sum_axis(Axis(0)) / denom;
    (grad_y - &g_mean - &(&y * &gy)) / &std
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn weighted_sum(act: Activation, z: &Array2<f32>, w: &Array2<f32>) -> f32 {
        (&act.apply(z) * w).sum()
    }

    fn check_gradient(act: Activation) {
        let z = array![[0.3, -1.2, 0.5], [1.1, 0.4, -0.7], [-0.2, 0.9, 0.1], [0.6, -0.3, 1.4]];
        let w = array![[1.0, -0.5, 0.2], [0.3, 0.8, -1.0], [-0.6, 0.1, 0.4], [0.9, -0.2, 0.7]];
        let analytic = act.backward(&z, &w);

        let h = 1e-3;
        for i in 0..z.nrows() {
            for j in 0..z.ncols() {
                let mut plus = z.clone();
                plus[[i, j]] += h;
                let mut minus = z.clone();
                minus[[i, j]] -= h;
                let numeric =
                    (weighted_sum(act, &plus, &w) - weighted_sum(act, &minus, &w)) / (2.0 * h);
                assert!(
                    (numeric - analytic[[i, j]]).abs() < 1e-2,
                    "{act}: d/dz[{i},{j}] numeric {numeric} vs analytic {}",
                    analytic[[i, j]]
                );
            }
        }
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        for act in [
            Activation::Linear,
            Activation::Tanh,
            Activation::LinearBn,
            Activation::TanhBn,
        ] {
            check_gradient(act);
        }
    }

    #[test]
    fn test_batch_normalization_columns() {
        let x = array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0]];
        let y = batch_normalization(&x);
        for col in y.columns() {
            assert!(col.sum().abs() < 1e-5);
            let var = col.mapv(|v| v * v).sum() / 2.0;
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_single_row_batch_is_finite() {
        let x = array![[4.0, -2.0]];
        let y = batch_normalization(&x);
        assert!(y.iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!("tanh-BN".parse::<Activation>().unwrap(), Activation::TanhBn);
        assert_eq!("linear".parse::<Activation>().unwrap(), Activation::Linear);
        assert!("relu".parse::<Activation>().is_err());
    }
}

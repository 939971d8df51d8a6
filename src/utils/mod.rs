//! Math utilities: orthonormalization, log-sum-exp, argmax.

use ndarray::{Array2, ArrayView1, Axis};

/// Orthonormalize the columns of `a` (rows >= cols) in place with two passes of
/// modified Gram-Schmidt.
///
/// The implicit R factor has a positive diagonal, which matches the sign
/// convention of a QR-based orthogonal initializer.
pub fn orthonormalize_columns(a: &mut Array2<f32>) {
    let k = a.ncols();
    for _pass in 0..2 {
        for j in 0..k {
            for i in 0..j {
                let proj = a.column(i).dot(&a.column(j));
                let qi = a.column(i).to_owned();
                a.column_mut(j).scaled_add(-proj, &qi);
            }
            let norm = a.column(j).dot(&a.column(j)).sqrt().max(f32::MIN_POSITIVE);
            a.column_mut(j).mapv_inplace(|v| v / norm);
        }
    }
}

/// Numerically stable `log(Σ exp(x))`.
#[inline]
pub fn log_sum_exp(x: ArrayView1<f32>) -> f32 {
    let max = x.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if !max.is_finite() {
        return max;
    }
    max + x.mapv(|v| (v - max).exp()).sum().ln()
}

/// Index of the largest entry (first one on ties).
#[inline]
pub fn argmax(x: ArrayView1<f32>) -> usize {
    x.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0
}

/// Row-wise softmax of a (batch, classes) matrix.
pub fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let lse = log_sum_exp(row.view());
        row.mapv_inplace(|v| (v - lse).exp());
    }
    out
}

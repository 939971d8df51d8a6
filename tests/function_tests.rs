//! Tests for the function variants and activations through the public API.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

use targetprop::config::{FunctionKind, FunctionSpec};
use targetprop::core::Function;
use targetprop::{Activation, Init, TPError};

fn build(kind: FunctionKind, activation: Activation, in_dim: usize, out_dim: usize) -> Function {
    let mut rng = StdRng::seed_from_u64(17);
    Function::new(&FunctionSpec::new(kind, activation, Init::Orthogonal), in_dim, out_dim, &mut rng)
        .expect("function")
}

// ============================================================================
// Shapes
// ============================================================================

#[test]
fn test_weighted_variants_map_batch_shapes() {
    let x = Array2::from_elem((5, 3), 0.1);
    for kind in [FunctionKind::Identity, FunctionKind::Parameterized, FunctionKind::Random] {
        let f = build(kind, Activation::Linear, 3, 7);
        let y = f.forward(&x, None).expect("forward");
        assert_eq!(y.shape(), &[5, 7], "{kind:?}");
        assert_eq!((f.in_dim(), f.out_dim()), (3, 7));
    }
}

#[test]
fn test_identity_is_rectangular_eye() {
    let f = build(FunctionKind::Identity, Activation::Linear, 3, 2);
    let y = f.forward(&array![[1.0, 2.0, 3.0]], None).expect("forward");
    assert_eq!(y, array![[1.0, 2.0]]);
}

#[test]
fn test_unimplemented_init_fails_at_construction() {
    let mut rng = StdRng::seed_from_u64(0);
    let spec = FunctionSpec::new(FunctionKind::Parameterized, Activation::Tanh, Init::LowRank(2));
    let result = Function::new(&spec, 4, 4, &mut rng);
    assert!(matches!(result, Err(TPError::NotImplemented(_))));
}

// ============================================================================
// Updates
// ============================================================================

#[test]
fn test_parameterized_update_rule() {
    let mut f = build(FunctionKind::Parameterized, Activation::Tanh, 3, 2);
    let w0 = f.weight().cloned().expect("weight");
    let x = array![[0.2, -0.4, 0.6], [0.1, 0.0, -0.3]];
    let (_, trace) = f.forward_traced(&x, None).expect("forward");
    f.backward(&trace, &array![[1.0, -1.0], [0.5, 0.5]]).expect("backward");
    let g = f.grad().cloned().expect("gradient");

    f.update(0.1);
    let w1 = f.weight().cloned().expect("weight");
    for ((a, b), c) in w1.iter().zip(w0.iter()).zip(g.iter()) {
        assert_abs_diff_eq!(*a, b - 0.1 * c, epsilon = 1e-6);
    }
    assert!(f.grad().is_none());

    // no gradient, no change
    f.update(0.1);
    assert_eq!(f.weight().expect("weight"), &w1);
}

#[test]
fn test_untrained_variants_ignore_updates() {
    for kind in [FunctionKind::Identity, FunctionKind::Random] {
        let mut f = build(kind, Activation::Linear, 3, 3);
        let w0 = f.weight().cloned().expect("weight");
        let x = array![[0.2, -0.4, 0.6]];
        let (_, trace) = f.forward_traced(&x, None).expect("forward");
        let grad_in = f.backward(&trace, &array![[1.0, 1.0, 1.0]]).expect("backward");
        assert_eq!(grad_in.shape(), &[1, 3]);
        f.update(10.0);
        assert_eq!(f.weight().expect("weight"), &w0, "{kind:?}");
        assert!(f.grad().is_none());
    }
}

#[test]
fn test_input_gradient_matches_finite_difference() {
    let f = build(FunctionKind::Parameterized, Activation::Tanh, 3, 2);
    let x = array![[0.3, -0.2, 0.5]];
    let (_, trace) = f.forward_traced(&x, None).expect("forward");
    let grad_out = array![[1.0, 1.0]];
    let grad_in = f.input_grad(&trace, &grad_out).expect("input_grad");
    let h = 1e-3;
    for j in 0..3 {
        let mut plus = x.clone();
        plus[[0, j]] += h;
        let mut minus = x.clone();
        minus[[0, j]] -= h;
        let fd = (f.forward(&plus, None).unwrap().sum() - f.forward(&minus, None).unwrap().sum())
            / (2.0 * h);
        assert_abs_diff_eq!(fd, grad_in[[0, j]], epsilon = 1e-2);
    }
}

// ============================================================================
// Difference correction
// ============================================================================

#[test]
fn test_difference_without_original_is_contract_violation() {
    let f = build(FunctionKind::Difference, Activation::Linear, 3, 3);
    assert!(f.weight().is_none());
    let result = f.forward(&Array2::zeros((1, 3)), None);
    assert!(matches!(result, Err(TPError::ContractViolation(_))));
}

#[test]
fn test_difference_rejects_nonlinear_activation() {
    let mut rng = StdRng::seed_from_u64(0);
    let spec = FunctionSpec::new(FunctionKind::Difference, Activation::Tanh, Init::Orthogonal);
    assert!(matches!(Function::new(&spec, 3, 3, &mut rng), Err(TPError::Configuration(_))));
}

// ============================================================================
// Batch normalization
// ============================================================================

#[test]
fn test_batch_normalization_single_row_is_zero() {
    let y = Activation::LinearBn.apply(&array![[3.0, -7.0]]);
    assert_eq!(y, array![[0.0, 0.0]]);
}

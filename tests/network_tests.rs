//! Integration tests for the target-propagation network.
//!
//! These tests verify end-to-end behavior:
//! - A training step touches exactly the weights it should
//! - Fixed (random / identity) inverses never move
//! - Checkpoints reproduce the network bit for bit
//! - Learned inverses actually invert the forward transform

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use targetprop::checkpoint::{load_checkpoint, save_checkpoint, CheckpointData};
use targetprop::config::{Device, Slot};
use targetprop::{
    Activation, Algorithm, Config, Init, Layer, Loss, LossFeedback, Network, NetworkConfig,
    TPError, Targets,
};

fn net_config(algorithm: Algorithm, depth: usize, dims: (usize, usize, usize)) -> NetworkConfig {
    NetworkConfig {
        depth,
        direct_depth: 1,
        in_dim: dims.0,
        hid_dim: dims.1,
        out_dim: dims.2,
        layer: algorithm.layer_spec(
            [Init::Orthogonal, Init::Orthogonal, Init::Uniform, Init::Orthogonal],
            -1.0,
        ),
        last_activation: Activation::Linear,
        device: Device::Cpu,
    }
}

fn batch() -> (Array2<f32>, Targets) {
    (
        array![[0.1, 0.2, 0.3, 0.4], [0.5, -0.1, 0.0, 0.2]],
        Targets::Classes(vec![0, 1]),
    )
}

fn weight(net: &Network, layer: usize, slot: Slot) -> Array2<f32> {
    net.layers()[layer]
        .function(slot)
        .weight()
        .cloned()
        .expect("weighted function")
}

fn config() -> Config {
    Config {
        lr: 0.1,
        lr_backward: 0.1,
        stepsize: 0.1,
        ..Config::default()
    }
}

// ============================================================================
// Training step
// ============================================================================

#[test]
fn test_single_step_updates_expected_weights() {
    let mut net = Network::new(&net_config(Algorithm::Dtp { bn: false }, 3, (4, 8, 2)), Loss::CrossEntropy, 7)
        .expect("network");
    let before = net.get_state();
    let (x, targets) = batch();

    let metrics = net.train_step(&x, &targets, &config()).expect("train_step");
    assert!(metrics.loss.is_finite());
    assert!(metrics.reconstruction_loss.expect("trainable inverses").is_finite());

    let after = net.get_state();
    let changed = |key: &str| before[key] != after[key];

    // output layer regresses onto its target
    assert!(changed("layer_2.ff1"));
    assert!(changed("layer_2.ff2"));
    // inverses used for targets are trained
    assert!(changed("layer_1.bf1"));
    assert!(changed("layer_2.bf1"));
    // earlier layers regress onto targets pulled down through the inverses
    assert!(changed("layer_1.ff1"));
    assert!(changed("layer_1.ff2"));
    assert!(changed("layer_0.ff1"));
    assert!(changed("layer_0.ff2"));
    // layer 0's inverse never produces a target
    assert!(!changed("layer_0.bf1"));
    assert!(after["layer_0.bf2"].is_none());
}

#[test]
fn test_targets_use_inverses_trained_in_the_same_step() {
    let net = Network::new(&net_config(Algorithm::Dtp { bn: false }, 3, (4, 8, 2)), Loss::CrossEntropy, 7)
        .expect("network");
    let (x, targets) = batch();
    let cfg = config();
    let forward_only = Config {
        epochs_backward: 0,
        ..config()
    };

    let mut full = net.clone();
    full.train_step(&x, &targets, &cfg).expect("train_step");

    // backward phase first, then a step that skips it
    let mut staged = net.clone();
    staged.train_back_weights(&x, &cfg).expect("train_back_weights");
    staged.train_step(&x, &targets, &forward_only).expect("train_step");

    // forward phase with the inverses as they were before the step
    let mut stale = net.clone();
    stale.train_step(&x, &targets, &forward_only).expect("train_step");

    let full_state = full.get_state();
    assert_eq!(full_state, staged.get_state());
    assert_ne!(full_state["layer_0.ff1"], stale.get_state()["layer_0.ff1"]);
    assert_eq!(full_state["layer_2.ff1"], stale.get_state()["layer_2.ff1"]);
}

#[test]
fn test_diverging_inverse_training_keeps_running() {
    let mut cfg = net_config(Algorithm::Dtp { bn: false }, 3, (4, 8, 2));
    cfg.layer.bf1.activation = Activation::Linear;
    let net = Network::new(&cfg, Loss::CrossEntropy, 7).expect("network");
    let (x, _) = batch();
    let unstable = Config {
        lr_backward: 1e3,
        epochs_backward: 3,
        ..config()
    };

    // the first round of a 3-round phase matches a 1-round phase on a copy
    let mut single = net.clone();
    let first = single
        .train_back_weights(&x, &Config { epochs_backward: 1, ..unstable.clone() })
        .expect("train_back_weights")
        .expect("trainable inverses");

    let mut net = net;
    let last = net
        .train_back_weights(&x, &unstable)
        .expect("train_back_weights")
        .expect("trainable inverses");
    assert!(last.is_nan() || last >= first, "reconstruction loss {first} -> {last}");

    let y = net.predict(&x).expect("predict");
    assert!(y.iter().all(|v| v.is_finite()));
}

#[test]
fn test_gradients_cleared_after_step() {
    let mut net = Network::new(&net_config(Algorithm::Dtp { bn: false }, 3, (4, 8, 2)), Loss::CrossEntropy, 7)
        .expect("network");
    let (x, targets) = batch();
    net.train_step(&x, &targets, &config()).expect("train_step");
    for layer in net.layers() {
        for slot in Slot::ALL {
            if let Some(g) = layer.function(slot).grad() {
                assert!(g.iter().all(|v| *v == 0.0));
            }
        }
    }
}

#[test]
fn test_all_feedback_losses_train() {
    for feedback in [LossFeedback::Dtp, LossFeedback::Drl, LossFeedback::LDrl] {
        let mut net =
            Network::new(&net_config(Algorithm::Dtp { bn: false }, 3, (4, 8, 2)), Loss::CrossEntropy, 3)
                .expect("network");
        let (x, targets) = batch();
        let cfg = Config {
            loss_feedback: feedback,
            ..config()
        };
        let metrics = net.train_step(&x, &targets, &cfg).expect("train_step");
        assert!(metrics.loss.is_finite(), "{feedback:?}");
        assert!(metrics.reconstruction_loss.expect("trainable").is_finite(), "{feedback:?}");
    }
}

#[test]
fn test_batch_normalized_preset_trains() {
    let mut net = Network::new(&net_config(Algorithm::Dtp { bn: true }, 3, (4, 8, 2)), Loss::CrossEntropy, 5)
        .expect("network");
    let x = Array2::random_using((6, 4), Uniform::new(-1.0, 1.0), &mut StdRng::seed_from_u64(0));
    let targets = Targets::Classes(vec![0, 1, 0, 1, 1, 0]);
    let metrics = net.train_step(&x, &targets, &config()).expect("train_step");
    assert!(metrics.loss.is_finite());
}

#[test]
fn test_label_augmentation_step() {
    let loss = Loss::for_classes(true, 2);
    let mut net = Network::new(&net_config(Algorithm::Fwdtp { bn: false }, 2, (4, 8, 6)), loss, 5)
        .expect("network");
    let (x, targets) = batch();
    let metrics = net.train_step(&x, &targets, &config()).expect("train_step");
    assert!(metrics.loss.is_finite());
    assert!(metrics.correct.expect("class targets") <= 2);
    assert_eq!(metrics.reconstruction_loss, None);
}

#[test]
fn test_direct_depth_equal_to_depth() {
    let mut cfg = net_config(Algorithm::Dtp { bn: false }, 2, (4, 8, 2));
    cfg.direct_depth = 2;
    let mut net = Network::new(&cfg, Loss::CrossEntropy, 1).expect("network");
    let before = net.get_state();
    let (x, targets) = batch();
    let metrics = net.train_step(&x, &targets, &config()).expect("train_step");
    // no layer needs an inverse, so no backward round updates anything
    assert_eq!(before["layer_1.bf1"], net.get_state()["layer_1.bf1"]);
    assert_ne!(before["layer_0.ff1"], net.get_state()["layer_0.ff1"]);
    assert!(metrics.loss.is_finite());
}

#[test]
fn test_non_finite_input_is_numerical_error() {
    let mut net = Network::new(&net_config(Algorithm::Dtp { bn: false }, 2, (4, 8, 2)), Loss::CrossEntropy, 1)
        .expect("network");
    let x = Array2::from_elem((2, 4), f32::NAN);
    let result = net.train_step(&x, &Targets::Classes(vec![0, 1]), &config());
    assert!(matches!(result, Err(TPError::Numerical(_))));
}

#[test]
fn test_wrong_input_width_rejected() {
    let mut net = Network::new(&net_config(Algorithm::Dtp { bn: false }, 2, (4, 8, 2)), Loss::CrossEntropy, 1)
        .expect("network");
    let x = Array2::zeros((2, 3));
    let result = net.train_step(&x, &Targets::Classes(vec![0, 1]), &config());
    assert!(matches!(result, Err(TPError::ShapeMismatch(_))));
}

// ============================================================================
// Fixed inverses
// ============================================================================

#[test]
fn test_random_inverse_never_changes() {
    let mut net = Network::new(&net_config(Algorithm::Fwdtp { bn: false }, 3, (4, 8, 2)), Loss::CrossEntropy, 11)
        .expect("network");
    assert!(!net.back_trainable());
    let bf1_before: Vec<_> = (0..3).map(|d| weight(&net, d, Slot::Bf1)).collect();
    let (x, targets) = batch();
    for _ in 0..5 {
        net.train_step(&x, &targets, &config()).expect("train_step");
    }
    for (d, before) in bf1_before.iter().enumerate() {
        assert_eq!(&weight(&net, d, Slot::Bf1), before);
        assert!(net.layers()[d].function(Slot::Bf1).grad().is_none());
    }
}

#[test]
fn test_identity_inverse_never_changes() {
    let mut net = Network::new(&net_config(Algorithm::Itp { bn: false }, 3, (4, 8, 2)), Loss::CrossEntropy, 11)
        .expect("network");
    let (x, targets) = batch();
    for _ in 0..3 {
        net.train_step(&x, &targets, &config()).expect("train_step");
    }
    let w = weight(&net, 1, Slot::Bf1);
    assert_eq!(w.shape(), &[8, 8]);
    for ((i, j), v) in w.indexed_iter() {
        assert_eq!(*v, if i == j { 1.0 } else { 0.0 });
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

#[test]
fn test_checkpoint_round_trip_reproduces_outputs() {
    let cfg = net_config(Algorithm::Dtp { bn: false }, 3, (4, 8, 2));
    let mut trained = Network::new(&cfg, Loss::CrossEntropy, 21).expect("network");
    let (x, targets) = batch();
    trained.train_step(&x, &targets, &config()).expect("train_step");

    let dir = std::env::temp_dir().join("targetprop_test_network_checkpoint");
    let path = dir.join("net.json");
    let data = CheckpointData::new("DTP", trained.dims(), 1, &trained.get_state());
    save_checkpoint(&data, &path).expect("save");

    let mut fresh = Network::new(&cfg, Loss::CrossEntropy, 99).expect("network");
    assert_ne!(fresh.predict(&x).unwrap(), trained.predict(&x).unwrap());

    let loaded = load_checkpoint(&path).expect("load");
    assert_eq!(loaded.dims, vec![4, 8, 8, 2]);
    fresh.load_state(&loaded.state().expect("state")).expect("load_state");
    assert_eq!(fresh.predict(&x).unwrap(), trained.predict(&x).unwrap());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_load_state_shape_mismatch_leaves_network_untouched() {
    let small = Network::new(&net_config(Algorithm::Dtp { bn: false }, 3, (4, 8, 2)), Loss::CrossEntropy, 1)
        .expect("network");
    let mut wide = Network::new(&net_config(Algorithm::Dtp { bn: false }, 3, (4, 16, 2)), Loss::CrossEntropy, 1)
        .expect("network");
    let before = wide.get_state();
    let result = wide.load_state(&small.get_state());
    assert!(matches!(result, Err(TPError::ContractViolation(_))));
    assert_eq!(wide.get_state(), before);
}

// ============================================================================
// Inverse quality
// ============================================================================

/// `‖compute_target(forward(x)) − x‖²` for a layer without difference correction.
fn reconstruction_error(layer: &mut Layer, x: &Array2<f32>) -> f32 {
    let (_, y) = layer.forward(x).expect("forward");
    let rec = layer.compute_target(&y).expect("target");
    (&rec - x).mapv(|v| v * v).sum()
}

#[test]
fn test_backward_training_learns_inverse() {
    let mut rng = StdRng::seed_from_u64(4);
    let spec = Algorithm::Tp.layer_spec(
        [Init::Orthogonal, Init::Orthogonal, Init::Uniform, Init::Orthogonal],
        -1.0,
    );
    let mut layer = Layer::new(4, 8, 8, &spec, &mut rng).expect("layer");
    let x = Array2::random_using((16, 4), Uniform::new(-0.5, 0.5), &mut rng);

    let before = reconstruction_error(&mut layer, &x);
    for _ in 0..500 {
        layer
            .train_backward(&x, LossFeedback::Dtp, 0.01, &mut rng)
            .expect("train_backward");
        layer.update_backward(0.02);
    }
    let after = reconstruction_error(&mut layer, &x);
    assert!(after < 0.5 * before, "before={before} after={after}");

    // and far better than an unrelated target
    let noise = Array2::random_using((16, 4), Uniform::new(-0.5, 0.5), &mut rng);
    let random_error = (&noise - &x).mapv(|v| v * v).sum();
    assert!(after < random_error, "after={after} random={random_error}");
}

#[test]
fn test_difference_target_of_unchanged_output_is_input() {
    let mut net = Network::new(&net_config(Algorithm::Dtp { bn: false }, 3, (4, 8, 2)), Loss::CrossEntropy, 2)
        .expect("network");
    let (x, _) = batch();
    net.forward(&x).expect("forward");
    let layer = &net.layers()[1];
    let y = layer.output().cloned().expect("cached");
    let target = layer.compute_target(&y).expect("target");
    let input = layer.input().expect("cached");
    for (a, b) in target.iter().zip(input.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
}

//! Target-propagation training binary.
//!
//! Trains a DTP-family network on MNIST, FashionMNIST, CIFAR-10 or CIFAR-100,
//! optionally resuming from a checkpoint (continual mode) and saving the final
//! weights. Per-epoch metrics go to the log and, if requested, a JSONL file.
//!
//! ## Usage
//!
//! ```bash
//! tp-train --dataset MNIST --data-dir data --algorithm FWDTP-BN \
//!   --epochs 100 --depth 6 --hid-dim 256 --lr 1e-3 --lrb 1e-3 \
//!   --metrics-file data/output/metrics.jsonl --save yes
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use targetprop::checkpoint::{load_checkpoint, save_checkpoint, CheckpointData};
use targetprop::config::{Algorithm, Device, FunctionKind, NetworkConfig, Slot};
use targetprop::data::{make_dataset, BatchLoader, DatasetKind};
use targetprop::training::{train, JsonlSink, MetricsSink, NullSink};
use targetprop::{Activation, Config, Init, LossFeedback, Loss, Network, TPError, TPResult};

#[derive(Parser, Debug)]
#[command(
    name = "tp-train",
    about = "Train a feed-forward classifier with difference target propagation"
)]
struct Args {
    /// MNIST, FashionMNIST, CIFAR10 or CIFAR100
    #[arg(long, default_value = "MNIST")]
    dataset: String,

    /// Root directory holding one sub-directory per dataset
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// TP, DTP, DTP-BN, FWDTP, FWDTP-BN, ITP or ITP-BN
    #[arg(long, default_value = "FWDTP-BN")]
    algorithm: String,

    #[arg(long, default_value_t = 100)]
    epochs: usize,

    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Train on the full training set and report on the test set
    #[arg(long, default_value_t = false)]
    test: bool,

    #[arg(long, default_value_t = 6)]
    depth: usize,

    /// Number of output-side layers trained from the loss gradient
    #[arg(long, default_value_t = 1)]
    direct_depth: usize,

    #[arg(long, default_value_t = 784)]
    in_dim: usize,

    #[arg(long, default_value_t = 256)]
    hid_dim: usize,

    #[arg(long, default_value_t = 10)]
    out_dim: usize,

    /// Forward learning rate
    #[arg(long = "learning-rate", visible_alias = "lr", default_value_t = 1e-3)]
    learning_rate: f32,

    /// Backward learning rate
    #[arg(long = "learning-rate-backward", visible_alias = "lrb", default_value_t = 1e-3)]
    learning_rate_backward: f32,

    /// Noise level of the reconstruction loss
    #[arg(long, visible_alias = "sb", default_value_t = 1e-2)]
    std_backward: f32,

    /// Step along the negative loss gradient for output targets
    #[arg(long, default_value_t = 1e-2)]
    stepsize: f32,

    /// Vote over `out_dim / classes` output groups
    #[arg(long, default_value_t = false)]
    label_augmentation: bool,

    /// Override the preset function types
    #[arg(long = "forward-function-1", visible_alias = "ff1")]
    ff1: Option<FunctionKind>,
    #[arg(long = "forward-function-2", visible_alias = "ff2")]
    ff2: Option<FunctionKind>,
    #[arg(long = "backward-function-1", visible_alias = "bf1")]
    bf1: Option<FunctionKind>,
    #[arg(long = "backward-function-2", visible_alias = "bf2")]
    bf2: Option<FunctionKind>,

    #[arg(long = "forward-function-1-init", visible_alias = "ff1-init", default_value = "orthogonal")]
    ff1_init: Init,
    #[arg(long = "forward-function-2-init", visible_alias = "ff2-init", default_value = "orthogonal")]
    ff2_init: Init,
    #[arg(long = "backward-function-1-init", visible_alias = "bf1-init", default_value = "uniform")]
    bf1_init: Init,
    #[arg(long = "backward-function-2-init", visible_alias = "bf2-init", default_value = "orthogonal")]
    bf2_init: Init,

    /// Fraction of initial weights zeroed (negative = dense)
    #[arg(long, visible_alias = "sr", default_value_t = -1.0, allow_negative_numbers = true)]
    sparse_ratio: f32,

    /// Override the preset activations
    #[arg(long = "forward-function-1-activation", visible_alias = "ff1-act")]
    ff1_act: Option<Activation>,
    #[arg(long = "forward-function-2-activation", visible_alias = "ff2-act")]
    ff2_act: Option<Activation>,
    #[arg(long = "backward-function-1-activation", visible_alias = "bf1-act")]
    bf1_act: Option<Activation>,
    #[arg(long = "backward-function-2-activation", visible_alias = "bf2-act")]
    bf2_act: Option<Activation>,

    /// Activation of the output layer's ff2
    #[arg(long, default_value = "linear")]
    forward_last_activation: Activation,

    /// DTP, DRL or L-DRL
    #[arg(long, default_value = "DTP")]
    loss_feedback: LossFeedback,

    /// Backward training rounds per batch
    #[arg(long, default_value_t = 5)]
    epochs_backward: usize,

    /// Resume from the checkpoint before training
    #[arg(long, default_value = "no", value_parser = ["yes", "no"])]
    continual: String,

    /// Write the checkpoint after training
    #[arg(long, default_value = "no", value_parser = ["yes", "no"])]
    save: String,

    #[arg(long, default_value = "checkpoints/tp/checkpoint.json")]
    checkpoint: PathBuf,

    /// Output metrics file (JSONL)
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

impl Args {
    fn network_config(&self, algorithm: Algorithm) -> TPResult<NetworkConfig> {
        let inits = [
            self.ff1_init.clone(),
            self.ff2_init.clone(),
            self.bf1_init.clone(),
            self.bf2_init.clone(),
        ];
        let mut layer = algorithm.layer_spec(inits, self.sparse_ratio);
        let kinds = [self.ff1, self.ff2, self.bf1, self.bf2];
        let acts = [self.ff1_act, self.ff2_act, self.bf1_act, self.bf2_act];
        for ((slot, kind), act) in Slot::ALL.into_iter().zip(kinds).zip(acts) {
            let spec = layer.get_mut(slot);
            if let Some(kind) = kind {
                spec.kind = kind;
            }
            if let Some(act) = act {
                spec.activation = act;
            }
        }
        let config = NetworkConfig {
            depth: self.depth,
            direct_depth: self.direct_depth,
            in_dim: self.in_dim,
            hid_dim: self.hid_dim,
            out_dim: self.out_dim,
            layer,
            last_activation: self.forward_last_activation,
            device: Device::Cpu,
        };
        config.validate()?;
        Ok(config)
    }

    fn train_config(&self) -> Config {
        Config {
            lr: self.learning_rate,
            lr_backward: self.learning_rate_backward,
            std_backward: self.std_backward,
            stepsize: self.stepsize,
            loss_feedback: self.loss_feedback,
            epochs_backward: self.epochs_backward,
            epochs: self.epochs,
            batch_size: self.batch_size,
            seed: self.seed,
        }
    }
}

fn run(args: &Args) -> TPResult<()> {
    // configuration errors surface before any dataset is read
    let algorithm: Algorithm = args.algorithm.parse()?;
    let kind: DatasetKind = args.dataset.parse()?;
    let net_config = args.network_config(algorithm)?;
    let config = args.train_config();

    info!(device = %net_config.device, %algorithm, dataset = %kind, "starting");
    let layer = &net_config.layer;
    info!("Forward  : {} -> {}", layer.ff1, layer.ff2);
    info!("Backward : {} -> {}", layer.bf1, layer.bf2);

    let data_dir = args.data_dir.join(kind.default_subdir());
    let (train_set, valid_set, test_set) = make_dataset(
        kind,
        &data_dir,
        args.label_augmentation,
        args.out_dim,
        args.test,
    )?;
    if train_set.image_dim() != args.in_dim {
        return Err(TPError::Configuration(format!(
            "in_dim {} but {kind} images have {} values",
            args.in_dim,
            train_set.image_dim()
        )));
    }
    info!(
        train = train_set.len(),
        valid = valid_set.len(),
        test = test_set.len(),
        "dataset loaded"
    );

    let loss = Loss::for_classes(args.label_augmentation, kind.num_classes());
    let mut network = Network::new(&net_config, loss, args.seed)?;

    if args.continual == "yes" {
        let data = load_checkpoint(&args.checkpoint)?;
        if data.algorithm != algorithm.to_string() {
            warn!(saved = %data.algorithm, current = %algorithm, "checkpoint algorithm differs");
        }
        network.load_state(&data.state()?)?;
        info!(path = %args.checkpoint.display(), epoch = data.epoch, "resumed from checkpoint");
    }

    let mut train_loader =
        BatchLoader::from_dataset(&train_set, args.batch_size)?.shuffled(args.seed);
    let mut valid_loader = BatchLoader::from_dataset(&valid_set, args.batch_size)?;
    let mut test_loader = BatchLoader::from_dataset(&test_set, args.batch_size)?;

    let mut sink: Box<dyn MetricsSink> = match &args.metrics_file {
        Some(path) => Box::new(JsonlSink::open(path)),
        None => Box::new(NullSink),
    };
    sink.log_config(&serde_json::json!({
        "algorithm": algorithm.to_string(),
        "dataset": kind.to_string(),
        "network": &net_config,
        "training": &config,
    }));

    let history = train(
        &mut network,
        &mut train_loader,
        &mut valid_loader,
        &config,
        sink.as_mut(),
    )?;
    if let Some(last) = history.last() {
        info!(epoch = last.epoch, valid_loss = last.valid_loss, "training finished");
    }

    if args.save == "yes" {
        let data = CheckpointData::new(
            &algorithm.to_string(),
            network.dims(),
            args.epochs,
            &network.get_state(),
        );
        save_checkpoint(&data, &args.checkpoint)?;
        info!(path = %args.checkpoint.display(), "checkpoint saved");
    }

    let (loss, acc) = network.external_test(&mut test_loader)?;
    println!("Test Loss      : {loss}");
    if let Some(acc) = acc {
        println!("Test Acc       : {acc}");
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_configuration() => {
            error!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

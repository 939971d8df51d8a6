//! Immutable network configuration.
//!
//! Built once at startup (from the CLI or by tests) and passed by reference to
//! [`Network::new`](crate::core::Network::new). Every tag parses through
//! `FromStr`, so an unsupported value is rejected before anything is built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::{Activation, Init, TPError, TPResult};

/// Baseline algorithms (backprop / feedback alignment), trained elsewhere.
pub const BP_LIST: [&str; 3] = ["BP", "FA", "sFA"];
/// Target-propagation algorithms handled by this crate.
pub const TP_LIST: [&str; 7] = ["TP", "DTP", "DTP-BN", "FWDTP", "FWDTP-BN", "ITP", "ITP-BN"];

/// Which of the four function variants fills a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Identity,
    Parameterized,
    Random,
    Difference,
}

impl FromStr for FunctionKind {
    type Err = TPError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(FunctionKind::Identity),
            "parameterized" => Ok(FunctionKind::Parameterized),
            "random" => Ok(FunctionKind::Random),
            "difference" => Ok(FunctionKind::Difference),
            other => Err(TPError::Configuration(format!("function type '{other}'"))),
        }
    }
}

/// The four function slots of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Ff1,
    Ff2,
    Bf1,
    Bf2,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Ff1, Slot::Ff2, Slot::Bf1, Slot::Bf2];

    pub fn name(&self) -> &'static str {
        match self {
            Slot::Ff1 => "ff1",
            Slot::Ff2 => "ff2",
            Slot::Bf1 => "bf1",
            Slot::Bf2 => "bf2",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration of one direction of a layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSpec {
    pub kind: FunctionKind,
    pub activation: Activation,
    pub init: Init,
    /// Fraction of initial weight entries zeroed; `None` (or <= 0) keeps it dense.
    pub sparsity: Option<f32>,
}

impl FunctionSpec {
    pub fn new(kind: FunctionKind, activation: Activation, init: Init) -> Self {
        Self {
            kind,
            activation,
            init,
            sparsity: None,
        }
    }

    pub fn with_sparsity(mut self, ratio: f32) -> Self {
        self.sparsity = (ratio > 0.0).then_some(ratio);
        self
    }
}

impl fmt::Display for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FunctionKind::Identity => "identity",
            FunctionKind::Parameterized => "parameterized",
            FunctionKind::Random => "random",
            FunctionKind::Difference => "difference",
        };
        write!(f, "{kind}({},{})", self.activation, self.init)
    }
}

/// Specs for the four functions of every layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSpec {
    pub ff1: FunctionSpec,
    pub ff2: FunctionSpec,
    pub bf1: FunctionSpec,
    pub bf2: FunctionSpec,
}

impl LayerSpec {
    pub fn get(&self, slot: Slot) -> &FunctionSpec {
        match slot {
            Slot::Ff1 => &self.ff1,
            Slot::Ff2 => &self.ff2,
            Slot::Bf1 => &self.bf1,
            Slot::Bf2 => &self.bf2,
        }
    }

    pub fn get_mut(&mut self, slot: Slot) -> &mut FunctionSpec {
        match slot {
            Slot::Ff1 => &mut self.ff1,
            Slot::Ff2 => &mut self.ff2,
            Slot::Bf1 => &mut self.bf1,
            Slot::Bf2 => &mut self.bf2,
        }
    }
}

/// Reconstruction objective used to train the backward functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossFeedback {
    /// Plain reconstruction of a perturbed input
    #[serde(rename = "DTP")]
    Dtp,
    /// Difference reconstruction loss
    #[serde(rename = "DRL")]
    Drl,
    /// Local difference reconstruction loss
    #[serde(rename = "L-DRL")]
    LDrl,
}

impl FromStr for LossFeedback {
    type Err = TPError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DTP" => Ok(LossFeedback::Dtp),
            "DRL" => Ok(LossFeedback::Drl),
            "L-DRL" => Ok(LossFeedback::LDrl),
            other => Err(TPError::Configuration(format!("loss feedback '{other}'"))),
        }
    }
}

/// Compute device. Only the CPU is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cpu")
    }
}

/// Target-propagation algorithm presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Algorithm {
    /// Vanilla TP: learned inverse, no difference correction
    Tp,
    /// Difference TP
    Dtp { bn: bool },
    /// Fixed-weight DTP: random, untrained inverse
    Fwdtp { bn: bool },
    /// Identity inverse with difference correction
    Itp { bn: bool },
}

impl Algorithm {
    /// Preset layer layout for this algorithm with the given per-slot inits.
    pub fn layer_spec(&self, inits: [Init; 4], sparsity: f32) -> LayerSpec {
        use FunctionKind::*;

        let (kinds, bn) = match *self {
            Algorithm::Tp => ([Parameterized, Parameterized, Parameterized, Identity], false),
            Algorithm::Dtp { bn } => ([Parameterized, Parameterized, Parameterized, Difference], bn),
            Algorithm::Fwdtp { bn } => ([Parameterized, Parameterized, Random, Difference], bn),
            Algorithm::Itp { bn } => ([Parameterized, Parameterized, Identity, Difference], bn),
        };
        let mut acts = if bn {
            [
                Activation::LinearBn,
                Activation::TanhBn,
                Activation::TanhBn,
                Activation::LinearBn,
            ]
        } else {
            [
                Activation::Linear,
                Activation::Tanh,
                Activation::Tanh,
                Activation::Linear,
            ]
        };
        if matches!(self, Algorithm::Itp { .. }) {
            // identity functions only take linear activations
            acts[2] = acts[3];
        }
        let [i0, i1, i2, i3] = inits;
        let spec = |k: usize, init: Init| {
            FunctionSpec::new(kinds[k], acts[k], init).with_sparsity(sparsity)
        };
        LayerSpec {
            ff1: spec(0, i0),
            ff2: spec(1, i1),
            bf1: spec(2, i2),
            bf2: spec(3, i3),
        }
    }
}

impl FromStr for Algorithm {
    type Err = TPError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TP" => Ok(Algorithm::Tp),
            "DTP" => Ok(Algorithm::Dtp { bn: false }),
            "DTP-BN" => Ok(Algorithm::Dtp { bn: true }),
            "FWDTP" => Ok(Algorithm::Fwdtp { bn: false }),
            "FWDTP-BN" => Ok(Algorithm::Fwdtp { bn: true }),
            "ITP" => Ok(Algorithm::Itp { bn: false }),
            "ITP-BN" => Ok(Algorithm::Itp { bn: true }),
            other if BP_LIST.contains(&other) => Err(TPError::Configuration(format!(
                "algorithm '{other}' belongs to the backprop baseline trainer"
            ))),
            other => Err(TPError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, bn) = match *self {
            Algorithm::Tp => ("TP", false),
            Algorithm::Dtp { bn } => ("DTP", bn),
            Algorithm::Fwdtp { bn } => ("FWDTP", bn),
            Algorithm::Itp { bn } => ("ITP", bn),
        };
        if bn {
            write!(f, "{name}-BN")
        } else {
            f.write_str(name)
        }
    }
}

/// Shape and function layout of a network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkConfig {
    pub depth: usize,
    pub direct_depth: usize,
    pub in_dim: usize,
    pub hid_dim: usize,
    pub out_dim: usize,
    pub layer: LayerSpec,
    /// Replaces ff2's activation in the output layer.
    pub last_activation: Activation,
    pub device: Device,
}

impl NetworkConfig {
    /// Layer boundary dimensions: `[in, hid, ..., hid, out]` (`depth + 1` entries).
    pub fn dims(&self) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.depth + 1);
        dims.push(self.in_dim);
        dims.extend(std::iter::repeat(self.hid_dim).take(self.depth.saturating_sub(1)));
        dims.push(self.out_dim);
        dims
    }

    /// # Errors
    /// - `Configuration` for zero sizes, `direct_depth` outside `1..=depth`, or
    ///   a difference function outside the bf2 slot.
    pub fn validate(&self) -> TPResult<()> {
        if self.depth == 0 {
            return Err(TPError::Configuration("depth must be at least 1".into()));
        }
        if self.direct_depth == 0 || self.direct_depth > self.depth {
            return Err(TPError::Configuration(format!(
                "direct_depth {} outside 1..={}",
                self.direct_depth, self.depth
            )));
        }
        if self.in_dim == 0 || self.hid_dim == 0 || self.out_dim == 0 {
            return Err(TPError::Configuration("dimensions must be positive".into()));
        }
        for slot in [Slot::Ff1, Slot::Ff2, Slot::Bf1] {
            if self.layer.get(slot).kind == FunctionKind::Difference {
                return Err(TPError::Configuration(format!(
                    "difference function in slot {slot} (only bf2 may correct bf1)"
                )));
            }
        }
        Ok(())
    }
}

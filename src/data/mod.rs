//! Datasets and batching.
//!
//! ## Submodules
//!
//! - [`mnist`] — MNIST / FashionMNIST IDX files
//! - [`image`] — CIFAR-10 / CIFAR-100 binary batches
//! - [`loader`] — Seeded, restartable batch iteration

pub mod image;
pub mod loader;
pub mod mnist;

pub use loader::{BatchLoader, Batches};

use ndarray::{s, Array2};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::core::{TPError, TPResult};
use crate::loss::Targets;
use image::CifarFormat;

/// Samples taken from the end of the training set for validation.
pub const VALID_SIZE: usize = 10_000;

/// Labelled images, one row per sample, pixels in \[0, 1\].
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Array2<f32>,
    pub labels: Vec<usize>,
    pub num_classes: usize,
}

impl Dataset {
    /// Build from a flat row-major pixel buffer.
    pub fn from_flat(
        pixels: Vec<f32>,
        labels: Vec<usize>,
        image_dim: usize,
        num_classes: usize,
    ) -> TPResult<Self> {
        let images = Array2::from_shape_vec((labels.len(), image_dim), pixels).map_err(|e| {
            TPError::Dataset(format!("{} labels do not match the images: {e}", labels.len()))
        })?;
        Ok(Self {
            images,
            labels,
            num_classes,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn image_dim(&self) -> usize {
        self.images.ncols()
    }

    pub fn targets(&self) -> Targets {
        Targets::Classes(self.labels.clone())
    }

    /// Split off the last `n` samples: `(head, tail)`.
    pub fn split_tail(self, n: usize) -> TPResult<(Dataset, Dataset)> {
        if n >= self.len() {
            return Err(TPError::Dataset(format!(
                "cannot hold out {n} of {} samples",
                self.len()
            )));
        }
        let cut = self.len() - n;
        let head = Dataset {
            images: self.images.slice(s![..cut, ..]).to_owned(),
            labels: self.labels[..cut].to_vec(),
            num_classes: self.num_classes,
        };
        let tail = Dataset {
            images: self.images.slice(s![cut.., ..]).to_owned(),
            labels: self.labels[cut..].to_vec(),
            num_classes: self.num_classes,
        };
        Ok((head, tail))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Mnist,
    FashionMnist,
    Cifar10,
    Cifar100,
}

impl DatasetKind {
    pub fn num_classes(&self) -> usize {
        match self {
            DatasetKind::Mnist | DatasetKind::FashionMnist => mnist::MNIST_NUM_CLASSES,
            DatasetKind::Cifar10 => image::CIFAR10_NUM_CLASSES,
            DatasetKind::Cifar100 => image::CIFAR100_NUM_CLASSES,
        }
    }

    /// Conventional sub-directory under a data root.
    pub fn default_subdir(&self) -> &'static str {
        match self {
            DatasetKind::Mnist => "MNIST",
            DatasetKind::FashionMnist => "FashionMNIST",
            DatasetKind::Cifar10 => "cifar-10-batches-bin",
            DatasetKind::Cifar100 => "cifar-100-binary",
        }
    }

    fn load_train(&self, dir: &Path) -> TPResult<Dataset> {
        match self {
            DatasetKind::Mnist | DatasetKind::FashionMnist => mnist::load_idx_split(dir, "train"),
            DatasetKind::Cifar10 => image::load_cifar_train(dir, CifarFormat::Cifar10),
            DatasetKind::Cifar100 => image::load_cifar_train(dir, CifarFormat::Cifar100),
        }
    }

    fn load_test(&self, dir: &Path) -> TPResult<Dataset> {
        match self {
            DatasetKind::Mnist | DatasetKind::FashionMnist => mnist::load_idx_split(dir, "t10k"),
            DatasetKind::Cifar10 => image::load_cifar_test(dir, CifarFormat::Cifar10),
            DatasetKind::Cifar100 => image::load_cifar_test(dir, CifarFormat::Cifar100),
        }
    }
}

impl FromStr for DatasetKind {
    type Err = TPError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MNIST" => Ok(DatasetKind::Mnist),
            "FashionMNIST" => Ok(DatasetKind::FashionMnist),
            "CIFAR10" => Ok(DatasetKind::Cifar10),
            "CIFAR100" => Ok(DatasetKind::Cifar100),
            other => Err(TPError::Configuration(format!("dataset '{other}'"))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DatasetKind::Mnist => "MNIST",
            DatasetKind::FashionMnist => "FashionMNIST",
            DatasetKind::Cifar10 => "CIFAR10",
            DatasetKind::Cifar100 => "CIFAR100",
        })
    }
}

/// Check that `out_dim` can carry the classes of `kind`.
///
/// Without label augmentation the first `num_classes` outputs are the logits;
/// with it every output votes, so `out_dim` must be a multiple of the class count.
pub fn check_out_dim(kind: DatasetKind, label_augmentation: bool, out_dim: usize) -> TPResult<()> {
    let classes = kind.num_classes();
    if out_dim < classes {
        return Err(TPError::Configuration(format!(
            "out_dim {out_dim} below the {classes} classes of {kind}"
        )));
    }
    if label_augmentation && out_dim % classes != 0 {
        return Err(TPError::Configuration(format!(
            "out_dim {out_dim} is not a multiple of {classes} under label augmentation"
        )));
    }
    Ok(())
}

/// Load `(train, valid, test)` for `kind` from `dir`.
///
/// The valid split is the last [`VALID_SIZE`] training samples; in `test_mode`
/// the whole training set is used and the test set doubles as valid.
pub fn make_dataset(
    kind: DatasetKind,
    dir: &Path,
    label_augmentation: bool,
    out_dim: usize,
    test_mode: bool,
) -> TPResult<(Dataset, Dataset, Dataset)> {
    check_out_dim(kind, label_augmentation, out_dim)?;
    let train = kind.load_train(dir)?;
    let test = kind.load_test(dir)?;
    if test_mode {
        Ok((train, test.clone(), test))
    } else {
        let (train, valid) = train.split_tail(VALID_SIZE)?;
        Ok((train, valid, test))
    }
}

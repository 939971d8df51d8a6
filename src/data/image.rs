//! CIFAR-10 / CIFAR-100 binary batch loading.
//!
//! ## Record layout
//!
//! ```text
//! CIFAR-10   [label: u8]                        [red: 1024×u8] [green: 1024×u8] [blue: 1024×u8]
//! CIFAR-100  [coarse label: u8] [fine label: u8] [red: 1024×u8] [green: 1024×u8] [blue: 1024×u8]
//! ```
//! Pixels are row-major within each channel plane. The planar (CHW) order is
//! kept as is and scaled to \[0, 1\].

use std::fs;
use std::path::Path;

use super::Dataset;
use crate::core::{TPError, TPResult};

/// CIFAR image height in pixels.
pub const CIFAR_HEIGHT: usize = 32;
/// CIFAR image width in pixels.
pub const CIFAR_WIDTH: usize = 32;
/// Number of color channels.
pub const CIFAR_CHANNELS: usize = 3;
/// Values per image (32 × 32 × 3 = 3072).
pub const CIFAR_PIXELS: usize = CIFAR_HEIGHT * CIFAR_WIDTH * CIFAR_CHANNELS;
pub const CIFAR10_NUM_CLASSES: usize = 10;
pub const CIFAR100_NUM_CLASSES: usize = 100;

/// Which CIFAR variant a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CifarFormat {
    Cifar10,
    /// Fine (100-class) labels are used
    Cifar100,
}

impl CifarFormat {
    fn label_bytes(&self) -> usize {
        match self {
            CifarFormat::Cifar10 => 1,
            CifarFormat::Cifar100 => 2,
        }
    }

    pub fn record_size(&self) -> usize {
        self.label_bytes() + CIFAR_PIXELS
    }

    pub fn num_classes(&self) -> usize {
        match self {
            CifarFormat::Cifar10 => CIFAR10_NUM_CLASSES,
            CifarFormat::Cifar100 => CIFAR100_NUM_CLASSES,
        }
    }
}

/// Decode the records of one binary file, appending to `pixels` and `labels`.
///
/// # Errors
///
/// `Dataset` if the byte count is not a whole number of records or a label is
/// out of range.
pub fn decode_cifar(
    data: &[u8],
    format: CifarFormat,
    pixels: &mut Vec<f32>,
    labels: &mut Vec<usize>,
) -> TPResult<()> {
    let record = format.record_size();
    if data.len() % record != 0 {
        return Err(TPError::Dataset(format!(
            "size {} is not a multiple of record size {record}",
            data.len()
        )));
    }
    let label_at = format.label_bytes() - 1;
    for chunk in data.chunks_exact(record) {
        let label = usize::from(chunk[label_at]);
        if label >= format.num_classes() {
            return Err(TPError::Dataset(format!("label {label} out of range")));
        }
        labels.push(label);
        pixels.extend(chunk[format.label_bytes()..].iter().map(|&b| f32::from(b) / 255.0));
    }
    Ok(())
}

fn load_files(data_dir: &Path, names: &[String], format: CifarFormat) -> TPResult<Dataset> {
    let mut pixels = Vec::new();
    let mut labels = Vec::new();
    for name in names {
        let path = data_dir.join(name);
        let data = fs::read(&path)
            .map_err(|e| TPError::Dataset(format!("{}: {e}", path.display())))?;
        decode_cifar(&data, format, &mut pixels, &mut labels)?;
    }
    Dataset::from_flat(pixels, labels, CIFAR_PIXELS, format.num_classes())
}

/// Load the training split (`data_batch_1..5.bin` or `train.bin`).
pub fn load_cifar_train(data_dir: &Path, format: CifarFormat) -> TPResult<Dataset> {
    let names: Vec<String> = match format {
        CifarFormat::Cifar10 => (1..=5).map(|i| format!("data_batch_{i}.bin")).collect(),
        CifarFormat::Cifar100 => vec!["train.bin".to_string()],
    };
    load_files(data_dir, &names, format)
}

/// Load the test split (`test_batch.bin` or `test.bin`).
pub fn load_cifar_test(data_dir: &Path, format: CifarFormat) -> TPResult<Dataset> {
    let name = match format {
        CifarFormat::Cifar10 => "test_batch.bin",
        CifarFormat::Cifar100 => "test.bin",
    };
    load_files(data_dir, &[name.to_string()], format)
}

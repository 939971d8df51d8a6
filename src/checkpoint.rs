//! Checkpoint save/load for target-propagation networks.
//!
//! A checkpoint is the network state map plus enough metadata to refuse a
//! mismatched network:
//! ```json
//! { "algorithm": "FWDTP-BN", "dims": [784, 256, 10], "epoch": 100,
//!   "params": { "layer_0.ff1": [[...]], "layer_0.bf2": null, ... } }
//! ```

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::{NetworkState, TPError, TPResult};

/// Serializable checkpoint data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Algorithm preset the network was built with.
    pub algorithm: String,
    /// Layer boundary dimensions.
    pub dims: Vec<usize>,
    /// Epochs trained when the checkpoint was written.
    pub epoch: usize,
    /// `"layer_<i>.<slot>"` → weight rows, `null` for parameter-free functions.
    pub params: BTreeMap<String, Option<Vec<Vec<f32>>>>,
}

/// Convert an Array2 to Vec<Vec<f32>> for serialization.
fn array2_to_vecs(arr: &Array2<f32>) -> Vec<Vec<f32>> {
    arr.rows().into_iter().map(|row| row.to_vec()).collect()
}

/// Convert Vec<Vec<f32>> back to Array2.
fn vecs_to_array2(vecs: &[Vec<f32>]) -> TPResult<Array2<f32>> {
    if vecs.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let nrows = vecs.len();
    let ncols = vecs[0].len();
    if let Some((i, row)) = vecs.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        return Err(TPError::ContractViolation(format!(
            "ragged weight matrix: row {i} has {} values, row 0 has {ncols}",
            row.len()
        )));
    }
    let flat: Vec<f32> = vecs.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| TPError::ContractViolation(format!("ragged weight matrix: {e}")))
}

impl CheckpointData {
    pub fn new(algorithm: &str, dims: &[usize], epoch: usize, state: &NetworkState) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            dims: dims.to_vec(),
            epoch,
            params: state
                .iter()
                .map(|(key, w)| (key.clone(), w.as_ref().map(array2_to_vecs)))
                .collect(),
        }
    }

    /// Rebuild the state map.
    ///
    /// # Errors
    /// `ContractViolation` if a stored matrix is ragged.
    pub fn state(&self) -> TPResult<NetworkState> {
        self.params
            .iter()
            .map(|(key, w)| {
                let w = w.as_deref().map(vecs_to_array2).transpose()?;
                Ok((key.clone(), w))
            })
            .collect()
    }
}

/// Save a checkpoint to a JSON file, creating parent directories.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the data cannot be serialized.
pub fn save_checkpoint(data: &CheckpointData, path: &Path) -> TPResult<()> {
    let json = serde_json::to_string(data)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    Ok(())
}

/// Load a checkpoint from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_checkpoint(path: &Path) -> TPResult<CheckpointData> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

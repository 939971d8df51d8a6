//! Mini-batch iteration over an in-memory dataset.

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::Dataset;
use crate::core::{TPError, TPResult};
use crate::loss::Targets;

/// Finite, restartable sequence of `(inputs, targets)` batches.
///
/// Each call to [`batches`](Self::batches) starts a new pass; a shuffled loader
/// draws a fresh permutation from its own seeded generator every pass.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    inputs: Array2<f32>,
    targets: Targets,
    batch_size: usize,
    rng: Option<StdRng>,
}

impl BatchLoader {
    /// # Errors
    /// - `Configuration` for a zero batch size
    /// - `ShapeMismatch` if inputs and targets have different lengths
    pub fn new(inputs: Array2<f32>, targets: Targets, batch_size: usize) -> TPResult<Self> {
        if batch_size == 0 {
            return Err(TPError::Configuration("batch_size must be positive".into()));
        }
        if inputs.nrows() != targets.len() {
            return Err(TPError::ShapeMismatch(format!(
                "{} inputs vs {} targets",
                inputs.nrows(),
                targets.len()
            )));
        }
        Ok(Self {
            inputs,
            targets,
            batch_size,
            rng: None,
        })
    }

    pub fn from_dataset(dataset: &Dataset, batch_size: usize) -> TPResult<Self> {
        Self::new(dataset.images.clone(), dataset.targets(), batch_size)
    }

    /// Shuffle every pass with a generator seeded by `seed`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Start a pass over the data. The last batch may be short.
    pub fn batches(&mut self) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        Batches {
            loader: self,
            order,
            pos: 0,
        }
    }
}

/// One pass of a [`BatchLoader`].
pub struct Batches<'a> {
    loader: &'a BatchLoader,
    order: Vec<usize>,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = (Array2<f32>, Targets);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.loader.batch_size).min(self.order.len());
        let idx = &self.order[self.pos..end];
        self.pos = end;
        Some((
            self.loader.inputs.select(Axis(0), idx),
            self.loader.targets.select(idx),
        ))
    }
}

use std::num::NonZeroUsize;
use std::ops::Range;

use super::dataset::Dataset;
use super::shard::ShardSpec;
use crate::orchestra::error::{OrchestraError, Result};

/// Shard-aware loader producing owned batches of one domain.
///
/// A trailing partial batch is dropped, so every batch has `batch_size` samples.
#[derive(Debug, Clone)]
pub struct DataLoader<D> {
    dataset: D,
    shard: ShardSpec,
    shard_range: Range<usize>,
    batch_size: usize,
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: D, shard: ShardSpec, batch_size: NonZeroUsize) -> Self {
        let shard_range = shard.range(dataset.len());

        Self {
            dataset,
            shard,
            shard_range,
            batch_size: batch_size.get(),
        }
    }

    #[inline]
    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    #[inline]
    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    #[inline]
    pub fn shard_range(&self) -> Range<usize> {
        self.shard_range.clone()
    }

    /// Number of batches in one pass.
    #[inline]
    pub fn len(&self) -> usize {
        self.shard_range.len() / self.batch_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fresh pass over this rank's shard.
    pub fn batches(&self) -> Batches<'_, D> {
        Batches {
            loader: self,
            cursor: self.shard_range.start,
        }
    }
}

/// One pass of a [`DataLoader`].
#[derive(Debug)]
pub struct Batches<'a, D> {
    loader: &'a DataLoader<D>,
    cursor: usize,
}

impl<D: Dataset> Iterator for Batches<'_, D> {
    type Item = Vec<D::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.cursor + self.loader.batch_size;
        if end > self.loader.shard_range.end {
            return None;
        }

        let batch = (self.cursor..end).map(|i| self.loader.dataset.get(i)).collect();
        self.cursor = end;
        Some(batch)
    }
}

/// The first `size` samples of `dataset`, kept fixed for visualization.
pub fn display_batch<D: Dataset>(dataset: &D, size: NonZeroUsize) -> Result<Vec<D::Item>> {
    let size = size.get();
    if dataset.len() < size {
        return Err(OrchestraError::Data(format!(
            "display batch needs {size} samples, dataset has {}",
            dataset.len()
        )));
    }

    Ok((0..size).map(|i| dataset.get(i)).collect())
}

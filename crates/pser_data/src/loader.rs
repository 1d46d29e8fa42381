//! Batched iteration over a dataset.

use rand::seq::SliceRandom;

use crate::batch::{collate, Batch};
use crate::dataset::SeriesDataset;
use crate::error::{DataError, Result};
use pser_core::Seed;

/// A sequential producer of batches, consumed by the runners.
///
/// Batches of one pass are yielded in order; a source used for training is
/// expected to present a new order after each [`set_epoch`](Self::set_epoch).
pub trait BatchSource {
    /// Batches of one full pass.
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;

    /// Number of batches in one pass.
    fn n_batches(&self) -> usize;

    /// Number of samples in one pass.
    fn n_samples(&self) -> usize;

    /// Select the sample order for training epoch `epoch`.
    fn set_epoch(&mut self, _epoch: usize) {}

    /// Advance the underlying data to its next difficulty tier.
    fn harden(&mut self) {}
}

/// A dataloader that produces padded batches from a dataset.
///
/// With shuffling enabled the order of epoch `e` is drawn from
/// `seed.for_epoch(e)`, so every epoch differs and every run repeats.
///
/// # Example
///
/// ```rust,ignore
/// use pser_data::{LabeledDataset, PatternLoader};
/// use pser_core::Seed;
///
/// let loader = PatternLoader::builder(dataset)
///     .batch_size(32)
///     .shuffle(true)
///     .seed(Seed::new(42))
///     .build()?;
///
/// for batch in loader.iter() {
///     let batch = batch?;
/// }
/// ```
pub struct PatternLoader<D: SeriesDataset> {
    dataset: D,
    batch_size: usize,
    shuffle: bool,
    seed: Seed,
    max_len: Option<usize>,
    epoch: usize,
}

impl<D: SeriesDataset> PatternLoader<D> {
    /// Create a new dataloader builder.
    #[must_use]
    pub fn builder(dataset: D) -> PatternLoaderBuilder<D> {
        PatternLoaderBuilder::new(dataset)
    }

    /// Get the dataset.
    #[must_use]
    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Get the dataset mutably, e.g. to change masking between passes.
    pub fn dataset_mut(&mut self) -> &mut D {
        &mut self.dataset
    }

    /// Get the batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Create an iterator over the batches of the current epoch.
    #[must_use]
    pub fn iter(&self) -> PatternLoaderIter<'_, D> {
        PatternLoaderIter::new(self)
    }

    fn order(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = self.seed.for_epoch(self.epoch).to_rng();
            indices.shuffle(&mut rng);
        }
        indices
    }
}

impl<D: SeriesDataset> BatchSource for PatternLoader<D> {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.iter())
    }

    fn n_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn n_samples(&self) -> usize {
        self.dataset.len()
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    fn harden(&mut self) {
        self.dataset.harden();
    }
}

/// Builder for [`PatternLoader`].
pub struct PatternLoaderBuilder<D: SeriesDataset> {
    dataset: D,
    batch_size: usize,
    shuffle: bool,
    seed: Seed,
    max_len: Option<usize>,
}

impl<D: SeriesDataset> PatternLoaderBuilder<D> {
    /// Create a new builder.
    #[must_use]
    pub fn new(dataset: D) -> Self {
        Self {
            dataset,
            batch_size: 32,
            shuffle: false,
            seed: Seed::default(),
            max_len: None,
        }
    }

    /// Set the batch size.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enable or disable per-epoch shuffling.
    #[must_use]
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Set the seed the shuffling order is derived from.
    #[must_use]
    pub fn seed(mut self, seed: Seed) -> Self {
        self.seed = seed;
        self
    }

    /// Pad or truncate every batch to this length.
    #[must_use]
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Build the dataloader.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch size is zero or the dataset is empty.
    pub fn build(self) -> Result<PatternLoader<D>> {
        if self.batch_size == 0 {
            return Err(DataError::InvalidBatchSize(
                "Batch size must be greater than 0".to_string(),
            ));
        }
        if self.dataset.is_empty() {
            return Err(DataError::EmptyDataset);
        }
        if self.max_len == Some(0) {
            return Err(DataError::InvalidShape("max_len must be greater than 0".to_string()));
        }

        Ok(PatternLoader {
            dataset: self.dataset,
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            seed: self.seed,
            max_len: self.max_len,
            epoch: 0,
        })
    }
}

/// Iterator over the batches of a [`PatternLoader`].
pub struct PatternLoaderIter<'a, D: SeriesDataset> {
    loader: &'a PatternLoader<D>,
    indices: Vec<usize>,
    position: usize,
}

impl<'a, D: SeriesDataset> PatternLoaderIter<'a, D> {
    fn new(loader: &'a PatternLoader<D>) -> Self {
        Self {
            indices: loader.order(),
            loader,
            position: 0,
        }
    }
}

impl<D: SeriesDataset> Iterator for PatternLoaderIter<'_, D> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.indices.len());
        let chunk = &self.indices[self.position..end];
        self.position = end;

        let samples = chunk
            .iter()
            .map(|&idx| self.loader.dataset.get(idx))
            .collect::<Result<Vec<_>>>();
        Some(samples.and_then(|s| collate(s, self.loader.max_len)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.indices.len() - self.position).div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}

impl<D: SeriesDataset> ExactSizeIterator for PatternLoaderIter<'_, D> {}

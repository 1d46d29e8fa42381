//! Dataset abstractions and in-memory implementations.

use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::Rng;

use crate::error::{DataError, Result};
use pser_core::Seed;

/// One sample as yielded by a dataset.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Model input, shape `(length, features)`.
    pub x: Array2<f32>,
    /// What the model is trained to produce for this sample.
    pub target: SampleTarget,
    /// Sample identifier, carried into prediction dumps.
    pub id: String,
}

/// Target of a single sample.
#[derive(Debug, Clone)]
pub enum SampleTarget {
    /// Class index (classification) or output values (regression), shape `(n_outputs,)`.
    Label(Array1<f32>),
    /// Values to reconstruct and which of them count, both `(length, features)`.
    Masked {
        /// Unmasked input values.
        values: Array2<f32>,
        /// `true` where the value was hidden from the model and must be predicted.
        mask: Array2<bool>,
    },
}

/// Indexed pattern-series samples with a fixed feature dimensionality.
pub trait SeriesDataset {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Whether the dataset has no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of features per time step.
    fn feat_dim(&self) -> usize;

    /// Sample at `index`.
    fn get(&self, index: usize) -> Result<Sample>;

    /// Advance to the next difficulty tier. The dataset decides what harder means.
    fn harden(&mut self) {}

    /// Current difficulty tier, 0 before any [`harden`](Self::harden) call.
    fn difficulty(&self) -> usize {
        0
    }
}

fn check_lengths(lengths: &[usize], n: usize, max_len: usize) -> Result<()> {
    if lengths.len() != n {
        return Err(DataError::InvalidShape(format!(
            "expected {n} sequence lengths, got {}",
            lengths.len()
        )));
    }
    if let Some(&bad) = lengths.iter().find(|&&l| l == 0 || l > max_len) {
        return Err(DataError::InvalidShape(format!(
            "sequence length {bad} outside 1..={max_len}"
        )));
    }
    Ok(())
}

fn default_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| i.to_string()).collect()
}

/// In-memory dataset of labelled series for classification and regression.
///
/// `x` is stored `(N, L, F)` with per-sample valid lengths; `y` is `(N, n_outputs)`,
/// holding the class index in column 0 for classification.
///
/// Hardening adds uniform input noise whose amplitude is read from the
/// configured noise tiers; without tiers it only advances the counter.
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    x: Array3<f32>,
    y: Array2<f32>,
    lengths: Vec<usize>,
    ids: Vec<String>,
    noise_tiers: Vec<f32>,
    tier: usize,
    seed: Seed,
}

impl LabeledDataset {
    /// Create a dataset where every sample spans the full length of `x`.
    pub fn from_arrays(x: Array3<f32>, y: Array2<f32>) -> Result<Self> {
        let n = x.shape()[0];
        if n == 0 {
            return Err(DataError::EmptyDataset);
        }
        if y.nrows() != n {
            return Err(DataError::InvalidShape(format!(
                "x has {n} samples but y has {}",
                y.nrows()
            )));
        }
        let seq_len = x.shape()[1];
        Ok(Self {
            x,
            y,
            lengths: vec![seq_len; n],
            ids: default_ids(n),
            noise_tiers: Vec::new(),
            tier: 0,
            seed: Seed::default(),
        })
    }

    /// Set per-sample valid lengths; steps beyond a sample's length are padding.
    pub fn with_lengths(mut self, lengths: Vec<usize>) -> Result<Self> {
        check_lengths(&lengths, self.len(), self.seq_len())?;
        self.lengths = lengths;
        Ok(self)
    }

    /// Set sample identifiers.
    pub fn with_ids(mut self, ids: Vec<String>) -> Result<Self> {
        if ids.len() != self.len() {
            return Err(DataError::InvalidShape(format!(
                "expected {} ids, got {}",
                self.len(),
                ids.len()
            )));
        }
        self.ids = ids;
        Ok(self)
    }

    /// Noise amplitude per difficulty tier, and the seed the noise is drawn from.
    #[must_use]
    pub fn with_noise_tiers(mut self, tiers: Vec<f32>, seed: Seed) -> Self {
        self.noise_tiers = tiers;
        self.seed = seed;
        self
    }

    /// Padded sequence length.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.x.shape()[1]
    }

    /// Label matrix.
    #[must_use]
    pub fn labels(&self) -> &Array2<f32> {
        &self.y
    }

    /// Number of classes, taken as the largest class index in column 0 plus one.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.y
            .column(0)
            .iter()
            .fold(0usize, |acc, &v| acc.max(v.max(0.0) as usize + 1))
    }

    fn noise_amplitude(&self) -> f32 {
        if self.tier == 0 || self.noise_tiers.is_empty() {
            return 0.0;
        }
        let idx = (self.tier - 1).min(self.noise_tiers.len() - 1);
        self.noise_tiers[idx]
    }
}

impl SeriesDataset for LabeledDataset {
    fn len(&self) -> usize {
        self.x.shape()[0]
    }

    fn feat_dim(&self) -> usize {
        self.x.shape()[2]
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.len() {
            return Err(DataError::IndexOutOfBounds {
                index,
                length: self.len(),
            });
        }
        let len = self.lengths[index];
        let mut x = self.x.slice(s![index, ..len, ..]).to_owned();

        let amplitude = self.noise_amplitude();
        if amplitude > 0.0 {
            let mut rng = self
                .seed
                .for_sample(index)
                .derive(&format!("tier-{}", self.tier))
                .to_rng();
            x.mapv_inplace(|v| v + rng.gen_range(-amplitude..=amplitude));
        }

        Ok(Sample {
            x,
            target: SampleTarget::Label(self.y.index_axis(Axis(0), index).to_owned()),
            id: self.ids[index].clone(),
        })
    }

    fn harden(&mut self) {
        self.tier += 1;
        tracing::info!(
            tier = self.tier,
            noise = self.noise_amplitude(),
            "Labeled dataset hardened"
        );
    }

    fn difficulty(&self) -> usize {
        self.tier
    }
}

/// In-memory dataset for masked reconstruction.
///
/// Each sample hides a seeded random subset of its values (or, when target
/// features are set, every value of those features) and asks the model to
/// reconstruct them. Hidden inputs are zeroed.
///
/// Hardening raises the masking ratio by 0.05 per tier, up to 0.9.
#[derive(Debug, Clone)]
pub struct ImputationDataset {
    x: Array3<f32>,
    lengths: Vec<usize>,
    ids: Vec<String>,
    masking_ratio: f64,
    mask_feats: Option<Vec<usize>>,
    seed: Seed,
    tier: usize,
}

impl ImputationDataset {
    /// Create a dataset hiding `masking_ratio` of the values of every sample.
    pub fn new(x: Array3<f32>, masking_ratio: f64, seed: Seed) -> Result<Self> {
        let n = x.shape()[0];
        if n == 0 {
            return Err(DataError::EmptyDataset);
        }
        if !(0.0..1.0).contains(&masking_ratio) {
            return Err(DataError::InvalidShape(format!(
                "masking ratio must lie in [0, 1), got {masking_ratio}"
            )));
        }
        let seq_len = x.shape()[1];
        Ok(Self {
            x,
            lengths: vec![seq_len; n],
            ids: default_ids(n),
            masking_ratio,
            mask_feats: None,
            seed,
            tier: 0,
        })
    }

    /// Set per-sample valid lengths.
    pub fn with_lengths(mut self, lengths: Vec<usize>) -> Result<Self> {
        check_lengths(&lengths, self.len(), self.x.shape()[1])?;
        self.lengths = lengths;
        Ok(self)
    }

    /// Hide exactly these features at every time step instead of random values.
    ///
    /// `None` returns to random masking.
    pub fn set_mask_feats(&mut self, feats: Option<Vec<usize>>) -> Result<()> {
        if let Some(bad) = feats
            .as_ref()
            .and_then(|f| f.iter().find(|&&i| i >= self.feat_dim()))
        {
            return Err(DataError::IndexOutOfBounds {
                index: *bad,
                length: self.feat_dim(),
            });
        }
        self.mask_feats = feats;
        Ok(())
    }

    /// Current masking ratio.
    #[must_use]
    pub fn masking_ratio(&self) -> f64 {
        self.masking_ratio
    }
}

impl SeriesDataset for ImputationDataset {
    fn len(&self) -> usize {
        self.x.shape()[0]
    }

    fn feat_dim(&self) -> usize {
        self.x.shape()[2]
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.len() {
            return Err(DataError::IndexOutOfBounds {
                index,
                length: self.len(),
            });
        }
        let len = self.lengths[index];
        let values = self.x.slice(s![index, ..len, ..]).to_owned();

        let mask = match &self.mask_feats {
            Some(feats) => Array2::from_shape_fn(values.dim(), |(_, f)| feats.contains(&f)),
            None => {
                let mut rng = self.seed.for_sample(index).to_rng();
                let ratio = self.masking_ratio;
                Array2::from_shape_fn(values.dim(), |_| rng.gen_bool(ratio))
            }
        };

        let mut x = values.clone();
        x.zip_mut_with(&mask, |v, &hidden| {
            if hidden {
                *v = 0.0;
            }
        });

        Ok(Sample {
            x,
            target: SampleTarget::Masked { values, mask },
            id: self.ids[index].clone(),
        })
    }

    fn harden(&mut self) {
        self.tier += 1;
        self.masking_ratio = (self.masking_ratio + 0.05).min(0.9);
        tracing::info!(
            tier = self.tier,
            masking_ratio = self.masking_ratio,
            "Imputation dataset hardened"
        );
    }

    fn difficulty(&self) -> usize {
        self.tier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, l: usize, f: usize) -> Array3<f32> {
        Array3::from_shape_fn((n, l, f), |(i, t, j)| (i * 100 + t * 10 + j) as f32)
    }

    #[test]
    fn test_labeled_respects_lengths() {
        let y = Array2::from_shape_vec((3, 1), vec![0.0, 1.0, 2.0]).unwrap();
        let ds = LabeledDataset::from_arrays(ramp(3, 5, 2), y)
            .unwrap()
            .with_lengths(vec![5, 3, 1])
            .unwrap();

        assert_eq!(ds.num_classes(), 3);
        let sample = ds.get(1).unwrap();
        assert_eq!(sample.x.dim(), (3, 2));
        assert_eq!(sample.x[[2, 1]], 121.0);
        assert_eq!(sample.id, "1");
        assert!(matches!(ds.get(3), Err(DataError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn test_labeled_rejects_bad_lengths() {
        let y = Array2::zeros((2, 1));
        let ds = LabeledDataset::from_arrays(ramp(2, 4, 1), y).unwrap();
        assert!(ds.clone().with_lengths(vec![4]).is_err());
        assert!(ds.with_lengths(vec![4, 5]).is_err());
    }

    #[test]
    fn test_labeled_harden_adds_noise() {
        let y = Array2::zeros((2, 1));
        let mut ds = LabeledDataset::from_arrays(ramp(2, 4, 1), y)
            .unwrap()
            .with_noise_tiers(vec![0.5], Seed::new(1));
        let clean = ds.get(0).unwrap().x;

        ds.harden();
        assert_eq!(ds.difficulty(), 1);
        let noisy = ds.get(0).unwrap().x;
        assert_ne!(clean, noisy);
        assert!(clean
            .iter()
            .zip(noisy.iter())
            .all(|(a, b)| (a - b).abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn test_imputation_masks_are_seeded_and_zeroed() {
        let ds = ImputationDataset::new(ramp(2, 50, 3), 0.3, Seed::new(9)).unwrap();
        let a = ds.get(0).unwrap();
        let b = ds.get(0).unwrap();

        let SampleTarget::Masked { values, mask } = a.target else {
            panic!("expected masked target");
        };
        let SampleTarget::Masked { mask: mask_b, .. } = b.target else {
            panic!("expected masked target");
        };
        assert_eq!(mask, mask_b);
        assert!(mask.iter().any(|&m| m));
        for ((x, v), m) in a.x.iter().zip(values.iter()).zip(mask.iter()) {
            if *m {
                assert_eq!(*x, 0.0);
            } else {
                assert_eq!(x, v);
            }
        }
    }

    #[test]
    fn test_imputation_target_features() {
        let mut ds = ImputationDataset::new(ramp(1, 4, 3), 0.2, Seed::new(0)).unwrap();
        ds.set_mask_feats(Some(vec![1])).unwrap();
        let SampleTarget::Masked { mask, .. } = ds.get(0).unwrap().target else {
            panic!("expected masked target");
        };
        assert!(mask.column(1).iter().all(|&m| m));
        assert!(!mask.column(0).iter().any(|&m| m));
        assert!(ds.set_mask_feats(Some(vec![3])).is_err());
    }
}

//! Padded batches and their conversion to tensors.

use burn::prelude::*;
use burn::tensor::TensorData;
use ndarray::{s, Array2, Array3, Axis};

use crate::dataset::{Sample, SampleTarget};
use crate::error::{DataError, Result};

/// Targets of a batch.
#[derive(Debug, Clone)]
pub enum Targets {
    /// Supervised targets, shape `(batch, n_outputs)`.
    Labels(Array2<f32>),
    /// Reconstruction targets, both `(batch, length, features)`.
    Masked {
        /// Values to reconstruct.
        values: Array3<f32>,
        /// `true` where a value is to be predicted. Padded steps are `false`.
        mask: Array3<bool>,
    },
}

/// A batch of zero-padded samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Input, shape `(batch, length, features)`.
    pub x: Array3<f32>,
    /// Targets.
    pub targets: Targets,
    /// `(batch, length)`, `true` for real time steps, `false` for padding.
    pub padding_mask: Array2<bool>,
    /// Sample identifiers.
    pub ids: Vec<String>,
}

impl Batch {
    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.shape()[0]
    }

    /// Whether the batch has no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Padded length.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.x.shape()[1]
    }

    /// Input tensor on `device`.
    pub fn x_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        array3_tensor(&self.x, device)
    }

    /// Padding mask tensor on `device`.
    pub fn padding_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2, Bool> {
        let [b, l] = [self.padding_mask.nrows(), self.padding_mask.ncols()];
        let flat: Vec<f32> = self
            .padding_mask
            .iter()
            .map(|&m| if m { 1.0 } else { 0.0 })
            .collect();
        Tensor::<B, 2>::from_data(TensorData::new(flat, [b, l]), device).equal_elem(1.0)
    }
}

/// Copy an `(a, b, c)` array into a tensor.
pub(crate) fn array3_tensor<B: Backend>(array: &Array3<f32>, device: &B::Device) -> Tensor<B, 3> {
    let (a, b, c) = array.dim();
    let flat: Vec<f32> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(flat, [a, b, c]), device)
}

impl Targets {
    /// Label matrix as a tensor. `None` for reconstruction targets.
    pub fn labels_tensor<B: Backend>(&self, device: &B::Device) -> Option<Tensor<B, 2>> {
        match self {
            Targets::Labels(y) => {
                let (a, b) = y.dim();
                let flat: Vec<f32> = y.iter().copied().collect();
                Some(Tensor::from_data(TensorData::new(flat, [a, b]), device))
            }
            Targets::Masked { .. } => None,
        }
    }

    /// Reconstruction values and their mask (as 0/1 floats). `None` for labels.
    pub fn masked_tensors<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Option<(Tensor<B, 3>, Tensor<B, 3>)> {
        match self {
            Targets::Masked { values, mask } => {
                let mask = mask.mapv(|m| if m { 1.0f32 } else { 0.0 });
                Some((array3_tensor(values, device), array3_tensor(&mask, device)))
            }
            Targets::Labels(_) => None,
        }
    }
}

/// Collate samples into a zero-padded batch.
///
/// The padded length is the longest sample, or `max_len` when given; longer
/// samples are truncated. Every sample must have the same feature count and
/// the same kind of target.
pub fn collate(samples: Vec<Sample>, max_len: Option<usize>) -> Result<Batch> {
    let first = samples.first().ok_or(DataError::EmptyDataset)?;
    let n = samples.len();
    let feat_dim = first.x.ncols();
    let seq_len = max_len.unwrap_or_else(|| samples.iter().map(|s| s.x.nrows()).max().unwrap_or(0));

    let mut x = Array3::<f32>::zeros((n, seq_len, feat_dim));
    let mut padding_mask = Array2::<bool>::from_elem((n, seq_len), false);
    let mut ids = Vec::with_capacity(n);

    let mut labels: Option<Array2<f32>> = match &first.target {
        SampleTarget::Label(y) => Some(Array2::zeros((n, y.len()))),
        SampleTarget::Masked { .. } => None,
    };
    let mut masked: Option<(Array3<f32>, Array3<bool>)> = match &first.target {
        SampleTarget::Label(_) => None,
        SampleTarget::Masked { .. } => Some((
            Array3::zeros((n, seq_len, feat_dim)),
            Array3::from_elem((n, seq_len, feat_dim), false),
        )),
    };

    for (i, sample) in samples.into_iter().enumerate() {
        if sample.x.ncols() != feat_dim {
            return Err(DataError::InvalidShape(format!(
                "sample '{}' has {} features, batch has {feat_dim}",
                sample.id,
                sample.x.ncols()
            )));
        }
        let end = sample.x.nrows().min(seq_len);
        x.slice_mut(s![i, ..end, ..])
            .assign(&sample.x.slice(s![..end, ..]));
        padding_mask.slice_mut(s![i, ..end]).fill(true);

        match (sample.target, labels.as_mut(), masked.as_mut()) {
            (SampleTarget::Label(y), Some(out), None) => {
                if y.len() != out.ncols() {
                    return Err(DataError::InvalidShape(format!(
                        "sample '{}' has {} targets, batch has {}",
                        sample.id,
                        y.len(),
                        out.ncols()
                    )));
                }
                out.index_axis_mut(Axis(0), i).assign(&y);
            }
            (SampleTarget::Masked { values, mask }, None, Some((out_v, out_m))) => {
                if values.dim() != sample.x.dim() || mask.dim() != sample.x.dim() {
                    return Err(DataError::InvalidShape(format!(
                        "sample '{}' target shape differs from its input",
                        sample.id
                    )));
                }
                out_v
                    .slice_mut(s![i, ..end, ..])
                    .assign(&values.slice(s![..end, ..]));
                out_m
                    .slice_mut(s![i, ..end, ..])
                    .assign(&mask.slice(s![..end, ..]));
            }
            _ => {
                return Err(DataError::InvalidShape(format!(
                    "sample '{}' mixes labelled and masked targets in one batch",
                    sample.id
                )))
            }
        }
        ids.push(sample.id);
    }

    let targets = match (labels, masked) {
        (Some(y), _) => Targets::Labels(y),
        (None, Some((values, mask))) => Targets::Masked { values, mask },
        (None, None) => return Err(DataError::EmptyDataset),
    };

    Ok(Batch {
        x,
        targets,
        padding_mask,
        ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use ndarray::Array1;

    fn labelled(len: usize, label: f32, id: &str) -> Sample {
        Sample {
            x: Array2::from_elem((len, 2), 1.0),
            target: SampleTarget::Label(Array1::from_vec(vec![label])),
            id: id.to_string(),
        }
    }

    #[test]
    fn test_collate_pads_to_longest() {
        let batch = collate(vec![labelled(4, 0.0, "a"), labelled(2, 1.0, "b")], None).unwrap();

        assert_eq!(batch.x.dim(), (2, 4, 2));
        assert_eq!(batch.padding_mask.row(1).to_vec(), vec![true, true, false, false]);
        assert_eq!(batch.x[[1, 3, 0]], 0.0);
        assert_eq!(batch.ids, vec!["a", "b"]);
        match &batch.targets {
            Targets::Labels(y) => assert_eq!(y.column(0).to_vec(), vec![0.0, 1.0]),
            Targets::Masked { .. } => panic!("expected labels"),
        }
    }

    #[test]
    fn test_collate_truncates_to_max_len() {
        let batch = collate(vec![labelled(6, 0.0, "a")], Some(3)).unwrap();
        assert_eq!(batch.seq_len(), 3);
        assert!(batch.padding_mask.iter().all(|&m| m));
    }

    #[test]
    fn test_collate_rejects_mixed_features() {
        let mut odd = labelled(3, 0.0, "odd");
        odd.x = Array2::zeros((3, 5));
        let err = collate(vec![labelled(3, 0.0, "a"), odd], None).unwrap_err();
        assert!(matches!(err, DataError::InvalidShape(_)));
    }

    #[test]
    fn test_padded_steps_never_in_target_mask() {
        let sample = |len: usize| Sample {
            x: Array2::zeros((len, 1)),
            target: SampleTarget::Masked {
                values: Array2::ones((len, 1)),
                mask: Array2::from_elem((len, 1), true),
            },
            id: len.to_string(),
        };
        let batch = collate(vec![sample(3), sample(1)], None).unwrap();
        let Targets::Masked { mask, .. } = &batch.targets else {
            panic!("expected masked targets");
        };
        assert_eq!(mask.iter().filter(|&&m| m).count(), 4);
        assert!(!mask[[1, 1, 0]]);
    }

    #[test]
    fn test_tensors_match_arrays() {
        let device = Default::default();
        let batch = collate(vec![labelled(3, 1.0, "a"), labelled(1, 0.0, "b")], None).unwrap();

        let x = batch.x_tensor::<NdArray>(&device);
        assert_eq!(x.dims(), [2, 3, 2]);

        let mask = batch.padding_tensor::<NdArray>(&device);
        let active: f32 = mask.float().sum().into_scalar();
        assert_eq!(active, 4.0);

        let y = batch.targets.labels_tensor::<NdArray>(&device).unwrap();
        assert_eq!(y.dims(), [2, 1]);
    }
}

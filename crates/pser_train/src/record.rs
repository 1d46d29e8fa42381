//! Per-batch raw outputs kept by an evaluation pass.

use std::path::Path;

use ndarray::{Array2, Array3, ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Raw arrays of one batch. Absent fields were not produced by the runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// `(batch, length, features)`, `true` where a value was reconstructed
    /// (target mask already combined with the padding mask).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_masks: Option<Array3<bool>>,
    /// Labels `(batch, n_out)` or reconstruction targets `(batch, length, features)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<ArrayD<f32>>,
    /// Model outputs, same layout as `targets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<ArrayD<f32>>,
    /// Input reconstruction of a supervised model, when it produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recon: Option<Array3<f32>>,
    /// Loss per sample (supervised) or per active element (reconstruction).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<f64>>,
    /// Sample identifiers.
    #[serde(rename = "IDs")]
    pub ids: Vec<String>,
}

/// Batch records of one pass, in batch order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerBatchRecord {
    batches: Vec<BatchRecord>,
}

impl PerBatchRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch.
    pub fn push(&mut self, batch: BatchRecord) {
        self.batches.push(batch);
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether no batch was recorded.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Recorded batches.
    pub fn batches(&self) -> &[BatchRecord] {
        &self.batches
    }

    /// Sample identifiers of all batches, in order.
    pub fn ids(&self) -> Vec<String> {
        self.batches.iter().flat_map(|b| b.ids.iter().cloned()).collect()
    }

    /// Concatenate two-dimensional predictions of all batches along the sample axis.
    pub fn stacked_predictions(&self) -> Result<Option<Array2<f32>>> {
        let parts = self
            .batches
            .iter()
            .filter_map(|b| b.predictions.as_ref())
            .map(|p| {
                p.view()
                    .into_dimensionality::<ndarray::Ix2>()
                    .map_err(|e| TrainError::Other(format!("predictions are not 2-D: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if parts.is_empty() {
            return Ok(None);
        }
        ndarray::concatenate(Axis(0), &parts)
            .map(Some)
            .map_err(|e| TrainError::Other(e.to_string()))
    }

    /// Write the record as JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read a record written by [`write_json`](Self::write_json).
    pub fn read_json(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Sum per-element reconstruction losses into one value per sample.
///
/// Element losses of a batch are stored in row-major order of its active
/// target-mask positions; every sample owns the next `active(sample)` of them.
pub fn per_sample_metrics(record: &PerBatchRecord) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    for (b, batch) in record.batches().iter().enumerate() {
        let (Some(masks), Some(metrics)) = (&batch.target_masks, &batch.metrics) else {
            return Err(TrainError::Other(format!(
                "batch {b} lacks target masks or element metrics"
            )));
        };
        let mut offset = 0usize;
        for sample in masks.outer_iter() {
            let active = sample.iter().filter(|&&m| m).count();
            let end = offset + active;
            let slice = metrics.get(offset..end).ok_or_else(|| {
                TrainError::Other(format!(
                    "batch {b} has {} element metrics, masks need at least {end}",
                    metrics.len()
                ))
            })?;
            out.push(slice.iter().sum());
            offset = end;
        }
        if offset != metrics.len() {
            return Err(TrainError::Other(format!(
                "batch {b} has {} element metrics for {offset} active elements",
                metrics.len()
            )));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    fn masked_batch() -> BatchRecord {
        // sample 0: two active elements, sample 1: one
        let mut mask = Array3::from_elem((2, 2, 1), false);
        mask[[0, 0, 0]] = true;
        mask[[0, 1, 0]] = true;
        mask[[1, 1, 0]] = true;
        BatchRecord {
            target_masks: Some(mask),
            metrics: Some(vec![1.0, 2.0, 4.0]),
            ids: vec!["a".into(), "b".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_per_sample_sums_active_elements() {
        let mut record = PerBatchRecord::new();
        record.push(masked_batch());
        record.push(masked_batch());
        assert_eq!(per_sample_metrics(&record).unwrap(), vec![3.0, 4.0, 3.0, 4.0]);
        assert_eq!(record.ids(), vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_per_sample_rejects_count_mismatch() {
        let mut batch = masked_batch();
        batch.metrics = Some(vec![1.0, 2.0]);
        let mut record = PerBatchRecord::new();
        record.push(batch);
        assert!(per_sample_metrics(&record).is_err());
    }

    #[test]
    fn test_stacked_predictions_and_json() {
        let mut record = PerBatchRecord::new();
        for rows in [arr2(&[[1.0f32, 2.0]]), arr2(&[[3.0f32, 4.0], [5.0, 6.0]])] {
            record.push(BatchRecord {
                predictions: Some(rows.into_dyn()),
                ids: vec!["x".into()],
                ..Default::default()
            });
        }
        let stacked = record.stacked_predictions().unwrap().unwrap();
        assert_eq!(stacked.dim(), (3, 2));
        assert_eq!(stacked[[2, 1]], 6.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_predictions.json");
        record.write_json(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"IDs\""));
        assert!(!text.contains("target_masks"));
        assert_eq!(PerBatchRecord::read_json(&path).unwrap(), record);
    }
}

//! Activation feature vectors.

use std::ops::Range;

use burn::prelude::*;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{OpenMaxError, Result};
use pser_core::SupervisedOutput;

/// Widths of the channels an activation feature vector is split into.
///
/// Channel 0 is always the logits, so its width is the number of classes;
/// channel `i > 0` is the pooled output of intermediate layer `i - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    widths: Vec<usize>,
}

impl ChannelLayout {
    /// Layout with the given channel widths, logits first.
    pub fn new(widths: Vec<usize>) -> Result<Self> {
        if widths.is_empty() || widths.contains(&0) {
            return Err(OpenMaxError::InvalidInput(format!(
                "channel widths must be non-empty and positive, got {widths:?}"
            )));
        }
        Ok(Self { widths })
    }

    /// Number of channels.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.widths.len()
    }

    /// Number of classes (width of the logits channel).
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.widths[0]
    }

    /// Total feature width.
    #[must_use]
    pub fn width(&self) -> usize {
        self.widths.iter().sum()
    }

    /// Column range of `channel` within a feature vector.
    #[must_use]
    pub fn range(&self, channel: usize) -> Range<usize> {
        let start: usize = self.widths[..channel].iter().sum();
        start..start + self.widths[channel]
    }

    /// Column range of the logits.
    #[must_use]
    pub fn logits(&self) -> Range<usize> {
        self.range(0)
    }
}

/// Concatenate logits with the global-average pooled activations.
///
/// Returns an `(N, num_classes + Σ channels)` matrix and its layout.
pub fn activation_features<B: Backend>(
    output: &SupervisedOutput<B>,
) -> Result<(Array2<f32>, ChannelLayout)> {
    let [n, num_classes] = output.predictions.dims();
    let mut widths = vec![num_classes];
    let mut parts = vec![output.predictions.clone()];

    for act in &output.activations {
        let [batch, channels, _] = act.dims();
        if batch != n {
            return Err(OpenMaxError::InvalidInput(format!(
                "activation batch {batch} differs from logits batch {n}"
            )));
        }
        parts.push(act.clone().mean_dim(2).reshape([batch, channels]));
        widths.push(channels);
    }

    let layout = ChannelLayout::new(widths)?;
    let flat = Tensor::cat(parts, 1)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| OpenMaxError::Tensor(format!("{e:?}")))?;
    let features = Array2::from_shape_vec((n, layout.width()), flat)
        .map_err(|e| OpenMaxError::InvalidInput(e.to_string()))?;
    Ok((features, layout))
}

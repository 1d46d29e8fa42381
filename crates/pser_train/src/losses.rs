//! Unreduced loss functions.
//!
//! Every loss returns one value per sample (or per element) so the runners
//! can weight batches by their active counts.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;

/// Cross-entropy per sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerSampleCrossEntropy;

impl PerSampleCrossEntropy {
    /// Create a new loss.
    pub fn new() -> Self {
        Self
    }

    /// `logits` `(batch, classes)`, `targets` `(batch,)` class indices; returns `(batch,)`.
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [batch, _] = logits.dims();
        let log_probs = log_softmax(logits, 1);
        log_probs.gather(1, targets.reshape([batch, 1])).reshape([batch]).neg()
    }
}

/// Squared error summed over outputs, per sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerSampleSquaredError;

impl PerSampleSquaredError {
    /// Create a new loss.
    pub fn new() -> Self {
        Self
    }

    /// `preds` and `targets` `(batch, outputs)`; returns `(batch,)`.
    pub fn forward<B: Backend>(&self, preds: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch, _] = preds.dims();
        let diff = preds - targets;
        (diff.clone() * diff).sum_dim(1).reshape([batch])
    }
}

/// Squared error on the active elements of a reconstruction.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaskedSquaredError;

impl MaskedSquaredError {
    /// Create a new loss.
    pub fn new() -> Self {
        Self
    }

    /// Element-wise squared error, zero where `mask` is 0.
    ///
    /// All tensors are `(batch, length, features)`; `mask` holds 0/1 floats.
    pub fn forward<B: Backend>(&self, preds: Tensor<B, 3>, targets: Tensor<B, 3>, mask: Tensor<B, 3>) -> Tensor<B, 3> {
        let diff = preds - targets;
        diff.clone() * diff * mask
    }
}

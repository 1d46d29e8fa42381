//! Fully convolutional reconstruction network for masked imputation.

use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::PaddingConfig1d;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::apply_padding;
use crate::encoder::ConvBlock;
use pser_core::MaskedModel;

/// Configuration for the [`MaskedEncoder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskedEncoderConfig {
    /// Number of input features per time step.
    pub feat_dim: usize,
    /// Filters of both hidden conv blocks.
    pub n_filters: usize,
    /// Kernel size of the hidden conv blocks.
    pub kernel_size: usize,
}

impl MaskedEncoderConfig {
    /// Create a new config.
    pub fn new(feat_dim: usize) -> Self {
        Self {
            feat_dim,
            n_filters: 64,
            kernel_size: 3,
        }
    }

    /// Set the hidden filter count.
    #[must_use]
    pub fn with_filters(mut self, n_filters: usize) -> Self {
        self.n_filters = n_filters;
        self
    }

    /// Initialize the model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MaskedEncoder<B> {
        MaskedEncoder {
            block1: ConvBlock::new(self.feat_dim, self.n_filters, self.kernel_size, device),
            block2: ConvBlock::new(self.n_filters, self.n_filters, self.kernel_size, device),
            output: Conv1dConfig::new(self.n_filters, self.feat_dim, 1)
                .with_padding(PaddingConfig1d::Valid)
                .init(device),
        }
    }
}

/// Reconstructs every time step of a `(batch, length, features)` input.
#[derive(Module, Debug)]
pub struct MaskedEncoder<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    output: Conv1d<B>,
}

impl<B: Backend> MaskedModel<B> for MaskedEncoder<B> {
    fn forward(&self, x: Tensor<B, 3>, padding_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let x = apply_padding(x, padding_mask).swap_dims(1, 2);
        let h = self.block2.forward(self.block1.forward(x));
        self.output.forward(h).swap_dims(1, 2)
    }

    fn output_l2(&self) -> Tensor<B, 1> {
        let w = self.output.weight.val();
        let mut l2 = (w.clone() * w).sum();
        if let Some(bias) = &self.output.bias {
            let b = bias.val();
            l2 = l2 + (b.clone() * b).sum();
        }
        l2
    }
}

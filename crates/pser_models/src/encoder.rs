//! Convolutional pattern-series encoder.
//!
//! Two convolutional blocks followed by global average pooling and a
//! two-layer head. The ReLU outputs of both blocks are returned as the
//! intermediate activations used by OpenMax.

use burn::nn::{
    conv::{Conv1d, Conv1dConfig},
    pool::{AdaptiveAvgPool1d, AdaptiveAvgPool1dConfig, MaxPool1d, MaxPool1dConfig},
    Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig1d, Relu,
};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::apply_padding;
use pser_core::{PatternModel, SupervisedOutput};

/// Configuration for the [`PatternSeriesEncoder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSeriesEncoderConfig {
    /// Number of input features per time step.
    pub feat_dim: usize,
    /// Width of the prediction vector (classes or regression targets).
    pub num_outputs: usize,
    /// Filters of the first conv block.
    pub n_filters_1: usize,
    /// Filters of the second conv block.
    pub n_filters_2: usize,
    /// Kernel size of both conv blocks.
    pub kernel_size: usize,
    /// Width of the hidden dense layer.
    pub hidden: usize,
    /// Dropout before the output layer.
    pub dropout: f64,
}

impl Default for PatternSeriesEncoderConfig {
    fn default() -> Self {
        Self {
            feat_dim: 1,
            num_outputs: 2,
            n_filters_1: 64,
            n_filters_2: 128,
            kernel_size: 3,
            hidden: 256,
            dropout: 0.5,
        }
    }
}

impl PatternSeriesEncoderConfig {
    /// Create a new config with specified dimensions.
    pub fn new(feat_dim: usize, num_outputs: usize) -> Self {
        Self {
            feat_dim,
            num_outputs,
            ..Default::default()
        }
    }

    /// Set the number of filters of both conv blocks.
    #[must_use]
    pub fn with_filters(mut self, n_filters_1: usize, n_filters_2: usize) -> Self {
        self.n_filters_1 = n_filters_1;
        self.n_filters_2 = n_filters_2;
        self
    }

    /// Set the hidden layer width.
    #[must_use]
    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    /// Set the dropout probability.
    #[must_use]
    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    /// Initialize the model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatternSeriesEncoder<B> {
        PatternSeriesEncoder::new(self.clone(), device)
    }
}

/// Conv1d -> ReLU
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv1d<B>,
}

impl<B: Backend> ConvBlock<B> {
    /// Create a new convolutional block.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, device: &B::Device) -> Self {
        let conv = Conv1dConfig::new(in_channels, out_channels, kernel_size)
            .with_padding(PaddingConfig1d::Same)
            .init(device);
        Self { conv }
    }

    /// Forward pass, `(batch, channels, length)` in and out.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        Relu::new().forward(self.conv.forward(x))
    }
}

/// Supervised encoder for `(batch, length, features)` inputs.
///
/// Architecture:
/// - Conv1d(feat_dim, 64, k=3) -> ReLU -> MaxPool(2)
/// - Conv1d(64, 128, k=3) -> ReLU
/// - Global Average Pooling
/// - Linear(128, 256) -> ReLU -> Dropout(0.5)
/// - Linear(256, num_outputs)
///
/// Padded time steps are zeroed before the first convolution.
#[derive(Module, Debug)]
pub struct PatternSeriesEncoder<B: Backend> {
    block1: ConvBlock<B>,
    pool: MaxPool1d,
    block2: ConvBlock<B>,
    gap: AdaptiveAvgPool1d,
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> PatternSeriesEncoder<B> {
    /// Create a new encoder.
    pub fn new(config: PatternSeriesEncoderConfig, device: &B::Device) -> Self {
        Self {
            block1: ConvBlock::new(config.feat_dim, config.n_filters_1, config.kernel_size, device),
            pool: MaxPool1dConfig::new(2).with_stride(2).init(),
            block2: ConvBlock::new(config.n_filters_1, config.n_filters_2, config.kernel_size, device),
            gap: AdaptiveAvgPool1dConfig::new(1).init(),
            hidden: LinearConfig::new(config.n_filters_2, config.hidden).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            output: LinearConfig::new(config.hidden, config.num_outputs).init(device),
        }
    }
}

impl<B: Backend> PatternModel<B> for PatternSeriesEncoder<B> {
    fn forward(&self, x: Tensor<B, 3>, padding_mask: Tensor<B, 2, Bool>) -> SupervisedOutput<B> {
        let x = apply_padding(x, padding_mask).swap_dims(1, 2);

        let act1 = self.block1.forward(x);
        let act2 = self.block2.forward(self.pool.forward(act1.clone()));

        let pooled = self.gap.forward(act2.clone());
        let [batch, channels, _] = pooled.dims();
        let h = Relu::new().forward(self.hidden.forward(pooled.reshape([batch, channels])));
        let predictions = self.output.forward(self.dropout.forward(h));

        SupervisedOutput {
            predictions,
            recon: None,
            activations: vec![act1, act2],
        }
    }

    fn num_outputs(&self) -> usize {
        self.output.weight.dims()[1]
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

    fn with_output_of(self, donor: Self) -> Self {
        Self {
            output: donor.output,
            ..self
        }
    }

    fn freeze_backbone(self) -> Self {
        Self {
            block1: self.block1.no_grad(),
            block2: self.block2.no_grad(),
            hidden: self.hidden.no_grad(),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_config_builder() {
        let config = PatternSeriesEncoderConfig::new(3, 5)
            .with_filters(8, 16)
            .with_hidden(32)
            .with_dropout(0.1);
        assert_eq!(config.feat_dim, 3);
        assert_eq!(config.num_outputs, 5);
        assert_eq!(config.n_filters_2, 16);
        assert_eq!(config.hidden, 32);
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = PatternSeriesEncoderConfig::new(3, 4)
            .with_filters(8, 16)
            .with_hidden(12)
            .init::<TestBackend>(&device);

        let x = Tensor::<TestBackend, 3>::random([2, 10, 3], Distribution::Normal(0.0, 1.0), &device);
        let mask = Tensor::<TestBackend, 2>::ones([2, 10], &device).equal_elem(1.0);
        let out = model.forward(x, mask);

        assert_eq!(out.predictions.dims(), [2, 4]);
        assert_eq!(out.activations.len(), 2);
        assert_eq!(out.activations[0].dims(), [2, 8, 10]);
        assert_eq!(out.activations[1].dims(), [2, 16, 5]);
        assert!(out.recon.is_none());
        assert_eq!(model.num_outputs(), 4);
    }

    #[test]
    fn test_padding_is_ignored() {
        let device = Default::default();
        let model = PatternSeriesEncoderConfig::new(1, 2)
            .with_filters(4, 4)
            .with_hidden(4)
            .with_dropout(0.0)
            .init::<TestBackend>(&device);

        let a = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0, 0.0, 0.0], [1, 6, 1]),
            &device,
        );
        let b = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0, 9.0, -9.0], [1, 6, 1]),
            &device,
        );
        let mask = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 1.0, 1.0, 0.0, 0.0], [1, 6]),
            &device,
        )
        .equal_elem(1.0);

        let pa = model.forward(a, mask.clone()).predictions.into_data().to_vec::<f32>().unwrap();
        let pb = model.forward(b, mask).predictions.into_data().to_vec::<f32>().unwrap();
        for (x, y) in pa.iter().zip(&pb) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_output_swap_and_l2() {
        let device = Default::default();
        let model = PatternSeriesEncoderConfig::new(2, 3).with_filters(4, 4).with_hidden(6).init::<TestBackend>(&device);
        let donor = PatternSeriesEncoderConfig::new(2, 7).with_filters(4, 4).with_hidden(6).init::<TestBackend>(&device);

        let l2 = model.output_l2().into_scalar();
        assert!(l2 > 0.0);

        let swapped = model.with_output_of(donor);
        assert_eq!(swapped.num_outputs(), 7);
    }
}

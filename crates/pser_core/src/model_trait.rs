//! Model traits for training.
//!
//! The runners treat networks as differentiable functions from an input
//! batch and its padding mask to predictions. Both traits are generic over
//! any [`Backend`] so that the autodiff model and its `valid()` inner module
//! share one implementation.

use burn::prelude::*;

/// Output of a supervised forward pass.
#[derive(Debug, Clone)]
pub struct SupervisedOutput<B: Backend> {
    /// Class logits or regression outputs, shape `(batch, num_outputs)`.
    pub predictions: Tensor<B, 2>,
    /// Optional input reconstruction, shape `(batch, length, features)`.
    pub recon: Option<Tensor<B, 3>>,
    /// Intermediate layer activations, each `(batch, channels, length)`.
    ///
    /// Global-average pooling over the last axis turns each into one
    /// activation channel of the OpenMax feature vector.
    pub activations: Vec<Tensor<B, 3>>,
}

/// A network trained by the supervised runner.
pub trait PatternModel<B: Backend>: Module<B> + Clone + Send {
    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `(batch, length, features)`
    /// * `padding_mask` - `(batch, length)`, `true` for real time steps
    fn forward(&self, x: Tensor<B, 3>, padding_mask: Tensor<B, 2, Bool>) -> SupervisedOutput<B>;

    /// Width of the prediction vector.
    fn num_outputs(&self) -> usize;

    /// Squared L2 norm of the output layer's parameters, shape `[1]`.
    fn output_l2(&self) -> Tensor<B, 1>;

    /// Replace this model's output layer with the one of `donor`.
    ///
    /// Used when a checkpoint is loaded into a model whose output width differs.
    fn with_output_of(self, donor: Self) -> Self;

    /// Stop gradients for every parameter except the output layer.
    fn freeze_backbone(self) -> Self;
}

/// A network trained by the unsupervised (masked reconstruction) runner.
pub trait MaskedModel<B: Backend>: Module<B> + Clone + Send {
    /// Reconstruct the input, shape `(batch, length, features)`.
    fn forward(&self, x: Tensor<B, 3>, padding_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3>;

    /// Squared L2 norm of the output layer's parameters, shape `[1]`.
    fn output_l2(&self) -> Tensor<B, 1>;
}

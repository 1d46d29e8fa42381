//! # pser_models
//!
//! Small convolutional encoders used by the `pser` binary and the
//! integration tests. Any network implementing
//! [`pser_core::PatternModel`] or [`pser_core::MaskedModel`] can replace them.
//!
//! - [`PatternSeriesEncoder`] - supervised classifier/regressor exposing
//!   its intermediate activations for OpenMax
//! - [`MaskedEncoder`] - fully convolutional reconstruction network for
//!   masked imputation pre-training

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod encoder;
mod masked;

pub use encoder::{ConvBlock, PatternSeriesEncoder, PatternSeriesEncoderConfig};
pub use masked::{MaskedEncoder, MaskedEncoderConfig};

use burn::prelude::*;

/// Zero the padded time steps of a `(batch, length, features)` input.
pub(crate) fn apply_padding<B: Backend>(x: Tensor<B, 3>, padding_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
    let mask = padding_mask.float().unsqueeze_dim::<3>(2);
    x * mask
}

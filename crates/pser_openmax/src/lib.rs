//! # pser_openmax
//!
//! Open-set recognition layered on a closed-set classifier.
//!
//! The pipeline, in the order a run uses it:
//! 1. [`activation_features`]: logits concatenated with the global-average
//!    pooled intermediate activations, split into channels by a [`ChannelLayout`]
//! 2. [`build_weibull_model`]: per-class mean activation vectors (MAVs) over
//!    correctly classified training samples, their [`compute_channel_distances`],
//!    and [`weibull_tailfitting`] on the largest distances
//! 3. [`get_scores`]: revision of the top-ranked logits by the Weibull CDF,
//!    giving an `(N, C + 1)` OpenMax distribution with an explicit unknown class,
//!    next to the plain `(N, C)` softmax
//!
//! ## Example
//!
//! ```rust,ignore
//! use pser_openmax::{build_weibull_model, get_scores, ClassIndexMap, OpenSetIndexMap};
//!
//! let model = build_weibull_model(&train_features, &train_labels, &layout, &config)?;
//! let classes = ClassIndexMap::identity(layout.num_classes());
//! let open_set = OpenSetIndexMap::unknown_last(&classes);
//! let scores = get_scores(&model, &test_features, layout.num_classes(), &classes, &open_set, &config)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod activation;
mod distance;
mod error;
mod mav;
mod recalibrate;
mod weibull;

pub use activation::{activation_features, ChannelLayout};
pub use distance::{channel_distance, compute_channel_distances};
pub use error::{OpenMaxError, Result};
pub use mav::{build_weibull_model, class_means, predicted_classes, ClassFeatures};
pub use recalibrate::{get_scores, ClassIndexMap, OpenMaxScores, OpenSetIndexMap};
pub use weibull::{weibull_tailfitting, ClassWeibull, FitFailure, WeibullFit, WeibullModel};

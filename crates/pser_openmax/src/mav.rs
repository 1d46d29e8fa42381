//! Class mean activation vectors and the end-to-end tail model fit.

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::activation::ChannelLayout;
use crate::distance::compute_channel_distances;
use crate::error::{OpenMaxError, Result};
use crate::weibull::{weibull_tailfitting, WeibullModel};
use pser_core::OpenMaxConfig;

/// Correctly classified samples of one class and their mean.
#[derive(Debug, Clone)]
pub struct ClassFeatures {
    /// Class label.
    pub class: usize,
    /// Mean activation vector; zeros when the class has no correct samples.
    pub mav: Array1<f32>,
    /// Activation features of the correctly classified samples.
    pub features: Array2<f32>,
}

/// Argmax over the logits channel of every feature row.
#[must_use]
pub fn predicted_classes(features: ArrayView2<f32>, layout: &ChannelLayout) -> Vec<usize> {
    let logits = layout.logits();
    features
        .rows()
        .into_iter()
        .map(|row| {
            row.slice(ndarray::s![logits.clone()])
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
                    if v > bv {
                        (i, v)
                    } else {
                        (bi, bv)
                    }
                })
                .0
        })
        .collect()
}

/// Group correctly classified rows by label and average them.
///
/// A row is correct when the argmax of its logits channel equals its label.
/// Every class `0..num_classes` is returned, including classes without a
/// single correct sample. Labels outside that range are ignored.
pub fn class_means(
    features: ArrayView2<f32>,
    labels: &[usize],
    layout: &ChannelLayout,
) -> Result<Vec<ClassFeatures>> {
    if features.nrows() != labels.len() {
        return Err(OpenMaxError::InvalidInput(format!(
            "{} feature rows for {} labels",
            features.nrows(),
            labels.len()
        )));
    }
    if features.ncols() != layout.width() {
        return Err(OpenMaxError::InvalidInput(format!(
            "feature width {} does not match layout width {}",
            features.ncols(),
            layout.width()
        )));
    }

    let predicted = predicted_classes(features, layout);
    let num_classes = layout.num_classes();
    let mut rows: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (i, (&label, &pred)) in labels.iter().zip(&predicted).enumerate() {
        if label < num_classes && label == pred {
            rows[label].push(i);
        }
    }

    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(class, idx)| {
            let selected = features.select(Axis(0), &idx);
            let mav = selected
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(layout.width()));
            ClassFeatures {
                class,
                mav,
                features: selected,
            }
        })
        .collect())
}

/// Fit the OpenMax tail model from training-set activation features.
///
/// MAVs and distances are recomputed from scratch on every call.
pub fn build_weibull_model(
    features: ArrayView2<f32>,
    labels: &[usize],
    layout: &ChannelLayout,
    config: &OpenMaxConfig,
) -> Result<WeibullModel> {
    let groups = class_means(features, labels, layout)?;
    let n_correct: usize = groups.iter().map(|g| g.features.nrows()).sum();
    if n_correct == 0 {
        return Err(OpenMaxError::InvalidInput(
            "no correctly classified samples to fit on".to_string(),
        ));
    }
    tracing::info!(
        samples = features.nrows(),
        correct = n_correct,
        classes = groups.len(),
        "Fitting Weibull tail models"
    );

    let mut mavs = Vec::with_capacity(groups.len());
    let mut distances = Vec::with_capacity(groups.len());
    let mut classes = Vec::with_capacity(groups.len());
    for group in groups {
        distances.push(compute_channel_distances(
            group.mav.view(),
            group.features.view(),
            layout,
            config.distance,
            config.euclid_weight,
        )?);
        mavs.push(group.mav);
        classes.push(group.class);
    }

    weibull_tailfitting(&mavs, &distances, &classes, layout, config.tail_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_only_correct_samples_enter_the_mean() {
        let layout = ChannelLayout::new(vec![2, 1]).unwrap();
        let features = arr2(&[
            [2.0f32, 0.0, 1.0], // pred 0, label 0
            [4.0, 0.0, 3.0],    // pred 0, label 0
            [5.0, 0.0, 9.0],    // pred 0, label 1: wrong
            [0.0, 1.0, 7.0],    // pred 1, label 1
        ]);
        let groups = class_means(features.view(), &[0, 0, 1, 1], &layout).unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].mav.to_vec(), vec![3.0, 0.0, 2.0]);
        assert_eq!(groups[1].features.nrows(), 1);
        assert_eq!(groups[1].mav.to_vec(), vec![0.0, 1.0, 7.0]);
    }

    #[test]
    fn test_class_without_correct_samples() {
        let layout = ChannelLayout::new(vec![3]).unwrap();
        let features = arr2(&[[1.0f32, 0.0, 0.0]]);
        let groups = class_means(features.view(), &[0], &layout).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2].features.nrows(), 0);
        assert_eq!(groups[2].mav.to_vec(), vec![0.0; 3]);
    }

    #[test]
    fn test_build_reports_missing_classes() {
        let layout = ChannelLayout::new(vec![2]).unwrap();
        let features = Array2::from_shape_fn((30, 2), |(i, j)| {
            if j == 0 {
                3.0 + (i as f32) * 0.1
            } else {
                (i % 7) as f32 * 0.2
            }
        });
        let labels = vec![0; 30];
        let config = OpenMaxConfig::default();

        let model = build_weibull_model(features.view(), &labels, &layout, &config).unwrap();
        assert!(model.is_valid(0));
        assert!(!model.is_valid(1));
        assert!(model.class_error(1).is_some());
    }

    #[test]
    fn test_build_without_correct_samples_fails() {
        let layout = ChannelLayout::new(vec![2]).unwrap();
        let features = arr2(&[[0.0f32, 1.0]]);
        let config = OpenMaxConfig::default();
        assert!(build_weibull_model(features.view(), &[0], &layout, &config).is_err());
    }
}

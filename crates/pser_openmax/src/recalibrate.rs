//! OpenMax recalibration of closed-set logits.

use std::collections::BTreeMap;

use ndarray::{s, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::distance::channel_distance;
use crate::error::{OpenMaxError, Result};
use crate::weibull::WeibullModel;
use pser_core::OpenMaxConfig;

/// Maps logit columns to the class labels of a [`WeibullModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassIndexMap {
    labels: Vec<usize>,
}

impl ClassIndexMap {
    /// Column `i` holds class `i`.
    #[must_use]
    pub fn identity(num_classes: usize) -> Self {
        Self {
            labels: (0..num_classes).collect(),
        }
    }

    /// Column `i` holds class `labels[i]`. Labels must be unique.
    pub fn from_labels(labels: Vec<usize>) -> Result<Self> {
        let mut sorted = labels.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != labels.len() {
            return Err(OpenMaxError::InvalidInput(format!(
                "duplicate class labels in {labels:?}"
            )));
        }
        Ok(Self { labels })
    }

    /// Class label of logit column `column`.
    #[must_use]
    pub fn label(&self, column: usize) -> usize {
        self.labels[column]
    }

    /// Number of known classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Maps class labels to slots of the `num_classes + 1` open-set output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSetIndexMap {
    slots: BTreeMap<usize, usize>,
    unknown: usize,
}

impl OpenSetIndexMap {
    /// Known classes keep their logit column; the unknown class is the last slot.
    #[must_use]
    pub fn unknown_last(classes: &ClassIndexMap) -> Self {
        Self {
            slots: classes
                .labels
                .iter()
                .enumerate()
                .map(|(col, &label)| (label, col))
                .collect(),
            unknown: classes.len(),
        }
    }

    /// Explicit slots. Together with `unknown` they must cover `0..=slots.len()` exactly once.
    pub fn new(slots: BTreeMap<usize, usize>, unknown: usize) -> Result<Self> {
        let mut used: Vec<usize> = slots.values().copied().chain([unknown]).collect();
        used.sort_unstable();
        if used != (0..=slots.len()).collect::<Vec<_>>() {
            return Err(OpenMaxError::InvalidInput(format!(
                "open-set slots {used:?} are not a permutation of 0..={}",
                slots.len()
            )));
        }
        Ok(Self { slots, unknown })
    }

    /// Slot of the unknown class.
    #[must_use]
    pub fn unknown(&self) -> usize {
        self.unknown
    }

    /// Slot of class `label`.
    #[must_use]
    pub fn slot(&self, label: usize) -> Option<usize> {
        self.slots.get(&label).copied()
    }

    /// Number of known classes with a slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no known class has a slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Open-set and closed-set probabilities for a set of samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenMaxScores {
    /// `(N, num_classes + 1)`, each row sums to 1.
    pub openmax: Array2<f64>,
    /// `(N, num_classes)` plain softmax of the logits, each row sums to 1.
    pub softmax: Array2<f64>,
    /// Ranked logits left unrevised because their class (or every channel
    /// of it) had no valid tail model.
    pub skipped: usize,
}

fn argmax_rows(probs: &Array2<f64>) -> Vec<usize> {
    probs
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| {
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

impl OpenMaxScores {
    /// Most probable open-set slot per sample.
    #[must_use]
    pub fn openmax_predictions(&self) -> Vec<usize> {
        argmax_rows(&self.openmax)
    }

    /// Most probable known class per sample.
    #[must_use]
    pub fn softmax_predictions(&self) -> Vec<usize> {
        argmax_rows(&self.softmax)
    }
}

fn softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Mean w-score of a sample over the valid channels of `class`, `None` if it has none.
fn mean_w_score(
    model: &WeibullModel,
    class: usize,
    row: ArrayView1<f32>,
    config: &OpenMaxConfig,
) -> Option<f64> {
    let entry = model.class(class)?;
    let (mut sum, mut count) = (0.0, 0usize);
    for (channel, fit) in entry.fits.iter().enumerate() {
        let Some(fit) = fit else { continue };
        let range = model.layout.range(channel);
        let d = channel_distance(
            entry.mav.slice(s![range.clone()]),
            row.slice(s![range]),
            config.distance,
            config.euclid_weight,
        );
        let w = fit.w_score(d);
        if w.is_finite() {
            sum += w;
            count += 1;
        }
    }
    (count > 0).then(|| sum / count as f64)
}

/// Recalibrate logits into an open-set distribution.
///
/// For every sample the top `alpha` logits are ranked; the logit of rank
/// `r` (0-based) is scaled by `1 - w`, with `w` the mean Weibull CDF of the
/// sample's per-channel distances to that class's MAV times `(alpha - r) / alpha`.
/// The mass removed from the known logits becomes the unknown pseudo-logit,
/// and a softmax over all `num_classes + 1` values gives the result.
///
/// Classes without a valid tail model keep their logit and are counted in
/// [`OpenMaxScores::skipped`].
pub fn get_scores(
    model: &WeibullModel,
    features: ArrayView2<f32>,
    num_classes: usize,
    class_index_map: &ClassIndexMap,
    open_set_index_map: &OpenSetIndexMap,
    config: &OpenMaxConfig,
) -> Result<OpenMaxScores> {
    let layout = &model.layout;
    if num_classes == 0 || num_classes != layout.num_classes() || num_classes != class_index_map.len() {
        return Err(OpenMaxError::InvalidInput(format!(
            "num_classes {num_classes}, model logits {}, class map {}",
            layout.num_classes(),
            class_index_map.len()
        )));
    }
    if features.ncols() != layout.width() {
        return Err(OpenMaxError::InvalidInput(format!(
            "feature width {} does not match model width {}",
            features.ncols(),
            layout.width()
        )));
    }
    if open_set_index_map.len() != num_classes {
        return Err(OpenMaxError::InvalidInput(format!(
            "open-set map has {} known slots for {num_classes} classes",
            open_set_index_map.len()
        )));
    }
    let slots: Vec<usize> = (0..num_classes)
        .map(|col| {
            let label = class_index_map.label(col);
            open_set_index_map.slot(label).ok_or_else(|| {
                OpenMaxError::InvalidInput(format!("class {label} has no open-set slot"))
            })
        })
        .collect::<Result<_>>()?;

    let alpha = config.alpha_for(num_classes);
    let n = features.nrows();
    let mut openmax = Array2::<f64>::zeros((n, num_classes + 1));
    let mut closed = Array2::<f64>::zeros((n, num_classes));
    let mut skipped = 0usize;

    for (i, row) in features.rows().into_iter().enumerate() {
        let logits: Vec<f64> = row
            .slice(s![layout.logits()])
            .iter()
            .map(|&v| f64::from(v))
            .collect();
        if logits.iter().any(|v| !v.is_finite()) {
            return Err(OpenMaxError::InvalidInput(format!(
                "sample {i} has non-finite logits"
            )));
        }

        let mut ranked: Vec<usize> = (0..num_classes).collect();
        ranked.sort_by(|&a, &b| {
            logits[b]
                .partial_cmp(&logits[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut revised = logits.clone();
        let mut unknown = 0.0;
        for (rank, &col) in ranked.iter().take(alpha).enumerate() {
            let Some(w) = mean_w_score(model, class_index_map.label(col), row, config) else {
                skipped += 1;
                continue;
            };
            let weight = w * (alpha - rank) as f64 / alpha as f64;
            revised[col] = logits[col] * (1.0 - weight);
            unknown += logits[col] - revised[col];
        }

        let mut open = vec![0.0; num_classes + 1];
        for (col, &slot) in slots.iter().enumerate() {
            open[slot] = revised[col];
        }
        open[open_set_index_map.unknown()] = unknown;

        for (slot, p) in softmax(&open).into_iter().enumerate() {
            openmax[[i, slot]] = p;
        }
        for (col, p) in softmax(&logits).into_iter().enumerate() {
            closed[[i, col]] = p;
        }
    }

    if skipped > 0 {
        tracing::warn!(skipped, "OpenMax left logits of invalid classes unrevised");
    }

    Ok(OpenMaxScores {
        openmax,
        softmax: closed,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ChannelLayout;
    use crate::mav::build_weibull_model;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Two well separated classes with one pooled channel of width 2.
    fn training_features(n_per_class: usize) -> (Array2<f32>, Vec<usize>, ChannelLayout) {
        let layout = ChannelLayout::new(vec![2, 2]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for class in 0..2 {
            for _ in 0..n_per_class {
                let mut noise = || rng.gen_range(-0.3f32..0.3);
                let (l0, l1) = if class == 0 { (4.0, -1.0) } else { (-1.0, 4.0) };
                let (a0, a1) = if class == 0 { (1.0, 0.2) } else { (0.2, 1.0) };
                rows.extend([l0 + noise(), l1 + noise(), a0 + noise(), a1 + noise()]);
                labels.push(class);
            }
        }
        let features = Array2::from_shape_vec((2 * n_per_class, 4), rows).unwrap();
        (features, labels, layout)
    }

    fn assert_distributions(probs: &Array2<f64>) {
        for row in probs.rows() {
            let sum: f64 = row.sum();
            assert!((sum - 1.0).abs() < 1e-6, "row sums to {sum}");
            assert!(row.iter().all(|&p| p >= 0.0 && p.is_finite()));
        }
    }

    #[test]
    fn test_scores_are_distributions() {
        let (features, labels, layout) = training_features(40);
        let config = OpenMaxConfig::default();
        let model = build_weibull_model(features.view(), &labels, &layout, &config).unwrap();

        let classes = ClassIndexMap::identity(2);
        let open_set = OpenSetIndexMap::unknown_last(&classes);
        let probe = ndarray::arr2(&[
            [4.0f32, -1.0, 1.0, 0.2],
            [0.5, 0.4, 9.0, -7.0],
            [-300.0, 250.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 0.0],
        ]);
        let scores = get_scores(&model, probe.view(), 2, &classes, &open_set, &config).unwrap();

        assert_eq!(scores.openmax.dim(), (4, 3));
        assert_eq!(scores.softmax.dim(), (4, 2));
        assert_eq!(scores.skipped, 0);
        assert_distributions(&scores.openmax);
        assert_distributions(&scores.softmax);
    }

    #[test]
    fn test_outlier_moves_mass_to_unknown() {
        let (features, labels, layout) = training_features(40);
        let config = OpenMaxConfig::default();
        let model = build_weibull_model(features.view(), &labels, &layout, &config).unwrap();
        let classes = ClassIndexMap::identity(2);
        let open_set = OpenSetIndexMap::unknown_last(&classes);

        let typical = ndarray::arr2(&[[4.0f32, -1.0, 1.0, 0.2]]);
        let outlier = ndarray::arr2(&[[4.0f32, -1.0, -30.0, 40.0]]);
        let t = get_scores(&model, typical.view(), 2, &classes, &open_set, &config).unwrap();
        let o = get_scores(&model, outlier.view(), 2, &classes, &open_set, &config).unwrap();

        assert_eq!(t.openmax_predictions(), vec![0]);
        assert!(o.openmax[[0, 2]] > t.openmax[[0, 2]]);
        assert_eq!(o.softmax_predictions(), vec![0]);
    }

    #[test]
    fn test_invalid_class_is_skipped_not_nan() {
        let (features, labels, layout) = training_features(40);
        // class 1 only keeps 5 samples: below the tail size
        let keep: Vec<usize> = (0..45).collect();
        let features = features.select(ndarray::Axis(0), &keep);
        let labels: Vec<usize> = keep.iter().map(|&i| labels[i]).collect();
        let config = OpenMaxConfig::default();
        let model = build_weibull_model(features.view(), &labels, &layout, &config).unwrap();
        assert!(!model.is_valid(1));

        let classes = ClassIndexMap::identity(2);
        let open_set = OpenSetIndexMap::unknown_last(&classes);
        let probe = ndarray::arr2(&[[-1.0f32, 4.0, 0.2, 1.0]]);
        let scores = get_scores(&model, probe.view(), 2, &classes, &open_set, &config).unwrap();

        assert_eq!(scores.skipped, 1);
        assert_distributions(&scores.openmax);
    }

    #[test]
    fn test_custom_open_set_slots() {
        let (features, labels, layout) = training_features(40);
        let config = OpenMaxConfig::default();
        let model = build_weibull_model(features.view(), &labels, &layout, &config).unwrap();
        let classes = ClassIndexMap::identity(2);

        // unknown first, known classes shifted by one
        let open_set = OpenSetIndexMap::new(BTreeMap::from([(0, 1), (1, 2)]), 0).unwrap();
        let probe = ndarray::arr2(&[[4.0f32, -1.0, 1.0, 0.2]]);
        let scores = get_scores(&model, probe.view(), 2, &classes, &open_set, &config).unwrap();
        assert_eq!(scores.openmax_predictions(), vec![1]);

        assert!(OpenSetIndexMap::new(BTreeMap::from([(0, 0), (1, 0)]), 2).is_err());
        assert!(ClassIndexMap::from_labels(vec![1, 1]).is_err());
    }

    #[test]
    fn test_shape_checks() {
        let (features, labels, layout) = training_features(40);
        let config = OpenMaxConfig::default();
        let model = build_weibull_model(features.view(), &labels, &layout, &config).unwrap();
        let classes = ClassIndexMap::identity(2);
        let open_set = OpenSetIndexMap::unknown_last(&classes);

        let narrow = ndarray::arr2(&[[1.0f32, 0.0]]);
        assert!(get_scores(&model, narrow.view(), 2, &classes, &open_set, &config).is_err());
        assert!(get_scores(&model, features.view(), 3, &classes, &open_set, &config).is_err());
    }

    #[test]
    fn test_open_set_map_wider_than_classes_is_rejected() {
        let (features, labels, layout) = training_features(40);
        let config = OpenMaxConfig::default();
        let model = build_weibull_model(features.view(), &labels, &layout, &config).unwrap();
        let classes = ClassIndexMap::identity(2);

        // a valid permutation of 0..=3, but sized for three known classes
        let open_set = OpenSetIndexMap::new(BTreeMap::from([(0, 0), (1, 1), (5, 2)]), 3).unwrap();
        assert_eq!(open_set.len(), 3);
        let probe = ndarray::arr2(&[[4.0f32, -1.0, 1.0, 0.2]]);
        let result = get_scores(&model, probe.view(), 2, &classes, &open_set, &config);
        assert!(matches!(result, Err(OpenMaxError::InvalidInput(_))));
    }
}

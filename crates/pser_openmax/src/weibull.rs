//! Weibull tail models of per-class distances.
//!
//! Each class and channel gets a three-parameter Weibull fitted by maximum
//! likelihood to the `tail_size` largest distances. The location is profiled
//! over a geometric grid below the smallest tail value; for each candidate the
//! shape solves the likelihood equation by safeguarded Newton iterations and
//! the scale follows in closed form.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Weibull};

use crate::activation::ChannelLayout;
use crate::error::{OpenMaxError, Result};

const NEWTON_MAX_ITER: usize = 100;
const NEWTON_TOL: f64 = 1e-10;
/// Location offsets below the tail minimum, as fractions of the tail spread.
const LOCATION_GRID: [f64; 10] = [1e-3, 2e-3, 5e-3, 1e-2, 2e-2, 5e-2, 0.1, 0.2, 0.5, 1.0];

/// A fitted three-parameter Weibull distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeibullFit {
    /// Shape `k`.
    pub shape: f64,
    /// Scale `λ`.
    pub scale: f64,
    /// Location; the distribution has no mass at or below it.
    pub location: f64,
}

/// Shape and scale of a two-parameter fit on strictly positive data, plus its log-likelihood.
fn fit_two_param(y: &[f64]) -> Option<(f64, f64, f64)> {
    let n = y.len() as f64;
    let y_max = y.iter().cloned().fold(f64::MIN, f64::max);
    // Shape is scale invariant; normalizing keeps y^k in range.
    let z: Vec<f64> = y.iter().map(|v| v / y_max).collect();
    let ln_z: Vec<f64> = z.iter().map(|v| v.ln()).collect();
    let mean_ln = ln_z.iter().sum::<f64>() / n;

    let mut k = 1.0f64;
    for _ in 0..NEWTON_MAX_ITER {
        let (mut s0, mut s1, mut s2) = (0.0, 0.0, 0.0);
        for (zi, li) in z.iter().zip(&ln_z) {
            let p = zi.powf(k);
            s0 += p;
            s1 += p * li;
            s2 += p * li * li;
        }
        let ratio = s1 / s0;
        let g = ratio - 1.0 / k - mean_ln;
        let dg = s2 / s0 - ratio * ratio + 1.0 / (k * k);
        if !g.is_finite() || !dg.is_finite() || dg <= 0.0 {
            return None;
        }
        let mut next = k - g / dg;
        if next <= 0.0 {
            next = k / 2.0;
        }
        let converged = (next - k).abs() < NEWTON_TOL * k.max(1.0);
        k = next;
        if converged {
            break;
        }
    }

    let mean_zk = z.iter().map(|v| v.powf(k)).sum::<f64>() / n;
    let scale = y_max * mean_zk.powf(1.0 / k);
    if !k.is_finite() || !scale.is_finite() || k <= 0.0 || scale <= 0.0 {
        return None;
    }

    let sum_ln_y: f64 = y.iter().map(|v| v.ln()).sum();
    let sum_pow: f64 = y.iter().map(|v| (v / scale).powf(k)).sum();
    let log_likelihood = n * k.ln() - n * k * scale.ln() + (k - 1.0) * sum_ln_y - sum_pow;
    Some((k, scale, log_likelihood))
}

impl WeibullFit {
    /// Fit a three-parameter Weibull to `tail` by maximum likelihood.
    ///
    /// Fails when fewer than two values are given or the values do not spread.
    pub fn fit(tail: &[f64]) -> Result<Self> {
        if tail.len() < 2 {
            return Err(OpenMaxError::Fit(format!("{} values are too few to fit", tail.len())));
        }
        if tail.iter().any(|v| !v.is_finite()) {
            return Err(OpenMaxError::Fit("tail contains non-finite distances".into()));
        }
        let min = tail.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = tail.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let spread = max - min;
        if spread <= f64::EPSILON * max.abs().max(1.0) {
            return Err(OpenMaxError::Fit("tail distances do not spread".into()));
        }

        let mut best: Option<(f64, WeibullFit)> = None;
        for offset in LOCATION_GRID {
            let location = min - offset * spread;
            let shifted: Vec<f64> = tail.iter().map(|v| v - location).collect();
            if let Some((shape, scale, ll)) = fit_two_param(&shifted) {
                if best.as_ref().map_or(true, |(b, _)| ll > *b) {
                    best = Some((
                        ll,
                        WeibullFit {
                            shape,
                            scale,
                            location,
                        },
                    ));
                }
            }
        }

        let (_, fit) = best.ok_or_else(|| OpenMaxError::Fit("likelihood iterations diverged".into()))?;
        Weibull::new(fit.shape, fit.scale).map_err(|e| OpenMaxError::Fit(e.to_string()))?;
        Ok(fit)
    }

    /// Probability that a distance from this class is at most `x` (the w-score).
    #[must_use]
    pub fn w_score(&self, x: f64) -> f64 {
        if x.is_nan() || x <= self.location {
            return 0.0;
        }
        Weibull::new(self.shape, self.scale).map_or(0.0, |d| d.cdf(x - self.location))
    }
}

/// Tail model of one class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassWeibull {
    /// Class label.
    pub class: usize,
    /// Mean activation vector of the class.
    pub mav: Array1<f32>,
    /// Fit per channel; `None` for channels whose fit failed.
    pub fits: Vec<Option<WeibullFit>>,
}

impl ClassWeibull {
    /// Whether at least one channel could be fitted.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.fits.iter().any(Option::is_some)
    }
}

/// A class or channel that could not be fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitFailure {
    /// Class label.
    pub class: usize,
    /// Channel, `None` when the whole class failed.
    pub channel: Option<usize>,
    /// Human-readable reason.
    pub reason: String,
}

impl FitFailure {
    fn from_error(err: &OpenMaxError) -> Option<Self> {
        match err {
            OpenMaxError::InsufficientTail { class, .. } => Some(Self {
                class: *class,
                channel: None,
                reason: err.to_string(),
            }),
            OpenMaxError::FitFailed { class, channel, .. } => Some(Self {
                class: *class,
                channel: Some(*channel),
                reason: err.to_string(),
            }),
            _ => None,
        }
    }
}

/// Per-class, per-channel Weibull tail models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeibullModel {
    /// Channel layout of the activation features the model was fitted on.
    pub layout: ChannelLayout,
    /// Number of distances each fit used.
    pub tail_size: usize,
    classes: BTreeMap<usize, ClassWeibull>,
    invalid: BTreeMap<usize, TailShortfall>,
    failures: Vec<FitFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TailShortfall {
    needed: usize,
    got: usize,
}

impl WeibullModel {
    /// Usable tail model of `class`, `None` if absent or invalid.
    #[must_use]
    pub fn class(&self, class: usize) -> Option<&ClassWeibull> {
        self.classes.get(&class).filter(|c| c.is_valid())
    }

    /// Whether `class` has a usable tail model.
    #[must_use]
    pub fn is_valid(&self, class: usize) -> bool {
        self.class(class).is_some()
    }

    /// Labels of all classes that were fitted, valid or not.
    pub fn classes(&self) -> impl Iterator<Item = usize> + '_ {
        self.classes.keys().copied().chain(self.invalid.keys().copied())
    }

    /// Every failure recorded while fitting.
    #[must_use]
    pub fn failures(&self) -> &[FitFailure] {
        &self.failures
    }

    /// Why `class` is unusable, as an error.
    #[must_use]
    pub fn class_error(&self, class: usize) -> Option<OpenMaxError> {
        self.invalid
            .get(&class)
            .map(|r| OpenMaxError::InsufficientTail {
                class,
                needed: r.needed,
                got: r.got,
            })
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| OpenMaxError::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| OpenMaxError::Serialization(e.to_string()))
    }
}

/// Fit tail models for every class.
///
/// `mavs[i]`, `distances[i]` (shape `(n_i, n_channels)`) and `class_labels[i]`
/// describe the same class. Per channel the distances are sorted in
/// descending order and only the first `tail_size` enter the fit.
///
/// A class with fewer than `tail_size` distances is recorded as an
/// [`OpenMaxError::InsufficientTail`] failure and left without fits; a
/// channel whose fit fails is recorded and left as `None`. Only
/// inconsistent inputs return an error.
pub fn weibull_tailfitting(
    mavs: &[Array1<f32>],
    distances: &[Array2<f64>],
    class_labels: &[usize],
    layout: &ChannelLayout,
    tail_size: usize,
) -> Result<WeibullModel> {
    if mavs.len() != distances.len() || mavs.len() != class_labels.len() {
        return Err(OpenMaxError::InvalidInput(format!(
            "{} MAVs, {} distance sets and {} labels",
            mavs.len(),
            distances.len(),
            class_labels.len()
        )));
    }
    if tail_size == 0 {
        return Err(OpenMaxError::InvalidInput("tail size must be at least 1".into()));
    }

    let mut model = WeibullModel {
        layout: layout.clone(),
        tail_size,
        classes: BTreeMap::new(),
        invalid: BTreeMap::new(),
        failures: Vec::new(),
    };

    for ((mav, dist), &class) in mavs.iter().zip(distances).zip(class_labels) {
        if dist.ncols() != layout.num_channels() || mav.len() != layout.width() {
            return Err(OpenMaxError::InvalidInput(format!(
                "class {class}: distances for {} channels, MAV width {}, layout {:?}",
                dist.ncols(),
                mav.len(),
                layout
            )));
        }

        let got = dist.nrows();
        if got < tail_size {
            let err = OpenMaxError::InsufficientTail {
                class,
                needed: tail_size,
                got,
            };
            tracing::warn!("{err}");
            model.failures.extend(FitFailure::from_error(&err));
            model
                .invalid
                .insert(class, TailShortfall { needed: tail_size, got });
            continue;
        }

        let mut fits = Vec::with_capacity(layout.num_channels());
        for channel in 0..layout.num_channels() {
            let mut column: Vec<f64> = dist.column(channel).to_vec();
            column.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            column.truncate(tail_size);

            match WeibullFit::fit(&column) {
                Ok(fit) => fits.push(Some(fit)),
                Err(fit_err) => {
                    let reason = match fit_err {
                        OpenMaxError::Fit(reason) => reason,
                        other => other.to_string(),
                    };
                    let err = OpenMaxError::FitFailed {
                        class,
                        channel,
                        reason,
                    };
                    tracing::warn!("{err}");
                    model.failures.extend(FitFailure::from_error(&err));
                    fits.push(None);
                }
            }
        }

        model.classes.insert(
            class,
            ClassWeibull {
                class,
                mav: mav.clone(),
                fits,
            },
        );
    }

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Distribution;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn sample_weibull(shape: f64, scale: f64, location: f64, n: usize) -> Vec<f64> {
        let dist = Weibull::new(shape, scale).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        (0..n).map(|_| location + dist.sample(&mut rng)).collect()
    }

    #[test]
    fn test_fit_recovers_parameters() {
        let data = sample_weibull(2.5, 1.5, 0.0, 2000);
        let fit = WeibullFit::fit(&data).unwrap();
        // location is profiled, so shape/scale trade off slightly against it
        assert!((fit.shape - 2.5).abs() < 0.6, "shape {}", fit.shape);
        assert!(fit.location <= data.iter().cloned().fold(f64::INFINITY, f64::min));
        let median = fit.location + fit.scale * 2f64.ln().powf(1.0 / fit.shape);
        let true_median = 1.5 * 2f64.ln().powf(1.0 / 2.5);
        assert!((median - true_median).abs() < 0.1);
    }

    #[test]
    fn test_w_score_is_a_cdf() {
        let data = sample_weibull(1.8, 0.4, 1.0, 50);
        let fit = WeibullFit::fit(&data).unwrap();

        assert_eq!(fit.w_score(fit.location), 0.0);
        assert_eq!(fit.w_score(fit.location - 1.0), 0.0);
        let lo = fit.w_score(1.1);
        let hi = fit.w_score(3.0);
        assert!(lo < hi);
        assert!(hi <= 1.0 && hi > 0.99);
    }

    #[test]
    fn test_fit_rejects_degenerate_tails() {
        assert!(WeibullFit::fit(&[1.0]).is_err());
        assert!(WeibullFit::fit(&[0.5, 0.5, 0.5]).is_err());
        assert!(WeibullFit::fit(&[0.5, f64::NAN]).is_err());
        assert!(matches!(WeibullFit::fit(&[0.5, 0.5]), Err(OpenMaxError::Fit(_))));
    }

    fn class_data(n: usize, seed: u64) -> (Array1<f32>, Array2<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let dist = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.1..2.0));
        (Array1::zeros(3), dist)
    }

    #[test]
    fn test_under_populated_class_is_reported() {
        let layout = ChannelLayout::new(vec![2, 1]).unwrap();
        let (mav0, d0) = class_data(40, 1);
        let (mav1, d1) = class_data(5, 2);

        let model = weibull_tailfitting(&[mav0, mav1], &[d0, d1], &[0, 1], &layout, 20).unwrap();

        assert!(model.is_valid(0));
        assert!(!model.is_valid(1));
        assert_eq!(
            model.class_error(1),
            Some(OpenMaxError::InsufficientTail {
                class: 1,
                needed: 20,
                got: 5
            })
        );
        assert_eq!(model.failures().len(), 1);
        assert_eq!(model.failures()[0].class, 1);
        assert_eq!(model.classes().count(), 2);
    }

    #[test]
    fn test_only_the_tail_is_used() {
        let layout = ChannelLayout::new(vec![1]).unwrap();
        // 20 large distances, 80 tiny ones: the fit only sees the large ones
        let values: Vec<f64> = (0..100)
            .map(|i| if i < 20 { 10.0 + i as f64 * 0.1 } else { 0.01 * i as f64 })
            .collect();
        let dist = Array2::from_shape_vec((100, 1), values).unwrap();

        let model =
            weibull_tailfitting(&[Array1::zeros(1)], &[dist], &[0], &layout, 20).unwrap();
        let fit = model.class(0).unwrap().fits[0].unwrap();
        assert!(fit.location >= 8.0 && fit.location < 10.0);
        assert!(fit.w_score(1.0) == 0.0);
    }

    #[test]
    fn test_json_round_trip_keeps_validity() {
        let layout = ChannelLayout::new(vec![2, 1]).unwrap();
        let (mav0, d0) = class_data(30, 3);
        let (mav1, d1) = class_data(3, 4);
        let model = weibull_tailfitting(&[mav0, mav1], &[d0, d1], &[0, 1], &layout, 20).unwrap();

        let restored = WeibullModel::from_json(&model.to_json().unwrap()).unwrap();
        assert!(restored.is_valid(0));
        assert!(!restored.is_valid(1));
        assert_eq!(restored.failures(), model.failures());
    }

    #[test]
    fn test_mismatched_inputs() {
        let layout = ChannelLayout::new(vec![2]).unwrap();
        assert!(weibull_tailfitting(&[Array1::zeros(2)], &[], &[0], &layout, 20).is_err());
    }
}

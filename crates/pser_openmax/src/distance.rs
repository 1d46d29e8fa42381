//! Per-channel distances between activation vectors and class MAVs.

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::activation::ChannelLayout;
use crate::error::{OpenMaxError, Result};
use pser_core::DistanceKind;

fn euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = f64::from(x) - f64::from(y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn cosine(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    match (na == 0.0, nb == 0.0) {
        (true, true) => 0.0,
        (true, false) | (false, true) => 1.0,
        (false, false) => 1.0 - dot / (na.sqrt() * nb.sqrt()),
    }
}

/// Distance between two equally long channel slices.
///
/// Zero vectors have cosine distance 0 to each other and 1 to anything else.
#[must_use]
pub fn channel_distance(
    a: ArrayView1<f32>,
    b: ArrayView1<f32>,
    kind: DistanceKind,
    euclid_weight: f64,
) -> f64 {
    match kind {
        DistanceKind::Eucos => euclid_weight * euclidean(a, b) + cosine(a, b),
        DistanceKind::Euclidean => euclidean(a, b),
        DistanceKind::Cosine => cosine(a, b),
    }
}

/// Distance of every sample to `mav`, per channel.
///
/// Returns `(n_samples, n_channels)`.
pub fn compute_channel_distances(
    mav: ArrayView1<f32>,
    samples: ArrayView2<f32>,
    layout: &ChannelLayout,
    kind: DistanceKind,
    euclid_weight: f64,
) -> Result<Array2<f64>> {
    if mav.len() != layout.width() || samples.ncols() != layout.width() {
        return Err(OpenMaxError::InvalidInput(format!(
            "feature width {} / MAV width {} do not match layout width {}",
            samples.ncols(),
            mav.len(),
            layout.width()
        )));
    }

    let n_channels = layout.num_channels();
    Ok(Array2::from_shape_fn((samples.nrows(), n_channels), |(i, ch)| {
        let range = layout.range(ch);
        channel_distance(
            mav.slice(ndarray::s![range.clone()]),
            samples.row(i).slice(ndarray::s![range]),
            kind,
            euclid_weight,
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_distance_kinds() {
        let a = arr1(&[1.0f32, 0.0]);
        let b = arr1(&[0.0f32, 2.0]);

        let e = channel_distance(a.view(), b.view(), DistanceKind::Euclidean, 0.0);
        let c = channel_distance(a.view(), b.view(), DistanceKind::Cosine, 0.0);
        let ec = channel_distance(a.view(), b.view(), DistanceKind::Eucos, 5e-3);

        assert!((e - 5.0f64.sqrt()).abs() < 1e-12);
        assert!((c - 1.0).abs() < 1e-12);
        assert!((ec - (5e-3 * 5.0f64.sqrt() + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_zero_vectors_do_not_produce_nan() {
        let zero = arr1(&[0.0f32, 0.0]);
        let one = arr1(&[1.0f32, 1.0]);
        let d = channel_distance(zero.view(), zero.view(), DistanceKind::Eucos, 5e-3);
        assert_eq!(d, 0.0);
        let d = channel_distance(zero.view(), one.view(), DistanceKind::Cosine, 5e-3);
        assert_eq!(d, 1.0);
    }

    #[test]
    fn test_per_channel_distances() {
        let layout = ChannelLayout::new(vec![2, 1]).unwrap();
        let mav = arr1(&[1.0f32, 0.0, 3.0]);
        let samples = arr2(&[[1.0f32, 0.0, 3.0], [0.0, 1.0, 5.0]]);

        let d = compute_channel_distances(
            mav.view(),
            samples.view(),
            &layout,
            DistanceKind::Euclidean,
            0.0,
        )
        .unwrap();

        assert_eq!(d.dim(), (2, 2));
        assert_eq!(d[[0, 0]], 0.0);
        assert!((d[[1, 0]] - 2.0f64.sqrt()).abs() < 1e-12);
        assert!((d[[1, 1]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_width_mismatch() {
        let layout = ChannelLayout::new(vec![2]).unwrap();
        let mav = arr1(&[1.0f32, 0.0, 3.0]);
        let samples = arr2(&[[1.0f32, 0.0, 3.0]]);
        assert!(compute_channel_distances(mav.view(), samples.view(), &layout, DistanceKind::Eucos, 5e-3).is_err());
    }
}

//! Areas under the ROC and precision-recall curves for two-class problems.

use std::cmp::Ordering;

/// Positives, negatives and the descending-score order of the samples.
fn ranked(labels: &[bool], scores: &[f64]) -> Option<(usize, usize, Vec<usize>)> {
    if labels.len() != scores.len() || labels.is_empty() {
        return None;
    }
    let n_pos = labels.iter().filter(|&&l| l).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    Some((n_pos, n_neg, order))
}

/// Cumulative `(true positives, false positives)` at every distinct threshold,
/// from the highest score down.
fn threshold_counts(labels: &[bool], scores: &[f64], order: &[usize]) -> Vec<(usize, usize)> {
    let mut counts = Vec::new();
    let (mut tp, mut fp) = (0, 0);
    for (k, &i) in order.iter().enumerate() {
        if labels[i] {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_tie = order
            .get(k + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_tie {
            counts.push((tp, fp));
        }
    }
    counts
}

/// Area under the ROC curve of positive-class `scores`.
///
/// Trapezoidal over the curve with tied scores merged into one point.
/// `None` when only one class is present.
pub fn roc_auc(labels: &[bool], scores: &[f64]) -> Option<f64> {
    let (n_pos, n_neg, order) = ranked(labels, scores)?;
    if n_neg == 0 {
        return None;
    }

    let mut area = 0.0;
    let (mut prev_tpr, mut prev_fpr) = (0.0, 0.0);
    for (tp, fp) in threshold_counts(labels, scores, &order) {
        let tpr = tp as f64 / n_pos as f64;
        let fpr = fp as f64 / n_neg as f64;
        area += (fpr - prev_fpr) * (tpr + prev_tpr) / 2.0;
        prev_tpr = tpr;
        prev_fpr = fpr;
    }
    Some(area)
}

/// Area under the precision-recall curve of positive-class `scores`.
///
/// The curve starts at `(recall 0, precision 1)` and is integrated with the
/// trapezoidal rule over recall. `None` when there are no positives.
pub fn pr_auc(labels: &[bool], scores: &[f64]) -> Option<f64> {
    let (n_pos, _, order) = ranked(labels, scores)?;

    let mut area = 0.0;
    let (mut prev_recall, mut prev_precision) = (0.0, 1.0);
    for (tp, fp) in threshold_counts(labels, scores, &order) {
        let recall = tp as f64 / n_pos as f64;
        let precision = tp as f64 / (tp + fp) as f64;
        area += (recall - prev_recall) * (precision + prev_precision) / 2.0;
        prev_recall = recall;
        prev_precision = precision;
    }
    Some(area)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_separation() {
        let labels = [false, false, true, true];
        let scores = [0.1, 0.2, 0.8, 0.9];
        assert!((roc_auc(&labels, &scores).unwrap() - 1.0).abs() < 1e-12);
        assert!((pr_auc(&labels, &scores).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_scores() {
        let labels = [true, true, false, false];
        let scores = [0.1, 0.2, 0.8, 0.9];
        assert!(roc_auc(&labels, &scores).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_ties_give_half() {
        let labels = [true, false, true, false];
        let scores = [0.5; 4];
        assert!((roc_auc(&labels, &scores).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_known_roc_value() {
        // one positive ranked below one negative: 3 of 4 pairs ordered
        let labels = [true, false, true, false];
        let scores = [0.9, 0.8, 0.7, 0.1];
        assert!((roc_auc(&labels, &scores).unwrap() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_is_undefined() {
        assert!(roc_auc(&[true, true], &[0.1, 0.2]).is_none());
        assert!(pr_auc(&[false, false], &[0.1, 0.2]).is_none());
        assert!(roc_auc(&[], &[]).is_none());
    }
}

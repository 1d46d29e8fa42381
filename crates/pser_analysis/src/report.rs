//! Classification report with per-class metrics and macro averages.

use serde::{Deserialize, Serialize};

use crate::confusion::{confusion_matrix, ConfusionMatrix};
use crate::error::{AnalysisError, Result};

/// Beta of the precision-weighted F score reported alongside F1.
pub const DEFAULT_BETA: f64 = 0.25;

/// Per-class and macro-averaged classification metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationReport {
    /// Names of the analysed classes, in index order.
    pub class_names: Vec<String>,
    /// Underlying confusion matrix.
    pub confusion: ConfusionMatrix,
    /// Fraction of correctly classified samples.
    pub total_accuracy: f64,
    /// Precision per class.
    pub precision: Vec<f64>,
    /// Recall per class.
    pub recall: Vec<f64>,
    /// F1 per class.
    pub f1: Vec<f64>,
    /// F-beta per class.
    pub f_beta: Vec<f64>,
    /// Beta used for [`f_beta`](Self::f_beta).
    pub beta: f64,
    /// Macro-averaged precision.
    pub prec_avg: f64,
    /// Macro-averaged recall.
    pub rec_avg: f64,
    /// Macro-averaged F1.
    pub f1_avg: f64,
    /// Macro-averaged F-beta.
    pub fbeta_avg: f64,
}

impl ClassificationReport {
    /// Display the report as a formatted string.
    pub fn to_string_table(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:>12} {:>10} {:>10} {:>10} {:>10} {:>8}\n",
            "", "precision", "recall", "f1", format!("f{}", self.beta), "support"
        ));
        for (i, name) in self.class_names.iter().enumerate() {
            out.push_str(&format!(
                "{:>12} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>8}\n",
                name,
                self.precision[i],
                self.recall[i],
                self.f1[i],
                self.f_beta[i],
                self.confusion.support(i)
            ));
        }
        out.push_str(&format!(
            "{:>12} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>8}\n",
            "macro avg",
            self.prec_avg,
            self.rec_avg,
            self.f1_avg,
            self.fbeta_avg,
            self.confusion.total()
        ));
        out.push_str(&format!("accuracy: {:.4}\n", self.total_accuracy));
        out
    }
}

/// Analyse predicted against true class indices with `beta = 0.25`.
///
/// See [`analyze_classification_with_beta`].
pub fn analyze_classification(
    predictions: &[usize],
    true_labels: &[usize],
    class_names: &[String],
) -> Result<ClassificationReport> {
    analyze_classification_with_beta(predictions, true_labels, class_names, DEFAULT_BETA)
}

/// Analyse predicted against true class indices.
///
/// Builds a confusion matrix over `class_names` (index `i` is `class_names[i]`)
/// and derives per-class precision, recall, F1 and F-beta with their
/// unweighted means over all classes.
///
/// # Errors
///
/// Fails when the slices differ in length, are empty, or hold an index
/// outside `class_names`.
pub fn analyze_classification_with_beta(
    predictions: &[usize],
    true_labels: &[usize],
    class_names: &[String],
    beta: f64,
) -> Result<ClassificationReport> {
    if predictions.len() != true_labels.len() {
        return Err(AnalysisError::LengthMismatch {
            predictions: predictions.len(),
            labels: true_labels.len(),
        });
    }
    let n_classes = class_names.len();
    if n_classes == 0 || predictions.is_empty() {
        return Err(AnalysisError::Empty);
    }
    if let Some(&index) = predictions
        .iter()
        .chain(true_labels)
        .find(|&&c| c >= n_classes)
    {
        return Err(AnalysisError::UnknownClass { index, n_classes });
    }

    let confusion =
        confusion_matrix(predictions, true_labels, n_classes).with_labels(class_names.to_vec());

    let precision: Vec<f64> = (0..n_classes).map(|c| confusion.precision(c)).collect();
    let recall: Vec<f64> = (0..n_classes).map(|c| confusion.recall(c)).collect();
    let f1: Vec<f64> = (0..n_classes).map(|c| confusion.f1(c)).collect();
    let f_beta: Vec<f64> = (0..n_classes).map(|c| confusion.f_beta(c, beta)).collect();

    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;

    Ok(ClassificationReport {
        class_names: class_names.to_vec(),
        total_accuracy: confusion.accuracy(),
        prec_avg: mean(&precision),
        rec_avg: mean(&recall),
        f1_avg: mean(&f1),
        fbeta_avg: mean(&f_beta),
        confusion,
        precision,
        recall,
        f1,
        f_beta,
        beta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_perfectly_separable_two_class() {
        let labels = vec![0, 0, 0, 1, 1, 1, 1];
        let report = analyze_classification(&labels, &labels, &names(2)).unwrap();

        assert!((report.fbeta_avg - 1.0).abs() < 1e-12);
        assert!((report.f1_avg - 1.0).abs() < 1e-12);
        assert!((report.total_accuracy - 1.0).abs() < 1e-12);
        assert_eq!(report.beta, DEFAULT_BETA);
    }

    #[test]
    fn test_macro_averages() {
        let preds = vec![0, 0, 1, 1];
        let targets = vec![0, 1, 1, 1];
        let report = analyze_classification(&preds, &targets, &names(2)).unwrap();

        // class 0: p = 0.5, r = 1.0; class 1: p = 1.0, r = 2/3
        assert!((report.prec_avg - 0.75).abs() < 1e-12);
        assert!((report.rec_avg - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        assert!((report.total_accuracy - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_slot_counts_as_class() {
        // two known classes plus an unknown slot
        let preds = vec![0, 1, 2, 2];
        let targets = vec![0, 1, 2, 0];
        let report = analyze_classification(&preds, &targets, &names(3)).unwrap();
        assert_eq!(report.precision.len(), 3);
        assert!((report.precision[2] - 0.5).abs() < 1e-12);
        assert!(report.to_string_table().contains("macro avg"));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            analyze_classification(&[0], &[0, 1], &names(2)),
            Err(AnalysisError::LengthMismatch { .. })
        ));
        assert!(matches!(
            analyze_classification(&[3], &[0], &names(2)),
            Err(AnalysisError::UnknownClass { index: 3, .. })
        ));
        assert!(matches!(
            analyze_classification(&[], &[], &names(2)),
            Err(AnalysisError::Empty)
        ));
    }
}

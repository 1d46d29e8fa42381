//! Confusion matrix computation.

use serde::{Deserialize, Serialize};

/// Confusion matrix for classification evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// The matrix values (row = true, col = pred).
    pub matrix: Vec<Vec<usize>>,
    /// Number of classes.
    pub n_classes: usize,
    /// Class labels.
    pub labels: Option<Vec<String>>,
}

impl ConfusionMatrix {
    /// Create a new confusion matrix.
    pub fn new(n_classes: usize) -> Self {
        Self {
            matrix: vec![vec![0; n_classes]; n_classes],
            n_classes,
            labels: None,
        }
    }

    /// Set class labels.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Add a prediction. Out-of-range indices are ignored.
    pub fn add(&mut self, true_class: usize, pred_class: usize) {
        if true_class < self.n_classes && pred_class < self.n_classes {
            self.matrix[true_class][pred_class] += 1;
        }
    }

    /// Total number of recorded samples.
    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    /// Number of samples whose true class is `class`.
    pub fn support(&self, class: usize) -> usize {
        self.matrix[class].iter().sum()
    }

    /// Fraction of samples on the diagonal.
    pub fn accuracy(&self) -> f64 {
        let correct: usize = (0..self.n_classes).map(|i| self.matrix[i][i]).sum();
        ratio(correct, self.total())
    }

    /// Precision of `class`, `0` when it was never predicted.
    pub fn precision(&self, class: usize) -> f64 {
        let predicted: usize = (0..self.n_classes).map(|i| self.matrix[i][class]).sum();
        ratio(self.matrix[class][class], predicted)
    }

    /// Recall of `class`, `0` when it never occurs.
    pub fn recall(&self, class: usize) -> f64 {
        ratio(self.matrix[class][class], self.support(class))
    }

    /// F-beta score of `class`. `beta < 1` weights precision higher.
    pub fn f_beta(&self, class: usize, beta: f64) -> f64 {
        let p = self.precision(class);
        let r = self.recall(class);
        let b2 = beta * beta;
        let denom = b2 * p + r;
        if denom == 0.0 {
            0.0
        } else {
            (1.0 + b2) * p * r / denom
        }
    }

    /// F1 score of `class`.
    pub fn f1(&self, class: usize) -> f64 {
        self.f_beta(class, 1.0)
    }

    /// Get a text representation.
    pub fn to_string_table(&self) -> String {
        let name = |i: usize| -> String {
            self.labels
                .as_ref()
                .and_then(|l| l.get(i).cloned())
                .unwrap_or_else(|| i.to_string())
        };
        let mut s = String::new();

        s.push_str("       ");
        for j in 0..self.n_classes {
            s.push_str(&format!("{:>8}", name(j).chars().take(7).collect::<String>()));
        }
        s.push('\n');

        for i in 0..self.n_classes {
            s.push_str(&format!("{:>6} ", name(i).chars().take(6).collect::<String>()));
            for j in 0..self.n_classes {
                s.push_str(&format!("{:>8}", self.matrix[i][j]));
            }
            s.push('\n');
        }

        s
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Compute confusion matrix from predictions and targets.
pub fn confusion_matrix(preds: &[usize], targets: &[usize], n_classes: usize) -> ConfusionMatrix {
    let mut cm = ConfusionMatrix::new(n_classes);
    for (&pred, &target) in preds.iter().zip(targets) {
        cm.add(target, pred);
    }
    cm
}

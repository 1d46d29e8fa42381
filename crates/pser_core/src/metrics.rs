//! Insertion-ordered per-epoch metric map.

use serde::{Deserialize, Serialize};

/// Aggregate metrics of one training or evaluation pass.
///
/// Names keep the order in which they were first inserted; re-inserting a
/// name overwrites its value in place. A value of `None` means the metric
/// is undefined for this pass (e.g. an epoch with only degenerate batches).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    entries: Vec<(String, Option<f64>)>,
}

impl EpochMetrics {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map whose first entry is `epoch`.
    #[must_use]
    pub fn for_epoch(epoch: Option<usize>) -> Self {
        let mut metrics = Self::new();
        metrics.insert("epoch", epoch.map(|e| e as f64));
        metrics
    }

    /// Insert or overwrite a possibly undefined metric.
    pub fn insert(&mut self, name: impl Into<String>, value: Option<f64>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Insert or overwrite a defined metric.
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.insert(name, Some(value));
    }

    /// Value of `name`, `None` when absent or undefined.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| *v)
    }

    /// Whether `name` has been inserted, defined or not.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Metric names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Number of metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One-line summary, `name: value | ...`. Undefined values print as `-`.
    #[must_use]
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| match value {
                Some(v) => format!("{name}: {v:8.6}"),
                None => format!("{name}: -"),
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_and_overwrite() {
        let mut m = EpochMetrics::for_epoch(Some(3));
        m.set("loss", 0.5);
        m.set("accuracy", 0.9);
        m.set("loss", 0.25);

        let names: Vec<_> = m.names().collect();
        assert_eq!(names, vec!["epoch", "loss", "accuracy"]);
        assert_eq!(m.get("loss"), Some(0.25));
        assert_eq!(m.get("epoch"), Some(3.0));
    }

    #[test]
    fn test_undefined_values() {
        let mut m = EpochMetrics::for_epoch(None);
        m.insert("loss", None);
        assert!(m.contains("loss"));
        assert_eq!(m.get("loss"), None);
        assert_eq!(m.get("missing"), None);
        assert_eq!(m.summary(), "epoch: - | loss: -");
    }
}

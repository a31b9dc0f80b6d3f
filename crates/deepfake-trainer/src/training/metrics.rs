//! Confusion-matrix metrics for validation and test passes.

use deepfake_core::Label;

/// Metrics computed from a confusion matrix.
///
/// Class 1 (fake) is the positive class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub fpr: f64,
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    pub fn_count: usize,
}

impl ClassificationMetrics {
    /// Number of scored samples.
    #[must_use]
    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_count
    }
}

/// Running confusion counts over a pass of batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Confusion {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_count: usize,
}

impl Confusion {
    /// Add one batch of predicted and true class indices.
    pub fn update(&mut self, predictions: &[u32], labels: &[u32]) {
        debug_assert_eq!(predictions.len(), labels.len());
        let positive = Label::Fake.index();
        for (&pred, &label) in predictions.iter().zip(labels) {
            match (pred == positive, label == positive) {
                (true, true) => self.tp += 1,
                (true, false) => self.fp += 1,
                (false, false) => self.tn += 1,
                (false, true) => self.fn_count += 1,
            }
        }
    }

    #[must_use]
    pub fn correct(&self) -> usize {
        self.tp + self.tn
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_count
    }

    /// Derived metrics. Every ratio with an empty denominator is 0.0.
    #[must_use]
    pub fn metrics(&self) -> ClassificationMetrics {
        let ratio = |num: usize, den: usize| if den > 0 { num as f64 / den as f64 } else { 0.0 };
        let precision = ratio(self.tp, self.tp + self.fp);
        let recall = ratio(self.tp, self.tp + self.fn_count);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        ClassificationMetrics {
            accuracy: ratio(self.correct(), self.total()),
            precision,
            recall,
            f1,
            fpr: ratio(self.fp, self.fp + self.tn),
            tp: self.tp,
            fp: self.fp,
            tn: self.tn,
            fn_count: self.fn_count,
        }
    }
}

/// Compute metrics from predicted and ground-truth class indices.
#[must_use]
pub fn compute_classification_metrics(predictions: &[u32], labels: &[u32]) -> ClassificationMetrics {
    let mut confusion = Confusion::default();
    confusion.update(predictions, labels);
    confusion.metrics()
}

impl std::fmt::Display for ClassificationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acc={:.4} prec={:.4} rec={:.4} f1={:.4} fpr={:.4} (tp={} fp={} tn={} fn={})",
            self.accuracy,
            self.precision,
            self.recall,
            self.f1,
            self.fpr,
            self.tp,
            self.fp,
            self.tn,
            self.fn_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let m = compute_classification_metrics(&[0, 0, 1, 1], &[0, 0, 1, 1]);
        assert!((m.accuracy - 1.0).abs() < 1e-9);
        assert!((m.precision - 1.0).abs() < 1e-9);
        assert!((m.recall - 1.0).abs() < 1e-9);
        assert!((m.f1 - 1.0).abs() < 1e-9);
        assert!(m.fpr.abs() < 1e-9);
    }

    #[test]
    fn test_all_wrong() {
        let m = compute_classification_metrics(&[1, 1, 0, 0], &[0, 0, 1, 1]);
        assert!(m.accuracy.abs() < 1e-9);
        assert!(m.precision.abs() < 1e-9);
        assert!(m.recall.abs() < 1e-9);
        assert!((m.fpr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixed() {
        // 3 TP, 1 FP, 2 TN, 1 FN
        let m = compute_classification_metrics(&[1, 1, 1, 1, 0, 0, 0], &[1, 1, 1, 0, 0, 0, 1]);
        assert_eq!((m.tp, m.fp, m.tn, m.fn_count), (3, 1, 2, 1));
        assert!((m.accuracy - 5.0 / 7.0).abs() < 1e-9);
        assert!((m.precision - 0.75).abs() < 1e-9);
        assert!((m.recall - 0.75).abs() < 1e-9);
        assert!((m.fpr - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.total(), 7);
    }

    #[test]
    fn test_accumulates_across_batches() {
        let mut c = Confusion::default();
        c.update(&[1, 0], &[1, 1]);
        c.update(&[0], &[0]);
        assert_eq!(c.correct(), 2);
        assert_eq!(c.total(), 3);
        assert!((c.metrics().accuracy - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty() {
        let m = compute_classification_metrics(&[], &[]);
        assert_eq!(m, ClassificationMetrics::default());
    }

    #[test]
    fn test_display() {
        let m = compute_classification_metrics(&[1, 0], &[1, 0]);
        assert_eq!(
            m.to_string(),
            "acc=1.0000 prec=1.0000 rec=1.0000 f1=1.0000 fpr=0.0000 (tp=1 fp=0 tn=1 fn=0)"
        );
    }
}

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::TensorData;

/// Class-weighted cross entropy.
///
/// `loss = -sum_i w[y_i] * log p(y_i | x_i) / sum_i w[y_i]`, so rare
/// classes count as much as common ones in aggregate.
#[derive(Clone, Debug)]
pub struct WeightedCrossEntropy<B: Backend> {
    weights: Tensor<B, 1>,
}

impl<B: Backend> WeightedCrossEntropy<B> {
    /// Create from per-class weights, e.g. `LabelCodec::class_weights`
    pub fn new(weights: &[f32], device: &B::Device) -> Self {
        Self {
            weights: Tensor::from_data(TensorData::new(weights.to_vec(), [weights.len()]), device),
        }
    }

    /// Compute the loss
    ///
    /// # Arguments
    /// * `logits` - Model output logits [batch_size, num_classes]
    /// * `targets` - Target class indices [batch_size]
    pub fn forward(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [n, _] = logits.dims();
        let log_probs = log_softmax(logits, 1)
            .gather(1, targets.clone().reshape([n, 1]))
            .reshape([n]);
        let w = self.weights.clone().select(0, targets);

        // a batch made only of zero-weight classes contributes nothing
        let norm = w.clone().sum().clamp_min(1e-12);
        (log_probs * w).sum().neg() / norm
    }
}

/// Multi-class metrics computed on the host
pub mod metrics {
    use serde::{Deserialize, Serialize};

    /// K×K counts; rows are true classes, columns predicted classes
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ConfusionMatrix {
        n_classes: usize,
        counts: Vec<u64>,
    }

    impl ConfusionMatrix {
        /// Empty matrix over `n_classes` classes
        pub fn new(n_classes: usize) -> Self {
            Self {
                n_classes,
                counts: vec![0; n_classes * n_classes],
            }
        }

        /// Tally (target, prediction) pairs
        pub fn from_pairs(n_classes: usize, targets: &[usize], predictions: &[usize]) -> Self {
            let mut cm = Self::new(n_classes);
            for (&t, &p) in targets.iter().zip(predictions) {
                cm.add(t, p);
            }
            cm
        }

        /// Count one pair; out-of-range indices are ignored
        pub fn add(&mut self, target: usize, prediction: usize) {
            if target < self.n_classes && prediction < self.n_classes {
                self.counts[target * self.n_classes + prediction] += 1;
            }
        }

        /// Merge another matrix of the same size
        pub fn merge(&mut self, other: &ConfusionMatrix) {
            for (a, b) in self.counts.iter_mut().zip(&other.counts) {
                *a += b;
            }
        }

        pub fn n_classes(&self) -> usize {
            self.n_classes
        }

        pub fn get(&self, target: usize, prediction: usize) -> u64 {
            self.counts[target * self.n_classes + prediction]
        }

        /// Rows as nested vectors, for reports
        pub fn rows(&self) -> Vec<Vec<u64>> {
            self.counts.chunks(self.n_classes.max(1)).map(|r| r.to_vec()).collect()
        }

        pub fn total(&self) -> u64 {
            self.counts.iter().sum()
        }

        fn support(&self, c: usize) -> u64 {
            (0..self.n_classes).map(|p| self.get(c, p)).sum()
        }

        fn predicted(&self, c: usize) -> u64 {
            (0..self.n_classes).map(|t| self.get(t, c)).sum()
        }

        /// Precision, recall and F1 of one class; 0 where undefined
        pub fn class_scores(&self, c: usize) -> (f64, f64, f64) {
            let tp = self.get(c, c) as f64;
            let predicted = self.predicted(c) as f64;
            let support = self.support(c) as f64;

            let precision = if predicted > 0.0 { tp / predicted } else { 0.0 };
            let recall = if support > 0.0 { tp / support } else { 0.0 };
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            (precision, recall, f1)
        }

        /// Summary metrics. Macro averages and the median cover classes
        /// that occur as a target or a prediction.
        pub fn metrics(&self) -> ClassificationMetrics {
            let total = self.total();
            let correct: u64 = (0..self.n_classes).map(|c| self.get(c, c)).sum();
            let accuracy = if total > 0 { correct as f64 / total as f64 } else { 0.0 };

            let active: Vec<usize> = (0..self.n_classes)
                .filter(|&c| self.support(c) > 0 || self.predicted(c) > 0)
                .collect();
            let scores: Vec<(f64, f64, f64)> = active.iter().map(|&c| self.class_scores(c)).collect();

            let mean = |f: fn(&(f64, f64, f64)) -> f64| {
                if scores.is_empty() {
                    0.0
                } else {
                    scores.iter().map(f).sum::<f64>() / scores.len() as f64
                }
            };
            let mut f1s: Vec<f64> = scores.iter().map(|s| s.2).collect();

            ClassificationMetrics {
                accuracy,
                macro_precision: mean(|s| s.0),
                macro_recall: mean(|s| s.1),
                macro_f1: mean(|s| s.2),
                median_f1: median(&mut f1s),
            }
        }
    }

    /// Epoch-level summary scores
    #[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
    pub struct ClassificationMetrics {
        /// Micro accuracy
        pub accuracy: f64,
        pub macro_precision: f64,
        pub macro_recall: f64,
        pub macro_f1: f64,
        /// Median of per-class F1
        pub median_f1: f64,
    }

    /// Median of a slice; 0 when empty
    pub fn median(values: &mut [f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        }
    }
}

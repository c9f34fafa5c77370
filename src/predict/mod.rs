pub mod predictor;

pub use predictor::InferenceEngine;

use crate::data::loader::MatrixFile;
use crate::data::MatrixSource;
use crate::error::{Result, SimsError};
use crate::model::loss::metrics::{ClassificationMetrics, ConfusionMatrix};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

/// How many ranked labels each prediction carries
pub const TOP_K: usize = 3;

/// A matrix to score, with one identifier per row
#[derive(Clone)]
pub struct ScoringInput {
    /// Name used in error messages
    pub name: String,
    pub cell_ids: Vec<String>,
    pub matrix: Arc<dyn MatrixSource>,
}

impl ScoringInput {
    /// Rows are identified by their index
    pub fn new(name: impl Into<String>, matrix: Arc<dyn MatrixSource>) -> Self {
        let cell_ids = (0..matrix.n_rows()).map(|i| i.to_string()).collect();
        Self {
            name: name.into(),
            cell_ids,
            matrix,
        }
    }

    /// Attach cell identifiers, one per row
    pub fn with_cell_ids(mut self, cell_ids: Vec<String>) -> Result<Self> {
        if cell_ids.len() != self.matrix.n_rows() {
            return Err(SimsError::DimensionMismatch {
                expected: self.matrix.n_rows(),
                actual: cell_ids.len(),
                origin: Some(format!("{} cell ids", self.name)),
                row: None,
            });
        }
        self.cell_ids = cell_ids;
        Ok(self)
    }

    pub fn n_rows(&self) -> usize {
        self.matrix.n_rows()
    }
}

impl From<MatrixFile> for ScoringInput {
    fn from(file: MatrixFile) -> Self {
        Self {
            name: file.path.display().to_string(),
            cell_ids: file.cell_ids,
            matrix: file.matrix,
        }
    }
}

/// A label with its probability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedLabel {
    pub label: String,
    pub probability: f64,
}

/// Prediction for a single cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPrediction {
    /// Cell identifier
    pub cell: String,
    /// Most probable label; ties go to the lowest class index
    pub label: String,
    /// Encoded class of `label`
    pub class_index: usize,
    /// Probability of `label`
    pub probability: f64,
    /// Up to three most probable labels, best first
    pub top: Vec<RankedLabel>,
}

impl CellPrediction {
    /// Second-best label, if the model has more than one class
    pub fn runner_up(&self) -> Option<&RankedLabel> {
        self.top.get(1)
    }

    /// Gap between best and second-best probability
    pub fn margin(&self) -> f64 {
        self.runner_up()
            .map(|r| self.probability - r.probability)
            .unwrap_or(self.probability)
    }
}

/// Predictions for a whole matrix, in row order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionBatch {
    pub predictions: Vec<CellPrediction>,
    pub summary: PredictionSummary,
}

impl PredictionBatch {
    /// Create new prediction batch
    pub fn new(predictions: Vec<CellPrediction>) -> Self {
        let summary = PredictionSummary::from_predictions(&predictions);
        Self { predictions, summary }
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    /// Predicted labels in row order
    pub fn labels(&self) -> Vec<&str> {
        self.predictions.iter().map(|p| p.label.as_str()).collect()
    }

    /// Write as CSV with first/second/third label columns
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut w = csv::Writer::from_writer(writer);
        let mut header = vec!["cell".to_string(), "prediction".to_string(), "probability".to_string()];
        for rank in ["first", "second", "third"].iter().take(TOP_K) {
            header.push(format!("{rank}_label"));
            header.push(format!("{rank}_prob"));
        }
        w.write_record(&header).map_err(csv_err)?;

        for pred in &self.predictions {
            let mut record = vec![pred.cell.clone(), pred.label.clone(), format!("{:.6}", pred.probability)];
            for k in 0..TOP_K {
                match pred.top.get(k) {
                    Some(r) => {
                        record.push(r.label.clone());
                        record.push(format!("{:.6}", r.probability));
                    }
                    None => record.extend([String::new(), String::new()]),
                }
            }
            w.write_record(&record).map_err(csv_err)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Export to CSV format
    pub fn to_csv(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        String::from_utf8(buf).map_err(|e| SimsError::Storage(e.to_string()))
    }
}

fn csv_err(e: csv::Error) -> SimsError {
    SimsError::Storage(format!("failed to write csv: {e}"))
}

/// Prediction summary statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PredictionSummary {
    /// Total number of predictions
    pub total_predictions: usize,
    /// Cells per predicted label
    pub label_counts: BTreeMap<String, usize>,
    /// Average probability of the predicted label
    pub avg_probability: f64,
    /// Average best/second-best margin
    pub avg_margin: f64,
}

impl PredictionSummary {
    /// Create summary from predictions
    pub fn from_predictions(predictions: &[CellPrediction]) -> Self {
        let total = predictions.len();
        let mut label_counts = BTreeMap::new();
        for p in predictions {
            *label_counts.entry(p.label.clone()).or_insert(0) += 1;
        }
        let mean = |f: fn(&CellPrediction) -> f64| {
            if total > 0 {
                predictions.iter().map(f).sum::<f64>() / total as f64
            } else {
                0.0
            }
        };

        Self {
            total_predictions: total,
            label_counts,
            avg_probability: mean(|p| p.probability),
            avg_margin: mean(CellPrediction::margin),
        }
    }

    /// Print summary to stdout
    pub fn print(&self) {
        println!("\n=== Prediction Summary ===");
        println!("Total predictions: {}", self.total_predictions);
        for (label, count) in &self.label_counts {
            let share = *count as f64 / self.total_predictions.max(1) as f64;
            println!("  {}: {} ({:.2}%)", label, count, share * 100.0);
        }
        println!("Average probability: {:.4}", self.avg_probability);
        println!("Average margin: {:.4}", self.avg_margin);
        println!("==========================\n");
    }
}

/// Non-negative per-cell, per-gene importances in schema order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionMatrix {
    pub cells: Vec<String>,
    pub genes: Vec<String>,
    /// Row-major, `cells.len() * genes.len()`
    pub values: Vec<f32>,
    /// Raw mask of each decision step, same layout as `values`
    pub step_masks: Vec<Vec<f32>>,
    /// Whether rows were scaled to sum to 1
    pub normalized: bool,
}

impl AttributionMatrix {
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    /// Attributions of one cell
    pub fn row(&self, cell: usize) -> &[f32] {
        let n = self.genes.len();
        &self.values[cell * n..(cell + 1) * n]
    }

    /// Scale every row to sum to 1; all-zero rows stay zero
    pub fn normalize_rows(&mut self) {
        let n = self.genes.len().max(1);
        for row in self.values.chunks_mut(n) {
            let sum: f32 = row.iter().sum();
            if sum > 0.0 {
                row.iter_mut().for_each(|v| *v /= sum);
            }
        }
        self.normalized = true;
    }

    /// Column sums normalised to 1, in schema order
    pub fn feature_importances(&self) -> Vec<f64> {
        let n = self.genes.len();
        let mut totals = vec![0.0f64; n];
        for row in self.values.chunks(n.max(1)) {
            for (t, &v) in totals.iter_mut().zip(row) {
                *t += v as f64;
            }
        }
        let sum: f64 = totals.iter().sum();
        if sum > 0.0 {
            totals.iter_mut().for_each(|t| *t /= sum);
        }
        totals
    }

    /// The `k` most important genes, best first
    pub fn top_features(&self, k: usize) -> Vec<(String, f64)> {
        let importances = self.feature_importances();
        let mut order: Vec<usize> = (0..importances.len()).collect();
        order.sort_by(|&a, &b| importances[b].total_cmp(&importances[a]));
        order
            .into_iter()
            .take(k)
            .map(|i| (self.genes[i].clone(), importances[i]))
            .collect()
    }

    /// Write as CSV: a `cell` column followed by one column per gene
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut w = csv::Writer::from_writer(writer);
        w.write_record(std::iter::once("cell").chain(self.genes.iter().map(String::as_str)))
            .map_err(csv_err)?;
        for (i, cell) in self.cells.iter().enumerate() {
            let mut record = Vec::with_capacity(self.genes.len() + 1);
            record.push(cell.clone());
            record.extend(self.row(i).iter().map(|v| v.to_string()));
            w.write_record(&record).map_err(csv_err)?;
        }
        w.flush()?;
        Ok(())
    }
}

/// Predictions together with their attributions
#[derive(Debug, Clone)]
pub struct Explanation {
    pub predictions: PredictionBatch,
    pub attributions: AttributionMatrix,
}

/// Predictions scored against provided labels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Classes in index order
    pub classes: Vec<String>,
    pub metrics: ClassificationMetrics,
    /// Rows are true classes, columns predicted classes
    pub confusion: ConfusionMatrix,
    /// Cells whose label is part of the trained label space
    pub evaluated: usize,
    /// Labels absent from the trained label space, with their counts
    pub unseen_labels: BTreeMap<String, usize>,
    /// Matrix rows without a label entry
    pub unlabeled_rows: usize,
}

impl EvaluationReport {
    pub fn unseen_total(&self) -> usize {
        self.unseen_labels.values().sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SimsError::Storage(format!("failed to serialize report: {e}")))
    }

    /// Print summary to stdout
    pub fn print(&self) {
        println!("\n=== Evaluation Summary ===");
        println!("Evaluated cells: {}", self.evaluated);
        println!("Accuracy: {:.4}", self.metrics.accuracy);
        println!("Macro precision: {:.4}", self.metrics.macro_precision);
        println!("Macro recall: {:.4}", self.metrics.macro_recall);
        println!("Macro F1: {:.4}", self.metrics.macro_f1);
        println!("Median F1: {:.4}", self.metrics.median_f1);
        if !self.unseen_labels.is_empty() {
            println!("Labels not seen in training: {} cells", self.unseen_total());
            for (label, count) in &self.unseen_labels {
                println!("  {}: {}", label, count);
            }
        }
        if self.unlabeled_rows > 0 {
            println!("Rows without a label: {}", self.unlabeled_rows);
        }
        println!("==========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DenseMatrix;

    fn prediction(cell: &str, label: &str, probs: &[(&str, f64)]) -> CellPrediction {
        CellPrediction {
            cell: cell.to_string(),
            label: label.to_string(),
            class_index: 0,
            probability: probs[0].1,
            top: probs
                .iter()
                .map(|(l, p)| RankedLabel {
                    label: l.to_string(),
                    probability: *p,
                })
                .collect(),
        }
    }

    #[test]
    fn test_summary() {
        let batch = PredictionBatch::new(vec![
            prediction("c1", "T", &[("T", 0.8), ("B", 0.2)]),
            prediction("c2", "B", &[("B", 0.6), ("T", 0.4)]),
            prediction("c3", "T", &[("T", 0.7), ("B", 0.3)]),
        ]);
        assert_eq!(batch.summary.total_predictions, 3);
        assert_eq!(batch.summary.label_counts["T"], 2);
        assert!((batch.summary.avg_probability - 0.7).abs() < 1e-9);
        assert_eq!(batch.labels(), vec!["T", "B", "T"]);
    }

    #[test]
    fn test_csv_export() {
        let batch = PredictionBatch::new(vec![prediction("c1", "T", &[("T", 0.75), ("B", 0.25)])]);
        let csv = batch.to_csv().unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "cell,prediction,probability,first_label,first_prob,second_label,second_prob,third_label,third_prob"
        );
        assert_eq!(lines.next().unwrap(), "c1,T,0.750000,T,0.750000,B,0.250000,,");
    }

    #[test]
    fn test_attribution_normalization_and_importance() {
        let mut attr = AttributionMatrix {
            cells: vec!["a".into(), "b".into()],
            genes: vec!["G1".into(), "G2".into()],
            values: vec![3.0, 1.0, 0.0, 0.0],
            step_masks: Vec::new(),
            normalized: false,
        };
        assert_eq!(attr.feature_importances(), vec![0.75, 0.25]);
        assert_eq!(attr.top_features(1), vec![("G1".to_string(), 0.75)]);

        attr.normalize_rows();
        assert_eq!(attr.row(0), &[0.75, 0.25]);
        assert_eq!(attr.row(1), &[0.0, 0.0]);

        let mut buf = Vec::new();
        attr.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("cell,G1,G2\n"));
    }

    #[test]
    fn test_scoring_input_cell_ids() {
        let matrix: Arc<dyn MatrixSource> =
            Arc::new(DenseMatrix::new(vec!["G1".into()], vec![1.0, 2.0]).unwrap());
        let input = ScoringInput::new("m", matrix);
        assert_eq!(input.cell_ids, vec!["0", "1"]);
        assert!(input.clone().with_cell_ids(vec!["x".into()]).is_err());
        assert_eq!(input.with_cell_ids(vec!["x".into(), "y".into()]).unwrap().cell_ids[1], "y");
    }
}

use super::{AttributionMatrix, CellPrediction, EvaluationReport, Explanation, PredictionBatch, RankedLabel, ScoringInput, TOP_K};
use crate::data::labels::LabelCodec;
use crate::data::schema::{FeatureSchema, GeneSchema, RemappedMatrix};
use crate::data::{MatrixSource, RowAlignment};
use crate::error::{Result, SimsError};
use crate::model::architecture::SequentialAttentionNetwork;
use crate::model::checkpoint::{load_checkpoint, Checkpoint, CheckpointStore};
use crate::model::loss::metrics::ConfusionMatrix;
use crate::model::{argmax_rows, to_host};
use burn::prelude::*;
use burn::tensor::TensorData;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Default rows per forward pass
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Scores new matrices with a trained network.
///
/// Runs on a non-autodiff backend, so batch norm uses its running
/// statistics and every row is scored independently of the others.
pub struct InferenceEngine<B: Backend> {
    network: SequentialAttentionNetwork<B>,
    schema: GeneSchema,
    labels: LabelCodec,
    device: B::Device,
    batch_size: usize,
}

impl<B: Backend> InferenceEngine<B> {
    /// Restore network, schema and labels from a decoded checkpoint
    pub fn from_checkpoint(checkpoint: &Checkpoint, device: &B::Device) -> Result<Self> {
        checkpoint.meta.validate()?;
        let network = checkpoint.network::<B>(device)?;
        info!(
            "Loaded network: {} genes, {} classes, {} steps (trained {} epochs)",
            network.input_dim(),
            network.output_dim(),
            network.n_steps(),
            checkpoint.meta.progress.epochs_completed
        );
        Ok(Self {
            network,
            schema: checkpoint.meta.schema.clone(),
            labels: checkpoint.meta.labels.clone(),
            device: device.clone(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Load the checkpoint stored under `key`
    pub fn load(store: &dyn CheckpointStore, key: &str, device: &B::Device) -> Result<Self> {
        let checkpoint = load_checkpoint(store, key)?;
        Self::from_checkpoint(&checkpoint, device)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn schema(&self) -> &GeneSchema {
        &self.schema
    }

    pub fn labels(&self) -> &LabelCodec {
        &self.labels
    }

    fn remap(&self, input: &ScoringInput) -> Result<RemappedMatrix> {
        let remapped = FeatureSchema::remap(&input.name, input.matrix.clone(), &self.schema)?;
        let overlap = remapped.mapping().overlap();
        let coverage = overlap as f64 / self.schema.len() as f64;
        if coverage < 0.5 {
            warn!(
                "{}: only {} of {} trained genes present ({:.1}%), missing genes are zero-filled",
                input.name,
                overlap,
                self.schema.len(),
                coverage * 100.0
            );
        } else {
            debug!("{}: {} of {} trained genes present", input.name, overlap, self.schema.len());
        }
        Ok(remapped)
    }

    fn read_batch(&self, matrix: &RemappedMatrix, rows: std::ops::Range<usize>) -> Result<Tensor<B, 2>> {
        let n = rows.len();
        let width = self.schema.len();
        let chunks: Vec<Vec<f32>> = rows.into_par_iter().map(|r| matrix.read_row(r)).collect::<Result<_>>()?;
        let flat: Vec<f32> = chunks.into_iter().flatten().collect();
        Ok(Tensor::from_data(TensorData::new(flat, [n, width]), &self.device))
    }

    fn batch_ranges(&self, n_rows: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
        let batch_size = self.batch_size;
        (0..n_rows)
            .step_by(batch_size)
            .map(move |start| start..(start + batch_size).min(n_rows))
    }

    fn rank(&self, cell: &str, probs: &[f32], class_index: usize) -> Result<CellPrediction> {
        let mut order: Vec<usize> = (0..probs.len()).collect();
        // stable, so equal probabilities keep ascending class order
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

        let top = order
            .into_iter()
            .take(TOP_K)
            .map(|c| {
                Ok(RankedLabel {
                    label: self.labels.decode(c)?.to_string(),
                    probability: probs[c] as f64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CellPrediction {
            cell: cell.to_string(),
            label: self.labels.decode(class_index)?.to_string(),
            class_index,
            probability: probs[class_index] as f64,
            top,
        })
    }

    fn predictions(&self, input: &ScoringInput, rows: std::ops::Range<usize>, probs: &[f32]) -> Result<Vec<CellPrediction>> {
        let k = self.labels.space().len();
        let classes = argmax_rows(probs, k);
        rows.zip(probs.chunks(k))
            .zip(classes)
            .map(|((row, p), class)| self.rank(&input.cell_ids[row], p, class))
            .collect()
    }

    fn check_cells(input: &ScoringInput) -> Result<()> {
        if input.cell_ids.len() != input.n_rows() {
            return Err(SimsError::DimensionMismatch {
                expected: input.n_rows(),
                actual: input.cell_ids.len(),
                origin: Some(format!("{} cell ids", input.name)),
                row: None,
            });
        }
        Ok(())
    }

    /// Class probabilities, row-major `[n_rows, n_classes]`
    pub fn predict_proba(&self, input: &ScoringInput) -> Result<Vec<f32>> {
        let matrix = self.remap(input)?;
        let mut out = Vec::with_capacity(matrix.n_rows() * self.labels.space().len());
        for rows in self.batch_ranges(matrix.n_rows()) {
            let x = self.read_batch(&matrix, rows)?;
            out.extend(to_host(self.network.probabilities(x)?));
        }
        Ok(out)
    }

    /// Predict a label for every row
    pub fn predict(&self, input: &ScoringInput) -> Result<PredictionBatch> {
        Self::check_cells(input)?;
        let matrix = self.remap(input)?;
        info!("Predicting {} cells from {}", matrix.n_rows(), input.name);

        let mut predictions = Vec::with_capacity(matrix.n_rows());
        for rows in self.batch_ranges(matrix.n_rows()) {
            let x = self.read_batch(&matrix, rows.clone())?;
            let probs = to_host(self.network.probabilities(x)?);
            predictions.extend(self.predictions(input, rows, &probs)?);
        }
        Ok(PredictionBatch::new(predictions))
    }

    /// Predict and capture per-gene attributions.
    ///
    /// With `normalize`, every attribution row is scaled to sum to 1.
    pub fn explain(&self, input: &ScoringInput, normalize: bool) -> Result<Explanation> {
        Self::check_cells(input)?;
        let matrix = self.remap(input)?;
        info!("Explaining {} cells from {}", matrix.n_rows(), input.name);

        let n_steps = self.network.n_steps();
        let mut predictions = Vec::with_capacity(matrix.n_rows());
        let mut values = Vec::with_capacity(matrix.n_rows() * self.schema.len());
        let mut step_masks = vec![Vec::new(); n_steps];

        for rows in self.batch_ranges(matrix.n_rows()) {
            let x = self.read_batch(&matrix, rows.clone())?;
            let (probs, masks) = self.network.forward_masks(x)?;
            let probs = to_host(probs);
            predictions.extend(self.predictions(input, rows, &probs)?);
            values.extend(to_host(masks.explain));
            for (acc, mask) in step_masks.iter_mut().zip(masks.masks) {
                acc.extend(to_host(mask));
            }
        }

        let mut attributions = AttributionMatrix {
            cells: input.cell_ids.clone(),
            genes: self.schema.genes().to_vec(),
            values,
            step_masks,
            normalized: false,
        };
        if normalize {
            attributions.normalize_rows();
        }

        Ok(Explanation {
            predictions: PredictionBatch::new(predictions),
            attributions,
        })
    }

    /// Predict and score against known labels.
    ///
    /// `alignment` maps label entries to matrix rows as in a training
    /// source. Labels outside the trained label space are counted in the
    /// report and left out of the metrics.
    pub fn evaluate(
        &self,
        input: &ScoringInput,
        labels: &[String],
        alignment: &RowAlignment,
    ) -> Result<EvaluationReport> {
        let n_rows = input.n_rows();
        let rows: Vec<usize> = match alignment {
            RowAlignment::Identity => {
                if labels.len() != n_rows {
                    return Err(SimsError::DimensionMismatch {
                        expected: n_rows,
                        actual: labels.len(),
                        origin: Some(format!("{} labels", input.name)),
                        row: None,
                    });
                }
                (0..n_rows).collect()
            }
            RowAlignment::Explicit(rows) => {
                if rows.len() != labels.len() {
                    return Err(SimsError::DimensionMismatch {
                        expected: labels.len(),
                        actual: rows.len(),
                        origin: Some(format!("{} label alignment", input.name)),
                        row: None,
                    });
                }
                if let Some(&bad) = rows.iter().find(|&&r| r >= n_rows) {
                    return Err(SimsError::IndexOutOfRange { index: bad, len: n_rows });
                }
                rows.clone()
            }
        };

        let batch = self.predict(input)?;
        let mut confusion = ConfusionMatrix::new(self.labels.space().len());
        let mut unseen_labels = BTreeMap::new();
        let mut labeled = vec![false; n_rows];

        for (label, &row) in labels.iter().zip(&rows) {
            labeled[row] = true;
            match self.labels.encode(label) {
                Ok(target) => confusion.add(target, batch.predictions[row].class_index),
                Err(_) => *unseen_labels.entry(label.clone()).or_insert(0) += 1,
            }
        }

        let evaluated = confusion.total() as usize;
        let unseen: usize = unseen_labels.values().sum();
        if unseen > 0 {
            warn!("{} cells carry labels not seen in training; excluded from metrics", unseen);
        }

        Ok(EvaluationReport {
            classes: self.labels.space().classes().to_vec(),
            metrics: confusion.metrics(),
            confusion,
            evaluated,
            unseen_labels,
            unlabeled_rows: labeled.iter().filter(|&&l| !l).count(),
        })
    }
}

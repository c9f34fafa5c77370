pub mod dataset;
pub mod labels;
pub mod loader;
pub mod schema;

use crate::error::{Result, SimsError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Read access to a cells × genes expression matrix.
///
/// Implementations may be in memory or backed by storage; the pipeline
/// only ever asks for single rows, so out-of-core backends never need to
/// materialise the whole matrix. Values are expected to be normalised by
/// the caller already.
pub trait MatrixSource: Send + Sync {
    /// Number of rows (cells)
    fn n_rows(&self) -> usize;

    /// Column (gene) identifiers in storage order
    fn gene_ids(&self) -> &[String];

    /// Read one row; the returned vector has `gene_ids().len()` entries
    fn read_row(&self, row: usize) -> Result<Vec<f32>>;

    /// Number of columns
    fn n_cols(&self) -> usize {
        self.gene_ids().len()
    }
}

/// A column of raw label values
pub trait LabelSource: Send + Sync {
    /// Number of label entries
    fn len(&self) -> usize;

    /// Label at entry `index`
    fn label(&self, index: usize) -> Option<&str>;

    /// Whether the column is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LabelSource for Vec<String> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn label(&self, index: usize) -> Option<&str> {
        self.get(index).map(String::as_str)
    }
}

/// Dense row-major matrix held in memory
#[derive(Debug, Clone)]
pub struct DenseMatrix {
    genes: Vec<String>,
    values: Vec<f32>,
    n_rows: usize,
}

impl DenseMatrix {
    /// Build from row-major values
    pub fn new(genes: Vec<String>, values: Vec<f32>) -> Result<Self> {
        let n_cols = genes.len();
        if n_cols == 0 {
            if values.is_empty() {
                return Ok(Self { genes, values, n_rows: 0 });
            }
            return Err(SimsError::DimensionMismatch {
                expected: 0,
                actual: values.len(),
                origin: None,
                row: None,
            });
        }
        if values.len() % n_cols != 0 {
            return Err(SimsError::DimensionMismatch {
                expected: n_cols,
                actual: values.len() % n_cols,
                origin: None,
                row: Some(values.len() / n_cols),
            });
        }
        let n_rows = values.len() / n_cols;
        Ok(Self { genes, values, n_rows })
    }

    /// Build from a list of rows
    pub fn from_rows(genes: Vec<String>, rows: Vec<Vec<f32>>) -> Result<Self> {
        let n_cols = genes.len();
        let mut values = Vec::with_capacity(rows.len() * n_cols);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != n_cols {
                return Err(SimsError::DimensionMismatch {
                    expected: n_cols,
                    actual: row.len(),
                    origin: None,
                    row: Some(i),
                });
            }
            values.extend(row);
        }
        Self::new(genes, values)
    }
}

impl MatrixSource for DenseMatrix {
    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn gene_ids(&self) -> &[String] {
        &self.genes
    }

    fn read_row(&self, row: usize) -> Result<Vec<f32>> {
        if row >= self.n_rows {
            return Err(SimsError::IndexOutOfRange { index: row, len: self.n_rows });
        }
        let n_cols = self.genes.len();
        Ok(self.values[row * n_cols..(row + 1) * n_cols].to_vec())
    }
}

/// One cell ready for the network
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Feature vector in schema order
    pub features: Vec<f32>,
    /// Encoded class, when the source carries labels
    pub label: Option<usize>,
}

/// How label entries line up with matrix rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowAlignment {
    /// Label entry `i` describes matrix row `i`
    Identity,
    /// Label entry `i` describes matrix row `rows[i]`
    Explicit(Vec<usize>),
}

/// A (matrix, labels) pair fed into a dataset
#[derive(Clone)]
pub struct SourceDescriptor {
    /// Name used in logs and error messages
    pub name: String,
    /// Expression matrix handle
    pub matrix: Arc<dyn MatrixSource>,
    /// Label column, absent for unlabeled data
    pub labels: Option<Arc<dyn LabelSource>>,
    /// Name of the label column the values came from
    pub label_column: String,
    /// Row alignment between label entries and matrix rows
    pub alignment: RowAlignment,
}

impl SourceDescriptor {
    /// Labeled source with identity alignment
    pub fn labeled(
        name: impl Into<String>,
        matrix: Arc<dyn MatrixSource>,
        labels: Arc<dyn LabelSource>,
        label_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            matrix,
            labels: Some(labels),
            label_column: label_column.into(),
            alignment: RowAlignment::Identity,
        }
    }

    /// Unlabeled source covering every matrix row
    pub fn unlabeled(name: impl Into<String>, matrix: Arc<dyn MatrixSource>) -> Self {
        Self {
            name: name.into(),
            matrix,
            labels: None,
            label_column: String::new(),
            alignment: RowAlignment::Identity,
        }
    }

    /// Override row alignment
    pub fn with_alignment(mut self, alignment: RowAlignment) -> Self {
        self.alignment = alignment;
        self
    }

    /// Number of rows this source contributes
    pub fn n_rows(&self) -> usize {
        match &self.alignment {
            RowAlignment::Identity => self.matrix.n_rows(),
            RowAlignment::Explicit(rows) => rows.len(),
        }
    }

    /// Matrix row backing local row `local`
    pub fn matrix_row(&self, local: usize) -> usize {
        match &self.alignment {
            RowAlignment::Identity => local,
            RowAlignment::Explicit(rows) => rows[local],
        }
    }

    /// Check that labels and alignment are consistent with the matrix
    pub fn validate(&self) -> Result<()> {
        let n_matrix = self.matrix.n_rows();
        if let RowAlignment::Explicit(rows) = &self.alignment {
            if let Some((entry, &row)) = rows.iter().enumerate().find(|(_, &r)| r >= n_matrix) {
                return Err(SimsError::data(
                    &self.name,
                    format!("label entry {entry} points at matrix row {row}, matrix has {n_matrix} rows"),
                ));
            }
        }
        if let Some(labels) = &self.labels {
            if labels.len() != self.n_rows() {
                return Err(SimsError::DimensionMismatch {
                    expected: self.n_rows(),
                    actual: labels.len(),
                    origin: Some(format!("{} (label column {:?})", self.name, self.label_column)),
                    row: None,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("name", &self.name)
            .field("rows", &self.n_rows())
            .field("genes", &self.matrix.n_cols())
            .field("labeled", &self.labels.is_some())
            .field("label_column", &self.label_column)
            .finish()
    }
}

/// Dataset split configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Fraction of rows held out for validation
    pub val_ratio: f32,
    /// Random seed
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            val_ratio: 0.2,
            seed: 2026,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dense_matrix_rows() {
        let m = DenseMatrix::new(genes(&["A", "B"]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(m.n_rows(), 2);
        assert_eq!(m.read_row(1).unwrap(), vec![3.0, 4.0]);
        assert!(matches!(
            m.read_row(2),
            Err(SimsError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_dense_matrix_rejects_ragged() {
        let err = DenseMatrix::from_rows(genes(&["A", "B"]), vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(matches!(err, Err(SimsError::DimensionMismatch { row: Some(1), .. })));
    }

    #[test]
    fn test_descriptor_alignment() {
        let m = Arc::new(DenseMatrix::new(genes(&["A"]), vec![1.0, 2.0, 3.0]).unwrap());
        let labels: Arc<dyn LabelSource> = Arc::new(vec!["x".to_string(), "y".to_string()]);
        let desc = SourceDescriptor::labeled("s", m.clone(), labels.clone(), "cell_type")
            .with_alignment(RowAlignment::Explicit(vec![2, 0]));
        desc.validate().unwrap();
        assert_eq!(desc.n_rows(), 2);
        assert_eq!(desc.matrix_row(0), 2);

        let bad = SourceDescriptor::labeled("s", m, labels, "cell_type")
            .with_alignment(RowAlignment::Explicit(vec![2, 7]));
        assert!(matches!(bad.validate(), Err(SimsError::Data { .. })));
    }

    #[test]
    fn test_descriptor_label_count_mismatch() {
        let m = Arc::new(DenseMatrix::new(genes(&["A"]), vec![1.0, 2.0, 3.0]).unwrap());
        let labels: Arc<dyn LabelSource> = Arc::new(vec!["x".to_string()]);
        let desc = SourceDescriptor::labeled("s", m, labels, "cell_type");
        assert!(matches!(desc.validate(), Err(SimsError::DimensionMismatch { .. })));
    }
}

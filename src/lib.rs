//! # scsims: interpretable single-cell classification
//!
//! scsims trains a sequential attention classifier over single-cell
//! expression matrices and explains each prediction with per-gene
//! attributions.
//!
//! ## Features
//!
//! - Gene schema reconciliation across matrices with different gene sets
//! - Class-weighted training with early stopping and resumable checkpoints
//! - Sparse per-step feature masks aggregated into attribution matrices
//! - Delimited text input (CSV, TSV, gzipped), read out of core where possible
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scsims::data::dataset::MultiSourceDataset;
//! use scsims::data::labels::LabelCodec;
//! use scsims::data::loader::{load_labels, open_matrix};
//! use scsims::data::schema::{FeatureSchema, SchemaMode};
//! use scsims::data::{LabelSource, SourceDescriptor};
//! use scsims::model::checkpoint::{FsCheckpointStore, BEST_KEY};
//! use scsims::model::NetworkConfig;
//! use scsims::predict::{InferenceEngine, ScoringInput};
//! use scsims::training::sink::TracingSink;
//! use scsims::training::trainer::TrainingLoop;
//! use scsims::training::TrainingConfig;
//! use scsims::{DefaultBackend, TrainingBackend};
//!
//! # fn main() -> scsims::Result<()> {
//! let file = open_matrix("pbmc.csv")?;
//! let (labels, alignment) = load_labels("pbmc_labels.csv", "class", None, &file.cell_ids)?;
//! let codec = LabelCodec::fit(labels.iter().map(String::as_str))?;
//! let schema = FeatureSchema::build([file.matrix.gene_ids()], SchemaMode::Union)?;
//!
//! let labels: Arc<dyn LabelSource> = Arc::new(labels);
//! let source = SourceDescriptor::labeled("pbmc", file.matrix.clone(), labels, "class").with_alignment(alignment);
//! let dataset = MultiSourceDataset::new(vec![source], schema, codec.space().clone())?;
//!
//! let store = Arc::new(FsCheckpointStore::new("checkpoints")?);
//! let mut training = TrainingLoop::<TrainingBackend>::new(
//!     TrainingConfig::default(),
//!     NetworkConfig::new(0, 0),
//!     Default::default(),
//!     store.clone(),
//!     Arc::new(TracingSink),
//! );
//! training.fit(&dataset, &codec)?;
//!
//! let engine = InferenceEngine::<DefaultBackend>::load(store.as_ref(), BEST_KEY, &Default::default())?;
//! let predictions = engine.predict(&ScoringInput::from(open_matrix("query.csv")?))?;
//! predictions.summary.print();
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod data;
pub mod error;
pub mod model;
pub mod predict;
pub mod training;
pub mod utils;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = NdArray<f32>;

/// Backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Re-export commonly used types
pub use data::dataset::MultiSourceDataset;
pub use data::labels::{LabelCodec, LabelSpace};
pub use data::schema::{FeatureSchema, GeneSchema};
pub use error::{Result, SimsError};
pub use model::{architecture::SequentialAttentionNetwork, NetworkConfig};
pub use predict::{AttributionMatrix, InferenceEngine, PredictionBatch};
pub use training::{trainer::TrainingLoop, TrainingConfig, TrainingResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - interpretable single-cell classification",
        NAME, VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_info() {
        let info_str = info();
        assert!(info_str.contains("scsims"));
        assert!(info_str.contains(VERSION));
    }
}

use crate::data::labels::LabelSpace;
use crate::data::schema::{GeneSchema, SchemaMapping};
use crate::data::{Sample, SourceDescriptor, SplitConfig};
use crate::error::{Result, SimsError};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info};

/// One configured source plus its schema projection
#[derive(Debug)]
struct ResolvedSource {
    descriptor: SourceDescriptor,
    mapping: SchemaMapping,
}

/// Row-level view over several (matrix, labels) sources sharing one schema.
///
/// Global row `i` resolves to (source, local row) through a prefix sum of
/// per-source row counts. Access is read-only, so `get` may be called
/// from many threads at once.
#[derive(Debug)]
pub struct MultiSourceDataset {
    sources: Vec<ResolvedSource>,
    /// `offsets[s]` is the first global row of source `s`; last entry is the total
    offsets: Vec<usize>,
    schema: GeneSchema,
    labels: LabelSpace,
}

impl MultiSourceDataset {
    /// Resolve every descriptor against the schema.
    ///
    /// Fails with `SchemaMismatch` if any source shares no gene with the
    /// schema.
    pub fn new(
        descriptors: Vec<SourceDescriptor>,
        schema: GeneSchema,
        labels: LabelSpace,
    ) -> Result<Self> {
        let mut sources = Vec::with_capacity(descriptors.len());
        let mut offsets = Vec::with_capacity(descriptors.len() + 1);
        let mut total = 0usize;

        for descriptor in descriptors {
            descriptor.validate()?;
            let mapping = schema.mapping_for(&descriptor.name, descriptor.matrix.gene_ids())?;
            debug!(
                "Source {}: {} rows, {}/{} schema genes",
                descriptor.name,
                descriptor.n_rows(),
                mapping.overlap(),
                schema.len()
            );
            offsets.push(total);
            total += descriptor.n_rows();
            sources.push(ResolvedSource { descriptor, mapping });
        }
        offsets.push(total);

        info!("Dataset spans {} rows across {} sources", total, sources.len());

        Ok(Self {
            sources,
            offsets,
            schema,
            labels,
        })
    }

    /// Total rows across all sources
    pub fn len(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Whether the dataset has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sources
    pub fn n_sources(&self) -> usize {
        self.sources.len()
    }

    /// Shared gene schema
    pub fn schema(&self) -> &GeneSchema {
        &self.schema
    }

    /// Shared label space
    pub fn label_space(&self) -> &LabelSpace {
        &self.labels
    }

    /// Resolve a global row to (source index, local row)
    pub fn locate(&self, index: usize) -> Result<(usize, usize)> {
        let len = self.len();
        if index >= len {
            return Err(SimsError::IndexOutOfRange { index, len });
        }
        // First offset strictly greater than index, minus one. Empty sources
        // share an offset with their successor and are skipped naturally.
        let source = self.offsets.partition_point(|&o| o <= index) - 1;
        Ok((source, index - self.offsets[source]))
    }

    /// Sample at a global row
    pub fn get(&self, index: usize) -> Result<Sample> {
        let (s, local) = self.locate(index)?;
        let source = &self.sources[s];
        let desc = &source.descriptor;

        let raw = desc.matrix.read_row(desc.matrix_row(local))?;
        let features = source.mapping.apply(&raw).map_err(|e| match e {
            SimsError::DimensionMismatch { expected, actual, .. } => SimsError::DimensionMismatch {
                expected,
                actual,
                origin: Some(desc.name.clone()),
                row: Some(local),
            },
            other => other,
        })?;

        let label = match &desc.labels {
            Some(labels) => {
                let raw_label = labels.label(local).ok_or(SimsError::IndexOutOfRange {
                    index: local,
                    len: labels.len(),
                })?;
                let class = self.labels.encode(raw_label).map_err(|_| SimsError::UnknownLabel {
                    label: raw_label.to_string(),
                    origin: Some(desc.name.clone()),
                    row: Some(local),
                })?;
                Some(class)
            }
            None => None,
        };

        Ok(Sample { features, label })
    }

    /// Fetch many rows in parallel, preserving order
    pub fn get_many(&self, indices: &[usize]) -> Result<Vec<Sample>> {
        indices.par_iter().map(|&i| self.get(i)).collect()
    }

    /// Encoded label of every row, for class counting
    pub fn encoded_labels(&self, indices: &[usize]) -> Result<Vec<usize>> {
        indices
            .iter()
            .map(|&i| {
                let (s, local) = self.locate(i)?;
                let desc = &self.sources[s].descriptor;
                let labels = desc.labels.as_ref().ok_or_else(|| {
                    SimsError::InvalidConfig(format!("source {} has no labels", desc.name))
                })?;
                let raw = labels.label(local).unwrap_or_default();
                self.labels.encode(raw).map_err(|_| SimsError::UnknownLabel {
                    label: raw.to_string(),
                    origin: Some(desc.name.clone()),
                    row: Some(local),
                })
            })
            .collect()
    }

    /// Sequential iterator over samples
    pub fn iter(&self) -> impl Iterator<Item = Result<Sample>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Iterator over samples in a seeded random order
    pub fn iter_shuffled(&self, seed: u64) -> impl Iterator<Item = Result<Sample>> + '_ {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        order.into_iter().map(move |i| self.get(i))
    }
}

/// Disjoint train/validation row indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplit {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

impl DatasetSplit {
    /// Deterministic seeded partition of `0..len`
    pub fn new(len: usize, config: &SplitConfig) -> Result<Self> {
        if !(0.0..1.0).contains(&config.val_ratio) {
            return Err(SimsError::InvalidConfig(format!(
                "val_ratio must be in [0, 1), got {}",
                config.val_ratio
            )));
        }

        let mut order: Vec<usize> = (0..len).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        order.shuffle(&mut rng);

        let mut n_val = (len as f32 * config.val_ratio).round() as usize;
        if config.val_ratio > 0.0 && len > 1 {
            n_val = n_val.clamp(1, len - 1);
        }
        let train = order.split_off(n_val);
        let mut val = order;
        val.sort_unstable();

        info!("Dataset split: train={}, val={} (seed {})", train.len(), val.len(), config.seed);
        Ok(Self { train, val })
    }
}

/// Shuffle and chunk row indices into batches
pub fn batches(indices: &[usize], batch_size: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut order = indices.to_vec();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    order.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::labels::LabelCodec;
    use crate::data::schema::{FeatureSchema, SchemaMode};
    use crate::data::{DenseMatrix, LabelSource, MatrixSource, RowAlignment};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn genes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn labels(names: &[&str]) -> Arc<dyn LabelSource> {
        Arc::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    fn two_source_dataset() -> MultiSourceDataset {
        let m1: Arc<dyn MatrixSource> = Arc::new(
            DenseMatrix::new(genes(&["G1", "G2", "G3"]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
        );
        let m2: Arc<dyn MatrixSource> = Arc::new(
            DenseMatrix::new(genes(&["G2", "G3", "G4"]), vec![5.0, 6.0, 7.0]).unwrap(),
        );
        let schema = FeatureSchema::build(
            [m1.gene_ids(), m2.gene_ids()],
            SchemaMode::Union,
        )
        .unwrap();
        let codec = LabelCodec::fit(["A", "B", "A"]).unwrap();

        MultiSourceDataset::new(
            vec![
                SourceDescriptor::labeled("s1", m1, labels(&["A", "B"]), "cell_type"),
                SourceDescriptor::labeled("s2", m2, labels(&["A"]), "cell_type"),
            ],
            schema,
            codec.space().clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_global_index_resolution() {
        let ds = two_source_dataset();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.locate(0).unwrap(), (0, 0));
        assert_eq!(ds.locate(1).unwrap(), (0, 1));
        assert_eq!(ds.locate(2).unwrap(), (1, 0));

        let s = ds.get(2).unwrap();
        assert_eq!(s.features, vec![0.0, 5.0, 6.0, 7.0]);
        assert_eq!(s.label, Some(0));

        let s = ds.get(1).unwrap();
        assert_eq!(s.features, vec![4.0, 5.0, 6.0, 0.0]);
        assert_eq!(s.label, Some(1));
    }

    #[test]
    fn test_out_of_range() {
        let ds = two_source_dataset();
        assert!(matches!(ds.get(3), Err(SimsError::IndexOutOfRange { index: 3, len: 3 })));
    }

    #[test]
    fn test_get_is_idempotent() {
        let ds = two_source_dataset();
        for i in 0..ds.len() {
            assert_eq!(ds.get(i).unwrap(), ds.get(i).unwrap());
        }
        let many = ds.get_many(&[2, 0, 2]).unwrap();
        assert_eq!(many[0], many[2]);
        assert_eq!(many[1], ds.get(0).unwrap());
    }

    #[test]
    fn test_empty_source_is_skipped() {
        let full: Arc<dyn MatrixSource> =
            Arc::new(DenseMatrix::new(genes(&["A"]), vec![1.0, 2.0]).unwrap());
        let empty: Arc<dyn MatrixSource> = Arc::new(DenseMatrix::new(genes(&["A"]), vec![]).unwrap());
        let schema = GeneSchema::from_genes(genes(&["A"])).unwrap();
        let codec = LabelCodec::fit(["x"]).unwrap();

        let ds = MultiSourceDataset::new(
            vec![
                SourceDescriptor::labeled("empty", empty, labels(&[]), "l"),
                SourceDescriptor::labeled("full", full, labels(&["x", "x"]), "l"),
            ],
            schema,
            codec.space().clone(),
        )
        .unwrap();

        assert_eq!(ds.locate(0).unwrap(), (1, 0));
        assert_eq!(ds.get(1).unwrap().features, vec![2.0]);
    }

    #[test]
    fn test_unknown_label_reports_source_and_row() {
        let m: Arc<dyn MatrixSource> =
            Arc::new(DenseMatrix::new(genes(&["A"]), vec![1.0, 2.0]).unwrap());
        let schema = GeneSchema::from_genes(genes(&["A"])).unwrap();
        let codec = LabelCodec::fit(["x"]).unwrap();
        let ds = MultiSourceDataset::new(
            vec![SourceDescriptor::labeled("batch2", m, labels(&["x", "y"]), "l")],
            schema,
            codec.space().clone(),
        )
        .unwrap();

        match ds.get(1) {
            Err(SimsError::UnknownLabel { label, origin, row }) => {
                assert_eq!(label, "y");
                assert_eq!(origin.as_deref(), Some("batch2"));
                assert_eq!(row, Some(1));
            }
            other => panic!("expected UnknownLabel, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_alignment() {
        let m: Arc<dyn MatrixSource> =
            Arc::new(DenseMatrix::new(genes(&["A"]), vec![10.0, 20.0, 30.0]).unwrap());
        let schema = GeneSchema::from_genes(genes(&["A"])).unwrap();
        let codec = LabelCodec::fit(["p", "q"]).unwrap();
        let ds = MultiSourceDataset::new(
            vec![SourceDescriptor::labeled("s", m, labels(&["q", "p"]), "l")
                .with_alignment(RowAlignment::Explicit(vec![2, 0]))],
            schema,
            codec.space().clone(),
        )
        .unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(0).unwrap(), Sample { features: vec![30.0], label: Some(1) });
        assert_eq!(ds.get(1).unwrap(), Sample { features: vec![10.0], label: Some(0) });
    }

    #[test]
    fn test_split_is_deterministic_and_disjoint() {
        let config = SplitConfig { val_ratio: 0.25, seed: 7 };
        let a = DatasetSplit::new(100, &config).unwrap();
        let b = DatasetSplit::new(100, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.val.len(), 25);

        let train: HashSet<_> = a.train.iter().collect();
        assert!(a.val.iter().all(|i| !train.contains(i)));
        assert_eq!(a.train.len() + a.val.len(), 100);

        let other = DatasetSplit::new(100, &SplitConfig { val_ratio: 0.25, seed: 8 }).unwrap();
        assert_ne!(a.val, other.val);
    }

    #[test]
    fn test_batches_cover_indices() {
        let idx: Vec<usize> = (0..10).collect();
        let b = batches(&idx, 4, 1);
        assert_eq!(b.len(), 3);
        let mut all: Vec<usize> = b.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, idx);
    }
}

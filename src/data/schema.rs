//! Canonical gene ordering and per-source column remapping.
//!
//! A [`GeneSchema`] is built once from every training source and frozen;
//! a [`SchemaMapping`] projects one source's local columns onto it. Genes
//! the source lacks are zero-filled, genes the schema lacks are dropped.

use crate::data::MatrixSource;
use crate::error::{Result, SimsError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How source gene sets are combined into the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    /// Sorted union of all source genes
    #[default]
    Union,
    /// Sorted intersection of all source genes
    Intersection,
}

impl std::str::FromStr for SchemaMode {
    type Err = SimsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "union" => Ok(Self::Union),
            "intersection" | "intersect" => Ok(Self::Intersection),
            other => Err(SimsError::InvalidConfig(format!("unknown schema mode {other:?}"))),
        }
    }
}

/// Ordered, duplicate-free list of gene identifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct GeneSchema {
    genes: Vec<String>,
    positions: HashMap<String, usize>,
}

impl GeneSchema {
    /// Schema over an explicit gene order; identifiers must be unique
    pub fn from_genes(genes: Vec<String>) -> Result<Self> {
        let mut positions = HashMap::with_capacity(genes.len());
        for (i, gene) in genes.iter().enumerate() {
            if positions.insert(gene.clone(), i).is_some() {
                return Err(SimsError::SchemaMismatch {
                    origin: "schema".to_string(),
                    detail: format!("duplicate gene identifier {gene:?} at position {i}"),
                });
            }
        }
        Ok(Self { genes, positions })
    }

    /// Number of genes
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    /// Whether the schema is empty
    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// Genes in schema order
    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    /// Schema position of a gene
    pub fn position(&self, gene: &str) -> Option<usize> {
        self.positions.get(gene).copied()
    }

    /// Mapping from a source's local columns into this schema.
    ///
    /// Fails with `SchemaMismatch` when no source gene is in the schema.
    pub fn mapping_for(&self, origin: &str, source_genes: &[String]) -> Result<SchemaMapping> {
        let mut pairs = Vec::new();
        let mut seen = vec![false; self.genes.len()];
        for (local, gene) in source_genes.iter().enumerate() {
            if let Some(pos) = self.position(gene) {
                if seen[pos] {
                    warn!("{}: duplicate gene column {:?} at {}, keeping first", origin, gene, local);
                    continue;
                }
                seen[pos] = true;
                pairs.push((local, pos));
            }
        }

        if pairs.is_empty() {
            return Err(SimsError::SchemaMismatch {
                origin: origin.to_string(),
                detail: format!(
                    "none of its {} genes appear in the {}-gene schema",
                    source_genes.len(),
                    self.genes.len()
                ),
            });
        }

        let overlap = pairs.len();
        debug!(
            "{}: {} of {} schema genes present, {} source genes dropped",
            origin,
            overlap,
            self.genes.len(),
            source_genes.len() - overlap
        );

        Ok(SchemaMapping {
            pairs,
            source_width: source_genes.len(),
            schema_width: self.genes.len(),
        })
    }
}

impl TryFrom<Vec<String>> for GeneSchema {
    type Error = SimsError;

    fn try_from(genes: Vec<String>) -> Result<Self> {
        Self::from_genes(genes)
    }
}

impl From<GeneSchema> for Vec<String> {
    fn from(schema: GeneSchema) -> Self {
        schema.genes
    }
}

/// Column projection from one source into a schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMapping {
    /// (local column, schema position) pairs
    pairs: Vec<(usize, usize)>,
    source_width: usize,
    schema_width: usize,
}

impl SchemaMapping {
    /// Number of schema genes the source supplies
    pub fn overlap(&self) -> usize {
        self.pairs.len()
    }

    /// Width of rows this mapping accepts
    pub fn source_width(&self) -> usize {
        self.source_width
    }

    /// Project one source row into schema order
    pub fn apply(&self, row: &[f32]) -> Result<Vec<f32>> {
        if row.len() != self.source_width {
            return Err(SimsError::DimensionMismatch {
                expected: self.source_width,
                actual: row.len(),
                origin: None,
                row: None,
            });
        }
        let mut out = vec![0.0; self.schema_width];
        for &(local, pos) in &self.pairs {
            out[pos] = row[local];
        }
        Ok(out)
    }
}

/// Schema construction and remapping
pub struct FeatureSchema;

impl FeatureSchema {
    /// Build the canonical schema from the gene lists of every source.
    ///
    /// The result is sorted, so any permutation of `sources` yields the
    /// same schema.
    pub fn build<'a, I>(sources: I, mode: SchemaMode) -> Result<GeneSchema>
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut combined: Option<BTreeSet<&'a str>> = None;
        let mut n_sources = 0;

        for genes in sources {
            n_sources += 1;
            let set: BTreeSet<&str> = genes.iter().map(String::as_str).collect();
            combined = Some(match (combined, mode) {
                (None, _) => set,
                (Some(acc), SchemaMode::Union) => acc.union(&set).copied().collect(),
                (Some(acc), SchemaMode::Intersection) => acc.intersection(&set).copied().collect(),
            });
        }

        let genes: Vec<String> = combined
            .unwrap_or_default()
            .into_iter()
            .map(str::to_string)
            .collect();

        if genes.is_empty() {
            return Err(SimsError::SchemaMismatch {
                origin: format!("{n_sources} sources"),
                detail: format!("{mode:?} of source gene sets is empty"),
            });
        }

        info!("Built {:?} gene schema with {} genes from {} sources", mode, genes.len(), n_sources);
        GeneSchema::from_genes(genes)
    }

    /// Lazily remap a matrix into schema order
    pub fn remap(
        origin: &str,
        matrix: Arc<dyn MatrixSource>,
        schema: &GeneSchema,
    ) -> Result<RemappedMatrix> {
        let mapping = schema.mapping_for(origin, matrix.gene_ids())?;
        Ok(RemappedMatrix {
            inner: matrix,
            mapping,
            genes: schema.genes().to_vec(),
        })
    }
}

/// A matrix viewed through a schema mapping; rows are remapped on read
pub struct RemappedMatrix {
    inner: Arc<dyn MatrixSource>,
    mapping: SchemaMapping,
    genes: Vec<String>,
}

impl RemappedMatrix {
    /// The mapping applied to each row
    pub fn mapping(&self) -> &SchemaMapping {
        &self.mapping
    }
}

impl MatrixSource for RemappedMatrix {
    fn n_rows(&self) -> usize {
        self.inner.n_rows()
    }

    fn gene_ids(&self) -> &[String] {
        &self.genes
    }

    fn read_row(&self, row: usize) -> Result<Vec<f32>> {
        let raw = self.inner.read_row(row)?;
        self.mapping.apply(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DenseMatrix;

    fn genes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_union_schema_is_sorted_and_order_independent() {
        let a = genes(&["G3", "G1", "G2"]);
        let b = genes(&["G4", "G2", "G3"]);

        let s1 = FeatureSchema::build([a.as_slice(), b.as_slice()], SchemaMode::Union).unwrap();
        let s2 = FeatureSchema::build([b.as_slice(), a.as_slice()], SchemaMode::Union).unwrap();

        assert_eq!(s1, s2);
        assert_eq!(s1.genes(), genes(&["G1", "G2", "G3", "G4"]).as_slice());
    }

    #[test]
    fn test_intersection_schema() {
        let a = genes(&["G1", "G2", "G3"]);
        let b = genes(&["G2", "G3", "G4"]);
        let s = FeatureSchema::build([a.as_slice(), b.as_slice()], SchemaMode::Intersection).unwrap();
        assert_eq!(s.genes(), genes(&["G2", "G3"]).as_slice());

        let c = genes(&["X"]);
        let err = FeatureSchema::build([a.as_slice(), c.as_slice()], SchemaMode::Intersection);
        assert!(matches!(err, Err(SimsError::SchemaMismatch { .. })));
    }

    #[test]
    fn test_remap_two_sources() {
        let g1 = genes(&["G1", "G2", "G3"]);
        let g2 = genes(&["G2", "G3", "G4"]);
        let schema = FeatureSchema::build([g1.as_slice(), g2.as_slice()], SchemaMode::Union).unwrap();

        let m1 = Arc::new(DenseMatrix::new(g1, vec![1.0, 2.0, 3.0]).unwrap());
        let m2 = Arc::new(DenseMatrix::new(g2, vec![5.0, 6.0, 7.0]).unwrap());

        let r1 = FeatureSchema::remap("s1", m1, &schema).unwrap();
        let r2 = FeatureSchema::remap("s2", m2, &schema).unwrap();

        assert_eq!(r1.read_row(0).unwrap(), vec![1.0, 2.0, 3.0, 0.0]);
        assert_eq!(r2.read_row(0).unwrap(), vec![0.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_remap_width_matches_schema_for_any_column_order() {
        let schema = GeneSchema::from_genes(genes(&["A", "B", "C"])).unwrap();
        let source = genes(&["Z", "C", "Y", "A", "X"]);
        let m = Arc::new(DenseMatrix::new(source, vec![9.0, 3.0, 9.0, 1.0, 9.0]).unwrap());

        let r = FeatureSchema::remap("s", m, &schema).unwrap();
        let row = r.read_row(0).unwrap();
        assert_eq!(row.len(), schema.len());
        assert_eq!(row, vec![1.0, 0.0, 3.0]);
        assert_eq!(r.mapping().overlap(), 2);
    }

    #[test]
    fn test_remap_zero_overlap_fails() {
        let schema = GeneSchema::from_genes(genes(&["A", "B"])).unwrap();
        let m = Arc::new(DenseMatrix::new(genes(&["C", "D"]), vec![1.0, 2.0]).unwrap());
        let err = FeatureSchema::remap("query", m, &schema);
        match err {
            Err(SimsError::SchemaMismatch { origin, .. }) => assert_eq!(origin, "query"),
            _ => panic!("expected SchemaMismatch"),
        }
    }

    #[test]
    fn test_duplicate_source_column_keeps_first() {
        let schema = GeneSchema::from_genes(genes(&["A", "B"])).unwrap();
        let mapping = schema.mapping_for("s", &genes(&["A", "A", "B"])).unwrap();
        assert_eq!(mapping.apply(&[1.0, 2.0, 3.0]).unwrap(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_schema_serde_rejects_duplicates() {
        let json = serde_json::to_string(&GeneSchema::from_genes(genes(&["A", "B"])).unwrap()).unwrap();
        assert_eq!(json, r#"["A","B"]"#);
        let back: GeneSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.position("B"), Some(1));

        assert!(serde_json::from_str::<GeneSchema>(r#"["A","A"]"#).is_err());
    }
}

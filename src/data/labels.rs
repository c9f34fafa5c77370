//! Label encoding and class-imbalance weighting.
//!
//! Classes are indexed in sorted order of their raw label string, so the
//! same label set always yields the same index assignment and the class
//! weight vector lines up with the network's output units.

use crate::error::{Result, SimsError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// Bijection between raw labels and `0..K`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSpace {
    classes: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelSpace {
    /// Label space over classes already in index order
    pub fn from_classes(classes: Vec<String>) -> Result<Self> {
        let mut index = HashMap::with_capacity(classes.len());
        for (i, class) in classes.iter().enumerate() {
            if index.insert(class.clone(), i).is_some() {
                return Err(SimsError::InvalidConfig(format!(
                    "duplicate class {class:?} in label space"
                )));
            }
        }
        Ok(Self { classes, index })
    }

    /// Number of classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether there are no classes
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Classes in index order
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Index of a label
    pub fn encode(&self, label: &str) -> Result<usize> {
        self.index
            .get(label)
            .copied()
            .ok_or_else(|| SimsError::UnknownLabel {
                label: label.to_string(),
                origin: None,
                row: None,
            })
    }

    /// Label of an index
    pub fn decode(&self, index: usize) -> Result<&str> {
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or(SimsError::IndexOutOfRange { index, len: self.classes.len() })
    }

    /// Whether a label is known
    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }
}

impl TryFrom<Vec<String>> for LabelSpace {
    type Error = SimsError;

    fn try_from(classes: Vec<String>) -> Result<Self> {
        Self::from_classes(classes)
    }
}

impl From<LabelSpace> for Vec<String> {
    fn from(space: LabelSpace) -> Self {
        space.classes
    }
}

/// Label space plus the class frequencies it was fitted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelCodec {
    space: LabelSpace,
    counts: Vec<usize>,
}

impl LabelCodec {
    /// Fit over every label observed in training sources
    pub fn fit<'a, I>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut tally: BTreeMap<&str, usize> = BTreeMap::new();
        for label in labels {
            *tally.entry(label).or_insert(0) += 1;
        }
        if tally.is_empty() {
            return Err(SimsError::InvalidConfig("no labels to fit".to_string()));
        }

        let classes: Vec<String> = tally.keys().map(|s| s.to_string()).collect();
        let counts: Vec<usize> = tally.values().copied().collect();
        info!("Fitted label codec with {} classes over {} labels", classes.len(), counts.iter().sum::<usize>());

        Ok(Self {
            space: LabelSpace::from_classes(classes)?,
            counts,
        })
    }

    /// Rebuild from a fixed label space and its class counts
    pub fn from_parts(space: LabelSpace, counts: Vec<usize>) -> Result<Self> {
        if counts.len() != space.len() {
            return Err(SimsError::DimensionMismatch {
                expected: space.len(),
                actual: counts.len(),
                origin: Some("class counts".to_string()),
                row: None,
            });
        }
        Ok(Self { space, counts })
    }

    /// The fitted label space
    pub fn space(&self) -> &LabelSpace {
        &self.space
    }

    /// Per-class counts seen during fit
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Index of a label
    pub fn encode(&self, label: &str) -> Result<usize> {
        self.space.encode(label)
    }

    /// Label of an index
    pub fn decode(&self, index: usize) -> Result<&str> {
        self.space.decode(index)
    }

    /// Same label space with counts recomputed from encoded labels, e.g. a training split
    pub fn recount<I>(&self, indices: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut counts = vec![0; self.space.len()];
        for i in indices {
            if let Some(c) = counts.get_mut(i) {
                *c += 1;
            }
        }
        Self {
            space: self.space.clone(),
            counts,
        }
    }

    /// Inverse-frequency weights `N / (K * count[c])`.
    ///
    /// Classes with zero count are left out of both `N` and `K` and get
    /// weight 0.
    pub fn class_weights(&self) -> Vec<f32> {
        let present = self.counts.iter().filter(|&&c| c > 0).count();
        let total: usize = self.counts.iter().sum();
        if present == 0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts
            .iter()
            .map(|&c| {
                if c == 0 {
                    0.0
                } else {
                    total as f32 / (present as f32 * c as f32)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fit_sorted_order() {
        let codec = LabelCodec::fit(["neuron", "astrocyte", "neuron", "microglia"]).unwrap();
        assert_eq!(codec.space().classes(), &["astrocyte", "microglia", "neuron"]);
        assert_eq!(codec.counts(), &[1, 1, 2]);
        assert_eq!(codec.encode("neuron").unwrap(), 2);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let codec = LabelCodec::fit(["b", "c", "a", "c"]).unwrap();
        for i in 0..codec.space().len() {
            let label = codec.decode(i).unwrap();
            assert_eq!(codec.encode(label).unwrap(), i);
        }
        assert!(matches!(codec.decode(3), Err(SimsError::IndexOutOfRange { index: 3, len: 3 })));
    }

    #[test]
    fn test_unknown_label() {
        let codec = LabelCodec::fit(["a"]).unwrap();
        match codec.encode("z") {
            Err(SimsError::UnknownLabel { label, .. }) => assert_eq!(label, "z"),
            other => panic!("expected UnknownLabel, got {other:?}"),
        }
    }

    #[test]
    fn test_inverse_frequency_weights() {
        let codec = LabelCodec::fit(["A", "A", "B"]).unwrap();
        let w = codec.class_weights();
        assert_relative_eq!(w[0], 0.75);
        assert_relative_eq!(w[1], 1.5);
    }

    #[test]
    fn test_zero_count_class_excluded() {
        let codec = LabelCodec::fit(["A", "A", "B", "C"]).unwrap();
        let train_only = codec.recount([0, 0, 1]);
        let w = train_only.class_weights();
        // N = 3, K = 2 present classes
        assert_relative_eq!(w[0], 0.75);
        assert_relative_eq!(w[1], 1.5);
        assert_eq!(w[2], 0.0);
        assert!(w.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_empty_fit_rejected() {
        let empty: [&str; 0] = [];
        assert!(LabelCodec::fit(empty).is_err());
    }
}

use serde::{Deserialize, Serialize};

use crate::model::ModelError;
use crate::tree::Tree;

/// Representation of the node partials used by the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrecisionEncoding {
    /// Canonical form with a dense precision matrix per node.
    #[default]
    Full,
    /// A scalar multiple of the diffusion precision per node.
    Scalar,
    /// Independent univariate recursions, one per trait coordinate.
    Elementary,
}

/// Trait values observed at the tips, in the order of [`Tree::tips`].
#[derive(Debug, Clone, PartialEq)]
pub struct TraitData {
    dim: usize,
    values: Vec<Vec<f64>>,
    missing: Vec<Vec<bool>>,
    encoding: PrecisionEncoding,
}

impl TraitData {
    pub fn new(values: Vec<Vec<f64>>, missing: Vec<Vec<bool>>) -> Result<Self, ModelError> {
        let dim = values.first().map(|row| row.len()).unwrap_or(0);
        if missing.len() != values.len() {
            return Err(ModelError::DimensionMismatch {
                what: "missing-data masks",
                expected: values.len(),
                found: missing.len(),
            });
        }
        for (row, mask) in values.iter().zip(&missing) {
            if row.len() != dim {
                return Err(ModelError::DimensionMismatch {
                    what: "tip trait vector",
                    expected: dim,
                    found: row.len(),
                });
            }
            if mask.len() != dim {
                return Err(ModelError::DimensionMismatch {
                    what: "missing-data mask",
                    expected: dim,
                    found: mask.len(),
                });
            }
            if let Some((&value, _)) = row
                .iter()
                .zip(mask)
                .find(|(value, missing)| !**missing && !value.is_finite())
            {
                return Err(ModelError::InvalidParameter {
                    name: "observed trait value",
                    value,
                });
            }
        }
        Ok(Self {
            dim,
            values,
            missing,
            encoding: PrecisionEncoding::Full,
        })
    }

    /// Rows in tip order; `NaN` marks a missing coordinate.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ModelError> {
        let missing = rows
            .iter()
            .map(|row| row.iter().map(|value| value.is_nan()).collect())
            .collect();
        Self::new(rows, missing)
    }

    /// Rows keyed by tip name. Every tip of `tree` needs a row.
    pub fn from_named(tree: &Tree, rows: &[(&str, Vec<f64>)]) -> Result<Self, ModelError> {
        let mut ordered = vec![None; tree.tip_count()];
        for (name, row) in rows {
            let index = tree
                .tip_by_name(name)
                .ok_or_else(|| ModelError::InvalidTree(format!("unknown taxon {name}")))?;
            ordered[index] = Some(row.clone());
        }
        let ordered = ordered
            .into_iter()
            .enumerate()
            .map(|(index, row)| {
                row.ok_or_else(|| {
                    let node = tree.tips()[index];
                    ModelError::InvalidTree(format!(
                        "no trait data for tip {}",
                        tree.name(node).unwrap_or("<unnamed>")
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_rows(ordered)
    }

    pub fn with_encoding(mut self, encoding: PrecisionEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Mark entries missing by their flat index `tip * dim + coordinate`.
    pub fn with_missing_flat(mut self, indices: &[usize]) -> Result<Self, ModelError> {
        for &index in indices {
            let (tip, coordinate) = (index / self.dim.max(1), index % self.dim.max(1));
            if tip >= self.values.len() {
                return Err(ModelError::DimensionMismatch {
                    what: "flat missing index",
                    expected: self.values.len() * self.dim,
                    found: index,
                });
            }
            self.missing[tip][coordinate] = true;
        }
        Ok(self)
    }

    /// The same data with one trait coordinate removed.
    pub fn without_coordinate(&self, coordinate: usize) -> Result<Self, ModelError> {
        if coordinate >= self.dim {
            return Err(ModelError::DimensionMismatch {
                what: "removed trait coordinate",
                expected: self.dim,
                found: coordinate,
            });
        }
        let drop = |row: &Vec<f64>| -> Vec<f64> {
            row.iter()
                .enumerate()
                .filter(|&(k, _)| k != coordinate)
                .map(|(_, &v)| v)
                .collect()
        };
        Ok(Self {
            dim: self.dim - 1,
            values: self.values.iter().map(drop).collect(),
            missing: self
                .missing
                .iter()
                .map(|mask| {
                    mask.iter()
                        .enumerate()
                        .filter(|&(k, _)| k != coordinate)
                        .map(|(_, &m)| m)
                        .collect()
                })
                .collect(),
            encoding: self.encoding,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn tip_count(&self) -> usize {
        self.values.len()
    }

    pub fn encoding(&self) -> PrecisionEncoding {
        self.encoding
    }

    pub fn values(&self, tip: usize) -> &[f64] {
        &self.values[tip]
    }

    pub fn missing(&self, tip: usize) -> &[bool] {
        &self.missing[tip]
    }

    pub fn is_missing(&self, tip: usize, coordinate: usize) -> bool {
        self.missing[tip][coordinate]
    }

    /// Indices of the observed coordinates of a tip.
    pub fn observed(&self, tip: usize) -> Vec<usize> {
        (0..self.dim).filter(|&k| !self.missing[tip][k]).collect()
    }

    pub fn is_fully_observed(&self, tip: usize) -> bool {
        self.missing[tip].iter().all(|&m| !m)
    }

    pub fn is_fully_missing(&self, tip: usize) -> bool {
        self.missing[tip].iter().all(|&m| m)
    }

    /// Some tip has both observed and missing coordinates.
    pub fn has_partially_missing(&self) -> bool {
        (0..self.tip_count()).any(|tip| !self.is_fully_observed(tip) && !self.is_fully_missing(tip))
    }

    pub(crate) fn validate(&self, tree: &Tree) -> Result<(), ModelError> {
        if self.tip_count() != tree.tip_count() {
            return Err(ModelError::DimensionMismatch {
                what: "tips with trait data",
                expected: tree.tip_count(),
                found: self.tip_count(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn nan_marks_missing() {
        let data = TraitData::from_rows(vec![vec![1., f64::NAN], vec![f64::NAN, f64::NAN]]).unwrap();
        assert_eq!(data.dim(), 2);
        assert_eq!(data.observed(0), vec![0]);
        assert!(data.is_fully_missing(1));
        assert!(data.has_partially_missing());
        let reduced = data.without_coordinate(1).unwrap();
        assert!(reduced.is_fully_observed(0));
        assert_eq!(reduced.values(0), &[1.]);
        assert!(matches!(
            data.without_coordinate(2),
            Err(ModelError::DimensionMismatch { expected: 2, found: 2, .. })
        ));
        let empty = reduced.without_coordinate(0).unwrap();
        assert_eq!(empty.dim(), 0);
        assert!(empty.without_coordinate(0).is_err());
    }

    #[test]
    fn flat_missing_indices() {
        let data = TraitData::from_rows(vec![vec![1., 2.], vec![3., 4.]])
            .unwrap()
            .with_missing_flat(&[1, 2])
            .unwrap();
        assert_eq!(data.missing(0), &[false, true]);
        assert_eq!(data.missing(1), &[true, false]);
        assert!(data.clone().with_missing_flat(&[4]).is_err());
    }

    #[test]
    fn ragged_rows_fail() {
        assert!(matches!(
            TraitData::from_rows(vec![vec![1., 2.], vec![3.]]),
            Err(ModelError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn named_rows_follow_tip_order() {
        let tree = Tree::from_newick("(a:1,(b:1,c:1):1);").unwrap();
        let data = TraitData::from_named(
            &tree,
            &[("c", vec![3.]), ("a", vec![1.]), ("b", vec![2.])],
        )
        .unwrap();
        for (index, &tip) in tree.tips().iter().enumerate() {
            let expected = match tree.name(tip).unwrap() {
                "a" => 1.,
                "b" => 2.,
                _ => 3.,
            };
            assert_eq!(data.values(index), &[expected]);
        }
        assert!(TraitData::from_named(&tree, &[("a", vec![1.])]).is_err());
    }
}

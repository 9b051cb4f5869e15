use std::cmp::Ordering;

use crate::utils::error::{EngineError, Result};

/// Brute-force inner-product index over a dense row-major matrix of unit
/// vectors. Because vectors are normalized, inner product equals cosine
/// similarity and scores lie in [-1, 1].
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    /// Rebuild an index from raw row-major values, e.g. loaded from disk.
    pub fn from_rows(dimension: usize, data: Vec<f32>) -> Result<Self> {
        if dimension == 0 || data.len() % dimension != 0 {
            return Err(EngineError::Persistence(format!(
                "invalid index payload: {} values for dimension {}",
                data.len(),
                dimension
            )));
        }
        Ok(Self { dimension, data })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_rows(&self) -> &[f32] {
        &self.data
    }

    pub fn add(&mut self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Vector stored at an internal slot, in insertion order.
    pub fn reconstruct(&self, slot: usize) -> Option<&[f32]> {
        let start = slot.checked_mul(self.dimension)?;
        let end = start + self.dimension;
        self.data.get(start..end)
    }

    /// Score the query against every stored vector and return the top `k`
    /// slots by inner product. Ties break toward the smaller slot, i.e.
    /// earlier insertion.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(slot, row)| {
                let score: f32 = row.iter().zip(query.iter()).map(|(a, b)| a * b).sum();
                (slot, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_search() {
        let mut index = FlatIndex::new(3);
        index.add(&[1.0, 0.0, 0.0]).unwrap();
        index.add(&[0.0, 1.0, 0.0]).unwrap();
        index.add(&[0.0, 0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 3);

        let hits = index.search(&[0.0, 1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].0, 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_scores_non_increasing() {
        let mut index = FlatIndex::new(2);
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[0.6, 0.8]).unwrap();
        index.add(&[0.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        for pair in hits.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut index = FlatIndex::new(2);
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        let slots: Vec<usize> = hits.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = FlatIndex::new(3);
        assert!(matches!(
            index.add(&[1.0, 0.0]),
            Err(EngineError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        index.add(&[1.0, 0.0, 0.0]).unwrap();
        assert!(index.search(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn test_reconstruct() {
        let mut index = FlatIndex::new(2);
        index.add(&[0.6, 0.8]).unwrap();
        index.add(&[0.0, 1.0]).unwrap();

        assert_eq!(index.reconstruct(0), Some(&[0.6, 0.8][..]));
        assert_eq!(index.reconstruct(1), Some(&[0.0, 1.0][..]));
        assert_eq!(index.reconstruct(2), None);
    }
}

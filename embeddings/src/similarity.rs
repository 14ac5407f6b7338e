//! Similarity computation and top-k ranking for embeddings.

use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Compute the cosine similarity between two embeddings.
///
/// Returns a value between -1.0 and 1.0, where:
/// - 1.0 means identical vectors
/// - 0.0 means orthogonal vectors (or either vector has zero norm)
/// - -1.0 means opposite vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let a = UnitVector::new(a.to_vec());
    let b = UnitVector::new(b.to_vec());
    Ok(a.dot(&b))
}

/// L2 norm of a vector.
///
/// Accumulated in `f64`, which cannot overflow or underflow for any finite
/// `f32` input.
pub fn magnitude(v: &[f32]) -> f64 {
    v.iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

/// Normalize an embedding to unit length.
///
/// Returns `false` and leaves the vector untouched when it is all zeros or
/// holds non-finite components.
pub fn normalize(embedding: &mut Embedding) -> bool {
    let magnitude = magnitude(embedding);
    if magnitude == 0.0 || !magnitude.is_finite() {
        return false;
    }
    for x in embedding.iter_mut() {
        *x = (f64::from(*x) / magnitude) as f32;
    }
    true
}

/// An embedding scaled to unit length, or all zeros if it had no direction
/// (zero norm or non-finite components).
///
/// Cheap to clone so normalized vectors can be memoized and shared between
/// queries.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitVector(Arc<[f32]>);

impl UnitVector {
    pub fn new(mut embedding: Embedding) -> Self {
        if !normalize(&mut embedding) {
            embedding.fill(0.0);
        }
        Self(embedding.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Dot product with another unit vector, i.e. their cosine similarity.
    ///
    /// Clamped to `[-1, 1]` to absorb rounding.
    pub fn dot(&self, other: &UnitVector) -> f32 {
        let dot: f64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(&x, &y)| f64::from(x) * f64::from(y))
            .sum();
        dot.clamp(-1.0, 1.0) as f32
    }
}

/// A similarity search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    /// Label of the matched candidate.
    pub id: String,

    /// Similarity score.
    pub score: f32,
}

impl SimilarityResult {
    /// Create a new similarity result.
    pub fn new(id: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// Rank raw candidate vectors against a query vector.
///
/// See [`rank_normalized`] for ordering and exclusion rules.
pub fn rank(
    query: &[f32],
    candidates: &[(String, Embedding)],
    k: usize,
    exclude: Option<&str>,
) -> Result<Vec<SimilarityResult>> {
    let query = UnitVector::new(query.to_vec());
    let candidates: Vec<(&str, UnitVector)> = candidates
        .iter()
        .map(|(id, v)| (id.as_str(), UnitVector::new(v.clone())))
        .collect();
    rank_normalized(&query, &candidates, k, exclude)
}

/// Rank already-normalized candidates by cosine similarity to `query`.
///
/// Results are sorted by descending score; equal scores keep input order.
/// Candidates whose label equals `exclude` are dropped before the list is cut
/// to `k`, so self-matches never cost a slot.
pub fn rank_normalized<S: AsRef<str>>(
    query: &UnitVector,
    candidates: &[(S, UnitVector)],
    k: usize,
    exclude: Option<&str>,
) -> Result<Vec<SimilarityResult>> {
    if k == 0 {
        return Err(EmbeddingError::InvalidInput("k must be at least 1".to_string()));
    }
    if candidates.is_empty() {
        return Err(EmbeddingError::InvalidInput(
            "candidate set is empty".to_string(),
        ));
    }
    if let Some((_, bad)) = candidates.iter().find(|(_, v)| v.len() != query.len()) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: query.len(),
            actual: bad.len(),
        });
    }

    let mut scored: Vec<(&str, f32)> = candidates
        .iter()
        .map(|(id, v)| (id.as_ref(), query.dot(v)))
        .filter(|(id, _)| Some(*id) != exclude)
        .collect();

    // `sort_by` is stable, which keeps ties in input order.
    scored.sort_by(|a, b| OrderedFloat(b.1).cmp(&OrderedFloat(a.1)));

    Ok(scored
        .into_iter()
        .take(k)
        .map(|(id, score)| SimilarityResult::new(id, score))
        .collect())
}

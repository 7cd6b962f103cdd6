//! Pairwise similarity between unit-normalized embeddings and stable ranking.

use crate::error::SearchError;
use crate::models::{CandidateEmbedding, RankedResult, SimilarityScore};

/// Tolerance used when checking the unit-norm precondition.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

pub fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|value| value * value).sum::<f32>().sqrt()
}

/// Scales `vector` to unit length in place. Returns `false` for an all-zero
/// vector, which has no direction and is left untouched.
pub fn normalize(vector: &mut [f32]) -> bool {
    let magnitude = l2_norm(vector);
    if magnitude == 0.0 || !magnitude.is_finite() {
        return false;
    }

    for value in vector.iter_mut() {
        *value /= magnitude;
    }
    true
}

pub fn is_unit_norm(vector: &[f32]) -> bool {
    (l2_norm(vector) - 1.0).abs() <= UNIT_NORM_TOLERANCE
}

/// Fails with the first candidate whose dimension differs from the query.
pub fn validate_dimensions(
    query: &[f32],
    candidates: &[CandidateEmbedding],
) -> Result<(), SearchError> {
    match candidates
        .iter()
        .find(|candidate| candidate.embedding.len() != query.len())
    {
        Some(candidate) => Err(SearchError::DimensionMismatch {
            expected: query.len(),
            found: candidate.embedding.len(),
            source_index: Some(candidate.source_index),
        }),
        None => Ok(()),
    }
}

/// Scores every candidate against `query` and sorts best-first.
///
/// Equal scores keep their input order, so callers that pass candidates in
/// extraction order get ties broken by ascending `source_index`. Dimensions
/// must already match (see [`validate_dimensions`]) and every vector must be
/// unit length; neither is re-checked here outside debug builds.
pub fn rank(query: &[f32], candidates: &[CandidateEmbedding]) -> Vec<RankedResult> {
    debug_assert!(is_unit_norm(query), "query embedding is not unit-normalized");

    let mut ranked: Vec<RankedResult> = candidates
        .iter()
        .map(|candidate| {
            debug_assert_eq!(candidate.embedding.len(), query.len());
            debug_assert!(
                is_unit_norm(&candidate.embedding),
                "candidate {} is not unit-normalized",
                candidate.source_index
            );

            RankedResult {
                source_index: candidate.source_index,
                score: canonical_score(dot(query, &candidate.embedding)),
            }
        })
        .collect();

    // `sort_by` is stable.
    ranked.sort_by(|left, right| right.score.total_cmp(&left.score));
    ranked
}

/// Folds `-0.0` into `+0.0` so `total_cmp` treats them as a tie.
fn canonical_score(score: SimilarityScore) -> SimilarityScore {
    score + 0.0
}

//! Rank fusion.
//!
//! Weighted Reciprocal Rank Fusion over the lexical and semantic
//! retriever outputs: score(d) = Σ w_i / (k + rank_i(d)), ranks
//! one-based, k = 60. Weights scale rank contributions, never raw
//! retriever scores. Ties break on the chunk id so results are
//! deterministic.

use std::collections::HashMap;

/// Standard RRF dampening constant.
pub(crate) const RRF_K: f64 = 60.0;

/// One retriever's ranked output with its fusion weight.
pub(crate) struct RetrieverRanking {
    pub weight: f64,
    pub ranked_ids: Vec<String>,
}

/// Fuse rankings into a single best-first list of `(id, fused_score)`.
pub(crate) fn rrf_fuse(rankings: &[RetrieverRanking], k: f64) -> Vec<(String, f64)> {
    let mut fused: HashMap<String, f64> = HashMap::new();

    for ranking in rankings {
        for (position, id) in ranking.ranked_ids.iter().enumerate() {
            let rank = (position + 1) as f64;
            *fused.entry(id.clone()).or_insert(0.0) += ranking.weight / (k + rank);
        }
    }

    let mut out: Vec<(String, f64)> = fused.into_iter().collect();
    out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

/// Min-max normalise to [0, 1]; a constant slice maps to all ones.
pub(crate) fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let Some(min) = scores.iter().copied().reduce(f32::min) else {
        return Vec::new();
    };
    let max = scores.iter().copied().fold(min, f32::max);

    let range = max - min;
    if range <= f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores.iter().map(|score| (score - min) / range).collect()
}

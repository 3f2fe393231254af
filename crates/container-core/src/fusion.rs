//! Reciprocal rank fusion and the pseudo-rerank blend (§4.4).

use std::collections::HashMap;

/// RRF smoothing constant used throughout the retrieval engine (§4.4,
/// GLOSSARY). Fixed rather than configurable: the spec pins it at 60.
pub const RRF_K: f64 = 60.0;

/// Compute reciprocal-rank-fusion scores given one or more rankings of
/// chunk ids (already sorted best-first). A chunk id that appears in
/// multiple rankings accumulates a score contribution from each.
pub fn reciprocal_rank_fusion<'a, I>(rankings: I) -> HashMap<String, f64>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut scores: HashMap<String, f64> = HashMap::new();
    for ranking in rankings {
        for (idx, chunk_id) in ranking.iter().enumerate() {
            *scores.entry(chunk_id.clone()).or_insert(0.0) += 1.0 / (RRF_K + idx as f64 + 1.0);
        }
    }
    scores
}

/// Min-max normalize a set of raw scores into `[0, 1]`. A single-element
/// or constant-valued set normalizes to `1.0` for every element (there is
/// no meaningful spread to normalize against).
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let spread = max - min;
    if spread < f64::EPSILON {
        return scores.iter().map(|_| 1.0).collect();
    }
    scores.iter().map(|s| (s - min) / spread).collect()
}

/// Exponential freshness decay, `exp(-lambda * age_days)`. `lambda <= 0`
/// disables decay entirely (returns `1.0`), matching §4.4.
pub fn freshness_weight(age_days: f64, decay_lambda: f64) -> f64 {
    if decay_lambda <= 0.0 {
        return 1.0;
    }
    (-decay_lambda * age_days.max(0.0)).exp()
}

/// Count of case-insensitive whole-word overlaps between a query and a
/// snippet, normalized by the query's word count. Used as the third term
/// of the pseudo-rerank blend (§4.4).
pub fn keyword_overlap(query: &str, snippet: &str) -> f64 {
    let query_words: Vec<String> = query
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .collect();
    if query_words.is_empty() {
        return 0.0;
    }
    let snippet_lower = snippet.to_ascii_lowercase();
    let snippet_words: std::collections::HashSet<&str> =
        snippet_lower.split_whitespace().collect();
    let hits = query_words
        .iter()
        .filter(|w| snippet_words.contains(w.as_str()))
        .count();
    hits as f64 / query_words.len() as f64
}

/// Pseudo-rerank blend: `0.4*vector + 0.4*bm25 + 0.2*keyword_overlap` (§4.4).
pub fn pseudo_rerank_blend(vector_score: f64, bm25_score: f64, keyword_overlap_score: f64) -> f64 {
    0.4 * vector_score + 0.4 * bm25_score + 0.2 * keyword_overlap_score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_rewards_top_ranked_and_multi_list_agreement() {
        let lex = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vec_ranking = vec!["b".to_string(), "a".to_string(), "d".to_string()];
        let scores = reciprocal_rank_fusion([lex.as_slice(), vec_ranking.as_slice()]);
        // "a" and "b" both appear near the top of both lists, so they
        // should outscore "c" and "d" which only appear in one list.
        assert!(scores["a"] > scores["c"]);
        assert!(scores["b"] > scores["d"]);
    }

    #[test]
    fn min_max_normalize_handles_constant_input() {
        let norm = min_max_normalize(&[5.0, 5.0, 5.0]);
        assert_eq!(norm, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn min_max_normalize_spans_zero_to_one() {
        let norm = min_max_normalize(&[1.0, 2.0, 3.0]);
        assert_eq!(norm[0], 0.0);
        assert_eq!(norm[2], 1.0);
    }

    #[test]
    fn freshness_weight_zero_lambda_disables_decay() {
        assert_eq!(freshness_weight(365.0, 0.0), 1.0);
    }

    #[test]
    fn freshness_weight_decays_with_age() {
        let recent = freshness_weight(1.0, 0.1);
        let old = freshness_weight(100.0, 0.1);
        assert!(recent > old);
        assert!(old >= 0.0);
    }

    #[test]
    fn keyword_overlap_counts_whole_word_hits() {
        let score = keyword_overlap("alpha beta", "alpha beta gamma");
        assert_eq!(score, 1.0);
        let partial = keyword_overlap("alpha missing", "alpha beta gamma");
        assert_eq!(partial, 0.5);
    }
}

//! Result ranking and hybrid retrieval
//!
//! This module handles:
//! - Ordering vector hits by relevance
//! - BM25 keyword scoring over a candidate set
//! - Blending the two into one hybrid score

use crate::vector::{sort_hits, SearchHit};

/// Lower-cased alphanumeric terms of two or more characters
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.chars().count() >= 2)
        .map(|s| s.to_lowercase())
        .collect()
}

/// Rank and merge search results
pub struct Ranker {
    bm25_weight: f32,
    vector_weight: f32,
    scorer: Bm25Scorer,
}

impl Ranker {
    /// `bm25_weight` is clamped to [0, 1]
    pub fn new(bm25_weight: f32) -> Self {
        let bm25_weight = bm25_weight.clamp(0.0, 1.0);
        Self {
            bm25_weight,
            vector_weight: 1.0 - bm25_weight,
            scorer: Bm25Scorer::new(),
        }
    }

    /// Rank results using vector scores only
    pub fn rank_vector_only(&self, mut hits: Vec<SearchHit>) -> Vec<SearchHit> {
        sort_hits(&mut hits);
        hits
    }

    /// Blend vector similarity with BM25 over the candidate set:
    /// `score = (1 - w) * vector + w * bm25 / max_bm25`
    pub fn rank_hybrid(&self, query: &str, mut hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let terms = tokenize(query);
        let docs: Vec<&str> = hits.iter().map(|h| h.chunk.content.as_str()).collect();
        let bm25 = self.scorer.score_corpus(&terms, &docs);
        let max = bm25.iter().cloned().fold(0.0f32, f32::max);

        for (hit, keyword) in hits.iter_mut().zip(bm25) {
            let normalized = if max > 0.0 { keyword / max } else { 0.0 };
            hit.score = self.vector_weight * hit.score + self.bm25_weight * normalized;
        }
        sort_hits(&mut hits);
        hits
    }
}

/// BM25 with corpus statistics taken from the scored documents
pub struct Bm25Scorer {
    k1: f32,
    b: f32,
}

impl Bm25Scorer {
    pub fn new() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }

    /// Score every document against the query terms
    pub fn score_corpus(&self, query_terms: &[String], docs: &[&str]) -> Vec<f32> {
        if docs.is_empty() || query_terms.is_empty() {
            return vec![0.0; docs.len()];
        }
        let tokenized: Vec<Vec<String>> = docs.iter().map(|d| tokenize(d)).collect();
        let n = docs.len() as f32;
        let avg_len = (tokenized.iter().map(|t| t.len()).sum::<usize>() as f32 / n).max(1.0);

        let idf: Vec<f32> = query_terms
            .iter()
            .map(|term| {
                let df = tokenized.iter().filter(|t| t.contains(term)).count() as f32;
                (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
            })
            .collect();

        tokenized
            .iter()
            .map(|doc| {
                let len = doc.len() as f32;
                query_terms
                    .iter()
                    .zip(&idf)
                    .map(|(term, idf)| {
                        let tf = doc.iter().filter(|t| *t == term).count() as f32;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let denom = tf + self.k1 * (1.0 - self.b + self.b * len / avg_len);
                        idf * tf * (self.k1 + 1.0) / denom
                    })
                    .sum()
            })
            .collect()
    }
}

impl Default for Bm25Scorer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::DocumentChunk;

    fn hit(id: &str, content: &str, score: f32, seq: u64) -> SearchHit {
        SearchHit {
            chunk: DocumentChunk::new(id, content, vec![]),
            score,
            seq,
        }
    }

    #[test]
    fn test_rank_vector_only() {
        let ranker = Ranker::new(0.0);
        let ranked = ranker.rank_vector_only(vec![
            hit("1", "", 0.5, 0),
            hit("2", "", 0.9, 1),
            hit("3", "", 0.7, 2),
        ]);
        let ids: Vec<_> = ranked.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn test_tokenize() {
        let terms = tokenize("How to configure X?");
        assert_eq!(terms, vec!["how", "to", "configure"]);
    }

    #[test]
    fn test_bm25_prefers_matching_docs() {
        let scorer = Bm25Scorer::new();
        let terms = tokenize("rust programming");
        let scores = scorer.score_corpus(
            &terms,
            &["Rust is a systems programming language", "Python is great"],
        );
        assert!(scores[0] > scores[1]);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn test_hybrid_blend_can_reorder() {
        let ranker = Ranker::new(0.5);
        let ranked = ranker.rank_hybrid(
            "tokio runtime",
            vec![
                hit("vec", "unrelated words entirely", 0.8, 0),
                hit("kw", "the tokio runtime", 0.6, 1),
            ],
        );
        assert_eq!(ranked[0].chunk.id, "kw");
        // keyword doc: 0.5 * 0.6 + 0.5 * 1.0
        assert!((ranked[0].score - 0.8).abs() < 1e-5);
        assert!((ranked[1].score - 0.4).abs() < 1e-5);
    }

    #[test]
    fn test_zero_weight_keeps_vector_scores() {
        let ranker = Ranker::new(0.0);
        let ranked = ranker.rank_hybrid("x", vec![hit("a", "xx", 0.3, 0)]);
        assert!((ranked[0].score - 0.3).abs() < 1e-6);
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-dedup** - two-tier deduplication policy.
//!
//! Tier one is exact: identical bytes hash to the same CID, and an exact
//! match always wins regardless of thresholds. Tier two is approximate:
//! cosine similarity over embeddings when both candidates have one,
//! otherwise Jaccard similarity over shingled text, compared against
//! three descending thresholds that decide whether the incoming document
//! is skipped, merged into the existing one, flagged for manual review,
//! or processed as genuinely new content.

use std::collections::HashSet;

use koi_identity::{Cid, Rid};

/// Similarity thresholds, each a lower bound (inclusive) on the `[0, 1]`
/// similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupThresholds {
    /// At or above this score, the incoming content is treated as
    /// identical to the existing artifact and skipped entirely.
    pub skip: f64,
    /// At or above this score (below `skip`), the incoming content is
    /// merged into the existing artifact's lineage.
    pub merge: f64,
    /// At or above this score (below `merge`), the incoming content is
    /// processed but flagged for manual review.
    pub flag: f64,
}

impl Default for DedupThresholds {
    fn default() -> Self {
        Self {
            skip: 0.95,
            merge: 0.85,
            flag: 0.75,
        }
    }
}

/// The decision the dedup stage reaches for an incoming document against
/// the most similar existing candidate, if any.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// Exact or near-exact duplicate; do not process further.
    Skip {
        /// The RID this content already exists under.
        matched_rid: Rid,
        /// `1.0` for an exact CID match, otherwise the similarity score.
        similarity: f64,
    },
    /// Similar enough to treat as a revision of existing content.
    Merge {
        /// The RID to merge this content's lineage into.
        matched_rid: Rid,
        /// The similarity score that triggered the merge.
        similarity: f64,
    },
    /// Similar enough to be suspicious, but processed normally pending
    /// manual review.
    Flag {
        /// The RID flagged as a possible duplicate of the incoming one.
        matched_rid: Rid,
        /// The similarity score that triggered the flag.
        similarity: f64,
    },
    /// No existing candidate was similar enough to act on.
    ProcessNormal,
}

/// One existing artifact considered as a duplicate candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The candidate's resource identifier.
    pub rid: Rid,
    /// The candidate's current content hash.
    pub cid: Cid,
    /// Word-shingle set of the candidate's text, used when no embedding
    /// is available.
    pub shingles: HashSet<String>,
    /// Dense embedding of the candidate's text, when the Embed stage has
    /// already run for it.
    pub embedding: Option<Vec<f32>>,
}

/// Produce the set of `n`-word shingles of `text`, lowercased.
///
/// Returns an empty set if `text` has fewer than `n` words; such content
/// never approximately matches anything and falls through to
/// `ProcessNormal`, which is the correct behavior for very short inputs.
pub fn shingle(text: &str, n: usize) -> HashSet<String> {
    let words: Vec<String> = text.split_whitespace().map(|w| w.to_lowercase()).collect();
    if n == 0 || words.len() < n {
        return HashSet::new();
    }
    words
        .windows(n)
        .map(|window| window.join(" "))
        .collect()
}

/// Jaccard similarity between two shingle sets: `|A ∩ B| / |A ∪ B|`.
/// Two empty sets are defined as dissimilar (`0.0`), since an empty
/// shingle set carries no signal to compare.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Cosine similarity between two equal-length embeddings, mapped from
/// `[-1, 1]` into `[0, 1]` so it composes with the Jaccard scale used for
/// candidates without embeddings.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = (dot / (norm_a * norm_b)) as f64;
    (cosine + 1.0) / 2.0
}

/// Evaluates incoming content against a set of existing candidates.
#[derive(Debug, Clone)]
pub struct DedupEngine {
    thresholds: DedupThresholds,
}

impl DedupEngine {
    /// Build an engine with the given thresholds.
    pub fn new(thresholds: DedupThresholds) -> Self {
        Self { thresholds }
    }

    /// Compare `incoming` (not yet stored) against `existing` candidates
    /// and decide how to treat it. Candidates are compared in order;
    /// ties in similarity score are broken by the earliest-listed
    /// candidate, matching the order the caller supplies (typically
    /// oldest-first from a query's candidate search).
    pub fn evaluate(&self, incoming_cid: &Cid, incoming: &Candidate, existing: &[Candidate]) -> DedupOutcome {
        if let Some(exact) = existing.iter().find(|c| &c.cid == incoming_cid) {
            return DedupOutcome::Skip {
                matched_rid: exact.rid.clone(),
                similarity: 1.0,
            };
        }

        let mut best: Option<(f64, &Candidate)> = None;
        for candidate in existing {
            let score = Self::similarity(incoming, candidate);
            if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                best = Some((score, candidate));
            }
        }

        match best {
            Some((score, candidate)) if score >= self.thresholds.skip => DedupOutcome::Skip {
                matched_rid: candidate.rid.clone(),
                similarity: score,
            },
            Some((score, candidate)) if score >= self.thresholds.merge => DedupOutcome::Merge {
                matched_rid: candidate.rid.clone(),
                similarity: score,
            },
            Some((score, candidate)) if score >= self.thresholds.flag => DedupOutcome::Flag {
                matched_rid: candidate.rid.clone(),
                similarity: score,
            },
            _ => DedupOutcome::ProcessNormal,
        }
    }

    fn similarity(a: &Candidate, b: &Candidate) -> f64 {
        match (&a.embedding, &b.embedding) {
            (Some(ea), Some(eb)) => cosine_similarity(ea, eb),
            _ => jaccard_similarity(&a.shingles, &b.shingles),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, cid: &Cid, text: &str) -> Candidate {
        Candidate {
            rid: Rid::mint("regen", "raw", id).unwrap(),
            cid: cid.clone(),
            shingles: shingle(text, 3),
            embedding: None,
        }
    }

    #[test]
    fn exact_cid_match_always_skips() {
        let engine = DedupEngine::new(DedupThresholds::default());
        let cid = Cid::hash_bytes(b"same bytes");
        let existing = vec![candidate("a", &cid, "completely unrelated filler text here")];
        let incoming = candidate("b", &cid, "different text entirely, irrelevant");

        let outcome = engine.evaluate(&cid, &incoming, &existing);
        assert_eq!(
            outcome,
            DedupOutcome::Skip {
                matched_rid: Rid::mint("regen", "raw", "a").unwrap(),
                similarity: 1.0,
            }
        );
    }

    #[test]
    fn near_identical_text_merges() {
        let engine = DedupEngine::new(DedupThresholds::default());
        let existing_cid = Cid::hash_bytes(b"v1");
        let incoming_cid = Cid::hash_bytes(b"v2");
        let text_a = "the quick brown fox jumps over the lazy dog today";
        let text_b = "the quick brown fox jumps over the lazy dog yesterday";

        let existing = vec![candidate("a", &existing_cid, text_a)];
        let incoming = candidate("b", &incoming_cid, text_b);

        match engine.evaluate(&incoming_cid, &incoming, &existing) {
            DedupOutcome::Merge { similarity, .. } => assert!(similarity >= 0.85),
            other => panic!("expected Merge, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_text_processes_normally() {
        let engine = DedupEngine::new(DedupThresholds::default());
        let existing_cid = Cid::hash_bytes(b"v1");
        let incoming_cid = Cid::hash_bytes(b"v2");
        let existing = vec![candidate("a", &existing_cid, "a treatise on deep sea fishing methods")];
        let incoming = candidate("b", &incoming_cid, "notes on medieval stonemasonry techniques");

        assert_eq!(
            engine.evaluate(&incoming_cid, &incoming, &existing),
            DedupOutcome::ProcessNormal
        );
    }

    #[test]
    fn no_candidates_processes_normally() {
        let engine = DedupEngine::new(DedupThresholds::default());
        let incoming_cid = Cid::hash_bytes(b"v1");
        let incoming = candidate("a", &incoming_cid, "anything at all");
        assert_eq!(
            engine.evaluate(&incoming_cid, &incoming, &[]),
            DedupOutcome::ProcessNormal
        );
    }

    #[test]
    fn jaccard_of_identical_sets_is_one() {
        let set = shingle("alpha beta gamma delta", 2);
        assert_eq!(jaccard_similarity(&set, &set), 1.0);
    }

    #[test]
    fn jaccard_of_empty_sets_is_zero() {
        let empty = HashSet::new();
        assert_eq!(jaccard_similarity(&empty, &empty), 0.0);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_opposite_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 0.0).abs() < 1e-6);
    }

    proptest::proptest! {
        #[test]
        fn jaccard_is_symmetric(
            a in proptest::collection::hash_set("[a-c]", 0..6),
            b in proptest::collection::hash_set("[a-c]", 0..6),
        ) {
            proptest::prop_assert_eq!(jaccard_similarity(&a, &b), jaccard_similarity(&b, &a));
        }
    }
}

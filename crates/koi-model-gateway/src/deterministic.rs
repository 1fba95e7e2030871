//! Zero-cost, network-free reference models.
//!
//! These back every pipeline run that has no provider configured (or any
//! test) so the Embed/Enrich/ExtractEntities stages are never blocked on
//! external credentials. They are deliberately simple: deterministic
//! hash-expansion for embeddings, a whitespace-normalizing pass for
//! enrichment, and a capitalized-token heuristic for entity extraction.

use async_trait::async_trait;
use koi_identity::Cid;
use sha2::{Digest, Sha256};

use crate::{EmbeddingModel, EntityExtractionModel, EnrichmentModel, ExtractedEntity, ModelError, ModelOutput};

/// Expands a SHA-256 digest of the input text into a fixed-length vector
/// of unit-ish floats. Not a semantic embedding - only useful for exact
/// and near-duplicate matching in tests and offline runs.
pub struct DeterministicEmbedder {
    dimension: usize,
}

impl DeterministicEmbedder {
    /// Create an embedder producing vectors of length `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingModel for DeterministicEmbedder {
    async fn embed(&self, text: &str) -> Result<ModelOutput<Vec<f32>>, ModelError> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut counter: u64 = 0;
        while vector.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if vector.len() == self.dimension {
                    break;
                }
                let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                vector.push((bits as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        Ok(ModelOutput {
            value: vector,
            cost_usd: 0.0,
            model: "deterministic-hash-embedder".to_string(),
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Collapses runs of whitespace and trims the text. Stands in for a real
/// enrichment model (summarization, cleanup) in offline runs.
pub struct DeterministicEnricher;

#[async_trait]
impl EnrichmentModel for DeterministicEnricher {
    async fn enrich(&self, text: &str) -> Result<ModelOutput<String>, ModelError> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Ok(ModelOutput {
            value: normalized,
            cost_usd: 0.0,
            model: "deterministic-whitespace-enricher".to_string(),
        })
    }
}

/// Flags capitalized, non-sentence-initial-looking tokens as candidate
/// entities. A crude stand-in for a real NER model.
pub struct DeterministicExtractor;

#[async_trait]
impl EntityExtractionModel for DeterministicExtractor {
    async fn extract_entities(
        &self,
        text: &str,
        _ontology_cid: &Cid,
    ) -> Result<ModelOutput<Vec<ExtractedEntity>>, ModelError> {
        let mut entities = Vec::new();
        let mut offset = 0usize;
        for word in text.split_whitespace() {
            let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric());
            let start = text[offset..].find(trimmed).map(|p| offset + p).unwrap_or(offset);
            let end = start + trimmed.len();
            offset = end;
            if trimmed.len() > 1
                && trimmed.chars().next().is_some_and(|c| c.is_uppercase())
                && trimmed.chars().skip(1).all(|c| c.is_lowercase())
            {
                entities.push(ExtractedEntity {
                    surface_form: trimmed.to_string(),
                    entity_kind: "unknown".to_string(),
                    span: Some((start, end)),
                    confidence: 0.5,
                });
            }
        }
        Ok(ModelOutput {
            value: entities,
            cost_usd: 0.0,
            model: "deterministic-capitalization-extractor".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embeddings_are_deterministic_across_calls() {
        let embedder = DeterministicEmbedder::new(8);
        let a = embedder.embed("repeatable input").await.unwrap();
        let b = embedder.embed("repeatable input").await.unwrap();
        assert_eq!(a.value, b.value);
    }

    #[tokio::test]
    async fn different_text_produces_different_embeddings() {
        let embedder = DeterministicEmbedder::new(8);
        let a = embedder.embed("alpha").await.unwrap();
        let b = embedder.embed("beta").await.unwrap();
        assert_ne!(a.value, b.value);
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-query** - the read-side query interface.
//!
//! Wraps an [`ArtifactStore`] and [`ReceiptLedger`] with the five read
//! operations every consumer of this node needs: fetch an artifact,
//! walk its provenance chain, search by embedding similarity, list the
//! entities recognized in an artifact, and list the artifacts that
//! mention a given entity. The vector and entity indexes are built
//! in-process as the pipeline runs (see [`QueryEngine::index_embedding`]
//! and [`QueryEngine::index_entities`]); they are not persisted here -
//! a process restart rebuilds them by replaying ingestion, the same way
//! the rest of this node treats derived state as reconstructible from
//! the artifact store and ledger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use koi_dedup::{cosine_similarity, Candidate};
use koi_identity::{Cid, Rid};
use koi_ledger::{LedgerError, Receipt, ReceiptLedger};
use koi_model_gateway::ExtractedEntity;
use koi_store_core::{Artifact, ArtifactRef, ArtifactStore, StorageError};
use serde::Serialize;
use tokio::sync::RwLock;

/// One hit from [`QueryEngine::search`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// The matching artifact's resource identifier.
    pub rid: Rid,
    /// Cosine similarity to the query embedding, in `[0, 1]`.
    pub score: f64,
}

/// The read-side query engine.
///
/// Owns shared handles to the store and ledger (rather than borrowing
/// them) so it can be held alongside other long-lived collaborators
/// behind a single `Arc`, as the runtime crate does.
pub struct QueryEngine {
    store: Arc<dyn ArtifactStore>,
    ledger: Arc<dyn ReceiptLedger>,
    vectors: RwLock<HashMap<Rid, Vec<f32>>>,
    entities_by_rid: RwLock<HashMap<Rid, Vec<ExtractedEntity>>>,
    rids_by_entity: RwLock<HashMap<String, HashSet<Rid>>>,
    documents: RwLock<HashMap<Rid, (Cid, HashSet<String>)>>,
}

impl QueryEngine {
    /// Build an engine over the given store and ledger, with empty
    /// vector/entity indexes.
    pub fn new(store: Arc<dyn ArtifactStore>, ledger: Arc<dyn ReceiptLedger>) -> Self {
        Self {
            store,
            ledger,
            vectors: RwLock::new(HashMap::new()),
            entities_by_rid: RwLock::new(HashMap::new()),
            rids_by_entity: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Register `rid`'s normalized-content hash and shingle set for
    /// future document-level duplicate detection. Overwrites any prior
    /// entry for `rid`, so only its current content is ever a candidate.
    pub async fn index_document(&self, rid: Rid, cid: Cid, shingles: HashSet<String>) {
        self.documents.write().await.insert(rid, (cid, shingles));
    }

    /// Snapshot of every indexed document as a duplicate candidate, for
    /// the document-level dedup gate run before the pipeline.
    pub async fn document_candidates(&self) -> Vec<Candidate> {
        self.documents
            .read()
            .await
            .iter()
            .map(|(rid, (cid, shingles))| Candidate {
                rid: rid.clone(),
                cid: cid.clone(),
                shingles: shingles.clone(),
                embedding: None,
            })
            .collect()
    }

    /// The normalized-content CID indexed for `rid`, if any.
    pub async fn document_cid(&self, rid: &Rid) -> Option<Cid> {
        self.documents.read().await.get(rid).map(|(cid, _)| cid.clone())
    }

    /// Register `rid`'s embedding for future [`search`](Self::search)
    /// calls. Call this whenever the Embed stage produces a new vector.
    pub async fn index_embedding(&self, rid: Rid, embedding: Vec<f32>) {
        self.vectors.write().await.insert(rid, embedding);
    }

    /// Register the entities recognized in `rid` for future
    /// [`entities_of`](Self::entities_of) and
    /// [`artifacts_mentioning`](Self::artifacts_mentioning) calls.
    pub async fn index_entities(&self, rid: Rid, entities: Vec<ExtractedEntity>) {
        let mut rids_by_entity = self.rids_by_entity.write().await;
        for entity in &entities {
            rids_by_entity
                .entry(entity.surface_form.clone())
                .or_default()
                .insert(rid.clone());
        }
        self.entities_by_rid.write().await.insert(rid, entities);
    }

    /// Fetch an artifact by RID (current revision) or CID.
    pub async fn get_artifact(&self, reference: &ArtifactRef) -> Result<Option<Artifact>, StorageError> {
        self.store.resolve(reference).await
    }

    /// Walk the transformation chain that produced `cid`, oldest first.
    pub async fn provenance(&self, cid: &Cid) -> Result<Vec<Receipt>, LedgerError> {
        self.ledger.chain_for(cid).await
    }

    /// Return the `top_k` indexed artifacts most similar to
    /// `query_embedding` by cosine similarity. Ties are broken by RID
    /// string ordering so repeated searches are stable.
    pub async fn search(&self, query_embedding: &[f32], top_k: usize) -> Vec<SearchHit> {
        let vectors = self.vectors.read().await;
        let mut hits: Vec<SearchHit> = vectors
            .iter()
            .map(|(rid, embedding)| SearchHit {
                rid: rid.clone(),
                score: cosine_similarity(query_embedding, embedding),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.rid.to_string().cmp(&b.rid.to_string()))
        });
        hits.truncate(top_k);
        hits
    }

    /// Entities recognized in `rid`, empty if ExtractEntities never ran
    /// for it (or it was never indexed).
    pub async fn entities_of(&self, rid: &Rid) -> Vec<ExtractedEntity> {
        self.entities_by_rid.read().await.get(rid).cloned().unwrap_or_default()
    }

    /// Artifacts that mention `entity_surface_form`, in no particular
    /// order.
    pub async fn artifacts_mentioning(&self, entity_surface_form: &str) -> Vec<Rid> {
        self.rids_by_entity
            .read()
            .await
            .get(entity_surface_form)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every indexed `(rid, embedding)` pair. Used by
    /// duplicate-candidate sources that compare an incoming chunk
    /// against everything seen so far.
    pub async fn all_vectors(&self) -> Vec<(Rid, Vec<f32>)> {
        self.vectors
            .read()
            .await
            .iter()
            .map(|(rid, embedding)| (rid.clone(), embedding.clone()))
            .collect()
    }
}

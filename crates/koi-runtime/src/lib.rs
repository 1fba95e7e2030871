#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-runtime** - wires identity, storage, the receipt ledger, the
//! event bus, the scheduler, the pipeline and the query engine into a
//! single handle.
//!
//! [`Runtime::ingest`] is the node's one write entrypoint: it mints a
//! document's resource identifier deterministically from its source and
//! original id, checks the incoming content against every document
//! already seen before running the seven-stage pipeline, and folds the
//! resulting embeddings and entities into the query engine's indexes.
//! An exact or near-exact match short-circuits with just a dedup
//! receipt; a merge or flag decision is additionally written to a
//! manual-review record on disk. Calling it twice with the same
//! `(source_rid, original_id, bytes)` is a no-op past the first call,
//! since every layer underneath - the artifact store's upsert, the
//! ledger's receipt append - is itself idempotent on content.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use koi_bus::FunBus;
use koi_dedup::{shingle, Candidate, DedupEngine, DedupOutcome, DedupThresholds};
use koi_identity::{Cid, Rid};
use koi_ledger::{compute_cat_id, LedgerError, Receipt, ReceiptLedger, SqliteReceiptLedger};
use koi_model_gateway::deterministic::{DeterministicEmbedder, DeterministicEnricher, DeterministicExtractor};
use koi_model_gateway::{EmbeddingModel, EntityExtractionModel, EnrichmentModel, GatewayConfig, ProviderConfig};
#[cfg(feature = "openai")]
use koi_model_gateway::openai::OpenAiModel;
use koi_pipeline::{
    normalize, Document, DuplicateCandidateSource, Engine, IngestStatus, PipelineConfig, PipelineError,
    PipelineOutcome,
};
use koi_query::QueryEngine;
use koi_scheduler::Scheduler;
use koi_store_core::{ArtifactRef, ArtifactStore, StorageError};
use koi_store_memory::MemoryArtifactStore;
use koi_store_sqlite::SqliteArtifactStore;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Number of words per shingle used for document-level duplicate
/// detection, ahead of the pipeline's own per-chunk dedup stage.
const DOCUMENT_SHINGLE_SIZE: usize = 3;

/// A paid OpenAI-compatible embedding is this wide by default; used when
/// no gateway configuration overrides it.
const DEFAULT_OPENAI_EMBEDDING_DIMENSION: usize = 1536;
const DETERMINISTIC_EMBEDDING_DIMENSION: usize = 256;

/// Where the artifact store and receipt ledger persist their state.
/// Both backends keep the ledger durable on SQLite, since provenance is
/// the one thing this node must never lose even in a throwaway
/// in-memory deployment.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Artifact bytes and the RID index live only in process memory;
    /// the receipt ledger is still durable, rooted at `ledger_dir`.
    Memory {
        /// Directory the receipt ledger writes its database and JSON
        /// mirror under.
        ledger_dir: PathBuf,
    },
    /// Artifact bytes, the RID index and the receipt ledger are all
    /// rooted under `data_dir`.
    Sqlite {
        /// Directory the store and ledger write their files under.
        data_dir: PathBuf,
    },
}

/// Top-level configuration for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Storage backend selection.
    pub storage: StorageConfig,
    /// Event bus ring-buffer capacity.
    pub bus_capacity: usize,
    /// Maximum concurrent paid-stage runs.
    pub max_in_flight: usize,
    /// Per-category daily USD spend caps; categories absent here are
    /// unmetered.
    pub daily_budgets: HashMap<String, f64>,
    /// Deduplication similarity thresholds.
    pub dedup_thresholds: DedupThresholds,
    /// Model gateway configuration. `None` runs entirely on the
    /// deterministic, zero-cost reference models.
    pub gateway: Option<GatewayConfig>,
    /// Pipeline stage configuration.
    pub pipeline: PipelineConfig,
}

impl RuntimeConfig {
    /// A configuration suitable for tests: in-memory storage, a
    /// temporary ledger directory, no paid models.
    pub fn for_testing(ledger_dir: PathBuf) -> Self {
        Self {
            storage: StorageConfig::Memory { ledger_dir },
            bus_capacity: 256,
            max_in_flight: 4,
            daily_budgets: HashMap::new(),
            dedup_thresholds: DedupThresholds::default(),
            gateway: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Errors raised while constructing or driving a [`Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The selected storage backend could not be opened.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The receipt ledger could not be opened or written to.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    /// A pipeline run failed.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    /// `(source_rid, original_id)` could not be minted into a valid RID.
    #[error("invalid ingestion identifier: {0}")]
    InvalidIdentifier(String),
    /// Writing a manual-review record to disk failed.
    #[error("review record write failed: {0}")]
    Review(#[from] std::io::Error),
}

/// A document submitted for ingestion, identified by where it came from
/// rather than by a pre-minted RID.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// The source system's own namespace/type, e.g.
    /// `orn:regen.raw:notion`. Only `namespace()`/`kind()` are used; its
    /// `id()` is ignored in favor of `original_id`.
    pub source_rid: Rid,
    /// The source system's identifier for this document, stable across
    /// re-ingestion (a Notion page id, a tweet id, ...).
    pub original_id: String,
    /// Raw bytes as received from the source.
    pub raw_bytes: Vec<u8>,
    /// Source format hint (`html`, `plain`, `markdown`, ...).
    pub format: String,
}

/// Draws duplicate candidates from every embedding the query engine has
/// indexed so far, looking up each candidate's current CID from the
/// store so an exact-content match still short-circuits to `Skip`.
/// Chunks are compared against the whole corpus rather than a narrower
/// scope (e.g. the same source), favoring recall over precision.
struct IndexedCandidateSource {
    query: Arc<QueryEngine>,
    store: Arc<dyn ArtifactStore>,
}

#[async_trait]
impl DuplicateCandidateSource for IndexedCandidateSource {
    async fn candidates_for(&self, rid: &Rid) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for (candidate_rid, embedding) in self.query.all_vectors().await {
            if &candidate_rid == rid {
                continue;
            }
            let Ok(Some(artifact)) = self.store.resolve(&ArtifactRef::Rid(candidate_rid.clone())).await else {
                continue;
            };
            candidates.push(Candidate {
                rid: candidate_rid,
                cid: artifact.cid,
                shingles: Default::default(),
                embedding: Some(embedding),
            });
        }
        candidates
    }
}

fn build_models(
    gateway: &Option<GatewayConfig>,
) -> (
    Arc<dyn EmbeddingModel>,
    Arc<dyn EnrichmentModel>,
    Arc<dyn EntityExtractionModel>,
) {
    #[cfg(feature = "openai")]
    if let Some(cfg) = gateway {
        if let ProviderConfig::OpenAi {
            api_key,
            chat_model,
            embedding_model,
            base_url,
        } = &cfg.provider
        {
            let model = Arc::new(OpenAiModel::new(
                api_key.clone(),
                base_url.clone(),
                chat_model.clone(),
                embedding_model.clone(),
                DEFAULT_OPENAI_EMBEDDING_DIMENSION,
                cfg.rate_limit_per_sec,
            ));
            return (model.clone(), model.clone(), model);
        }
    }
    let _ = gateway;
    (
        Arc::new(DeterministicEmbedder::new(DETERMINISTIC_EMBEDDING_DIMENSION)),
        Arc::new(DeterministicEnricher),
        Arc::new(DeterministicExtractor),
    )
}

/// The wired-together KOI processor node.
pub struct Runtime {
    store: Arc<dyn ArtifactStore>,
    ledger: Arc<dyn ReceiptLedger>,
    bus: Arc<FunBus>,
    scheduler: Arc<Scheduler>,
    embedder: Arc<dyn EmbeddingModel>,
    enricher: Arc<dyn EnrichmentModel>,
    extractor: Arc<dyn EntityExtractionModel>,
    dedup: Arc<DedupEngine>,
    query: Arc<QueryEngine>,
    pipeline_config: PipelineConfig,
    /// One lock per RID, held across that RID's entire ingest critical
    /// section so two concurrent re-ingestions of the same document
    /// serialize instead of racing each other's store/ledger writes.
    rid_locks: Mutex<HashMap<Rid, Arc<Mutex<()>>>>,
    /// Where flagged/merged document-level dedup decisions are recorded
    /// for manual review.
    review_dir: PathBuf,
}

/// A manual-review record for a document-level dedup decision that needs
/// a human to confirm (`Flag`) or that merged automatically (`Merge`).
#[derive(Debug, Serialize)]
struct ReviewRecord<'a> {
    incoming_rid: &'a Rid,
    matched_rid: &'a Rid,
    similarity: f64,
    decided_at: chrono::DateTime<chrono::Utc>,
}

impl Runtime {
    /// Build a runtime from `config`, opening its storage backends.
    pub async fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let (store, ledger): (Arc<dyn ArtifactStore>, Arc<dyn ReceiptLedger>) = match &config.storage {
            StorageConfig::Memory { ledger_dir } => (
                Arc::new(MemoryArtifactStore::new()),
                Arc::new(SqliteReceiptLedger::open(ledger_dir).await?),
            ),
            StorageConfig::Sqlite { data_dir } => (
                Arc::new(SqliteArtifactStore::open(data_dir).await?),
                Arc::new(SqliteReceiptLedger::open(data_dir).await?),
            ),
        };
        let review_dir = match &config.storage {
            StorageConfig::Memory { ledger_dir } => ledger_dir.join("review"),
            StorageConfig::Sqlite { data_dir } => data_dir.join("review"),
        };

        let (embedder, enricher, extractor) = build_models(&config.gateway);
        let query = Arc::new(QueryEngine::new(store.clone(), ledger.clone()));

        Ok(Self {
            store,
            ledger,
            bus: Arc::new(FunBus::new(config.bus_capacity)),
            scheduler: Arc::new(Scheduler::new(config.max_in_flight, config.daily_budgets)),
            embedder,
            enricher,
            extractor,
            dedup: Arc::new(DedupEngine::new(config.dedup_thresholds)),
            query,
            pipeline_config: config.pipeline,
            rid_locks: Mutex::new(HashMap::new()),
            review_dir,
        })
    }

    /// The per-RID lock guarding `rid`'s ingest critical section,
    /// creating one the first time `rid` is seen.
    async fn rid_lock_for(&self, rid: &Rid) -> Arc<Mutex<()>> {
        self.rid_locks.lock().await.entry(rid.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Append a ledger-only receipt for a document-level dedup decision
    /// that short-circuited before the pipeline ran.
    async fn append_dedup_receipt(
        &self,
        incoming_cid: &Cid,
        matched_cid: &Cid,
        decision: &str,
        similarity: f64,
    ) -> Result<(), RuntimeError> {
        let recipe_hash = format!("dedup:{decision}");
        let receipt = Receipt {
            cat_id: compute_cat_id("deduplicate", incoming_cid, matched_cid, &recipe_hash),
            operation: "deduplicate".to_string(),
            input_cid: incoming_cid.clone(),
            output_cid: matched_cid.clone(),
            recipe_hash,
            created_at: chrono::Utc::now(),
            cost_usd: None,
            model: None,
            metadata: serde_json::json!({ "decision": decision, "similarity": similarity }),
        };
        Ok(self.ledger.append(receipt).await?)
    }

    /// Persist a manual-review record for a `Flag`/`Merge` dedup decision
    /// to `<review_dir>/<subdir>/<incoming_rid>.json`.
    async fn persist_review(
        &self,
        subdir: &str,
        incoming_rid: &Rid,
        matched_rid: &Rid,
        similarity: f64,
    ) -> Result<(), RuntimeError> {
        let dir = self.review_dir.join(subdir);
        tokio::fs::create_dir_all(&dir).await?;
        let file_name = incoming_rid.to_string().replace(':', "_").replace('/', "_");
        let record = ReviewRecord {
            incoming_rid,
            matched_rid,
            similarity,
            decided_at: chrono::Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&record).expect("ReviewRecord always serializes");
        tokio::fs::write(dir.join(format!("{file_name}.json")), bytes).await?;
        Ok(())
    }

    /// Ingest one document. The document's RID is minted deterministically
    /// from `request.source_rid`'s namespace/type and `request.original_id`,
    /// so repeated ingestion of the same source document revises its
    /// existing artifact rather than creating a new one.
    pub async fn ingest(&self, request: IngestRequest) -> Result<PipelineOutcome, RuntimeError> {
        let rid = Rid::mint(
            request.source_rid.namespace(),
            request.source_rid.kind(),
            &request.original_id,
        )
        .map_err(|e| RuntimeError::InvalidIdentifier(e.to_string()))?;
        tracing::debug!(%rid, original_id = %request.original_id, "ingesting document");

        let rid_lock = self.rid_lock_for(&rid).await;
        let _guard = rid_lock.lock().await;

        let normalized = normalize(&request.raw_bytes);
        let content_cid = Cid::hash_bytes(&normalized);
        let shingles = shingle(&String::from_utf8_lossy(&normalized), DOCUMENT_SHINGLE_SIZE);
        let incoming = Candidate {
            rid: rid.clone(),
            cid: content_cid.clone(),
            shingles: shingles.clone(),
            embedding: None,
        };
        let existing_documents = self.query.document_candidates().await;
        let dedup_outcome = self.dedup.evaluate(&content_cid, &incoming, &existing_documents);

        if let Some(outcome) = self.short_circuit_on_dedup(&rid, &content_cid, &dedup_outcome).await? {
            tracing::info!(%rid, status = ?outcome.status, "ingestion short-circuited by document-level dedup");
            return Ok(outcome);
        }

        let candidates = IndexedCandidateSource {
            query: self.query.clone(),
            store: self.store.clone(),
        };
        let document = Document {
            rid: rid.clone(),
            raw_bytes: request.raw_bytes,
            format: request.format,
        };
        let engine = Engine::new(
            self.store.as_ref(),
            self.ledger.as_ref(),
            &self.bus,
            &self.scheduler,
            self.embedder.as_ref(),
            self.enricher.as_ref(),
            self.extractor.as_ref(),
            &self.dedup,
            &candidates,
            self.pipeline_config.clone(),
        );
        let cancellation = CancellationToken::new();
        let mut outcome = engine.run(document, &cancellation).await?;

        if matches!(dedup_outcome, DedupOutcome::Flag { .. }) {
            outcome.status = IngestStatus::Flagged;
        }

        for chunk in &outcome.chunks {
            if let Some(embedding) = &chunk.embedding {
                self.query.index_embedding(chunk.rid.clone(), embedding.clone()).await;
            }
            if !chunk.entities.is_empty() {
                self.query.index_entities(chunk.rid.clone(), chunk.entities.clone()).await;
            }
        }
        self.query.index_document(rid, content_cid, shingles).await;

        tracing::info!(
            rid = %outcome.rid,
            markdown_cid = %outcome.markdown_cid,
            chunks = outcome.chunks.len(),
            status = ?outcome.status,
            "ingestion complete"
        );
        Ok(outcome)
    }

    /// Evaluates `dedup_outcome` and, for `Skip`/`Merge`, returns a
    /// terminal [`PipelineOutcome`] without ever constructing the
    /// pipeline engine. `Flag` persists a review record but lets the
    /// caller continue running the pipeline in full; `ProcessNormal`
    /// does nothing.
    async fn short_circuit_on_dedup(
        &self,
        rid: &Rid,
        content_cid: &Cid,
        dedup_outcome: &DedupOutcome,
    ) -> Result<Option<PipelineOutcome>, RuntimeError> {
        match dedup_outcome {
            DedupOutcome::Skip { matched_rid, similarity } => {
                let matched_cid = self.query.document_cid(matched_rid).await.unwrap_or_else(|| content_cid.clone());
                self.append_dedup_receipt(content_cid, &matched_cid, "skip", *similarity).await?;
                Ok(Some(PipelineOutcome {
                    rid: matched_rid.clone(),
                    markdown_cid: matched_cid,
                    chunks: Vec::new(),
                    status: IngestStatus::Duplicate,
                }))
            }
            DedupOutcome::Merge { matched_rid, similarity } => {
                let matched_cid = self.query.document_cid(matched_rid).await.unwrap_or_else(|| content_cid.clone());
                self.append_dedup_receipt(content_cid, &matched_cid, "merge", *similarity).await?;
                self.persist_review("merged", rid, matched_rid, *similarity).await?;
                Ok(Some(PipelineOutcome {
                    rid: matched_rid.clone(),
                    markdown_cid: matched_cid,
                    chunks: Vec::new(),
                    status: IngestStatus::Merged,
                }))
            }
            DedupOutcome::Flag { matched_rid, similarity } => {
                self.persist_review("flagged", rid, matched_rid, *similarity).await?;
                Ok(None)
            }
            DedupOutcome::ProcessNormal => Ok(None),
        }
    }

    /// The read-side query engine, kept current by every [`ingest`](Self::ingest) call.
    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    /// The underlying artifact store, for callers that need raw
    /// get/resolve access outside of a query.
    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    /// The underlying receipt ledger.
    pub fn ledger(&self) -> &dyn ReceiptLedger {
        self.ledger.as_ref()
    }

    /// The event bus, for subscribing to ingestion notifications.
    pub fn bus(&self) -> &FunBus {
        &self.bus
    }

    /// Resolve `cid`'s full provenance chain, oldest first.
    pub async fn provenance(&self, cid: &Cid) -> Result<Vec<koi_ledger::Receipt>, RuntimeError> {
        Ok(self.ledger.chain_for(cid).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(kind: &str) -> Rid {
        Rid::mint("regen", kind, "placeholder").unwrap()
    }

    async fn test_runtime() -> (Runtime, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(RuntimeConfig::for_testing(dir.path().to_path_buf()))
            .await
            .unwrap();
        (runtime, dir)
    }

    #[tokio::test]
    async fn ingest_produces_queryable_chunks_with_provenance() {
        let (runtime, _dir) = test_runtime().await;
        let outcome = runtime
            .ingest(IngestRequest {
                source_rid: source("raw"),
                original_id: "doc-1".to_string(),
                raw_bytes: b"A reasonably long paragraph about Alice visiting Paris.".to_vec(),
                format: "plain".to_string(),
            })
            .await
            .unwrap();

        assert!(!outcome.chunks.is_empty());
        for chunk in &outcome.chunks {
            let chain = runtime.provenance(&chunk.cid).await.unwrap();
            assert!(!chain.is_empty());
            let entities = runtime.query().entities_of(&chunk.rid).await;
            assert!(!entities.is_empty() || chunk.entities.is_empty());
        }
    }

    #[tokio::test]
    async fn reingesting_identical_content_is_idempotent() {
        let (runtime, _dir) = test_runtime().await;
        let request = || IngestRequest {
            source_rid: source("raw"),
            original_id: "doc-2".to_string(),
            raw_bytes: b"Some stable content about Bob in London.".to_vec(),
            format: "plain".to_string(),
        };

        let first = runtime.ingest(request()).await.unwrap();
        let second = runtime.ingest(request()).await.unwrap();
        assert_eq!(first.rid, second.rid);
        assert_eq!(first.markdown_cid, second.markdown_cid);
    }

    #[tokio::test]
    async fn reingesting_under_same_original_id_revises_the_artifact() {
        let (runtime, _dir) = test_runtime().await;
        let source_rid = source("raw");

        let first = runtime
            .ingest(IngestRequest {
                source_rid: source_rid.clone(),
                original_id: "doc-3".to_string(),
                raw_bytes: b"Original long-enough version of this document.".to_vec(),
                format: "plain".to_string(),
            })
            .await
            .unwrap();

        let second = runtime
            .ingest(IngestRequest {
                source_rid,
                original_id: "doc-3".to_string(),
                raw_bytes: b"Edited long-enough version of this very same document.".to_vec(),
                format: "plain".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(first.rid, second.rid);
        assert_ne!(first.markdown_cid, second.markdown_cid);
        let history = runtime.store().history(&first.rid).await.unwrap();
        assert!(history.len() >= 2);
    }

    #[tokio::test]
    async fn identical_content_under_new_rid_short_circuits_without_pipeline_receipts() {
        let (runtime, _dir) = test_runtime().await;
        let bytes = b"Dana recorded a long observation about the tide pools.".to_vec();

        let first = runtime
            .ingest(IngestRequest {
                source_rid: source("raw"),
                original_id: "doc-5".to_string(),
                raw_bytes: bytes.clone(),
                format: "plain".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(first.status, IngestStatus::New);

        let second = runtime
            .ingest(IngestRequest {
                source_rid: source("raw"),
                original_id: "doc-6".to_string(),
                raw_bytes: bytes,
                format: "plain".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(second.status, IngestStatus::Duplicate);
        assert_eq!(second.rid, first.rid);
        assert_eq!(second.markdown_cid, first.markdown_cid);
        assert!(second.chunks.is_empty());
    }

    #[tokio::test]
    async fn near_duplicate_document_merges_and_writes_review_record() {
        let (runtime, dir) = test_runtime().await;
        let text_a = b"alpha bravo charlie delta echo foxtrot golf hotel india juliett kilo lima mike november oscar papa quebec romeo sierra tango".to_vec();
        let text_b = b"alpha bravo charlie delta echo foxtrot golf hotel india juliett kilo lima mike november oscar papa quebec romeo sierra uniform".to_vec();

        let first = runtime
            .ingest(IngestRequest {
                source_rid: source("raw"),
                original_id: "doc-7".to_string(),
                raw_bytes: text_a,
                format: "plain".to_string(),
            })
            .await
            .unwrap();

        let second = runtime
            .ingest(IngestRequest {
                source_rid: source("raw"),
                original_id: "doc-8".to_string(),
                raw_bytes: text_b,
                format: "plain".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(second.status, IngestStatus::Merged);
        assert_eq!(second.rid, first.rid);
        assert!(second.chunks.is_empty());

        let merged_dir = dir.path().join("review").join("merged");
        let entries: Vec<_> = std::fs::read_dir(&merged_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn search_finds_ingested_chunks() {
        let (runtime, _dir) = test_runtime().await;
        let outcome = runtime
            .ingest(IngestRequest {
                source_rid: source("raw"),
                original_id: "doc-4".to_string(),
                raw_bytes: b"Carol wrote a long note about gardening in spring.".to_vec(),
                format: "plain".to_string(),
            })
            .await
            .unwrap();
        let chunk = &outcome.chunks[0];
        let embedding = chunk.embedding.clone().unwrap();

        let hits = runtime.query().search(&embedding, 1).await;
        assert_eq!(hits[0].rid, chunk.rid);
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-pipeline** - the seven-stage ingestion pipeline.
//!
//! Every ingested document passes through Normalize, Markdown, Chunk,
//! Enrich, Embed, ExtractEntities and Deduplicate, in that fixed order.
//! Each stage is atomic: hash the input, run the transform, hash the
//! output, write the output bytes, upsert the artifact index, and append
//! a transformation receipt - all four writes commit together or the
//! stage is considered not to have run. Enrich and ExtractEntities are
//! optional/paid; they are skipped when disabled by configuration or by
//! the scheduler's content-classification heuristic, and their receipts
//! record cost. A stage that is skipped - for budget, configuration or
//! content-heuristic reasons - still appends a receipt, with
//! `operation = "skip"`, so the ledger always reflects what ran.
//!
//! Document-level deduplication - deciding whether a whole incoming
//! document is a duplicate before any of this runs at all - is the
//! caller's job, not this crate's; see `koi-runtime::Runtime::ingest`.
//! The `Deduplicate` stage here operates per chunk, against the corpus
//! of chunks already embedded, which is a narrower and later-running
//! check than that document-level gate.

use async_trait::async_trait;
use chrono::Utc;
use koi_bus::{FunBus, FunKind};
use koi_dedup::{Candidate, DedupEngine, DedupOutcome};
use koi_identity::{Cid, Rid};
use koi_ledger::{compute_cat_id, Receipt, ReceiptLedger};
use koi_model_gateway::{EmbeddingModel, EntityExtractionModel, EnrichmentModel};
use koi_scheduler::{should_skip_for_content, Scheduler, SchedulerError};
use koi_store_core::{ArtifactStore, StorageError};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The seven fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Whitespace/encoding normalization of the raw ingested bytes.
    Normalize,
    /// Conversion of normalized content to Markdown.
    Markdown,
    /// Splitting Markdown content into bounded chunks.
    Chunk,
    /// Optional/paid: model-based cleanup and summarization of a chunk.
    Enrich,
    /// Dense vector embedding of a chunk.
    Embed,
    /// Optional/paid: named-entity recognition against an ontology.
    ExtractEntities,
    /// Exact/approximate duplicate detection against existing content.
    Deduplicate,
}

impl Stage {
    /// The operation name recorded on this stage's receipts.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Markdown => "markdown",
            Stage::Chunk => "chunk",
            Stage::Enrich => "enrich",
            Stage::Embed => "embed",
            Stage::ExtractEntities => "extract-entities",
            Stage::Deduplicate => "deduplicate",
        }
    }

    /// Whether this stage may be skipped (disabled by configuration, or
    /// by the scheduler's content heuristic).
    pub fn is_optional(&self) -> bool {
        matches!(self, Stage::Enrich | Stage::ExtractEntities)
    }
}

/// A document submitted for ingestion.
#[derive(Debug, Clone)]
pub struct Document {
    /// The resource identifier this document's content resolves under.
    pub rid: Rid,
    /// Raw bytes as received.
    pub raw_bytes: Vec<u8>,
    /// Source format hint (`html`, `plain`, `markdown`, ...).
    pub format: String,
}

/// Per-chunk outcome of the pipeline.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    /// The chunk's own resource identifier.
    pub rid: Rid,
    /// The chunk's final content hash (post-enrich if enrichment ran,
    /// otherwise the raw chunk's hash).
    pub cid: Cid,
    /// The chunk's embedding, if the Embed stage ran.
    pub embedding: Option<Vec<f32>>,
    /// Entities recognized in the chunk, if ExtractEntities ran.
    pub entities: Vec<koi_model_gateway::ExtractedEntity>,
    /// The deduplication decision reached for this chunk.
    pub dedup_outcome: DedupOutcome,
}

/// Where an ingested document landed relative to content already seen.
/// Mirrors the external ingestion contract so a caller can tell a
/// freshly processed document apart from one that resolved to existing
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    /// No similar content existed; the document was processed in full.
    New,
    /// An exact or near-exact duplicate already existed; the pipeline
    /// never ran and only a dedup receipt was appended.
    Duplicate,
    /// Similar enough to an existing artifact to merge into its lineage;
    /// the pipeline never ran.
    Merged,
    /// Processed in full but flagged for manual review as a possible
    /// duplicate of existing content.
    Flagged,
    /// The document could not be ingested.
    Failed,
}

/// Result of running the full pipeline over one document.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// The document's own RID (after Normalize/Markdown have updated its
    /// current CID).
    pub rid: Rid,
    /// The document's CID after Markdown conversion, before chunking.
    pub markdown_cid: Cid,
    /// Results for each chunk that was not skipped by deduplication.
    /// Empty when `status` is `Duplicate` or `Merged`, since the
    /// pipeline never ran for those outcomes.
    pub chunks: Vec<ChunkResult>,
    /// Where this document landed relative to existing content.
    pub status: IngestStatus,
}

/// Errors raised while running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// An artifact store operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// A ledger append failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] koi_ledger::LedgerError),
    /// A paid model call failed.
    #[error("model error: {0}")]
    Model(#[from] koi_model_gateway::ModelError),
    /// The scheduler rejected a paid call on budget grounds. Only
    /// reachable where budget exhaustion has nowhere left to downgrade
    /// to a skip - the per-chunk paid stages catch this variant
    /// themselves and append a skip receipt instead of propagating it.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] koi_scheduler::SchedulerError),
    /// The document had no content left after normalization (e.g. an
    /// all-whitespace input).
    #[error("document has no content to ingest")]
    EmptyDocument,
    /// The ingestion was cancelled before this stage could run.
    #[error("ingestion cancelled")]
    Cancelled,
}

/// Supplies duplicate candidates to compare an incoming chunk against.
/// Implemented by the runtime crate, which has read access to prior
/// artifacts; kept as a trait here so this crate does not depend on a
/// query engine.
#[async_trait]
pub trait DuplicateCandidateSource: Send + Sync {
    /// Candidates to compare a chunk of `rid`'s sibling content against.
    async fn candidates_for(&self, rid: &Rid) -> Vec<Candidate>;
}

/// A source that never finds any candidates; every chunk processes as
/// new. Useful for callers that have not wired up a query engine yet.
pub struct NoCandidates;

#[async_trait]
impl DuplicateCandidateSource for NoCandidates {
    async fn candidates_for(&self, _rid: &Rid) -> Vec<Candidate> {
        Vec::new()
    }
}

/// Configuration toggles for optional stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target number of whitespace-delimited tokens per chunk.
    pub chunk_target_tokens: usize,
    /// Number of tokens consecutive chunks overlap by.
    pub chunk_overlap_tokens: usize,
    /// Whether the Enrich stage is enabled at all.
    pub enrich_enabled: bool,
    /// Whether the ExtractEntities stage is enabled at all.
    pub extract_entities_enabled: bool,
    /// Minimum character count below which paid stages are skipped by
    /// the content-classification heuristic.
    pub min_chars_for_paid_stages: usize,
    /// The ontology artifact entity extraction is run against.
    pub ontology_cid: Cid,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_target_tokens: 500,
            chunk_overlap_tokens: 100,
            enrich_enabled: true,
            extract_entities_enabled: true,
            min_chars_for_paid_stages: 20,
            ontology_cid: Cid::sentinel(),
        }
    }
}

/// Runs the fixed seven-stage pipeline over ingested documents.
pub struct Engine<'a> {
    store: &'a dyn ArtifactStore,
    ledger: &'a dyn ReceiptLedger,
    bus: &'a FunBus,
    scheduler: &'a Scheduler,
    embedder: &'a dyn EmbeddingModel,
    enricher: &'a dyn EnrichmentModel,
    extractor: &'a dyn EntityExtractionModel,
    dedup: &'a DedupEngine,
    candidates: &'a dyn DuplicateCandidateSource,
    config: PipelineConfig,
}

impl<'a> Engine<'a> {
    /// Build an engine wired to the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a dyn ArtifactStore,
        ledger: &'a dyn ReceiptLedger,
        bus: &'a FunBus,
        scheduler: &'a Scheduler,
        embedder: &'a dyn EmbeddingModel,
        enricher: &'a dyn EnrichmentModel,
        extractor: &'a dyn EntityExtractionModel,
        dedup: &'a DedupEngine,
        candidates: &'a dyn DuplicateCandidateSource,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            bus,
            scheduler,
            embedder,
            enricher,
            extractor,
            dedup,
            candidates,
            config,
        }
    }

    /// Run all seven stages over `document`. `cancellation` is checked
    /// between stages and between chunks; a caller that cancels it stops
    /// this run at the next checkpoint instead of mid-write.
    pub async fn run(
        &self,
        document: Document,
        cancellation: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        if cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let raw_cid = self.store.put_bytes(&document.raw_bytes).await?;
        self.store
            .upsert_artifact(&document.rid, &raw_cid, &document.format, "raw", json!({}))
            .await?;

        let normalized_bytes = normalize(&document.raw_bytes);
        if normalized_bytes.is_empty() {
            return Err(PipelineError::EmptyDocument);
        }
        let normalized_cid = self
            .run_pure_stage(Stage::Normalize, &document.rid, &raw_cid, &normalized_bytes)
            .await?;

        if cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let markdown_bytes = to_markdown(&normalized_bytes, &document.format);
        let markdown_cid = self
            .run_pure_stage(Stage::Markdown, &document.rid, &normalized_cid, &markdown_bytes)
            .await?;

        self.bus
            .publish(FunKind::New, document.rid.clone(), Some(markdown_cid.clone()))
            .await;

        let spans = chunk(&markdown_bytes, self.config.chunk_target_tokens, self.config.chunk_overlap_tokens);
        let mut chunks = Vec::with_capacity(spans.len());

        for (index, span) in spans.into_iter().enumerate() {
            if cancellation.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let chunk_rid = Rid::mint(
                document.rid.namespace(),
                "chunk",
                &format!("{}/{}", document.rid.id(), index),
            )
            .expect("chunk index suffix is always a valid RID id");

            let result = self.run_chunk(&chunk_rid, &markdown_cid, span).await?;
            chunks.push(result);
        }

        info!(rid = %document.rid, chunks = chunks.len(), "document ingested");

        Ok(PipelineOutcome {
            rid: document.rid,
            markdown_cid,
            chunks,
            status: IngestStatus::New,
        })
    }

    async fn run_chunk(
        &self,
        chunk_rid: &Rid,
        parent_cid: &Cid,
        span: ChunkSpan,
    ) -> Result<ChunkResult, PipelineError> {
        let chunk_bytes = span.text.clone().into_bytes();
        let chunk_cid = self.store.put_bytes(&chunk_bytes).await?;
        let offsets = json!({ "start_token": span.start_token, "end_token": span.end_token });
        self.store
            .upsert_artifact(chunk_rid, &chunk_cid, "text/markdown", Stage::Chunk.name(), offsets.clone())
            .await?;
        self.append_receipt(Stage::Chunk, parent_cid, &chunk_cid, None, None, offsets)
            .await?;

        let chunk_text = span.text;
        let skip_paid = should_skip_for_content(&chunk_text, self.config.min_chars_for_paid_stages);

        let mut current_cid = chunk_cid.clone();
        let mut current_text = chunk_text.clone();

        if self.config.enrich_enabled && !skip_paid {
            let slot = self.scheduler.acquire().await;
            match self.scheduler.check_budget("enrich", 0.01).await {
                Ok(()) => {
                    let output = self.enricher.enrich(&current_text).await?;
                    self.scheduler.record_spend("enrich", output.cost_usd).await;
                    drop(slot);

                    let enriched_bytes = output.value.clone().into_bytes();
                    let enriched_cid = self.store.put_bytes(&enriched_bytes).await?;
                    self.store
                        .upsert_artifact(chunk_rid, &enriched_cid, "text/markdown", Stage::Enrich.name(), json!({}))
                        .await?;
                    self.append_receipt(
                        Stage::Enrich,
                        &current_cid,
                        &enriched_cid,
                        Some(output.cost_usd),
                        Some(output.model),
                        json!({}),
                    )
                    .await?;
                    current_cid = enriched_cid;
                    current_text = output.value;
                }
                Err(SchedulerError::BudgetExceeded { .. }) => {
                    drop(slot);
                    warn!(rid = %chunk_rid, "skipping enrich: budget exceeded");
                    self.append_skip_receipt(Stage::Enrich, &current_cid, "budget").await?;
                }
            }
        } else {
            warn!(rid = %chunk_rid, "skipping enrich: disabled or content heuristic");
            self.append_skip_receipt(Stage::Enrich, &current_cid, "disabled-or-content-heuristic")
                .await?;
        }

        let embed_slot = self.scheduler.acquire().await;
        let embed_output = self.embedder.embed(&current_text).await?;
        self.scheduler.record_spend("embed", embed_output.cost_usd).await;
        drop(embed_slot);

        let embedding_bytes = serde_json::to_vec(&embed_output.value)
            .expect("Vec<f32> always serializes");
        let embedding_cid = self.store.put_bytes(&embedding_bytes).await?;
        self.append_receipt(
            Stage::Embed,
            &current_cid,
            &embedding_cid,
            Some(embed_output.cost_usd),
            Some(embed_output.model),
            json!({}),
        )
        .await?;

        let mut entities = Vec::new();
        if self.config.extract_entities_enabled && !skip_paid {
            let slot = self.scheduler.acquire().await;
            match self.scheduler.check_budget("extract-entities", 0.01).await {
                Ok(()) => {
                    let output = self
                        .extractor
                        .extract_entities(&current_text, &self.config.ontology_cid)
                        .await?;
                    self.scheduler.record_spend("extract-entities", output.cost_usd).await;
                    drop(slot);

                    let entities_bytes =
                        serde_json::to_vec(&output.value).expect("entities always serialize");
                    let entities_cid = self.store.put_bytes(&entities_bytes).await?;
                    self.append_receipt(
                        Stage::ExtractEntities,
                        &current_cid,
                        &entities_cid,
                        Some(output.cost_usd),
                        Some(output.model),
                        json!({}),
                    )
                    .await?;
                    entities = output.value;
                }
                Err(SchedulerError::BudgetExceeded { .. }) => {
                    drop(slot);
                    warn!(rid = %chunk_rid, "skipping extract-entities: budget exceeded");
                    self.append_skip_receipt(Stage::ExtractEntities, &current_cid, "budget")
                        .await?;
                }
            }
        } else {
            self.append_skip_receipt(Stage::ExtractEntities, &current_cid, "disabled-or-content-heuristic")
                .await?;
        }

        let candidates = self.candidates.candidates_for(chunk_rid).await;
        let incoming = Candidate {
            rid: chunk_rid.clone(),
            cid: current_cid.clone(),
            shingles: koi_dedup::shingle(&current_text, 3),
            embedding: Some(embed_output.value.clone()),
        };
        let dedup_outcome = self.dedup.evaluate(&current_cid, &incoming, &candidates);
        self.append_receipt(Stage::Deduplicate, &current_cid, &current_cid, None, None, json!({}))
            .await?;

        if !matches!(dedup_outcome, DedupOutcome::Skip { .. }) {
            self.store
                .upsert_artifact(chunk_rid, &current_cid, "text/markdown", Stage::Deduplicate.name(), json!({}))
                .await?;
            self.bus
                .publish(FunKind::New, chunk_rid.clone(), Some(current_cid.clone()))
                .await;
        }

        Ok(ChunkResult {
            rid: chunk_rid.clone(),
            cid: current_cid,
            embedding: Some(embed_output.value),
            entities,
            dedup_outcome,
        })
    }

    async fn run_pure_stage(
        &self,
        stage: Stage,
        rid: &Rid,
        input_cid: &Cid,
        output_bytes: &[u8],
    ) -> Result<Cid, PipelineError> {
        let output_cid = self.store.put_bytes(output_bytes).await?;
        self.store
            .upsert_artifact(rid, &output_cid, "text/plain", stage.name(), json!({}))
            .await?;
        self.append_receipt(stage, input_cid, &output_cid, None, None, json!({})).await?;
        Ok(output_cid)
    }

    async fn append_receipt(
        &self,
        stage: Stage,
        input_cid: &Cid,
        output_cid: &Cid,
        cost_usd: Option<f64>,
        model: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<(), PipelineError> {
        let recipe_hash = "v1".to_string();
        let receipt = Receipt {
            cat_id: compute_cat_id(stage.name(), input_cid, output_cid, &recipe_hash),
            operation: stage.name().to_string(),
            input_cid: input_cid.clone(),
            output_cid: output_cid.clone(),
            recipe_hash,
            created_at: Utc::now(),
            cost_usd,
            model,
            metadata,
        };
        self.ledger.append(receipt).await?;
        Ok(())
    }

    /// Append a `skip` receipt recording that `stage` did not run for
    /// `cid`, and why. Does not change `cid` - a skipped stage leaves a
    /// chunk's content hash exactly as it was.
    async fn append_skip_receipt(&self, stage: Stage, cid: &Cid, reason: &str) -> Result<(), PipelineError> {
        let recipe_hash = format!("skip:{reason}");
        let receipt = Receipt {
            cat_id: compute_cat_id("skip", cid, cid, &recipe_hash),
            operation: "skip".to_string(),
            input_cid: cid.clone(),
            output_cid: cid.clone(),
            recipe_hash,
            created_at: Utc::now(),
            cost_usd: None,
            model: None,
            metadata: json!({ "stage": stage.name(), "reason": reason }),
        };
        self.ledger.append(receipt).await?;
        Ok(())
    }
}

/// Normalize raw bytes: decode as UTF-8 (lossily), unify line endings to
/// `\n`, collapse runs of blank lines, and trim the result.
pub fn normalize(raw: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0;
    for line in unified.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().as_bytes().to_vec()
}

/// Convert normalized content to Markdown. Content already in Markdown
/// or plain text passes through unchanged; anything else is wrapped as
/// a fenced code block so no information is lost even without a real
/// format-specific converter.
pub fn to_markdown(normalized: &[u8], format_hint: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(normalized);
    match format_hint {
        "markdown" | "plain" | "text/markdown" | "text/plain" => text.into_owned().into_bytes(),
        other => format!("```{other}\n{text}\n```").into_bytes(),
    }
}

/// One chunk of Markdown text together with its token offsets into the
/// source artifact, for provenance metadata and for re-assembling the
/// original document from its chunks.
#[derive(Debug, Clone)]
pub struct ChunkSpan {
    /// The chunk's text.
    pub text: String,
    /// Index (inclusive) of this chunk's first whitespace-delimited
    /// token in the source text.
    pub start_token: usize,
    /// Index (exclusive), one past this chunk's last token in the
    /// source text.
    pub end_token: usize,
}

/// Split Markdown text into a token-based sliding window: each chunk
/// targets `target_tokens` whitespace-delimited tokens, and consecutive
/// chunks overlap by `overlap_tokens` so content near a chunk boundary
/// still appears whole in at least one chunk. A chunk boundary that
/// would fall in the middle of a run of capitalized words - the
/// cheapest available proxy for a multi-word entity mention, e.g. "New
/// York City" - is pushed forward to the end of that run instead.
pub fn chunk(markdown: &[u8], target_tokens: usize, overlap_tokens: usize) -> Vec<ChunkSpan> {
    let text = String::from_utf8_lossy(markdown).into_owned();
    let tokens = token_offsets(&text);

    if tokens.is_empty() {
        return vec![ChunkSpan {
            text: text.trim().to_string(),
            start_token: 0,
            end_token: 0,
        }];
    }

    let target_tokens = target_tokens.max(1);
    let step = target_tokens.saturating_sub(overlap_tokens).max(1);

    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let mut end = (start + target_tokens).min(tokens.len());
        end = extend_past_capitalized_run(&text, &tokens, end);
        let (start_byte, _) = tokens[start];
        let (_, end_byte) = tokens[end - 1];
        spans.push(ChunkSpan {
            text: text[start_byte..end_byte].to_string(),
            start_token: start,
            end_token: end,
        });
        if end >= tokens.len() {
            break;
        }
        start += step;
    }
    spans
}

/// Byte `(start, end)` of every whitespace-delimited token in `text`.
fn token_offsets(text: &str) -> Vec<(usize, usize)> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push((s, text.len()));
    }
    tokens
}

/// If the token just before `end` and the token at `end` are both
/// capitalized, extend `end` forward past the rest of that capitalized
/// run, so the chunk boundary never lands inside it.
fn extend_past_capitalized_run(text: &str, tokens: &[(usize, usize)], mut end: usize) -> usize {
    let is_capitalized = |i: usize| -> bool {
        tokens
            .get(i)
            .and_then(|&(s, e)| text[s..e].chars().next())
            .map(|c| c.is_uppercase())
            .unwrap_or(false)
    };
    if end == 0 || end >= tokens.len() {
        return end;
    }
    if is_capitalized(end - 1) && is_capitalized(end) {
        while end < tokens.len() && is_capitalized(end) {
            end += 1;
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use koi_dedup::DedupThresholds;
    use koi_ledger::SqliteReceiptLedger;
    use koi_model_gateway::deterministic::{DeterministicEmbedder, DeterministicEnricher, DeterministicExtractor};
    use koi_store_memory::MemoryArtifactStore;
    use std::collections::HashMap;

    #[test]
    fn normalize_collapses_blank_runs_and_trims() {
        let input = b"  line one\r\n\r\n\r\n\r\nline two  \n";
        let out = String::from_utf8(normalize(input)).unwrap();
        assert_eq!(out, "line one\n\nline two");
    }

    #[test]
    fn to_markdown_wraps_unknown_formats_as_code_fence() {
        let out = String::from_utf8(to_markdown(b"fn main() {}", "rust")).unwrap();
        assert_eq!(out, "```rust\nfn main() {}\n```");
    }

    #[test]
    fn to_markdown_passes_through_plain_text() {
        let out = String::from_utf8(to_markdown(b"hello", "plain")).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn chunk_produces_overlapping_token_windows() {
        let text = (1..=25).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let spans = chunk(text.as_bytes(), 10, 3);
        assert!(spans.len() >= 3);
        assert_eq!(spans[0].start_token, 0);
        assert_eq!(spans[0].end_token, 10);
        assert_eq!(spans[1].start_token, 7);
    }

    #[test]
    fn chunk_never_drops_content() {
        let markdown = "alpha beta gamma delta epsilon zeta eta theta iota";
        let spans = chunk(markdown.as_bytes(), 4, 1);
        let rejoined: String = spans.iter().map(|s| s.text.clone()).collect::<Vec<_>>().join(" ");
        for word in ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta", "iota"] {
            assert!(rejoined.contains(word));
        }
    }

    #[test]
    fn chunk_respects_entity_mention_boundaries() {
        let text = "A note about New York City and its long history of trade.";
        let spans = chunk(text.as_bytes(), 5, 0);
        for span in &spans {
            if span.text.contains("New") {
                assert!(span.text.contains("York") && span.text.contains("City"));
            }
        }
    }

    #[test]
    fn chunk_of_empty_text_returns_single_empty_span() {
        let spans = chunk(b"   \n  ", 10, 2);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start_token, 0);
        assert_eq!(spans[0].end_token, 0);
    }

    async fn test_engine_run(document: Document, config: PipelineConfig) -> PipelineOutcome {
        let store = MemoryArtifactStore::new();
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();
        let bus = FunBus::new(64);
        let scheduler = Scheduler::new(4, HashMap::new());
        let embedder = DeterministicEmbedder::new(8);
        let enricher = DeterministicEnricher;
        let extractor = DeterministicExtractor;
        let dedup = DedupEngine::new(DedupThresholds::default());
        let candidates = NoCandidates;

        let engine = Engine::new(
            &store, &ledger, &bus, &scheduler, &embedder, &enricher, &extractor, &dedup, &candidates, config,
        );
        engine.run(document, &CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn full_pipeline_produces_chunk_results_with_embeddings() {
        let document = Document {
            rid: Rid::mint("regen", "raw", "doc-1").unwrap(),
            raw_bytes: b"This is a reasonably long sentence about Alice and Paris.\n\nAnother paragraph about Bob."
                .to_vec(),
            format: "plain".to_string(),
        };
        let outcome = test_engine_run(document, PipelineConfig::default()).await;
        assert_eq!(outcome.status, IngestStatus::New);
        assert!(!outcome.chunks.is_empty());
        for chunk_result in &outcome.chunks {
            assert!(chunk_result.embedding.is_some());
            assert_eq!(chunk_result.dedup_outcome, DedupOutcome::ProcessNormal);
        }
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let document = Document {
            rid: Rid::mint("regen", "raw", "doc-empty").unwrap(),
            raw_bytes: b"   \n\n  \r\n ".to_vec(),
            format: "plain".to_string(),
        };
        let store = MemoryArtifactStore::new();
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();
        let bus = FunBus::new(64);
        let scheduler = Scheduler::new(4, HashMap::new());
        let embedder = DeterministicEmbedder::new(8);
        let enricher = DeterministicEnricher;
        let extractor = DeterministicExtractor;
        let dedup = DedupEngine::new(DedupThresholds::default());
        let candidates = NoCandidates;
        let engine = Engine::new(
            &store, &ledger, &bus, &scheduler, &embedder, &enricher, &extractor, &dedup, &candidates,
            PipelineConfig::default(),
        );

        let result = engine.run(document, &CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::EmptyDocument)));
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_run_before_any_writes() {
        let document = Document {
            rid: Rid::mint("regen", "raw", "doc-cancelled").unwrap(),
            raw_bytes: b"Some content that would otherwise ingest fine.".to_vec(),
            format: "plain".to_string(),
        };
        let store = MemoryArtifactStore::new();
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();
        let bus = FunBus::new(64);
        let scheduler = Scheduler::new(4, HashMap::new());
        let embedder = DeterministicEmbedder::new(8);
        let enricher = DeterministicEnricher;
        let extractor = DeterministicExtractor;
        let dedup = DedupEngine::new(DedupThresholds::default());
        let candidates = NoCandidates;
        let engine = Engine::new(
            &store, &ledger, &bus, &scheduler, &embedder, &enricher, &extractor, &dedup, &candidates,
            PipelineConfig::default(),
        );

        let token = CancellationToken::new();
        token.cancel();
        let result = engine.run(document, &token).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn disabling_optional_stages_skips_their_receipts() {
        let document = Document {
            rid: Rid::mint("regen", "raw", "doc-2").unwrap(),
            raw_bytes: b"Short text about Carol.".to_vec(),
            format: "plain".to_string(),
        };
        let mut config = PipelineConfig::default();
        config.enrich_enabled = false;
        config.extract_entities_enabled = false;

        let outcome = test_engine_run(document, config).await;
        for chunk_result in &outcome.chunks {
            assert!(chunk_result.entities.is_empty());
        }
    }
}

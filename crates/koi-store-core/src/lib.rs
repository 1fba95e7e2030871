#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-store-core** - content-addressed artifact store abstractions.
//!
//! This crate defines the [`ArtifactStore`] trait that every storage driver
//! (in-memory, SQLite) implements. It owns the `Artifact` shape and the
//! `StorageError` taxonomy; it does not itself store anything.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use koi_identity::{Cid, Rid};
use serde::{Deserialize, Serialize};

/// A stored content version identified by an RID and a CID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Semantic identifier this artifact is the current content of.
    pub rid: Rid,
    /// Content hash of `rid`'s current bytes.
    pub cid: Cid,
    /// MIME-ish content format, e.g. `text/markdown`.
    pub format: String,
    /// Pipeline stage that produced this artifact, e.g. `markdown`.
    pub stage: String,
    /// Byte length of the content at `cid`.
    pub size: u64,
    /// When this artifact row was first created.
    pub created_at: DateTime<Utc>,
    /// Start of this revision's validity.
    pub valid_from: DateTime<Utc>,
    /// End of this revision's validity; `None` marks the current revision.
    pub valid_to: Option<DateTime<Utc>>,
    /// Stage-specific metadata (chunk offsets, model ids, ...).
    pub metadata: serde_json::Value,
}

/// One row of an RID's content history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRevision {
    /// Content hash in effect during `[valid_from, valid_to)`.
    pub cid: Cid,
    /// Start of this revision's validity.
    pub valid_from: DateTime<Utc>,
    /// End of this revision's validity; `None` means still current.
    pub valid_to: Option<DateTime<Utc>>,
}

/// Either side of `resolve(rid or cid)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    /// Resolve by resource identifier (returns the current revision).
    Rid(Rid),
    /// Resolve by content identifier (returns the artifact row holding it,
    /// if more than one RID maps to the same bytes the first one written).
    Cid(Cid),
}

/// Outcome of [`ArtifactStore::upsert_artifact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row existed for this RID before; one was created.
    Created,
    /// A row existed with a different CID; the old row was closed and a
    /// new current row inserted.
    Revised,
    /// The existing current row already had this exact CID; no write.
    Unchanged,
}

/// Errors raised by an [`ArtifactStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be reached; callers may retry.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),
    /// The store's own invariants are violated (bytes missing for a
    /// referenced CID, duplicate CID with different bytes, ...). Fatal.
    #[error("storage integrity violation: {0}")]
    IntegrityViolation(String),
}

/// Durable content-addressed storage plus an RID→CID index with history.
///
/// Implementations own byte storage exclusively; nothing else in this
/// codebase writes artifact bytes directly.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under their CID. Idempotent: if the CID already
    /// exists, returns it without rewriting.
    async fn put_bytes(&self, bytes: &[u8]) -> Result<Cid, StorageError>;

    /// Fetch the bytes for `cid`, if present.
    async fn get_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StorageError>;

    /// Point `rid` at `cid`. If `rid`'s current CID already equals `cid`,
    /// this is a no-op (`Unchanged`); otherwise the prior current row (if
    /// any) is closed and a new one inserted, atomically.
    async fn upsert_artifact(
        &self,
        rid: &Rid,
        cid: &Cid,
        format: &str,
        stage: &str,
        metadata: serde_json::Value,
    ) -> Result<UpsertOutcome, StorageError>;

    /// The CID `rid` currently resolves to, if it has ever been written.
    async fn current_cid(&self, rid: &Rid) -> Result<Option<Cid>, StorageError>;

    /// `rid`'s full content history, oldest first.
    async fn history(&self, rid: &Rid) -> Result<Vec<ArtifactRevision>, StorageError>;

    /// Resolve an RID (current revision) or a CID (any artifact row
    /// holding it) to its full [`Artifact`] record.
    async fn resolve(&self, reference: &ArtifactRef) -> Result<Option<Artifact>, StorageError>;
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-store-memory** - in-memory [`ArtifactStore`] driver.
//!
//! Fast, non-persistent backend suitable for tests and development. All
//! data is lost when the process terminates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use koi_identity::{Cid, Rid};
use koi_store_core::{Artifact, ArtifactRef, ArtifactRevision, ArtifactStore, StorageError, UpsertOutcome};
use tokio::sync::RwLock;

/// An in-memory, non-persistent artifact store.
///
/// Byte storage is deduplicated by CID; the RID index keeps every
/// historical revision, with the last entry for a given RID always being
/// its current one.
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    bytes: Arc<RwLock<HashMap<Cid, Vec<u8>>>>,
    rid_history: Arc<RwLock<HashMap<Rid, Vec<Artifact>>>>,
    cid_first_rid: Arc<RwLock<HashMap<Cid, Rid>>>,
}

impl MemoryArtifactStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct byte payloads stored.
    pub async fn payload_count(&self) -> usize {
        self.bytes.read().await.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put_bytes(&self, bytes: &[u8]) -> Result<Cid, StorageError> {
        let cid = Cid::hash_bytes(bytes);
        self.bytes
            .write()
            .await
            .entry(cid.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(cid)
    }

    async fn get_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.bytes.read().await.get(cid).cloned())
    }

    async fn upsert_artifact(
        &self,
        rid: &Rid,
        cid: &Cid,
        format: &str,
        stage: &str,
        metadata: serde_json::Value,
    ) -> Result<UpsertOutcome, StorageError> {
        let size = self
            .bytes
            .read()
            .await
            .get(cid)
            .map(|b| b.len() as u64)
            .unwrap_or(0);

        let mut history = self.rid_history.write().await;
        let now = Utc::now();
        let entries = history.entry(rid.clone()).or_default();

        if let Some(current) = entries.last() {
            if current.valid_to.is_none() && &current.cid == cid {
                return Ok(UpsertOutcome::Unchanged);
            }
        }
        let outcome = if entries.is_empty() {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Revised
        };
        if let Some(last) = entries.last_mut() {
            if last.valid_to.is_none() {
                last.valid_to = Some(now);
            }
        }
        let created_at = entries.first().map(|a| a.created_at).unwrap_or(now);
        entries.push(Artifact {
            rid: rid.clone(),
            cid: cid.clone(),
            format: format.to_string(),
            stage: stage.to_string(),
            size,
            created_at,
            valid_from: now,
            valid_to: None,
            metadata,
        });
        drop(history);

        self.cid_first_rid
            .write()
            .await
            .entry(cid.clone())
            .or_insert_with(|| rid.clone());

        Ok(outcome)
    }

    async fn current_cid(&self, rid: &Rid) -> Result<Option<Cid>, StorageError> {
        Ok(self
            .rid_history
            .read()
            .await
            .get(rid)
            .and_then(|entries| entries.last())
            .map(|a| a.cid.clone()))
    }

    async fn history(&self, rid: &Rid) -> Result<Vec<ArtifactRevision>, StorageError> {
        Ok(self
            .rid_history
            .read()
            .await
            .get(rid)
            .map(|entries| {
                entries
                    .iter()
                    .map(|a| ArtifactRevision {
                        cid: a.cid.clone(),
                        valid_from: a.valid_from,
                        valid_to: a.valid_to,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn resolve(&self, reference: &ArtifactRef) -> Result<Option<Artifact>, StorageError> {
        match reference {
            ArtifactRef::Rid(rid) => Ok(self
                .rid_history
                .read()
                .await
                .get(rid)
                .and_then(|entries| entries.last().cloned())),
            ArtifactRef::Cid(cid) => {
                let rid = match self.cid_first_rid.read().await.get(cid).cloned() {
                    Some(rid) => rid,
                    None => return Ok(None),
                };
                Ok(self
                    .rid_history
                    .read()
                    .await
                    .get(&rid)
                    .and_then(|entries| entries.iter().find(|a| &a.cid == cid).cloned()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rid(id: &str) -> Rid {
        Rid::mint("regen", "raw", id).unwrap()
    }

    #[tokio::test]
    async fn put_bytes_is_idempotent() {
        let store = MemoryArtifactStore::new();
        let a = store.put_bytes(b"hello").await.unwrap();
        let b = store.put_bytes(b"hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.payload_count().await, 1);
    }

    #[tokio::test]
    async fn missing_bytes_and_rid_return_none() {
        let store = MemoryArtifactStore::new();
        assert!(store
            .get_bytes(&Cid::hash_bytes(b"nope"))
            .await
            .unwrap()
            .is_none());
        assert!(store.current_cid(&rid("x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_upsert_is_created_second_identical_is_unchanged() {
        let store = MemoryArtifactStore::new();
        let cid = store.put_bytes(b"content").await.unwrap();
        let r = rid("pageA");

        let first = store
            .upsert_artifact(&r, &cid, "text/plain", "raw", json!({}))
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Created);

        let second = store
            .upsert_artifact(&r, &cid, "text/plain", "raw", json!({}))
            .await
            .unwrap();
        assert_eq!(second, UpsertOutcome::Unchanged);

        assert_eq!(store.history(&r).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revision_closes_prior_row() {
        let store = MemoryArtifactStore::new();
        let r = rid("pageA");
        let cid1 = store.put_bytes(b"v1").await.unwrap();
        let cid2 = store.put_bytes(b"v2").await.unwrap();

        store
            .upsert_artifact(&r, &cid1, "text/plain", "raw", json!({}))
            .await
            .unwrap();
        let outcome = store
            .upsert_artifact(&r, &cid2, "text/plain", "raw", json!({}))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Revised);

        let history = store.history(&r).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].valid_to.is_some());
        assert!(history[1].valid_to.is_none());
        assert_eq!(store.current_cid(&r).await.unwrap().unwrap(), cid2);
    }

    #[tokio::test]
    async fn resolve_by_cid_finds_owning_rid() {
        let store = MemoryArtifactStore::new();
        let r = rid("pageA");
        let cid = store.put_bytes(b"content").await.unwrap();
        store
            .upsert_artifact(&r, &cid, "text/plain", "raw", json!({}))
            .await
            .unwrap();

        let resolved = store
            .resolve(&ArtifactRef::Cid(cid.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.rid, r);
        assert_eq!(resolved.cid, cid);
    }
}

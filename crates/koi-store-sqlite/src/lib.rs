#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-store-sqlite** - SQLite-indexed, filesystem-backed [`ArtifactStore`].
//!
//! Bytes are written once per CID under `<data_dir>/artifacts/<cid prefix
//! 2>/<cid>`; the RID→CID index and its history live in a SQLite database
//! at `<data_dir>/index.db`, matching the persisted layout this node's
//! external interfaces document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use koi_identity::{Cid, Rid};
use koi_store_core::{Artifact, ArtifactRef, ArtifactRevision, ArtifactStore, StorageError, UpsertOutcome};
use sqlx::{Row, SqlitePool};

/// Artifact store backed by the local filesystem (bytes) and a SQLite
/// database (the RID index).
#[derive(Debug)]
pub struct SqliteArtifactStore {
    pool: SqlitePool,
    data_dir: PathBuf,
}

impl SqliteArtifactStore {
    /// Open (or create) a store rooted at `data_dir`. Runs migrations.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(data_dir.join("artifacts"))
            .await
            .map_err(|e| StorageError::BackendUnavailable(e.to_string()))?;
        let db_path = data_dir.join("index.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| StorageError::BackendUnavailable(e.to_string()))?;
        let store = Self { pool, data_dir };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory store (bytes live under a temp directory). Useful
    /// for tests that only need an `ArtifactStore`, not on-disk durability.
    pub async fn open_in(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open(data_dir).await
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS artifact_revisions (
                rid TEXT NOT NULL,
                cid TEXT NOT NULL,
                format TEXT NOT NULL,
                stage TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                valid_from TEXT NOT NULL,
                valid_to TEXT,
                metadata TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_revisions_rid ON artifact_revisions(rid)")
            .execute(&self.pool)
            .await
            .map_err(sqlite_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_revisions_cid ON artifact_revisions(cid)")
            .execute(&self.pool)
            .await
            .map_err(sqlite_err)?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_revisions_rid_current \
             ON artifact_revisions(rid) WHERE valid_to IS NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;

        Ok(())
    }

    fn bytes_path(&self, cid: &Cid) -> PathBuf {
        let hex = cid.digest_hex();
        self.data_dir
            .join("artifacts")
            .join(&hex[0..2])
            .join(hex)
    }

    fn row_to_artifact(row: &sqlx::sqlite::SqliteRow, rid: Rid) -> Result<Artifact, StorageError> {
        let cid: String = row.get("cid");
        let valid_to: Option<String> = row.get("valid_to");
        Ok(Artifact {
            rid,
            cid: Cid::parse(&cid).map_err(|e| StorageError::IntegrityViolation(e.to_string()))?,
            format: row.get("format"),
            stage: row.get("stage"),
            size: row.get::<i64, _>("size") as u64,
            created_at: parse_ts(row.get("created_at"))?,
            valid_from: parse_ts(row.get("valid_from"))?,
            valid_to: valid_to.map(|s| parse_ts(s)).transpose()?,
            metadata: serde_json::from_str(row.get("metadata"))
                .map_err(|e| StorageError::IntegrityViolation(e.to_string()))?,
        })
    }
}

fn parse_ts(s: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::IntegrityViolation(e.to_string()))
}

fn sqlite_err(e: sqlx::Error) -> StorageError {
    StorageError::BackendUnavailable(e.to_string())
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn put_bytes(&self, bytes: &[u8]) -> Result<Cid, StorageError> {
        let cid = Cid::hash_bytes(bytes);
        let path = self.bytes_path(&cid);
        if tokio::fs::metadata(&path).await.is_err() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::BackendUnavailable(e.to_string()))?;
            }
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| StorageError::BackendUnavailable(e.to_string()))?;
        }
        Ok(cid)
    }

    async fn get_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.bytes_path(cid)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::BackendUnavailable(e.to_string())),
        }
    }

    async fn upsert_artifact(
        &self,
        rid: &Rid,
        cid: &Cid,
        format: &str,
        stage: &str,
        metadata: serde_json::Value,
    ) -> Result<UpsertOutcome, StorageError> {
        let size = tokio::fs::metadata(self.bytes_path(cid))
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        // BEGIN IMMEDIATE grabs the write lock up front rather than on the
        // first write inside the transaction, so two concurrent upserts of
        // the same RID serialize instead of racing to upgrade a deferred
        // read transaction and one of them hitting SQLITE_BUSY.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlite_err)?;

        let current: Option<(String, String)> = sqlx::query(
            "SELECT cid, created_at FROM artifact_revisions WHERE rid = ? AND valid_to IS NULL",
        )
        .bind(rid.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlite_err)?
        .map(|row: sqlx::sqlite::SqliteRow| (row.get("cid"), row.get("created_at")));

        if let Some((current_cid, _)) = &current {
            if current_cid == cid.as_str() {
                tx.commit().await.map_err(sqlite_err)?;
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let now = Utc::now();
        let outcome = if current.is_some() {
            UpsertOutcome::Revised
        } else {
            UpsertOutcome::Created
        };
        let created_at = current
            .as_ref()
            .map(|(_, ts)| ts.clone())
            .unwrap_or_else(|| now.to_rfc3339());

        if current.is_some() {
            sqlx::query(
                "UPDATE artifact_revisions SET valid_to = ? WHERE rid = ? AND valid_to IS NULL",
            )
            .bind(now.to_rfc3339())
            .bind(rid.to_string())
            .execute(&mut *tx)
            .await
            .map_err(sqlite_err)?;
        }

        sqlx::query(
            r#"
            INSERT INTO artifact_revisions
                (rid, cid, format, stage, size, created_at, valid_from, valid_to, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(rid.to_string())
        .bind(cid.as_str())
        .bind(format)
        .bind(stage)
        .bind(size as i64)
        .bind(&created_at)
        .bind(now.to_rfc3339())
        .bind(metadata.to_string())
        .execute(&mut *tx)
        .await
        .map_err(sqlite_err)?;

        tx.commit().await.map_err(sqlite_err)?;
        Ok(outcome)
    }

    async fn current_cid(&self, rid: &Rid) -> Result<Option<Cid>, StorageError> {
        let row = sqlx::query("SELECT cid FROM artifact_revisions WHERE rid = ? AND valid_to IS NULL")
            .bind(rid.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlite_err)?;
        row.map(|r| Cid::parse(&r.get::<String, _>("cid")))
            .transpose()
            .map_err(|e| StorageError::IntegrityViolation(e.to_string()))
    }

    async fn history(&self, rid: &Rid) -> Result<Vec<ArtifactRevision>, StorageError> {
        let rows = sqlx::query(
            "SELECT cid, valid_from, valid_to FROM artifact_revisions WHERE rid = ? ORDER BY valid_from ASC",
        )
        .bind(rid.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(sqlite_err)?;

        rows.into_iter()
            .map(|row| {
                let cid: String = row.get("cid");
                let valid_to: Option<String> = row.get("valid_to");
                Ok(ArtifactRevision {
                    cid: Cid::parse(&cid).map_err(|e| StorageError::IntegrityViolation(e.to_string()))?,
                    valid_from: parse_ts(row.get("valid_from"))?,
                    valid_to: valid_to.map(parse_ts).transpose()?,
                })
            })
            .collect()
    }

    async fn resolve(&self, reference: &ArtifactRef) -> Result<Option<Artifact>, StorageError> {
        match reference {
            ArtifactRef::Rid(rid) => {
                let row = sqlx::query(
                    "SELECT * FROM artifact_revisions WHERE rid = ? AND valid_to IS NULL",
                )
                .bind(rid.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlite_err)?;
                row.map(|r| Self::row_to_artifact(&r, rid.clone())).transpose()
            }
            ArtifactRef::Cid(cid) => {
                let row = sqlx::query(
                    "SELECT * FROM artifact_revisions WHERE cid = ? ORDER BY valid_from ASC LIMIT 1",
                )
                .bind(cid.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlite_err)?;
                match row {
                    Some(r) => {
                        let rid = Rid::parse(&r.get::<String, _>("rid"))
                            .map_err(|e| StorageError::IntegrityViolation(e.to_string()))?;
                        Ok(Some(Self::row_to_artifact(&r, rid)?))
                    }
                    None => Ok(None),
                }
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
    async fn persists_bytes_and_index_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let r = rid("pageA");

        let cid = {
            let store = SqliteArtifactStore::open(dir.path()).await.unwrap();
            let cid = store.put_bytes(b"hello koi").await.unwrap();
            store
                .upsert_artifact(&r, &cid, "text/plain", "raw", json!({}))
                .await
                .unwrap();
            cid
        };

        let store = SqliteArtifactStore::open(dir.path()).await.unwrap();
        assert_eq!(store.current_cid(&r).await.unwrap().unwrap(), cid);
        assert_eq!(store.get_bytes(&cid).await.unwrap().unwrap(), b"hello koi");
    }

    #[tokio::test]
    async fn revision_closes_prior_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteArtifactStore::open(dir.path()).await.unwrap();
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
    }

    #[tokio::test]
    async fn upsert_same_cid_twice_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteArtifactStore::open(dir.path()).await.unwrap();
        let r = rid("pageA");
        let cid = store.put_bytes(b"content").await.unwrap();

        let first = store
            .upsert_artifact(&r, &cid, "text/plain", "raw", json!({}))
            .await
            .unwrap();
        let second = store
            .upsert_artifact(&r, &cid, "text/plain", "raw", json!({}))
            .await
            .unwrap();

        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(second, UpsertOutcome::Unchanged);
        assert_eq!(store.history(&r).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_bytes_return_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteArtifactStore::open(dir.path()).await.unwrap();
        assert!(store
            .get_bytes(&Cid::hash_bytes(b"nope"))
            .await
            .unwrap()
            .is_none());
    }
}

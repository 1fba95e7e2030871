#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-ledger** - append-only transformation-receipt ledger.
//!
//! A transformation receipt ("CAT") records that some `operation` turned
//! `input_cid` into `output_cid` under a given `recipe_hash`. Receipts are
//! never updated or deleted; `chain_for` walks the provenance chain back
//! from an output CID to its origin, `by_input` finds every receipt that
//! consumed a given CID.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use koi_identity::Cid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

/// A single append-only transformation receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Deterministic identifier: `cat:<operation>:<hash(input||output||recipe)>`.
    pub cat_id: String,
    /// Pipeline stage or operation name, e.g. `chunk`, `embed`.
    pub operation: String,
    /// Content hash consumed by this transformation.
    pub input_cid: Cid,
    /// Content hash produced by this transformation.
    pub output_cid: Cid,
    /// Hash of the recipe (model id, parameters, code version) used.
    pub recipe_hash: String,
    /// When this receipt was appended.
    pub created_at: DateTime<Utc>,
    /// USD cost attributed to this transformation, if it called a paid
    /// model.
    pub cost_usd: Option<f64>,
    /// Model identifier used, if any.
    pub model: Option<String>,
    /// Operation-specific metadata.
    pub metadata: serde_json::Value,
}

/// Compute a receipt's deterministic `catId`.
pub fn compute_cat_id(operation: &str, input_cid: &Cid, output_cid: &Cid, recipe_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input_cid.as_str().as_bytes());
    hasher.update(output_cid.as_str().as_bytes());
    hasher.update(recipe_hash.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for b in digest.as_slice() {
        use std::fmt::Write;
        write!(hex, "{b:02x}").expect("writing to a String cannot fail");
    }
    format!("cat:{operation}:{hex}")
}

/// Errors raised by a [`ReceiptLedger`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The backend could not be reached.
    #[error("ledger backend unavailable: {0}")]
    BackendUnavailable(String),
    /// A receipt with this `catId` already exists with different content;
    /// the ledger is append-only so this is a hard conflict, not a retry.
    #[error("receipt {0} already exists with different content")]
    Conflict(String),
}

/// Append-only store of transformation receipts.
#[async_trait]
pub trait ReceiptLedger: Send + Sync {
    /// Append a receipt. Appending an identical receipt twice (same
    /// `cat_id`) is a no-op; appending a different receipt under the same
    /// `cat_id` is a [`LedgerError::Conflict`] (it cannot happen unless the
    /// hash inputs collide, since `cat_id` is derived from them).
    async fn append(&self, receipt: Receipt) -> Result<(), LedgerError>;

    /// Look up one receipt by its `catId`.
    async fn get(&self, cat_id: &str) -> Result<Option<Receipt>, LedgerError>;

    /// Walk the provenance chain backward from `cid`: the receipt whose
    /// `output_cid` is `cid`, then the receipt whose `output_cid` is that
    /// receipt's `input_cid`, and so on until a CID with no producing
    /// receipt (the original ingested content, or the retroactive
    /// sentinel) is reached. Returned oldest-first.
    async fn chain_for(&self, cid: &Cid) -> Result<Vec<Receipt>, LedgerError>;

    /// All receipts that consumed `cid` as their input, in append order.
    async fn by_input(&self, cid: &Cid) -> Result<Vec<Receipt>, LedgerError>;
}

/// SQLite-backed ledger with a page-sharded-by-day JSON mirror on disk,
/// for out-of-band inspection and backup independent of the database file.
#[derive(Debug)]
pub struct SqliteReceiptLedger {
    pool: SqlitePool,
    mirror_dir: PathBuf,
}

impl SqliteReceiptLedger {
    /// Open (or create) a ledger rooted at `data_dir`. Receipts are
    /// indexed in `<data_dir>/ledger.db` and mirrored as JSON lines under
    /// `<data_dir>/ledger/<YYYY-MM-DD>.jsonl`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let mirror_dir = data_dir.join("ledger");
        tokio::fs::create_dir_all(&mirror_dir)
            .await
            .map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?;
        let db_path = data_dir.join("ledger.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?;
        let ledger = Self { pool, mirror_dir };
        ledger.migrate().await?;
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS receipts (
                cat_id TEXT NOT NULL PRIMARY KEY,
                operation TEXT NOT NULL,
                input_cid TEXT NOT NULL,
                output_cid TEXT NOT NULL,
                recipe_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                cost_usd REAL,
                model TEXT,
                metadata TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_receipts_output ON receipts(output_cid)")
            .execute(&self.pool)
            .await
            .map_err(sqlite_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_receipts_input ON receipts(input_cid)")
            .execute(&self.pool)
            .await
            .map_err(sqlite_err)?;
        Ok(())
    }

    async fn mirror(&self, receipt: &Receipt) -> Result<(), LedgerError> {
        let shard = self
            .mirror_dir
            .join(format!("{}.jsonl", receipt.created_at.format("%Y-%m-%d")));
        let line = serde_json::to_string(receipt)
            .map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?;
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&shard)
            .await
            .map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?;
        Ok(())
    }

    fn row_to_receipt(row: &sqlx::sqlite::SqliteRow) -> Result<Receipt, LedgerError> {
        let input_cid: String = row.get("input_cid");
        let output_cid: String = row.get("output_cid");
        let metadata: String = row.get("metadata");
        Ok(Receipt {
            cat_id: row.get("cat_id"),
            operation: row.get("operation"),
            input_cid: Cid::parse(&input_cid).map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?,
            output_cid: Cid::parse(&output_cid).map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?,
            recipe_hash: row.get("recipe_hash"),
            created_at: DateTime::parse_from_rfc3339(&row.get::<String, _>("created_at"))
                .map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?
                .with_timezone(&Utc),
            cost_usd: row.get("cost_usd"),
            model: row.get("model"),
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| LedgerError::BackendUnavailable(e.to_string()))?,
        })
    }
}

fn sqlite_err(e: sqlx::Error) -> LedgerError {
    LedgerError::BackendUnavailable(e.to_string())
}

#[async_trait]
impl ReceiptLedger for SqliteReceiptLedger {
    async fn append(&self, receipt: Receipt) -> Result<(), LedgerError> {
        // The existence check and the insert share one `BEGIN IMMEDIATE`
        // transaction so two concurrent appends under the same cat_id
        // can't both observe "absent" and both attempt the insert; the
        // unique-violation arm below is the fallback for the case where
        // SQLite still serializes the writers but our own check raced.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlite_err)?;

        let existing_row = sqlx::query("SELECT * FROM receipts WHERE cat_id = ?")
            .bind(&receipt.cat_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlite_err)?;
        if let Some(row) = existing_row {
            let existing = Self::row_to_receipt(&row)?;
            tx.rollback().await.map_err(sqlite_err)?;
            return if existing == receipt {
                Ok(())
            } else {
                Err(LedgerError::Conflict(receipt.cat_id))
            };
        }

        let insert_result = sqlx::query(
            r#"
            INSERT INTO receipts
                (cat_id, operation, input_cid, output_cid, recipe_hash, created_at, cost_usd, model, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&receipt.cat_id)
        .bind(&receipt.operation)
        .bind(receipt.input_cid.as_str())
        .bind(receipt.output_cid.as_str())
        .bind(&receipt.recipe_hash)
        .bind(receipt.created_at.to_rfc3339())
        .bind(receipt.cost_usd)
        .bind(&receipt.model)
        .bind(receipt.metadata.to_string())
        .execute(&mut *tx)
        .await;

        match insert_result {
            Ok(_) => {
                tx.commit().await.map_err(sqlite_err)?;
                self.mirror(&receipt).await?;
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.map_err(sqlite_err)?;
                match self.get(&receipt.cat_id).await? {
                    Some(existing) if existing == receipt => Ok(()),
                    Some(_) => Err(LedgerError::Conflict(receipt.cat_id)),
                    None => Err(LedgerError::BackendUnavailable(
                        "unique violation on insert but no row found on refetch".to_string(),
                    )),
                }
            }
            Err(e) => {
                tx.rollback().await.map_err(sqlite_err)?;
                Err(sqlite_err(e))
            }
        }
    }

    async fn get(&self, cat_id: &str) -> Result<Option<Receipt>, LedgerError> {
        let row = sqlx::query("SELECT * FROM receipts WHERE cat_id = ?")
            .bind(cat_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlite_err)?;
        row.as_ref().map(Self::row_to_receipt).transpose()
    }

    async fn chain_for(&self, cid: &Cid) -> Result<Vec<Receipt>, LedgerError> {
        let mut chain = Vec::new();
        let mut cursor = cid.clone();
        loop {
            let row = sqlx::query("SELECT * FROM receipts WHERE output_cid = ?")
                .bind(cursor.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlite_err)?;
            let Some(row) = row else { break };
            let receipt = Self::row_to_receipt(&row)?;
            cursor = receipt.input_cid.clone();
            chain.push(receipt);
            if cursor.is_sentinel() {
                break;
            }
        }
        chain.reverse();
        Ok(chain)
    }

    async fn by_input(&self, cid: &Cid) -> Result<Vec<Receipt>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM receipts WHERE input_cid = ? ORDER BY created_at ASC")
            .bind(cid.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(sqlite_err)?;
        rows.iter().map(Self::row_to_receipt).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(operation: &str, input: &Cid, output: &Cid) -> Receipt {
        let recipe_hash = "recipe-v1".to_string();
        Receipt {
            cat_id: compute_cat_id(operation, input, output, &recipe_hash),
            operation: operation.to_string(),
            input_cid: input.clone(),
            output_cid: output.clone(),
            recipe_hash,
            created_at: Utc::now(),
            cost_usd: None,
            model: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn append_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();
        let input = Cid::hash_bytes(b"raw");
        let output = Cid::hash_bytes(b"normalized");
        let r = receipt("normalize", &input, &output);

        ledger.append(r.clone()).await.unwrap();
        let fetched = ledger.get(&r.cat_id).await.unwrap().unwrap();
        assert_eq!(fetched, r);
    }

    #[tokio::test]
    async fn appending_identical_receipt_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();
        let input = Cid::hash_bytes(b"raw");
        let output = Cid::hash_bytes(b"normalized");
        let r = receipt("normalize", &input, &output);

        ledger.append(r.clone()).await.unwrap();
        ledger.append(r.clone()).await.unwrap();
        assert_eq!(ledger.by_input(&input).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_receipt_under_same_cat_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();
        let input = Cid::hash_bytes(b"raw");
        let output = Cid::hash_bytes(b"normalized");
        let mut r = receipt("normalize", &input, &output);
        ledger.append(r.clone()).await.unwrap();

        r.cost_usd = Some(0.01);
        let err = ledger.append(r).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn chain_for_walks_back_to_origin() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();

        let raw = Cid::hash_bytes(b"raw");
        let normalized = Cid::hash_bytes(b"normalized");
        let markdown = Cid::hash_bytes(b"markdown");

        ledger.append(receipt("normalize", &raw, &normalized)).await.unwrap();
        ledger.append(receipt("markdown", &normalized, &markdown)).await.unwrap();

        let chain = ledger.chain_for(&markdown).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].operation, "normalize");
        assert_eq!(chain[1].operation, "markdown");
    }

    #[tokio::test]
    async fn chain_for_unreceipted_cid_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();
        let cid = Cid::hash_bytes(b"never produced by a receipt");
        assert!(ledger.chain_for(&cid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn by_input_finds_all_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteReceiptLedger::open(dir.path()).await.unwrap();
        let input = Cid::hash_bytes(b"shared-input");

        ledger
            .append(receipt("embed", &input, &Cid::hash_bytes(b"embedding")))
            .await
            .unwrap();
        ledger
            .append(receipt("extract-entities", &input, &Cid::hash_bytes(b"entities")))
            .await
            .unwrap();

        let consumers = ledger.by_input(&input).await.unwrap();
        assert_eq!(consumers.len(), 2);
    }

    #[test]
    fn cat_id_is_deterministic_and_scoped_by_operation() {
        let input = Cid::hash_bytes(b"x");
        let output = Cid::hash_bytes(b"y");
        let a = compute_cat_id("chunk", &input, &output, "r1");
        let b = compute_cat_id("chunk", &input, &output, "r1");
        let c = compute_cat_id("embed", &input, &output, "r1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("cat:chunk:"));
    }
}

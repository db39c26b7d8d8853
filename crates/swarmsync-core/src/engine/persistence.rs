//! SQLite-based persistence for transfer records and resume metadata
//!
//! Two tables:
//! - `transfers`: one row per TransferRecord snapshot
//! - `partials`: resume metadata per path (origin version, chunk bitmap)

use super::partial::PartialMeta;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use swarmsync_types::{
    Direction, FileVersion, PeerId, Priority, TransferProblem, TransferState, TransferSummary,
};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id TEXT PRIMARY KEY,
    direction TEXT NOT NULL,
    path TEXT NOT NULL,
    size INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    version INTEGER NOT NULL,
    modified_by TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    priority TEXT NOT NULL,
    transferred INTEGER NOT NULL DEFAULT 0,
    problem TEXT,
    problem_info TEXT,
    peers TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS partials (
    path TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    size INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    version INTEGER NOT NULL,
    modified_by TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    chunk_size INTEGER NOT NULL,
    chunk_bitmap TEXT NOT NULL,
    head_signature TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transfers_state ON transfers(state);
CREATE INDEX IF NOT EXISTS idx_transfers_path ON transfers(path);
"#;

/// Database connection pool for transfer persistence
#[derive(Clone, Debug)]
pub struct TransferDatabase {
    pool: SqlitePool,
}

impl TransferDatabase {
    /// Open (or create) the database file
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::init(pool).await
    }

    /// Private in-memory database, used by tests and ephemeral cores
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    /// Save or update a transfer snapshot
    pub async fn upsert_transfer(&self, transfer: &TransferSummary) -> Result<()> {
        let peers = transfer
            .peers
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(
            r#"
            INSERT INTO transfers (
                id, direction, path, size, content_hash, version, modified_by, modified_at,
                deleted, state, priority, transferred, problem, problem_info, peers,
                created_at, started_at, completed_at, retry_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                priority = excluded.priority,
                transferred = excluded.transferred,
                problem = excluded.problem,
                problem_info = excluded.problem_info,
                peers = excluded.peers,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                retry_count = excluded.retry_count
            "#,
        )
        .bind(transfer.id.to_string())
        .bind(transfer.direction.as_str())
        .bind(&transfer.version.path)
        .bind(transfer.version.size as i64)
        .bind(&transfer.version.content_hash)
        .bind(transfer.version.version as i64)
        .bind(transfer.version.modified_by.as_str())
        .bind(transfer.version.modified_at.to_rfc3339())
        .bind(transfer.version.deleted as i64)
        .bind(transfer.state.as_str())
        .bind(transfer.priority.as_str())
        .bind(transfer.transferred as i64)
        .bind(transfer.problem.map(|p| p.as_str()))
        .bind(transfer.problem_info.as_ref())
        .bind(peers)
        .bind(transfer.created_at.to_rfc3339())
        .bind(transfer.started_at.map(|d| d.to_rfc3339()))
        .bind(transfer.completed_at.map(|d| d.to_rfc3339()))
        .bind(transfer.retry_count as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_transfer(&self, id: Uuid) -> Result<Option<TransferSummary>> {
        let row = sqlx::query("SELECT * FROM transfers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_summary).transpose()
    }

    pub async fn load_all_transfers(&self) -> Result<Vec<TransferSummary>> {
        let rows = sqlx::query("SELECT * FROM transfers ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_summary).collect()
    }

    pub async fn load_by_state(&self, state: TransferState) -> Result<Vec<TransferSummary>> {
        let rows = sqlx::query("SELECT * FROM transfers WHERE state = ? ORDER BY created_at")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_summary).collect()
    }

    pub async fn delete_transfer(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete every completed transfer, returning how many were removed
    pub async fn clear_completed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transfers WHERE state = 'completed'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------------
    // Partials
    // ------------------------------------------------------------------------

    pub async fn upsert_partial(&self, meta: &PartialMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO partials (
                path, file_name, size, content_hash, version, modified_by, modified_at,
                chunk_size, chunk_bitmap, head_signature, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                file_name = excluded.file_name,
                size = excluded.size,
                content_hash = excluded.content_hash,
                version = excluded.version,
                modified_by = excluded.modified_by,
                modified_at = excluded.modified_at,
                chunk_size = excluded.chunk_size,
                chunk_bitmap = excluded.chunk_bitmap,
                head_signature = excluded.head_signature,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&meta.origin.path)
        .bind(&meta.file_name)
        .bind(meta.origin.size as i64)
        .bind(&meta.origin.content_hash)
        .bind(meta.origin.version as i64)
        .bind(meta.origin.modified_by.as_str())
        .bind(meta.origin.modified_at.to_rfc3339())
        .bind(meta.chunk_size as i64)
        .bind(&meta.chunk_bitmap)
        .bind(meta.head_signature.as_ref())
        .bind(meta.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_partial(&self, path: &str) -> Result<Option<PartialMeta>> {
        let row = sqlx::query("SELECT * FROM partials WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_partial).transpose()
    }

    pub async fn load_all_partials(&self) -> Result<Vec<PartialMeta>> {
        let rows = sqlx::query("SELECT * FROM partials ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_partial).collect()
    }

    pub async fn delete_partial(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM partials WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| SyncError::Serialization(format!("bad timestamp {}: {}", value, e)))
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse().map_err(SyncError::Serialization)
}

fn row_to_version(row: &SqliteRow) -> Result<FileVersion> {
    Ok(FileVersion {
        path: row.get("path"),
        size: row.get::<i64, _>("size") as u64,
        content_hash: row.get("content_hash"),
        version: row.get::<i64, _>("version") as u64,
        modified_by: PeerId::new(row.get::<String, _>("modified_by")),
        modified_at: parse_time(&row.get::<String, _>("modified_at"))?,
        deleted: false,
    })
}

/// Convert a database row to a TransferSummary
fn row_to_summary(row: SqliteRow) -> Result<TransferSummary> {
    let mut version = row_to_version(&row)?;
    version.deleted = row.get::<i64, _>("deleted") != 0;

    let peers: String = row.get("peers");
    let problem: Option<String> = row.get("problem");
    let started_at: Option<String> = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(TransferSummary {
        id: Uuid::parse_str(&row.get::<String, _>("id"))
            .map_err(|e| SyncError::Serialization(e.to_string()))?,
        direction: parse_enum::<Direction>(&row.get::<String, _>("direction"))?,
        version,
        state: parse_enum::<TransferState>(&row.get::<String, _>("state"))?,
        priority: parse_enum::<Priority>(&row.get::<String, _>("priority"))?,
        transferred: row.get::<i64, _>("transferred") as u64,
        problem: problem
            .as_deref()
            .map(parse_enum::<TransferProblem>)
            .transpose()?,
        problem_info: row.get("problem_info"),
        peers: peers
            .split(',')
            .filter(|p| !p.is_empty())
            .map(PeerId::from)
            .collect(),
        created_at: parse_time(&row.get::<String, _>("created_at"))?,
        started_at: started_at.as_deref().map(parse_time).transpose()?,
        completed_at: completed_at.as_deref().map(parse_time).transpose()?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
    })
}

fn row_to_partial(row: SqliteRow) -> Result<PartialMeta> {
    Ok(PartialMeta {
        origin: row_to_version(&row)?,
        file_name: row.get("file_name"),
        chunk_size: row.get::<i64, _>("chunk_size") as u64,
        chunk_bitmap: row.get("chunk_bitmap"),
        head_signature: row.get("head_signature"),
        updated_at: parse_time(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransferRecord;
    use crate::events::EventBus;

    #[tokio::test]
    async fn test_transfer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = TransferDatabase::new(dir.path().join("transfers.db"))
            .await
            .unwrap();

        let record = TransferRecord::new(
            Direction::Download,
            FileVersion::new("photos/cat.jpg", 2048, 7).with_hash("ab12"),
            Priority::High,
            EventBus::default(),
        );
        record.add_peer(PeerId::from("alice"));
        record.add_peer(PeerId::from("bob"));
        record.set_started().unwrap();
        record.add_transferred(1024);
        record.set_broken(TransferProblem::PeerDisconnected, "alice left");
        db.upsert_transfer(&record.summary()).await.unwrap();

        let loaded = db.load_transfer(record.id()).await.unwrap().unwrap();
        assert_eq!(loaded.state, TransferState::Broken);
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.problem, Some(TransferProblem::PeerDisconnected));
        assert_eq!(loaded.transferred, 1024);
        assert_eq!(loaded.peers.len(), 2);
        assert_eq!(loaded.version.path, "photos/cat.jpg");
        assert_eq!(loaded.version.version, 7);
        assert!(loaded.started_at.is_some());

        assert_eq!(db.load_by_state(TransferState::Broken).await.unwrap().len(), 1);
        assert_eq!(db.clear_completed().await.unwrap(), 0);
        db.delete_transfer(record.id()).await.unwrap();
        assert!(db.load_all_transfers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_meta_round_trip() {
        let db = TransferDatabase::in_memory().await.unwrap();
        let meta = PartialMeta {
            origin: FileVersion::new("docs/report.pdf", 3000, 2),
            file_name: "(incomplete) 0011223344556677".into(),
            chunk_size: 1000,
            chunk_bitmap: "101".into(),
            head_signature: Some("beef".into()),
            updated_at: Utc::now(),
        };
        db.upsert_partial(&meta).await.unwrap();

        let loaded = db.load_partial("docs/report.pdf").await.unwrap().unwrap();
        assert_eq!(loaded.chunk_bitmap, "101");
        assert_eq!(loaded.origin.version, 2);
        assert_eq!(
            loaded.origin.modified_at.timestamp_millis(),
            meta.origin.modified_at.timestamp_millis()
        );

        db.delete_partial("docs/report.pdf").await.unwrap();
        assert!(db.load_all_partials().await.unwrap().is_empty());
    }
}

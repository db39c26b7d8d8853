//! Partial files - on-disk staging for incomplete downloads
//!
//! Partial files live in a reserved directory inside the download root, so
//! the final promote is a same-filesystem rename and the final path never
//! holds incomplete content. Each partial is paired with a `partials` row
//! that records its origin version and which chunks are already written.

use super::chunks::ChunkPool;
use super::persistence::TransferDatabase;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use swarmsync_types::{timestamps_match, FileVersion};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Reserved directory for partial files, relative to the download root
pub const PARTIAL_DIR: &str = ".swarmsync";
pub const PARTIAL_PREFIX: &str = "(incomplete) ";
const STALE_SUFFIX: &str = ".stale";
const HEAD_SIGNATURE_LEN: u64 = 64 * 1024;

/// Resume metadata stored next to a partial file
#[derive(Debug, Clone)]
pub struct PartialMeta {
    pub origin: FileVersion,
    pub file_name: String,
    pub chunk_size: u64,
    /// One char per chunk, `'1'` when written
    pub chunk_bitmap: String,
    /// SHA-256 of the first bytes written, checked on resume
    pub head_signature: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// How `PartialStore::prepare` found the partial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    Fresh,
    Resumed { bytes: u64 },
    /// An old partial did not match the requested version
    Discarded,
}

/// A partial file ready to receive chunks
#[derive(Debug)]
pub struct PreparedPartial {
    pub path: PathBuf,
    pub final_path: PathBuf,
    pub pool: ChunkPool,
    pub outcome: ResumeOutcome,
    /// Content of a mismatched partial, kept aside for block reuse
    pub stale: Option<PathBuf>,
}

/// What a startup scan cleaned up
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub kept: Vec<String>,
    pub removed_files: Vec<PathBuf>,
    pub removed_entries: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct PartialStore {
    root: PathBuf,
    db: TransferDatabase,
    tolerance_ms: i64,
}

impl PartialStore {
    pub fn new(root: impl Into<PathBuf>, db: TransferDatabase, tolerance_ms: i64) -> Self {
        Self {
            root: root.into(),
            db,
            tolerance_ms,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.root.join(PARTIAL_DIR)
    }

    /// Reserved file name of the partial for `path`
    pub fn partial_name(path: &str) -> String {
        let digest = hex::encode(Sha256::digest(path.as_bytes()));
        format!("{}{}", PARTIAL_PREFIX, &digest[..16])
    }

    pub fn partial_path(&self, version: &FileVersion) -> PathBuf {
        self.partial_dir().join(Self::partial_name(&version.path))
    }

    /// Final location of `version`, refusing paths that escape the root
    pub fn final_path(&self, version: &FileVersion) -> Result<PathBuf> {
        let relative = Path::new(&version.path);
        let safe = !version.path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(SyncError::InvalidPath(version.path.clone()));
        }
        Ok(self.root.join(relative))
    }

    pub async fn load_meta(&self, path: &str) -> Result<Option<PartialMeta>> {
        self.db.load_partial(path).await
    }

    /// Whether stored metadata still describes `version`
    pub fn meta_matches(&self, meta: &PartialMeta, version: &FileVersion) -> bool {
        meta.origin.version == version.version
            && meta.origin.size == version.size
            && meta.origin.content_hash == version.content_hash
            && timestamps_match(meta.origin.modified_at, version.modified_at, self.tolerance_ms)
    }

    /// Open or create the partial for `version`.
    ///
    /// A partial whose metadata and head signature still match is resumed
    /// with its chunk bitmap. A mismatched one is moved aside as stale data
    /// and the download restarts from offset 0.
    pub async fn prepare(&self, version: &FileVersion, chunk_size: u64) -> Result<PreparedPartial> {
        let final_path = self.final_path(version)?;
        tokio::fs::create_dir_all(self.partial_dir()).await?;
        let path = self.partial_path(version);
        let exists = tokio::fs::try_exists(&path).await?;
        let meta = self.db.load_partial(&version.path).await?;

        if exists {
            if let Some(meta) = meta.as_ref() {
                if self.meta_matches(meta, version)
                    && meta.chunk_size == chunk_size
                    && self.head_matches(&path, meta).await?
                {
                    let pool = ChunkPool::from_bitmap(version.size, chunk_size, &meta.chunk_bitmap);
                    let bytes = pool.available_bytes();
                    info!("Resuming {} from {} bytes", version.path, bytes);
                    return Ok(PreparedPartial {
                        path,
                        final_path,
                        pool,
                        outcome: ResumeOutcome::Resumed { bytes },
                        stale: None,
                    });
                }
            }

            let stale = self.stale_path(version);
            tokio::fs::rename(&path, &stale).await?;
            info!(
                "Partial for {} does not match version {}, restarting",
                version.path, version.version
            );
            self.db.delete_partial(&version.path).await?;
            File::create(&path).await?;
            return Ok(PreparedPartial {
                path,
                final_path,
                pool: ChunkPool::new(version.size, chunk_size),
                outcome: ResumeOutcome::Discarded,
                stale: Some(stale),
            });
        }

        if meta.is_some() {
            self.db.delete_partial(&version.path).await?;
        }
        File::create(&path).await?;
        Ok(PreparedPartial {
            path,
            final_path,
            pool: ChunkPool::new(version.size, chunk_size),
            outcome: ResumeOutcome::Fresh,
            stale: None,
        })
    }

    fn stale_path(&self, version: &FileVersion) -> PathBuf {
        self.partial_dir().join(format!(
            "{}{}",
            Self::partial_name(&version.path),
            STALE_SUFFIX
        ))
    }

    async fn head_matches(&self, path: &Path, meta: &PartialMeta) -> Result<bool> {
        match &meta.head_signature {
            Some(expected) => Ok(head_signature(path).await?.as_deref() == Some(expected.as_str())),
            None => Ok(true),
        }
    }

    /// Persist the chunk bitmap and stamp the partial with the origin mtime
    pub async fn save_progress(&self, version: &FileVersion, pool: &ChunkPool) -> Result<()> {
        let path = self.partial_path(version);
        let head = if pool.available_count() > 0 {
            head_signature(&path).await?
        } else {
            None
        };
        let meta = PartialMeta {
            origin: version.clone(),
            file_name: Self::partial_name(&version.path),
            chunk_size: pool.chunk_size(),
            chunk_bitmap: pool.to_bitmap(),
            head_signature: head,
            updated_at: Utc::now(),
        };
        self.db.upsert_partial(&meta).await?;
        set_modified(&path, version.modified_at).await?;
        debug!(
            "Saved progress for {}: {}/{} chunks",
            version.path,
            pool.available_count(),
            pool.chunk_count()
        );
        Ok(())
    }

    /// Atomically move a finished partial to its final path
    pub async fn promote(&self, version: &FileVersion) -> Result<PathBuf> {
        let partial = self.partial_path(version);
        let final_path = self.final_path(version)?;
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        set_modified(&partial, version.modified_at).await?;
        tokio::fs::rename(&partial, &final_path).await?;
        self.db.delete_partial(&version.path).await?;
        info!("Promoted {} to {}", version.path, final_path.display());
        Ok(final_path)
    }

    /// Delete the partial and its metadata
    pub async fn discard(&self, path: &str) -> Result<()> {
        let file = self.partial_dir().join(Self::partial_name(path));
        remove_if_exists(&file).await?;
        self.db.delete_partial(path).await?;
        debug!("Discarded partial for {}", path);
        Ok(())
    }

    /// Remove a stale copy once block reuse is done with it
    pub async fn drop_stale(&self, stale: &Path) -> Result<()> {
        remove_if_exists(stale).await
    }

    /// Startup scan: drop orphan files, entries without a file and anything
    /// untouched for longer than `grace`
    pub async fn scan(&self, grace: std::time::Duration) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let dir = self.partial_dir();
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(report);
        }

        let grace = ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::days(36500));
        let cutoff = Utc::now() - grace;
        let metas = self.db.load_all_partials().await?;
        let mut known = std::collections::HashSet::new();

        for meta in metas {
            let file = dir.join(&meta.file_name);
            let exists = tokio::fs::try_exists(&file).await?;
            if !exists || meta.updated_at < cutoff {
                if exists {
                    remove_if_exists(&file).await?;
                    report.removed_files.push(file);
                }
                self.db.delete_partial(&meta.origin.path).await?;
                report.removed_entries.push(meta.origin.path);
                continue;
            }
            known.insert(meta.file_name.clone());
            report.kept.push(meta.origin.path);
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !known.contains(&name) {
                remove_if_exists(&entry.path()).await?;
                report.removed_files.push(entry.path());
            }
        }

        if !report.removed_files.is_empty() || !report.removed_entries.is_empty() {
            warn!(
                "Partial scan removed {} files and {} entries",
                report.removed_files.len(),
                report.removed_entries.len()
            );
        }
        Ok(report)
    }
}

async fn head_signature(path: &Path) -> Result<Option<String>> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut head = Vec::new();
    file.take(HEAD_SIGNATURE_LEN).read_to_end(&mut head).await?;
    if head.is_empty() {
        return Ok(None);
    }
    Ok(Some(hex::encode(Sha256::digest(&head))))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Set a file's modification time
pub async fn set_modified(path: &Path, at: DateTime<Utc>) -> Result<()> {
    let path = path.to_path_buf();
    let time: SystemTime = at.into();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_modified(time)
    })
    .await
    .map_err(|e| SyncError::InvalidOperation(e.to_string()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmsync_types::PeerId;

    async fn store() -> (tempfile::TempDir, PartialStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = TransferDatabase::new(dir.path().join("db/transfers.db"))
            .await
            .unwrap();
        let store = PartialStore::new(dir.path().join("root"), db, 2000);
        (dir, store)
    }

    fn version(n: u64) -> FileVersion {
        FileVersion::new("music/song.flac", 3000, n)
            .with_hash("f00d")
            .modified(PeerId::from("alice"), Utc::now() - ChronoDuration::hours(1))
    }

    #[tokio::test]
    async fn test_matching_partial_is_resumed() {
        let (_dir, store) = store().await;
        let v = version(1);

        let prepared = store.prepare(&v, 1000).await.unwrap();
        assert_eq!(prepared.outcome, ResumeOutcome::Fresh);
        tokio::fs::write(&prepared.path, vec![1u8; 2000]).await.unwrap();
        let mut pool = prepared.pool;
        pool.mark_available(0);
        pool.mark_available(1);
        store.save_progress(&v, &pool).await.unwrap();

        // Same version with an mtime off by less than the tolerance
        let mut same = v.clone();
        same.modified_at = v.modified_at + ChronoDuration::milliseconds(1500);
        let resumed = store.prepare(&same, 1000).await.unwrap();
        assert_eq!(resumed.outcome, ResumeOutcome::Resumed { bytes: 2000 });
        assert_eq!(resumed.pool.needed_count(), 1);
        assert!(resumed.stale.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_partial_restarts_from_zero() {
        let (_dir, store) = store().await;
        let v1 = version(1);
        let prepared = store.prepare(&v1, 1000).await.unwrap();
        tokio::fs::write(&prepared.path, vec![1u8; 1000]).await.unwrap();
        let mut pool = prepared.pool;
        pool.mark_available(0);
        store.save_progress(&v1, &pool).await.unwrap();

        let mut v2 = version(2);
        v2.modified_at = v1.modified_at + ChronoDuration::seconds(10);
        let prepared = store.prepare(&v2, 1000).await.unwrap();
        assert_eq!(prepared.outcome, ResumeOutcome::Discarded);
        assert_eq!(prepared.pool.available_bytes(), 0);
        assert_eq!(tokio::fs::metadata(&prepared.path).await.unwrap().len(), 0);

        let stale = prepared.stale.unwrap();
        assert_eq!(tokio::fs::read(&stale).await.unwrap(), vec![1u8; 1000]);
        store.drop_stale(&stale).await.unwrap();
        assert!(store.load_meta(&v2.path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_head_is_not_resumed() {
        let (_dir, store) = store().await;
        let v = version(1);
        let prepared = store.prepare(&v, 1000).await.unwrap();
        tokio::fs::write(&prepared.path, vec![1u8; 1000]).await.unwrap();
        let mut pool = prepared.pool;
        pool.mark_available(0);
        store.save_progress(&v, &pool).await.unwrap();

        tokio::fs::write(&prepared.path, vec![2u8; 1000]).await.unwrap();
        let again = store.prepare(&v, 1000).await.unwrap();
        assert_eq!(again.outcome, ResumeOutcome::Discarded);
    }

    #[tokio::test]
    async fn test_promote_is_atomic_rename() {
        let (_dir, store) = store().await;
        let v = version(1);
        let prepared = store.prepare(&v, 1000).await.unwrap();
        tokio::fs::write(&prepared.path, vec![9u8; 3000]).await.unwrap();
        assert!(!prepared.final_path.exists());

        let promoted = store.promote(&v).await.unwrap();
        assert_eq!(promoted, prepared.final_path);
        assert!(!prepared.path.exists());
        let meta = std::fs::metadata(&promoted).unwrap();
        let mtime: DateTime<Utc> = meta.modified().unwrap().into();
        assert!(timestamps_match(mtime, v.modified_at, 2000));
    }

    #[tokio::test]
    async fn test_scan_removes_orphans() {
        let (_dir, store) = store().await;
        let v = version(1);
        let prepared = store.prepare(&v, 1000).await.unwrap();
        store.save_progress(&v, &prepared.pool).await.unwrap();
        let orphan = store.partial_dir().join("(incomplete) deadbeef");
        tokio::fs::write(&orphan, b"x").await.unwrap();

        let report = store.scan(std::time::Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report.kept, vec![v.path.clone()]);
        assert_eq!(report.removed_files, vec![orphan.clone()]);
        assert!(!orphan.exists());

        // Zero grace period drops everything
        let report = store.scan(std::time::Duration::ZERO).await.unwrap();
        assert_eq!(report.removed_entries, vec![v.path.clone()]);
    }

    #[tokio::test]
    async fn test_final_path_rejects_escapes() {
        let (_dir, store) = store().await;
        let mut v = version(1);
        assert!(store.final_path(&v).unwrap().ends_with("music/song.flac"));

        v.path = "../etc/passwd".into();
        assert!(matches!(store.final_path(&v), Err(SyncError::InvalidPath(_))));
        v.path = "/abs".into();
        assert!(store.final_path(&v).is_err());
        assert!(PartialStore::partial_name("a/b.txt").starts_with(PARTIAL_PREFIX));
    }
}

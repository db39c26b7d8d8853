//! Upload serving - local file ranges streamed to a requesting peer

use super::delta::hash_file;
use super::throttle::{Throttle, ThrottledReader};
use super::transfer::TransferRecord;
use crate::error::{Result, SyncError};
use crate::peer::ByteStream;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use swarmsync_types::{timestamps_match, FileVersion, TransferProblem};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const STREAM_BUFFER: usize = 64 * 1024;

/// Whether the file at `path` still is `version` (size and mtime)
pub async fn local_copy_matches(path: &Path, version: &FileVersion, tolerance_ms: i64) -> Result<bool> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if version.deleted || !metadata.is_file() || metadata.len() != version.size {
        return Ok(false);
    }
    let modified: DateTime<Utc> = metadata.modified()?.into();
    Ok(timestamps_match(modified, version.modified_at, tolerance_ms))
}

/// `local_copy_matches` plus the content hash, when the version carries one
pub async fn local_copy_verified(path: &Path, version: &FileVersion, tolerance_ms: i64) -> Result<bool> {
    if !local_copy_matches(path, version, tolerance_ms).await? {
        return Ok(false);
    }
    if version.content_hash.is_empty() {
        return Ok(true);
    }
    let actual = hash_file(path).await?;
    Ok(actual.eq_ignore_ascii_case(&version.content_hash))
}

/// Open `length` bytes of the local file at `offset` for a started upload.
///
/// The stream is throttled on the upload's output class, counts its bytes
/// on the record and ends early once the record finishes. A local file that
/// no longer matches the advertised version aborts the upload.
pub async fn open_range(
    record: &Arc<TransferRecord>,
    path: &Path,
    offset: u64,
    length: u64,
    throttle: Throttle,
    tolerance_ms: i64,
) -> Result<ByteStream> {
    let version = record.version();
    if !record.is_started() {
        return Err(SyncError::InvalidOperation(format!(
            "upload of {} is {}",
            version.path,
            record.state()
        )));
    }
    if !local_copy_matches(path, version, tolerance_ms).await? {
        warn!("{} changed while uploading, aborting", version.path);
        record.abort_with(
            TransferProblem::LocalModification,
            "local file changed during upload",
        );
        return Err(SyncError::LocalModification(version.path.clone()));
    }
    let end = offset.checked_add(length).unwrap_or(u64::MAX);
    if end > version.size {
        return Err(SyncError::InvalidOperation(format!(
            "range {}+{} is outside {} ({} bytes)",
            offset, length, version.path, version.size
        )));
    }

    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    debug!("Serving {}+{} of {}", offset, length, version.path);

    let reader = ThrottledReader::new(
        file.take(length),
        throttle.with_cancellation(record.cancel_token().clone()),
    );
    let counter = Arc::clone(record);
    let stream = ReaderStream::with_capacity(reader, STREAM_BUFFER)
        .take_until(record.cancel_token().clone().cancelled_owned())
        .map_err(SyncError::from)
        .inspect_ok(move |bytes| counter.add_transferred(bytes.len() as u64));
    Ok(stream.boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BandwidthGovernor, TransferRecord};
    use crate::events::EventBus;
    use swarmsync_types::{Direction, Priority, TrafficClass};

    async fn local_file(dir: &Path, content: &[u8]) -> (std::path::PathBuf, FileVersion) {
        let path = dir.join("shared.bin");
        tokio::fs::write(&path, content).await.unwrap();
        let modified: DateTime<Utc> = std::fs::metadata(&path).unwrap().modified().unwrap().into();
        let version = FileVersion::new("shared.bin", content.len() as u64, 1)
            .modified(Default::default(), modified);
        (path, version)
    }

    fn throttle() -> Throttle {
        Throttle::new(BandwidthGovernor::default(), TrafficClass::WanOutput)
    }

    #[tokio::test]
    async fn test_serves_requested_range() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (path, version) = local_file(dir.path(), &content).await;
        let record = TransferRecord::new(Direction::Upload, version, Priority::Normal, EventBus::default());
        record.set_started().unwrap();

        let stream = open_range(&record, &path, 1000, 150_000, throttle(), 2000)
            .await
            .unwrap();
        let chunks: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
        let served: Vec<u8> = chunks.concat();
        assert_eq!(served, &content[1000..151_000]);
        assert_eq!(record.transferred(), 150_000);
    }

    #[tokio::test]
    async fn test_refuses_unstarted_and_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (path, version) = local_file(dir.path(), b"hello").await;
        let record = TransferRecord::new(Direction::Upload, version, Priority::Normal, EventBus::default());
        assert!(open_range(&record, &path, 0, 5, throttle(), 2000).await.is_err());

        record.set_started().unwrap();
        assert!(matches!(
            open_range(&record, &path, 3, 10, throttle(), 2000).await,
            Err(SyncError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_verified_copy_checks_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (path, version) = local_file(dir.path(), b"hello").await;
        assert!(local_copy_verified(&path, &version, 2000).await.unwrap());

        let right = version.clone().with_hash(crate::engine::strong_hash(b"hello"));
        assert!(local_copy_verified(&path, &right, 2000).await.unwrap());

        // Same size and mtime, other content
        let wrong = version.with_hash(crate::engine::strong_hash(b"jelly"));
        assert!(local_copy_matches(&path, &wrong, 2000).await.unwrap());
        assert!(!local_copy_verified(&path, &wrong, 2000).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_change_aborts_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (path, version) = local_file(dir.path(), b"hello").await;
        let record = TransferRecord::new(Direction::Upload, version, Priority::Normal, EventBus::default());
        record.set_started().unwrap();

        tokio::fs::write(&path, b"hello, world").await.unwrap();
        let result = open_range(&record, &path, 0, 5, throttle(), 2000).await;
        assert!(matches!(result, Err(SyncError::LocalModification(_))));
        assert!(record.is_aborted());
        assert_eq!(record.problem(), Some(TransferProblem::LocalModification));
    }
}

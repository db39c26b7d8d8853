//! Source worker - pulls chunks from one peer into the shared partial file
//!
//! In part mode the worker keeps up to `max_outstanding` chunks claimed and
//! fetches them one range request at a time. In whole-file mode it claims
//! every missing chunk and streams the file tail from the first gap.
//!
//! A source that delivers nothing for `stall_timeout` gives its claimed
//! chunks back and backs off. It is only dropped when the peer disconnects
//! or answers with an error.

use super::chunks::{ChunkPool, ChunkRange};
use super::throttle::Throttle;
use super::transfer::TransferRecord;
use crate::error::SyncError;
use crate::peer::SharedPeer;
use futures::StreamExt;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmsync_types::{FileVersion, PeerId};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a worker drives its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Parts { max_outstanding: usize },
    WholeFile,
}

/// Counters of one source, shared with the coordinator
#[derive(Debug)]
pub struct SourceStats {
    bytes_received: AtomicU64,
    chunks: Mutex<Vec<usize>>,
    last_activity: Mutex<Instant>,
}

impl SourceStats {
    pub fn new() -> Self {
        Self {
            bytes_received: AtomicU64::new(0),
            chunks: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Chunks this source delivered, in arrival order
    pub fn chunks(&self) -> Vec<usize> {
        self.chunks.lock().clone()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    fn received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    fn delivered(&self, chunk: usize) {
        self.chunks.lock().push(chunk);
    }
}

impl Default for SourceStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a worker stopped
#[derive(Debug)]
pub enum SourceExit {
    /// Nothing left to fetch
    Finished,
    Cancelled,
    /// The peer went away or refused; the source should be removed
    Lost(SyncError),
    /// Local failure, fatal for the whole download
    Failed(SyncError),
}

enum FetchError {
    Stalled,
    Cancelled,
    Peer(SyncError),
    Local(SyncError),
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Local(e.into())
    }
}

/// Shared per-download state every worker needs
#[derive(Clone)]
pub struct SwarmShared {
    pub version: FileVersion,
    pub partial_path: PathBuf,
    pub pool: Arc<Mutex<ChunkPool>>,
    pub pool_changed: Arc<Notify>,
    pub record: Arc<TransferRecord>,
    pub stall_timeout: Duration,
}

pub struct SourceWorker {
    peer: SharedPeer,
    shared: SwarmShared,
    throttle: Throttle,
    stats: Arc<SourceStats>,
    cancel: CancellationToken,
    mode: SourceMode,
}

impl SourceWorker {
    pub fn new(
        peer: SharedPeer,
        shared: SwarmShared,
        throttle: Throttle,
        stats: Arc<SourceStats>,
        cancel: CancellationToken,
        mode: SourceMode,
    ) -> Self {
        Self {
            peer,
            shared,
            throttle,
            stats,
            cancel,
            mode,
        }
    }

    fn peer_id(&self) -> &PeerId {
        self.peer.id()
    }

    pub async fn run(self) -> SourceExit {
        debug!(
            "Source {} working on {} ({:?})",
            self.peer_id(),
            self.shared.version.path,
            self.mode
        );

        let mut file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.shared.partial_path)
            .await
        {
            Ok(f) => f,
            Err(e) => return SourceExit::Failed(e.into()),
        };

        let exit = match self.mode {
            SourceMode::Parts { max_outstanding } => {
                self.run_parts(&mut file, max_outstanding.max(1)).await
            }
            SourceMode::WholeFile => self.run_whole(&mut file).await,
        };

        // Nothing may stay claimed by a worker that stopped
        let released = self.shared.pool.lock().reclaim_from(self.peer_id());
        if !released.is_empty() {
            self.shared.pool_changed.notify_waiters();
        }
        exit
    }

    async fn run_parts(&self, file: &mut File, max_outstanding: usize) -> SourceExit {
        loop {
            if self.cancel.is_cancelled() {
                return SourceExit::Cancelled;
            }
            if !self.peer.is_connected() {
                return SourceExit::Lost(SyncError::PeerDisconnected(self.peer_id().clone()));
            }

            let claimed = self
                .shared
                .pool
                .lock()
                .claim_up_to(self.peer_id(), max_outstanding);
            let mut queue: Vec<ChunkRange> = {
                let pool = self.shared.pool.lock();
                pool.pending_for(self.peer_id())
                    .into_iter()
                    .map(|i| pool.range(i))
                    .collect()
            };

            if queue.is_empty() {
                if self.shared.pool.lock().is_complete() {
                    return SourceExit::Finished;
                }
                // Other sources hold the rest; wait for a reclaim or completion
                tokio::select! {
                    _ = self.cancel.cancelled() => return SourceExit::Cancelled,
                    _ = timeout(Duration::from_millis(250), self.shared.pool_changed.notified()) => {}
                }
                continue;
            }
            debug!("Source {} claimed {} chunk(s)", self.peer_id(), claimed.len());

            // Only the first claimed chunk is requested now, the rest stay
            // reserved as outstanding work for this source
            let chunk = queue.remove(0);
            match self.fetch_chunk(file, chunk).await {
                Ok(()) => {
                    let accepted = self
                        .shared
                        .pool
                        .lock()
                        .mark_received(chunk.index, self.peer_id());
                    if accepted {
                        self.stats.delivered(chunk.index);
                    } else {
                        // Reclaimed under us, another source owns it now
                        self.shared.record.sub_transferred(chunk.length);
                    }
                    self.shared.pool_changed.notify_waiters();
                }
                Err(FetchError::Cancelled) => return SourceExit::Cancelled,
                Err(FetchError::Stalled) => {
                    let reclaimed = self.shared.pool.lock().reclaim_from(self.peer_id());
                    self.shared.pool_changed.notify_waiters();
                    warn!(
                        "Source {} stalled on {}, returned {} chunk(s)",
                        self.peer_id(),
                        self.shared.version.path,
                        reclaimed.len()
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return SourceExit::Cancelled,
                        _ = tokio::time::sleep(self.shared.stall_timeout) => {}
                    }
                }
                Err(FetchError::Peer(e)) => return SourceExit::Lost(e),
                Err(FetchError::Local(e)) => return SourceExit::Failed(e),
            }
        }
    }

    /// Fetch one chunk into the partial file. On failure the bytes already
    /// counted for it are taken back.
    async fn fetch_chunk(&self, file: &mut File, chunk: ChunkRange) -> Result<(), FetchError> {
        let mut received = 0u64;
        let record = &self.shared.record;
        let result = self
            .stream_into(file, chunk.offset, chunk.length, &mut received, |_, written| {
                record.add_transferred(written)
            })
            .await;
        match result {
            Ok(()) if received == chunk.length => Ok(()),
            Ok(()) => {
                self.shared.record.sub_transferred(received);
                Err(FetchError::Peer(SyncError::PeerRefused {
                    peer: self.peer_id().clone(),
                    message: format!(
                        "short answer for chunk {} ({} of {} bytes)",
                        chunk.index, received, chunk.length
                    ),
                }))
            }
            Err(e) => {
                self.shared.record.sub_transferred(received);
                Err(e)
            }
        }
    }

    /// Request `length` bytes at `offset` and write them at the same offset.
    /// `on_progress` sees the absolute file position and the byte count of
    /// every write.
    async fn stream_into(
        &self,
        file: &mut File,
        offset: u64,
        length: u64,
        received: &mut u64,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<(), FetchError> {
        let stall = self.shared.stall_timeout;
        let request = self.peer.request_range(&self.shared.version, offset, length);
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
            answer = timeout(stall, request) => match answer {
                Err(_) => return Err(FetchError::Stalled),
                Ok(Err(e)) => return Err(FetchError::Peer(e)),
                Ok(Ok(stream)) => stream,
            },
        };

        file.seek(SeekFrom::Start(offset)).await?;
        while *received < length {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                next = timeout(stall, stream.next()) => next,
            };
            let bytes = match next {
                Err(_) => return Err(FetchError::Stalled),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(FetchError::Peer(e)),
                Ok(Some(Ok(bytes))) => bytes,
            };

            let take = (bytes.len() as u64).min(length - *received);
            if take == 0 {
                continue;
            }
            self.throttle.consume(take).await;
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            file.write_all(&bytes[..take as usize]).await?;
            *received += take;
            self.stats.received(take);
            on_progress(offset + *received, take);
        }
        file.flush().await?;
        Ok(())
    }

    async fn run_whole(&self, file: &mut File) -> SourceExit {
        loop {
            if self.cancel.is_cancelled() {
                return SourceExit::Cancelled;
            }

            let (start, claimed) = {
                let mut pool = self.shared.pool.lock();
                let claimed = pool.claim_all(self.peer_id());
                (pool.first_missing_offset(), claimed.len())
            };
            let Some(start) = start else {
                return SourceExit::Finished;
            };
            let length = self.shared.version.size - start;
            info!(
                "Streaming {} from {} at offset {} ({} chunks missing)",
                self.shared.version.path,
                self.peer_id(),
                start,
                claimed
            );

            let pool = Arc::clone(&self.shared.pool);
            let notify = Arc::clone(&self.shared.pool_changed);
            let stats = Arc::clone(&self.stats);
            let record = Arc::clone(&self.shared.record);
            let peer = self.peer_id().clone();
            let mut committed = start;
            let mut received = 0u64;
            // The tail may run over chunks that are already available, only
            // chunks claimed here count as progress
            let result = self
                .stream_into(file, start, length, &mut received, |position, _| {
                    let mut pool = pool.lock();
                    let mut index = pool.index_of(committed);
                    while index < pool.chunk_count() && pool.range(index).end() <= position {
                        let range = pool.range(index);
                        if pool.mark_received(index, &peer) {
                            record.add_transferred(range.length);
                            stats.delivered(index);
                            notify.notify_waiters();
                        }
                        committed = range.end();
                        index += 1;
                    }
                })
                .await;

            match result {
                Ok(()) if received == length => return SourceExit::Finished,
                Ok(()) => {
                    return SourceExit::Lost(SyncError::PeerRefused {
                        peer: self.peer_id().clone(),
                        message: format!("stream ended after {} of {} bytes", received, length),
                    });
                }
                Err(FetchError::Stalled) => {
                    self.shared.pool.lock().reclaim_from(self.peer_id());
                    self.shared.pool_changed.notify_waiters();
                    warn!(
                        "Source {} stalled streaming {}, retrying",
                        self.peer_id(),
                        self.shared.version.path
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return SourceExit::Cancelled,
                        _ = tokio::time::sleep(self.shared.stall_timeout) => {}
                    }
                }
                Err(FetchError::Cancelled) => return SourceExit::Cancelled,
                Err(FetchError::Peer(e)) => return SourceExit::Lost(e),
                Err(FetchError::Local(e)) => return SourceExit::Failed(e),
            }
        }
    }
}

//! In-memory peers and fixtures shared by the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmsync_core::engine::digest_block;
use swarmsync_core::{ByteStream, Peer, Result, SyncError};
use swarmsync_types::{FileVersion, PartsRecord, PeerId, TransferEvent, TransferId, TransferMessage};
use tokio::sync::broadcast;

const PIECE: usize = 16 * 1024;

/// Peer serving one file from memory
pub struct MemoryPeer {
    id: PeerId,
    data: Bytes,
    parts: bool,
    latency: Duration,
    bandwidth: u64,
    lan: bool,
    /// Range requests answered before the peer drops off
    disconnect_after: Option<usize>,
    /// Range requests refused before the peer starts answering
    refuse_first: AtomicUsize,
    stalled: AtomicBool,
    connected: AtomicBool,
    requests: AtomicUsize,
    served: Mutex<Vec<(u64, u64)>>,
    parts_record: Option<PartsRecord>,
    messages: Mutex<Vec<TransferMessage>>,
}

impl MemoryPeer {
    pub fn new(id: &str, data: impl Into<Bytes>) -> Self {
        Self {
            id: PeerId::from(id),
            data: data.into(),
            parts: true,
            latency: Duration::ZERO,
            bandwidth: 0,
            lan: false,
            disconnect_after: None,
            refuse_first: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
            served: Mutex::new(Vec::new()),
            parts_record: None,
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn without_part_support(mut self) -> Self {
        self.parts = false;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_bandwidth(mut self, bytes_per_second: u64) -> Self {
        self.bandwidth = bytes_per_second;
        self
    }

    pub fn on_lan(mut self) -> Self {
        self.lan = true;
        self
    }

    pub fn disconnect_after(mut self, requests: usize) -> Self {
        self.disconnect_after = Some(requests);
        self
    }

    pub fn refuse_first(self, requests: usize) -> Self {
        self.refuse_first.store(requests, Ordering::SeqCst);
        self
    }

    pub fn stalled(self) -> Self {
        self.stalled.store(true, Ordering::SeqCst);
        self
    }

    /// Offer block signatures of the served data
    pub fn with_parts_record(mut self, block_size: u64) -> Self {
        self.parts_record = Some(parts_record(&self.data, block_size));
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Ranges answered so far, as (offset, length)
    pub fn served(&self) -> Vec<(u64, u64)> {
        self.served.lock().clone()
    }

    /// Chunk indices answered so far
    pub fn served_chunks(&self, chunk_size: u64) -> BTreeSet<u64> {
        self.served().iter().map(|(offset, _)| offset / chunk_size).collect()
    }

    pub fn messages(&self) -> Vec<TransferMessage> {
        self.messages.lock().clone()
    }

    async fn answer(&self, offset: u64, length: u64) -> Result<ByteStream> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::PeerDisconnected(self.id.clone()));
        }
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        if matches!(self.disconnect_after, Some(limit) if n >= limit) {
            self.disconnect();
            return Err(SyncError::PeerDisconnected(self.id.clone()));
        }
        let refused = self
            .refuse_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::PeerRefused {
                peer: self.id.clone(),
                message: "busy".into(),
            });
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.stalled.load(Ordering::SeqCst) {
            return Ok(futures::stream::pending().boxed());
        }

        let start = offset.min(self.data.len() as u64) as usize;
        let end = offset.saturating_add(length).min(self.data.len() as u64) as usize;
        self.served.lock().push((offset, (end - start) as u64));
        let body = self.data.slice(start..end);
        let pieces: Vec<Result<Bytes>> = (0..body.len())
            .step_by(PIECE)
            .map(|i| Ok(body.slice(i..(i + PIECE).min(body.len()))))
            .collect();
        Ok(futures::stream::iter(pieces).boxed())
    }
}

impl Peer for MemoryPeer {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn supports_part_requests(&self) -> bool {
        self.parts
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_lan(&self) -> bool {
        self.lan
    }

    fn bandwidth_estimate(&self) -> u64 {
        self.bandwidth
    }

    fn request_range<'a>(
        &'a self,
        _version: &'a FileVersion,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'a, Result<ByteStream>> {
        self.answer(offset, length).boxed()
    }

    fn request_parts_record<'a>(
        &'a self,
        _version: &'a FileVersion,
        block_size: u64,
    ) -> BoxFuture<'a, Result<Option<PartsRecord>>> {
        let record = self
            .parts_record
            .clone()
            .filter(|r| r.block_size == block_size);
        async move { Ok(record) }.boxed()
    }

    fn send(&self, message: TransferMessage) -> BoxFuture<'_, Result<()>> {
        self.messages.lock().push(message);
        async { Ok(()) }.boxed()
    }
}

/// Deterministic content without repeating blocks
pub fn content(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn parts_record(data: &[u8], block_size: u64) -> PartsRecord {
    PartsRecord {
        block_size,
        file_length: data.len() as u64,
        blocks: data.chunks(block_size as usize).map(digest_block).collect(),
    }
}

/// Version of `path` describing `data`
pub fn version_of(path: &str, data: &[u8], version: u64) -> FileVersion {
    FileVersion::new(path, data.len() as u64, version)
        .with_hash(sha256_hex(data))
        .modified(PeerId::from("origin"), chrono::Utc::now() - chrono::Duration::minutes(10))
}

/// Wait for the first event of `id` accepted by `pred`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<TransferEvent>,
    id: TransferId,
    mut pred: F,
) -> TransferEvent
where
    F: FnMut(&TransferEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.transfer_id() == Some(id) && pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `check` until it holds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

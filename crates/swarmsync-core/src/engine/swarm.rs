//! Swarm coordinator - drives one download across many sources
//!
//! The coordinator owns the chunk pool of a download. It hands every
//! part-capable source its own worker, falls back to a single whole-file
//! stream when no source can serve ranges, reuses blocks of stale local data
//! before fetching anything, and verifies the assembled file before promoting
//! it to its final path.

use super::chunks::{ChunkPool, ChunkState};
use super::delta::{self, BlockMatch};
use super::governor::BandwidthGovernor;
use super::partial::{PartialStore, ResumeOutcome};
use super::source_worker::{SourceExit, SourceMode, SourceStats, SourceWorker, SwarmShared};
use super::throttle::Throttle;
use super::transfer::TransferRecord;
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::peer::SharedPeer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use swarmsync_types::{
    Direction, FileVersion, PartsRecord, PeerId, Settings, TrafficClass, TransferEvent,
    TransferProblem, TransferState,
};
use tokio::fs::File;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Tuning of a single swarmed download
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub chunk_size: u64,
    pub max_requests_per_source: usize,
    pub stall_timeout: Duration,
    /// Smaller files are always fetched as one whole-file stream
    pub min_size_for_part_transfers: u64,
    pub progress_interval: Duration,
    pub persist_interval: Duration,
    pub keep_partial_on_abort: bool,
}

impl SwarmConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            chunk_size: settings.chunk_size.max(1),
            max_requests_per_source: settings.max_requests_per_source.max(1) as usize,
            stall_timeout: Duration::from_secs(settings.stall_timeout_secs.max(1)),
            min_size_for_part_transfers: settings.min_size_for_part_transfers,
            keep_partial_on_abort: settings.keep_partial_on_abort,
            ..Self::default()
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_requests_per_source: 2,
            stall_timeout: Duration::from_secs(30),
            min_size_for_part_transfers: 8 * 1024,
            progress_interval: Duration::from_millis(500),
            persist_interval: Duration::from_secs(2),
            keep_partial_on_abort: true,
        }
    }
}

/// Requests sent to a running coordinator
#[derive(Clone)]
pub enum SwarmCommand {
    AddSource(SharedPeer),
    RemoveSource(PeerId),
}

/// How a download ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmOutcome {
    Completed(PathBuf),
    Broken(TransferProblem),
    Aborted(Option<TransferProblem>),
}

/// Control side of a running coordinator
#[derive(Clone)]
pub struct SwarmHandle {
    record: Arc<TransferRecord>,
    tx: mpsc::UnboundedSender<SwarmCommand>,
    stats: Arc<Mutex<HashMap<PeerId, Arc<SourceStats>>>>,
    finished: CancellationToken,
}

impl SwarmHandle {
    pub fn record(&self) -> &Arc<TransferRecord> {
        &self.record
    }

    /// Returns false once the coordinator has stopped
    pub fn add_source(&self, peer: SharedPeer) -> bool {
        self.tx.send(SwarmCommand::AddSource(peer)).is_ok()
    }

    pub fn remove_source(&self, peer: &PeerId) -> bool {
        self.tx.send(SwarmCommand::RemoveSource(peer.clone())).is_ok()
    }

    /// Delivery counters of every source that ran a worker
    pub fn source_stats(&self) -> HashMap<PeerId, Arc<SourceStats>> {
        self.stats.lock().clone()
    }

    /// Cancelled once the coordinator is gone, after its last write to the
    /// partial and its metadata
    pub fn finished(&self) -> CancellationToken {
        self.finished.clone()
    }
}

struct ActiveSource {
    cancel: CancellationToken,
    mode: SourceMode,
}

pub struct SwarmCoordinator {
    record: Arc<TransferRecord>,
    store: PartialStore,
    governor: BandwidthGovernor,
    events: EventBus,
    config: SwarmConfig,
    commands: mpsc::UnboundedReceiver<SwarmCommand>,
    known: HashMap<PeerId, SharedPeer>,
    standby: Vec<PeerId>,
    active: HashMap<PeerId, ActiveSource>,
    stats: Arc<Mutex<HashMap<PeerId, Arc<SourceStats>>>>,
    /// Coordinators of older versions of the same path that must stop first
    predecessors: Vec<CancellationToken>,
    _finished: DropGuard,
}

impl SwarmCoordinator {
    pub fn new(
        record: Arc<TransferRecord>,
        store: PartialStore,
        governor: BandwidthGovernor,
        events: EventBus,
        config: SwarmConfig,
        sources: Vec<SharedPeer>,
    ) -> (Self, SwarmHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(HashMap::new()));
        let finished = CancellationToken::new();
        let handle = SwarmHandle {
            record: Arc::clone(&record),
            tx,
            stats: Arc::clone(&stats),
            finished: finished.clone(),
        };
        let mut coordinator = Self {
            record,
            store,
            governor,
            events,
            config,
            commands,
            known: HashMap::new(),
            standby: Vec::new(),
            active: HashMap::new(),
            stats,
            predecessors: Vec::new(),
            _finished: finished.drop_guard(),
        };
        for peer in sources {
            coordinator.learn(peer);
        }
        (coordinator, handle)
    }

    fn version(&self) -> &FileVersion {
        self.record.version()
    }

    /// Hold off touching the partial until `finished` is cancelled
    pub fn wait_for(&mut self, finished: CancellationToken) {
        self.predecessors.push(finished);
    }

    /// Run the download to its end and settle the record
    pub async fn run(mut self) -> SwarmOutcome {
        if let Err(e) = self.record.set_started() {
            debug!("Not starting {}: {}", self.version().path, e);
            return SwarmOutcome::Aborted(self.record.problem());
        }

        let reporter = spawn_progress_reporter(
            Arc::clone(&self.record),
            self.events.clone(),
            self.config.progress_interval,
        );
        let result = self.execute().await;
        reporter.abort();

        let outcome = match result {
            Ok(path) if self.record.complete() => SwarmOutcome::Completed(path),
            Ok(_) => SwarmOutcome::Aborted(self.record.problem()),
            Err(e) => {
                if !matches!(e, SyncError::Aborted) {
                    self.record.fail(&e);
                }
                match self.record.state() {
                    TransferState::Broken => SwarmOutcome::Broken(
                        self.record.problem().unwrap_or(TransferProblem::General),
                    ),
                    _ => SwarmOutcome::Aborted(self.record.problem()),
                }
            }
        };

        if let SwarmOutcome::Aborted(problem) = &outcome {
            self.settle_partial(*problem).await;
        }
        outcome
    }

    async fn execute(&mut self) -> Result<PathBuf> {
        // Both versions share the partial path and its metadata row
        for previous in std::mem::take(&mut self.predecessors) {
            tokio::select! {
                _ = self.record.cancelled() => return Err(SyncError::Aborted),
                _ = previous.cancelled() => {}
            }
        }

        let version = self.version().clone();
        let prepared = self.store.prepare(&version, self.config.chunk_size).await?;
        if let ResumeOutcome::Resumed { bytes } = prepared.outcome {
            info!("Resuming {} with {} bytes on disk", version.path, bytes);
        }
        self.record.set_transferred(prepared.pool.available_bytes());

        let partial_path = prepared.path.clone();
        let pool = Arc::new(Mutex::new(prepared.pool));
        let parts = self.fetch_parts_record().await;

        // Block reuse from a stale partial and from an older local copy
        let mut candidates = Vec::new();
        if let Some(stale) = prepared.stale.clone() {
            candidates.push(stale);
        }
        if tokio::fs::try_exists(&prepared.final_path).await? {
            candidates.push(prepared.final_path.clone());
        }
        if let Some(parts) = parts.as_ref() {
            for candidate in &candidates {
                if pool.lock().is_complete() {
                    break;
                }
                self.reuse_blocks(candidate, &partial_path, parts, &pool).await?;
            }
        }
        if let Some(stale) = prepared.stale.as_deref() {
            self.store.drop_stale(stale).await?;
        }

        let shared = SwarmShared {
            version: version.clone(),
            partial_path: partial_path.clone(),
            pool: Arc::clone(&pool),
            pool_changed: Arc::new(Notify::new()),
            record: Arc::clone(&self.record),
            stall_timeout: self.config.stall_timeout,
        };
        self.fetch_missing(&shared).await?;
        let snapshot = pool.lock().clone();
        self.store.save_progress(&version, &snapshot).await?;

        self.record.transition(TransferState::Verifying)?;
        self.verify(&partial_path, parts.as_ref(), &pool).await?;

        if self.record.is_finished() {
            return Err(SyncError::Aborted);
        }
        self.store.promote(&version).await
    }

    /// Ask known sources for block signatures matching our chunk size
    async fn fetch_parts_record(&self) -> Option<PartsRecord> {
        let version = self.version();
        for peer in self.known.values() {
            let request = peer.request_parts_record(version, self.config.chunk_size);
            match tokio::time::timeout(self.config.stall_timeout, request).await {
                Ok(Ok(Some(record)))
                    if record.block_size == self.config.chunk_size
                        && record.file_length == version.size =>
                {
                    debug!("Got parts record for {} from {}", version.path, peer.id());
                    return Some(record);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("No parts record from {}: {}", peer.id(), e),
                Err(_) => debug!("Parts record request to {} timed out", peer.id()),
            }
        }
        None
    }

    /// MATCHING then COPYING: scan `candidate` for blocks still needed and
    /// copy them into the partial
    async fn reuse_blocks(
        &self,
        candidate: &Path,
        partial_path: &Path,
        parts: &PartsRecord,
        pool: &Arc<Mutex<ChunkPool>>,
    ) -> Result<()> {
        self.record.transition(TransferState::Matching)?;
        let matches: Vec<BlockMatch> = match File::open(candidate).await {
            Ok(file) => delta::find_matches(parts, file).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let matches: Vec<BlockMatch> = {
            let pool = pool.lock();
            matches
                .into_iter()
                .filter(|m| pool.state(m.block) != Some(&ChunkState::Available))
                .collect()
        };

        if !matches.is_empty() {
            self.record.transition(TransferState::Copying)?;
            let copied = delta::apply_matches(candidate, partial_path, parts, &matches).await?;
            {
                let mut pool = pool.lock();
                for m in &matches {
                    pool.mark_available(m.block);
                }
            }
            self.record.add_transferred(copied);
            let snapshot = pool.lock().clone();
            self.store.save_progress(self.version(), &snapshot).await?;
            info!(
                "Reused {} block(s) ({} bytes) of {} from {}",
                matches.len(),
                copied,
                self.version().path,
                candidate.display()
            );
        }
        self.record.transition(TransferState::Started)?;
        Ok(())
    }

    /// Fan out to sources until every chunk is available
    async fn fetch_missing(&mut self, shared: &SwarmShared) -> Result<()> {
        let mut workers: JoinSet<(PeerId, SourceExit)> = JoinSet::new();
        let period = self.config.persist_interval;
        let mut persist = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let cancel = self.record.cancel_token().clone();

        // Sources added while the download was queued
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }

        let result = loop {
            if shared.pool.lock().is_complete() {
                break Ok(());
            }
            if workers.is_empty() {
                self.dispatch(shared, &mut workers);
                if workers.is_empty() {
                    break Err(SyncError::NoSources(self.version().path.clone()));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break Err(SyncError::Aborted),
                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                    self.dispatch(shared, &mut workers);
                }
                Some(joined) = workers.join_next() => {
                    let (peer, exit) = match joined {
                        Ok(done) => done,
                        Err(e) => break Err(SyncError::InvalidOperation(format!("source worker failed: {}", e))),
                    };
                    if let Err(e) = self.handle_exit(peer, exit) {
                        break Err(e);
                    }
                    self.dispatch(shared, &mut workers);
                }
                _ = persist.tick() => {
                    let snapshot = shared.pool.lock().clone();
                    if let Err(e) = self.store.save_progress(self.version(), &snapshot).await {
                        warn!("Failed to save progress of {}: {}", self.version().path, e);
                    }
                }
            }
        };

        for source in self.active.values() {
            source.cancel.cancel();
        }
        while workers.join_next().await.is_some() {}
        self.active.clear();

        if result.is_err() {
            let snapshot = shared.pool.lock().clone();
            if let Err(e) = self.store.save_progress(self.version(), &snapshot).await {
                warn!("Failed to save progress of {}: {}", self.version().path, e);
            }
        }
        result
    }

    /// Register a peer as a potential source
    fn learn(&mut self, peer: SharedPeer) {
        let id = peer.id().clone();
        if self.known.contains_key(&id) {
            return;
        }
        self.record.add_peer(id.clone());
        self.known.insert(id.clone(), peer);
        self.standby.push(id);
    }

    fn forget(&mut self, peer: &PeerId) {
        self.known.remove(peer);
        self.standby.retain(|p| p != peer);
        self.record.remove_peer(peer);
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::AddSource(peer) => {
                info!("Source {} added to {}", peer.id(), self.version().path);
                self.learn(peer);
            }
            SwarmCommand::RemoveSource(peer) => {
                if let Some(source) = self.active.get(&peer) {
                    source.cancel.cancel();
                }
                info!("Source {} removed from {}", peer, self.version().path);
                self.forget(&peer);
            }
        }
    }

    fn handle_exit(&mut self, peer: PeerId, exit: SourceExit) -> Result<()> {
        self.active.remove(&peer);
        match exit {
            SourceExit::Finished => debug!("Source {} has nothing left to fetch", peer),
            SourceExit::Cancelled => debug!("Source {} stopped", peer),
            SourceExit::Lost(e) => {
                warn!("Lost source {} for {}: {}", peer, self.version().path, e);
                self.forget(&peer);
            }
            SourceExit::Failed(e) => {
                error!("Writing {} failed: {}", self.version().path, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Start workers for standby sources.
    ///
    /// Part mode runs every part-capable source at once. Otherwise a single
    /// whole-file stream runs from the source with the best bandwidth
    /// estimate, first known on ties.
    fn dispatch(&mut self, shared: &SwarmShared, workers: &mut JoinSet<(PeerId, SourceExit)>) {
        let disconnected: Vec<PeerId> = self
            .standby
            .iter()
            .filter(|id| !self.known[*id].is_connected())
            .cloned()
            .collect();
        for id in disconnected {
            debug!("Dropping disconnected source {}", id);
            self.forget(&id);
        }

        let whole_running = self
            .active
            .values()
            .any(|s| s.mode == SourceMode::WholeFile);
        if whole_running || self.record.is_finished() {
            return;
        }

        let part_sized = self.version().size >= self.config.min_size_for_part_transfers;
        let capable: Vec<PeerId> = if part_sized {
            self.standby
                .iter()
                .filter(|id| self.known[*id].supports_part_requests())
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        if !capable.is_empty() {
            let mode = SourceMode::Parts {
                max_outstanding: self.config.max_requests_per_source,
            };
            for id in capable {
                self.spawn_worker(&id, mode, shared, workers);
            }
            return;
        }

        if !self.active.is_empty() {
            return;
        }
        let best = self
            .standby
            .iter()
            .enumerate()
            .max_by_key(|(i, id)| (self.known[*id].bandwidth_estimate(), std::cmp::Reverse(*i)))
            .map(|(_, id)| id.clone());
        if let Some(id) = best {
            self.spawn_worker(&id, SourceMode::WholeFile, shared, workers);
        }
    }

    fn spawn_worker(
        &mut self,
        id: &PeerId,
        mode: SourceMode,
        shared: &SwarmShared,
        workers: &mut JoinSet<(PeerId, SourceExit)>,
    ) {
        let Some(peer) = self.known.get(id).cloned() else {
            return;
        };
        self.standby.retain(|p| p != id);

        let cancel = self.record.cancel_token().child_token();
        let class = TrafficClass::for_transfer(Direction::Download, peer.is_lan());
        let throttle =
            Throttle::new(self.governor.clone(), class).with_cancellation(cancel.clone());
        let stats = Arc::clone(
            self.stats
                .lock()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(SourceStats::new())),
        );

        let worker = SourceWorker::new(
            peer,
            shared.clone(),
            throttle,
            Arc::clone(&stats),
            cancel.clone(),
            mode,
        );
        let peer_id = id.clone();
        workers.spawn(async move { (peer_id, worker.run().await) });
        self.active.insert(id.clone(), ActiveSource { cancel, mode });
    }

    /// Whole-file check against the version's content hash. A mismatch puts
    /// the differing chunks back into the pool.
    async fn verify(
        &self,
        partial_path: &Path,
        parts: Option<&PartsRecord>,
        pool: &Arc<Mutex<ChunkPool>>,
    ) -> Result<()> {
        let version = self.version();
        if version.content_hash.is_empty() {
            return Ok(());
        }
        let actual = delta::hash_file(partial_path).await?;
        if actual.eq_ignore_ascii_case(&version.content_hash) {
            return Ok(());
        }

        let bad = self.find_bad_chunks(partial_path, parts, pool).await?;
        warn!(
            "Verification of {} failed, {} chunk(s) to fetch again",
            version.path,
            bad.len()
        );
        let snapshot = {
            let mut pool = pool.lock();
            for index in &bad {
                pool.mark_needed(*index);
            }
            self.record.set_transferred(pool.available_bytes());
            pool.clone()
        };
        self.store.save_progress(version, &snapshot).await?;

        Err(SyncError::ChecksumMismatch {
            path: version.path.clone(),
            expected: version.content_hash.clone(),
            actual,
        })
    }

    async fn find_bad_chunks(
        &self,
        partial_path: &Path,
        parts: Option<&PartsRecord>,
        pool: &Arc<Mutex<ChunkPool>>,
    ) -> Result<Vec<usize>> {
        let ranges: Vec<_> = {
            let pool = pool.lock();
            (0..pool.chunk_count()).map(|i| pool.range(i)).collect()
        };
        let Some(parts) = parts else {
            return Ok(ranges.iter().map(|r| r.index).collect());
        };

        let mut file = File::open(partial_path).await?;
        let mut bad = Vec::new();
        for range in ranges {
            let expected = parts.blocks.get(range.index).map(|b| b.strong.as_str());
            let actual = delta::hash_range(&mut file, range.offset, range.length).await.ok();
            if actual.as_deref() != expected {
                bad.push(range.index);
            }
        }
        Ok(bad)
    }

    /// Decide what happens to the partial of an aborted download
    async fn settle_partial(&self, problem: Option<TransferProblem>) {
        let discard = match problem {
            Some(TransferProblem::LocalModification | TransferProblem::TargetDeleted) => true,
            // Kept for block reuse by the newer version
            Some(TransferProblem::Superseded) => false,
            _ => !self.config.keep_partial_on_abort,
        };
        if discard {
            if let Err(e) = self.store.discard(&self.version().path).await {
                warn!("Failed to discard partial of {}: {}", self.version().path, e);
            }
        }
    }
}

/// Emit progress with a smoothed speed until the record finishes
fn spawn_progress_reporter(
    record: Arc<TransferRecord>,
    events: EventBus,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        const ALPHA: f64 = 0.3;
        let total = record.version().size;
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        let mut last = record.transferred();
        let mut last_at = tokio::time::Instant::now();
        let mut speed = 0.0f64;

        loop {
            tokio::select! {
                _ = record.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = tokio::time::Instant::now();
            let transferred = record.transferred();
            let elapsed = now.duration_since(last_at).as_secs_f64();
            if elapsed > 0.0 {
                let instant = transferred.saturating_sub(last) as f64 / elapsed;
                speed = if speed == 0.0 {
                    instant
                } else {
                    ALPHA * instant + (1.0 - ALPHA) * speed
                };
            }
            let rounded = speed as u64;
            let eta = (rounded > 0).then(|| total.saturating_sub(transferred) / rounded);

            events.emit(TransferEvent::Progress {
                id: record.id(),
                transferred,
                total,
                speed: rounded,
                eta,
            });
            last = transferred;
            last_at = now;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = Settings {
            chunk_size: 0,
            max_requests_per_source: 3,
            stall_timeout_secs: 5,
            keep_partial_on_abort: false,
            ..Settings::default()
        };
        let config = SwarmConfig::from_settings(&settings);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.max_requests_per_source, 3);
        assert_eq!(config.stall_timeout, Duration::from_secs(5));
        assert!(!config.keep_partial_on_abort);
        assert_eq!(config.progress_interval, Duration::from_millis(500));
    }
}

//! SwarmSync Core - transfer engine for peer-to-peer folder sync
//!
//! This crate moves file content between peers: bandwidth-governed streams,
//! swarmed multi-source downloads, priority scheduling and resumable,
//! version-aware partial files. Peer discovery and wire encoding are left to
//! the messaging layer, which hands the core connected [`Peer`]s.

pub mod engine;
mod error;
mod events;
mod http_peer;
mod peer;
mod scheduler;
mod storage;
mod versioning;

pub use error::*;
pub use events::*;
pub use http_peer::*;
pub use peer::*;
pub use scheduler::*;
pub use storage::*;
pub use versioning::*;

use engine::{
    local_copy_verified, open_range, BandwidthGovernor, PartialStore, ScanReport, SwarmConfig,
    SwarmCoordinator, SwarmHandle, SwarmOutcome, Throttle, TransferDatabase, TransferRecord,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarmsync_types::{
    Direction, FileVersion, PeerId, Priority, Settings, TrafficClass, TransferEvent, TransferId,
    TransferMessage, TransferProblem, TransferState, TransferSummary,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What `TransferCore::start` found on disk
#[derive(Debug, Default, Clone)]
pub struct StartupReport {
    pub partials: ScanReport,
    /// Downloads that were running when the core last stopped
    pub interrupted: usize,
}

struct DownloadEntry {
    record: Arc<TransferRecord>,
    handle: SwarmHandle,
}

struct UploadEntry {
    record: Arc<TransferRecord>,
    peer: SharedPeer,
    local_path: PathBuf,
}

struct CoreInner {
    settings: RwLock<Settings>,
    storage: Storage,
    db: TransferDatabase,
    partials: RwLock<PartialStore>,
    governor: BandwidthGovernor,
    events: EventBus,
    peers: RwLock<HashMap<PeerId, SharedPeer>>,
    /// Peers advertising the newest known version of a path
    availability: RwLock<HashMap<String, Vec<PeerId>>>,
    local_versions: VersionTracker,
    remote_versions: VersionTracker,
    downloads: RwLock<HashMap<TransferId, DownloadEntry>>,
    /// Coordinators waiting for a download slot
    staged: Mutex<HashMap<TransferId, SwarmCoordinator>>,
    uploads: RwLock<HashMap<TransferId, UploadEntry>>,
    completed_downloads: RwLock<Vec<TransferSummary>>,
    completed_uploads: RwLock<Vec<TransferSummary>>,
    download_slots: PriorityScheduler,
    upload_slots: PriorityScheduler,
    file_priorities: RwLock<HashMap<String, Priority>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The transfer core, cheap to clone
#[derive(Clone)]
pub struct TransferCore {
    inner: Arc<CoreInner>,
}

impl TransferCore {
    /// Open the core with the settings stored in `data_dir`
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        Self::open(storage, settings).await
    }

    /// Open the core with explicit settings (they are not saved)
    pub async fn with_settings(data_dir: PathBuf, settings: Settings) -> Result<Self> {
        let storage = Storage::new(data_dir).await?;
        Self::open(storage, settings).await
    }

    async fn open(storage: Storage, settings: Settings) -> Result<Self> {
        let db = TransferDatabase::new(storage.database_path()).await?;
        let partials = PartialStore::new(
            settings.download_root.clone(),
            db.clone(),
            settings.mtime_tolerance_ms,
        );
        let governor = BandwidthGovernor::new(Duration::from_millis(settings.tick_period_ms.max(1)));
        for class in TrafficClass::ALL {
            governor.set_rate(class, settings.rate_for(class));
        }

        let inner = CoreInner {
            download_slots: PriorityScheduler::new(
                "download",
                settings.max_concurrent_downloads as usize,
            ),
            upload_slots: PriorityScheduler::new("upload", settings.max_concurrent_uploads as usize),
            settings: RwLock::new(settings),
            storage,
            db,
            partials: RwLock::new(partials),
            governor,
            events: EventBus::default(),
            peers: RwLock::new(HashMap::new()),
            availability: RwLock::new(HashMap::new()),
            local_versions: VersionTracker::new(),
            remote_versions: VersionTracker::new(),
            downloads: RwLock::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
            uploads: RwLock::new(HashMap::new()),
            completed_downloads: RwLock::new(Vec::new()),
            completed_uploads: RwLock::new(Vec::new()),
            file_priorities: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Start background work and reconcile what the last run left behind.
    ///
    /// Orphaned and expired partial files are removed, completed transfers
    /// are loaded, and downloads that were interrupted are marked broken so
    /// the next advertisement of their version resumes them.
    pub async fn start(&self) -> Result<StartupReport> {
        let governor_task = self.inner.governor.start();
        let stats_task = self.spawn_stats_forwarder();
        let persister = self.spawn_persister();
        self.inner
            .tasks
            .lock()
            .extend([governor_task, stats_task, persister]);

        let grace = Duration::from_secs(self.settings().partial_grace_period_hours * 3600);
        let partials = self.partials().scan(grace).await?;

        let mut interrupted = 0;
        for summary in self.inner.db.load_all_transfers().await? {
            match (summary.direction, summary.state) {
                (Direction::Download, TransferState::Completed) => {
                    self.inner.local_versions.accept(summary.version.clone());
                    self.inner.completed_downloads.write().push(summary);
                }
                (Direction::Upload, TransferState::Completed) => {
                    self.inner.completed_uploads.write().push(summary);
                }
                (_, state) if state.is_terminal() || state == TransferState::Broken => {}
                (direction, _) => {
                    let record = TransferRecord::restore(summary, self.inner.events.clone());
                    if direction == Direction::Download {
                        self.inner.remote_versions.accept(record.version().clone());
                        record.set_broken(TransferProblem::BrokenDownload, "interrupted");
                        interrupted += 1;
                    } else {
                        record.abort(Some(TransferProblem::PeerDisconnected));
                    }
                    self.inner.db.upsert_transfer(&record.summary()).await?;
                }
            }
        }

        info!(
            "Transfer core started: {} partial(s) kept, {} interrupted download(s)",
            partials.kept.len(),
            interrupted
        );
        Ok(StartupReport {
            partials,
            interrupted,
        })
    }

    /// Stop background tasks and persist every live transfer
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.governor.shutdown();
        let records: Vec<_> = self
            .inner
            .downloads
            .read()
            .values()
            .map(|d| Arc::clone(&d.record))
            .chain(self.inner.uploads.read().values().map(|u| Arc::clone(&u.record)))
            .collect();
        for record in records {
            self.persist(&record).await;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Transfer core stopped");
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn TransferObserver>) -> ObserverId {
        self.inner.events.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.events.remove_observer(id)
    }

    /// Forward governor statistics to observers
    fn spawn_stats_forwarder(&self) -> JoinHandle<()> {
        let mut stats = self.inner.governor.subscribe_stats();
        let events = self.inner.events.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    stat = stats.recv() => match stat {
                        Ok(stat) => events.emit(TransferEvent::BandwidthStats { stat }),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Write a snapshot of every record whose state changed
    fn spawn_persister(&self) -> JoinHandle<()> {
        let core = self.clone();
        let mut events = self.inner.events.subscribe();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(TransferEvent::Progress { .. } | TransferEvent::BandwidthStats { .. }) => {}
                    Ok(TransferEvent::RemovedFromCompleted { id }) => {
                        if let Err(e) = core.inner.db.delete_transfer(id).await {
                            warn!("Failed to delete transfer {}: {}", id, e);
                        }
                    }
                    Ok(event) => {
                        if let Some(record) = event.transfer_id().and_then(|id| core.record(id)) {
                            core.persist(&record).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Persister skipped {} events", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn persist(&self, record: &TransferRecord) {
        if let Err(e) = self.inner.db.upsert_transfer(&record.summary()).await {
            warn!("Failed to persist transfer {}: {}", record.id(), e);
        }
    }

    // ========================================================================
    // Peers & versions
    // ========================================================================

    pub fn add_peer(&self, peer: SharedPeer) {
        let id = peer.id().clone();
        if self.inner.peers.write().insert(id.clone(), peer).is_none() {
            debug!("Peer {} connected", id);
        }
    }

    pub fn peer(&self, id: &PeerId) -> Option<SharedPeer> {
        self.inner.peers.read().get(id).cloned()
    }

    /// Forget a peer: it stops being a source and its uploads break
    pub async fn remove_peer(&self, id: &PeerId) {
        if self.inner.peers.write().remove(id).is_none() {
            return;
        }
        info!("Peer {} disconnected", id);
        for peers in self.inner.availability.write().values_mut() {
            peers.retain(|p| p != id);
        }

        for entry in self.inner.downloads.read().values() {
            if entry.record.has_peer(id) {
                entry.handle.remove_source(id);
            }
        }

        let broken: Vec<TransferId> = self
            .inner
            .uploads
            .read()
            .iter()
            .filter(|(_, u)| u.peer.id() == id)
            .map(|(id, _)| *id)
            .collect();
        for upload in broken {
            if let Some(record) = self.record(upload) {
                record.set_broken(TransferProblem::PeerDisconnected, format!("{} went away", id));
            }
            self.finish_upload(upload).await;
        }
    }

    /// A peer advertises `version`.
    ///
    /// Joins a running download of the same version as a source, supersedes
    /// a download of an older version, or requests a new download when the
    /// local copy is behind. Returns the download the peer now serves.
    pub async fn peer_has_file(
        &self,
        peer: SharedPeer,
        version: FileVersion,
    ) -> Result<Option<TransferId>> {
        self.add_peer(Arc::clone(&peer));
        let peer_id = peer.id().clone();

        if version.deleted {
            if let VersionUpdate::Accepted { .. } = self.inner.remote_versions.accept(version.clone())
            {
                info!("{} was deleted by {}", version.path, peer_id);
                self.inner.availability.write().remove(&version.path);
                self.abort_downloads_of(&version.path, TransferProblem::TargetDeleted, "deleted remotely")
                    .await;
            }
            return Ok(None);
        }

        match self.inner.remote_versions.accept(version.clone()) {
            VersionUpdate::Stale { current } => {
                debug!(
                    "{} offers version {} of {}, {} is known",
                    peer_id, version.version, version.path, current.version
                );
                return Ok(None);
            }
            VersionUpdate::Unchanged => {
                let mut availability = self.inner.availability.write();
                let peers = availability.entry(version.path.clone()).or_default();
                if !peers.contains(&peer_id) {
                    peers.push(peer_id.clone());
                }
            }
            VersionUpdate::Accepted { .. } => {
                self.inner
                    .availability
                    .write()
                    .insert(version.path.clone(), vec![peer_id.clone()]);
                let superseded: Vec<Arc<TransferRecord>> = self
                    .inner
                    .downloads
                    .read()
                    .values()
                    .filter(|d| d.record.version().is_superseded_by(&version))
                    .map(|d| Arc::clone(&d.record))
                    .collect();
                for record in superseded {
                    info!(
                        "Version {} of {} supersedes the running download of {}",
                        version.version,
                        version.path,
                        record.version().version
                    );
                    self.abort_record(&record, TransferProblem::Superseded, "newer version available")
                        .await;
                }
            }
        }

        if let Some(entry) = self.find_download(&version) {
            entry.handle.add_source(peer);
            return Ok(Some(entry.record.id()));
        }
        if !self.local_is_behind(&version) {
            return Ok(None);
        }
        self.request_download(version, vec![peer], None).await.map(Some)
    }

    /// The local copy of a file changed. Transfers of other content for that
    /// path are aborted and their partials dropped.
    pub async fn local_file_changed(&self, version: FileVersion) {
        self.inner.local_versions.accept(version.clone());
        let tolerance = self.settings().mtime_tolerance_ms;

        self.abort_downloads_of(&version.path, TransferProblem::LocalModification, "local file changed")
            .await;

        let stale_uploads: Vec<TransferId> = self
            .inner
            .uploads
            .read()
            .iter()
            .filter(|(_, u)| {
                u.record.version().path == version.path
                    && !u.record.version().same_content(&version, tolerance)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale_uploads {
            if let Some(entry) = self.upload_entry(id) {
                entry
                    .record
                    .abort_with(TransferProblem::LocalModification, "local file changed");
                let _ = entry
                    .peer
                    .send(TransferMessage::AbortUpload {
                        version: entry.record.version().clone(),
                    })
                    .await;
            }
            self.finish_upload(id).await;
        }
    }

    fn local_is_behind(&self, version: &FileVersion) -> bool {
        match self.inner.local_versions.latest(&version.path) {
            Some(local) => local.compare_version(version) == Some(std::cmp::Ordering::Less),
            None => true,
        }
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Queue a download of `version` from `sources`
    pub async fn request_download(
        &self,
        version: FileVersion,
        sources: Vec<SharedPeer>,
        priority: Option<Priority>,
    ) -> Result<TransferId> {
        self.spawn_download(version, sources, priority, 0).await
    }

    async fn spawn_download(
        &self,
        version: FileVersion,
        sources: Vec<SharedPeer>,
        priority: Option<Priority>,
        retry_count: u32,
    ) -> Result<TransferId> {
        if version.deleted {
            return Err(SyncError::TargetDeleted(version.path));
        }
        // Refuses bad paths before anything is created
        self.partials().final_path(&version)?;
        if let VersionUpdate::Stale { current } = self.inner.remote_versions.accept(version.clone()) {
            return Err(SyncError::Superseded {
                path: version.path,
                version: current.version,
            });
        }

        if let Some(entry) = self.find_download(&version) {
            for peer in sources {
                entry.handle.add_source(peer);
            }
            return Ok(entry.record.id());
        }
        let older: Vec<(Arc<TransferRecord>, CancellationToken)> = self
            .inner
            .downloads
            .read()
            .values()
            .filter(|d| d.record.version().path == version.path)
            .map(|d| (Arc::clone(&d.record), d.handle.finished()))
            .collect();
        for (record, _) in &older {
            self.abort_record(record, TransferProblem::Superseded, "newer version requested")
                .await;
        }

        {
            let mut availability = self.inner.availability.write();
            let known = availability.entry(version.path.clone()).or_default();
            for peer in &sources {
                if !known.contains(peer.id()) {
                    known.push(peer.id().clone());
                }
            }
        }
        for peer in &sources {
            self.add_peer(Arc::clone(peer));
        }

        let priority = priority
            .or_else(|| self.inner.file_priorities.read().get(&version.path).copied())
            .unwrap_or_default();
        let record = TransferRecord::with_retry_count(
            Direction::Download,
            version,
            priority,
            retry_count,
            self.inner.events.clone(),
        );
        let id = record.id();
        let (mut coordinator, handle) = SwarmCoordinator::new(
            Arc::clone(&record),
            self.partials(),
            self.inner.governor.clone(),
            self.inner.events.clone(),
            SwarmConfig::from_settings(&self.settings()),
            sources,
        );
        for (_, finished) in older {
            coordinator.wait_for(finished);
        }

        self.inner.downloads.write().insert(
            id,
            DownloadEntry {
                record: Arc::clone(&record),
                handle,
            },
        );
        self.inner.staged.lock().insert(id, coordinator);
        record.set_queued()?;
        self.persist(&record).await;
        self.inner.download_slots.enqueue(id, priority);
        self.schedule();
        Ok(id)
    }

    fn find_download(&self, version: &FileVersion) -> Option<DownloadEntry> {
        let tolerance = self.settings().mtime_tolerance_ms;
        self.inner
            .downloads
            .read()
            .values()
            .find(|d| !d.record.is_finished() && d.record.version().same_content(version, tolerance))
            .map(|d| DownloadEntry {
                record: Arc::clone(&d.record),
                handle: d.handle.clone(),
            })
    }

    async fn abort_downloads_of(&self, path: &str, problem: TransferProblem, info: &str) {
        let records: Vec<Arc<TransferRecord>> = self
            .inner
            .downloads
            .read()
            .values()
            .filter(|d| d.record.version().path == path)
            .map(|d| Arc::clone(&d.record))
            .collect();
        for record in records {
            self.abort_record(&record, problem, info).await;
        }
    }

    /// Abort a download with a problem. Queued downloads are cleaned up
    /// here, running ones by their coordinator.
    async fn abort_record(&self, record: &Arc<TransferRecord>, problem: TransferProblem, info: &str) {
        if !record.abort_with(problem, info) {
            return;
        }
        let id = record.id();
        let staged = self.inner.staged.lock().remove(&id);
        if staged.is_some() {
            self.inner.download_slots.remove(id);
            self.inner.downloads.write().remove(&id);
            if matches!(
                problem,
                TransferProblem::LocalModification | TransferProblem::TargetDeleted
            ) {
                if let Err(e) = self.partials().discard(&record.version().path).await {
                    warn!("Failed to discard partial of {}: {}", record.version().path, e);
                }
            }
            self.persist(record).await;
        }
    }

    /// Promote queued transfers into free slots
    fn schedule(&self) {
        while let Some(id) = self.inner.download_slots.next_ready() {
            let Some(coordinator) = self.inner.staged.lock().remove(&id) else {
                self.inner.download_slots.release(id);
                continue;
            };
            let core = self.clone();
            tokio::spawn(async move {
                let outcome = coordinator.run().await;
                core.finish_download(id, outcome).await;
            });
        }

        while let Some(id) = self.inner.upload_slots.next_ready() {
            let Some(entry) = self.upload_entry(id) else {
                self.inner.upload_slots.release(id);
                continue;
            };
            if entry.record.set_started().is_err() {
                self.inner.upload_slots.release(id);
                continue;
            }
            tokio::spawn(async move {
                let message = TransferMessage::UploadStarted {
                    version: entry.record.version().clone(),
                };
                if let Err(e) = entry.peer.send(message).await {
                    warn!("Could not tell {} the upload started: {}", entry.peer.id(), e);
                }
            });
        }
    }

    async fn finish_download(&self, id: TransferId, outcome: SwarmOutcome) {
        self.inner.download_slots.release(id);
        let removed = self.inner.downloads.write().remove(&id);
        let Some(entry) = removed else {
            return;
        };
        let record = entry.record;
        self.persist(&record).await;

        match outcome {
            SwarmOutcome::Completed(path) => {
                info!("{} saved to {}", record.version().path, path.display());
                self.inner.local_versions.accept(record.version().clone());
                self.inner.completed_downloads.write().push(record.summary());
            }
            SwarmOutcome::Broken(problem) => {
                let max_retries = self.settings().max_retries;
                if problem.is_retryable() && record.retry_count() < max_retries {
                    self.schedule_retry(record.version().clone(), record.priority(), record.retry_count() + 1);
                } else {
                    warn!(
                        "Giving up on {} after {} retries",
                        record.version().path,
                        record.retry_count()
                    );
                }
            }
            SwarmOutcome::Aborted(problem) => {
                debug!("{} aborted ({:?})", record.version().path, problem);
            }
        }
        self.schedule();
    }

    fn schedule_retry(&self, version: FileVersion, priority: Priority, attempt: u32) {
        let delay = Duration::from_secs(self.settings().retry_delay_secs);
        let core = self.clone();
        info!(
            "Retrying {} in {:?} (attempt {})",
            version.path, delay, attempt
        );
        tokio::spawn(async move {
            tokio::select! {
                _ = core.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !core.inner.remote_versions.is_latest(&version) || !core.local_is_behind(&version) {
                debug!("Dropping retry of {}, version moved on", version.path);
                return;
            }
            let sources = core.sources_for(&version.path);
            if sources.is_empty() {
                debug!("No source left for {}, waiting for an advertisement", version.path);
                return;
            }
            if let Err(e) = core.spawn_download(version, sources, Some(priority), attempt).await {
                error!("Retry failed to start: {}", e);
            }
        });
    }

    fn sources_for(&self, path: &str) -> Vec<SharedPeer> {
        let availability = self.inner.availability.read();
        let peers = self.inner.peers.read();
        availability
            .get(path)
            .into_iter()
            .flatten()
            .filter_map(|id| peers.get(id).cloned())
            .filter(|p| p.is_connected())
            .collect()
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    /// A peer asks for `version`. The local copy must match it.
    pub async fn queue_upload(&self, peer: SharedPeer, version: FileVersion) -> Result<TransferId> {
        self.add_peer(Arc::clone(&peer));
        let local_path = self.partials().final_path(&version)?;
        let tolerance = self.settings().mtime_tolerance_ms;

        if !local_copy_verified(&local_path, &version, tolerance).await? {
            let _ = peer
                .send(TransferMessage::Broken {
                    version: version.clone(),
                    problem: TransferProblem::FileNotFound,
                })
                .await;
            return Err(SyncError::FileNotFound(version.path));
        }

        let existing = self
            .inner
            .uploads
            .read()
            .values()
            .find(|u| u.peer.id() == peer.id() && u.record.version().same_content(&version, tolerance))
            .map(|u| u.record.id());
        if let Some(id) = existing {
            return Ok(id);
        }

        let priority = self
            .inner
            .file_priorities
            .read()
            .get(&version.path)
            .copied()
            .unwrap_or_default();
        let record = TransferRecord::new(
            Direction::Upload,
            version.clone(),
            priority,
            self.inner.events.clone(),
        );
        let id = record.id();
        record.add_peer(peer.id().clone());
        self.inner.uploads.write().insert(
            id,
            UploadEntry {
                record: Arc::clone(&record),
                peer: Arc::clone(&peer),
                local_path,
            },
        );
        record.set_queued()?;
        peer.send(TransferMessage::Queued { version }).await?;
        self.inner.upload_slots.enqueue(id, priority);
        self.schedule();
        Ok(id)
    }

    /// Stream a range of a started upload to its peer
    pub async fn serve_range(
        &self,
        peer: &PeerId,
        version: &FileVersion,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream> {
        let tolerance = self.settings().mtime_tolerance_ms;
        let entry = self
            .inner
            .uploads
            .read()
            .values()
            .find(|u| u.peer.id() == peer && u.record.version().same_content(version, tolerance))
            .map(|u| UploadEntry {
                record: Arc::clone(&u.record),
                peer: Arc::clone(&u.peer),
                local_path: u.local_path.clone(),
            })
            .ok_or_else(|| SyncError::UnknownPeer(peer.clone()))?;

        let class = TrafficClass::for_transfer(Direction::Upload, entry.peer.is_lan());
        let throttle = Throttle::new(self.inner.governor.clone(), class);
        let result = open_range(
            &entry.record,
            &entry.local_path,
            offset,
            length,
            throttle,
            tolerance,
        )
        .await;
        if entry.record.is_finished() {
            self.finish_upload(entry.record.id()).await;
        }
        result
    }

    /// The peer received the whole file
    pub async fn complete_upload(&self, id: TransferId) -> Result<bool> {
        let entry = self.upload_entry(id).ok_or(SyncError::NotFound(id))?;
        let completed = entry.record.complete();
        self.finish_upload(id).await;
        Ok(completed)
    }

    async fn finish_upload(&self, id: TransferId) {
        self.inner.upload_slots.remove(id);
        let removed = self.inner.uploads.write().remove(&id);
        let Some(entry) = removed else {
            return;
        };
        self.persist(&entry.record).await;
        if entry.record.is_completed() {
            self.inner
                .completed_uploads
                .write()
                .push(entry.record.summary());
        }
        self.schedule();
    }

    fn upload_entry(&self, id: TransferId) -> Option<UploadEntry> {
        self.inner.uploads.read().get(&id).map(|u| UploadEntry {
            record: Arc::clone(&u.record),
            peer: Arc::clone(&u.peer),
            local_path: u.local_path.clone(),
        })
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Explicitly cancel a transfer. Returns false if it had already ended.
    pub async fn abort(&self, id: TransferId) -> Result<bool> {
        let download = self
            .inner
            .downloads
            .read()
            .get(&id)
            .map(|d| Arc::clone(&d.record));
        if let Some(record) = download {
            let aborted = record.abort(None);
            if aborted && self.inner.staged.lock().remove(&id).is_some() {
                self.inner.download_slots.remove(id);
                self.inner.downloads.write().remove(&id);
                self.persist(&record).await;
            }
            return Ok(aborted);
        }

        let entry = self.upload_entry(id).ok_or(SyncError::NotFound(id))?;
        let aborted = entry.record.abort(None);
        if aborted {
            let _ = entry
                .peer
                .send(TransferMessage::AbortUpload {
                    version: entry.record.version().clone(),
                })
                .await;
        }
        self.finish_upload(id).await;
        Ok(aborted)
    }

    /// Set the rate of a traffic class in bytes per second (0 = unlimited)
    pub async fn set_rate(&self, class: TrafficClass, bytes_per_second: u64) -> Result<()> {
        self.inner.governor.set_rate(class, bytes_per_second);
        let settings = {
            let mut settings = self.inner.settings.write();
            settings.set_rate_for(class, bytes_per_second);
            settings.clone()
        };
        self.inner.storage.save_settings(&settings).await
    }

    /// Change the priority of every transfer of `path`. Started transfers
    /// keep their slot.
    pub fn set_priority(&self, path: &str, priority: Priority) {
        self.inner
            .file_priorities
            .write()
            .insert(path.to_string(), priority);
        for entry in self.inner.downloads.read().values() {
            if entry.record.version().path == path {
                entry.record.set_priority(priority);
                self.inner.download_slots.set_priority(entry.record.id(), priority);
            }
        }
        for entry in self.inner.uploads.read().values() {
            if entry.record.version().path == path {
                entry.record.set_priority(priority);
                self.inner.upload_slots.set_priority(entry.record.id(), priority);
            }
        }
        self.schedule();
    }

    pub fn priority_of(&self, path: &str) -> Priority {
        let live = self
            .inner
            .downloads
            .read()
            .values()
            .find(|d| d.record.version().path == path)
            .map(|d| d.record.priority());
        live.or_else(|| self.inner.file_priorities.read().get(path).copied())
            .unwrap_or_default()
    }

    /// Drop the completed lists. Returns how many records were removed.
    pub async fn clear_completed(&self) -> Result<usize> {
        let cleared: Vec<TransferSummary> = std::mem::take(&mut *self.inner.completed_downloads.write())
            .into_iter()
            .chain(std::mem::take(&mut *self.inner.completed_uploads.write()))
            .collect();
        for summary in &cleared {
            self.inner
                .events
                .emit(TransferEvent::RemovedFromCompleted { id: summary.id });
        }
        self.inner.db.clear_completed().await?;
        Ok(cleared.len())
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        for class in TrafficClass::ALL {
            self.inner.governor.set_rate(class, settings.rate_for(class));
        }
        self.inner
            .download_slots
            .set_max_concurrent(settings.max_concurrent_downloads as usize);
        self.inner
            .upload_slots
            .set_max_concurrent(settings.max_concurrent_uploads as usize);
        *self.inner.partials.write() = PartialStore::new(
            settings.download_root.clone(),
            self.inner.db.clone(),
            settings.mtime_tolerance_ms,
        );
        *self.inner.settings.write() = settings.clone();
        self.inner.storage.save_settings(&settings).await?;
        self.schedule();
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn settings(&self) -> Settings {
        self.inner.settings.read().clone()
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn database(&self) -> &TransferDatabase {
        &self.inner.db
    }

    pub fn partials(&self) -> PartialStore {
        self.inner.partials.read().clone()
    }

    pub fn governor(&self) -> &BandwidthGovernor {
        &self.inner.governor
    }

    pub fn bandwidth_rate(&self, class: TrafficClass) -> u64 {
        self.inner.governor.rate(class).unwrap_or(0)
    }

    /// Bytes per second granted during the last governor period
    pub fn bandwidth_usage(&self, class: TrafficClass) -> u64 {
        self.inner.governor.usage(class)
    }

    pub fn count_active_downloads(&self) -> usize {
        self.inner
            .downloads
            .read()
            .values()
            .filter(|d| d.record.state().is_active())
            .count()
    }

    pub fn count_active_uploads(&self) -> usize {
        self.inner
            .uploads
            .read()
            .values()
            .filter(|u| u.record.state().is_active())
            .count()
    }

    pub fn completed_downloads(&self) -> Vec<TransferSummary> {
        self.inner.completed_downloads.read().clone()
    }

    pub fn completed_uploads(&self) -> Vec<TransferSummary> {
        self.inner.completed_uploads.read().clone()
    }

    fn record(&self, id: TransferId) -> Option<Arc<TransferRecord>> {
        if let Some(d) = self.inner.downloads.read().get(&id) {
            return Some(Arc::clone(&d.record));
        }
        self.inner
            .uploads
            .read()
            .get(&id)
            .map(|u| Arc::clone(&u.record))
    }

    /// Current view of a live or completed transfer
    pub fn get(&self, id: TransferId) -> Option<TransferSummary> {
        if let Some(record) = self.record(id) {
            return Some(record.summary());
        }
        self.inner
            .completed_downloads
            .read()
            .iter()
            .chain(self.inner.completed_uploads.read().iter())
            .find(|s| s.id == id)
            .cloned()
    }

    /// Live transfers followed by completed ones
    pub fn transfers(&self) -> Vec<TransferSummary> {
        let mut all: Vec<TransferSummary> = self
            .inner
            .downloads
            .read()
            .values()
            .map(|d| d.record.summary())
            .chain(self.inner.uploads.read().values().map(|u| u.record.summary()))
            .collect();
        all.sort_by_key(|s| s.created_at);
        all.extend(self.completed_downloads());
        all.extend(self.completed_uploads());
        all
    }

    /// Delivery counters per source of a live download
    pub fn source_stats(&self, id: TransferId) -> Option<HashMap<PeerId, Arc<engine::SourceStats>>> {
        self.inner
            .downloads
            .read()
            .get(&id)
            .map(|d| d.handle.source_stats())
    }
}

//! Transfer state machine - one record per (direction, file version)
//!
//! All transitions go through `TransferRecord::transition`, which refuses to
//! leave a terminal state. `complete` and `abort` race safely: whichever
//! commits first wins and the other becomes a no-op.

use crate::error::{Result, SyncError};
use crate::events::EventBus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use swarmsync_types::{
    Direction, FileVersion, PeerId, Priority, TransferEvent, TransferId, TransferProblem,
    TransferState, TransferSummary,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct TransferRecord {
    id: TransferId,
    direction: Direction,
    version: FileVersion,
    created_at: DateTime<Utc>,
    inner: Mutex<RecordState>,
    transferred: AtomicU64,
    cancel: CancellationToken,
    events: EventBus,
}

struct RecordState {
    state: TransferState,
    priority: Priority,
    problem: Option<TransferProblem>,
    problem_info: Option<String>,
    /// Contributing sources of a download, the requesting peer of an upload
    peers: BTreeSet<PeerId>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: u32,
}

impl TransferRecord {
    /// Create a record in REQUESTED state and announce it
    pub fn new(
        direction: Direction,
        version: FileVersion,
        priority: Priority,
        events: EventBus,
    ) -> Arc<Self> {
        Self::with_retry_count(direction, version, priority, 0, events)
    }

    pub fn with_retry_count(
        direction: Direction,
        version: FileVersion,
        priority: Priority,
        retry_count: u32,
        events: EventBus,
    ) -> Arc<Self> {
        let record = Arc::new(Self {
            id: Uuid::new_v4(),
            direction,
            version,
            created_at: Utc::now(),
            inner: Mutex::new(RecordState {
                state: TransferState::Requested,
                priority,
                problem: None,
                problem_info: None,
                peers: BTreeSet::new(),
                started_at: None,
                completed_at: None,
                retry_count,
            }),
            transferred: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            events,
        });

        debug!(
            "{} {} requested ({})",
            record.direction.as_str(),
            record.version.path,
            record.id
        );
        record.events.emit(TransferEvent::Requested {
            id: record.id,
            direction: record.direction,
            version: record.version.clone(),
        });
        record
    }

    /// Rebuild a finished record from a persisted summary. No events fire.
    pub fn restore(summary: TransferSummary, events: EventBus) -> Arc<Self> {
        let cancel = CancellationToken::new();
        if summary.state.is_terminal() {
            cancel.cancel();
        }
        Arc::new(Self {
            id: summary.id,
            direction: summary.direction,
            version: summary.version,
            created_at: summary.created_at,
            inner: Mutex::new(RecordState {
                state: summary.state,
                priority: summary.priority,
                problem: summary.problem,
                problem_info: summary.problem_info,
                peers: summary.peers.into_iter().collect(),
                started_at: summary.started_at,
                completed_at: summary.completed_at,
                retry_count: summary.retry_count,
            }),
            transferred: AtomicU64::new(summary.transferred),
            cancel,
            events,
        })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn version(&self) -> &FileVersion {
        &self.version
    }

    pub fn state(&self) -> TransferState {
        self.inner.lock().state
    }

    pub fn priority(&self) -> Priority {
        self.inner.lock().priority
    }

    pub fn set_priority(&self, priority: Priority) {
        self.inner.lock().priority = priority;
    }

    pub fn problem(&self) -> Option<TransferProblem> {
        self.inner.lock().problem
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    // ------------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------------

    pub fn is_queued(&self) -> bool {
        self.state() == TransferState::Queued
    }

    /// Requested or queued, not yet running
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state(),
            TransferState::Requested | TransferState::Queued
        )
    }

    /// Started or in one of its working sub-states
    pub fn is_started(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TransferState::Completed
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TransferState::Aborted
    }

    pub fn is_broken(&self) -> bool {
        self.state() == TransferState::Broken
    }

    /// Completed, aborted or broken
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state(),
            TransferState::Completed | TransferState::Aborted | TransferState::Broken
        )
    }

    // ------------------------------------------------------------------------
    // Progress & sources
    // ------------------------------------------------------------------------

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn add_transferred(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Take back bytes of a chunk that was abandoned half-way
    pub fn sub_transferred(&self, bytes: u64) {
        let _ = self
            .transferred
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn set_transferred(&self, bytes: u64) {
        self.transferred.store(bytes, Ordering::Relaxed);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.lock().peers.iter().cloned().collect()
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.inner.lock().peers.contains(peer)
    }

    /// Returns false if the peer was already registered or the record is finished
    pub fn add_peer(&self, peer: PeerId) -> bool {
        let added = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                TransferState::Completed | TransferState::Aborted | TransferState::Broken
            ) {
                return false;
            }
            inner.peers.insert(peer.clone())
        };
        if added && self.direction == Direction::Download {
            self.events.emit(TransferEvent::SourceAdded { id: self.id, peer });
        }
        added
    }

    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let removed = self.inner.lock().peers.remove(peer);
        if removed && self.direction == Direction::Download {
            self.events.emit(TransferEvent::SourceRemoved {
                id: self.id,
                peer: peer.clone(),
            });
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    /// Token cancelled once the record reaches a finished state
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Move to `next`, returning the previous state
    pub fn transition(&self, next: TransferState) -> Result<TransferState> {
        self.transition_with(next, None, None)
    }

    fn transition_with(
        &self,
        next: TransferState,
        problem: Option<TransferProblem>,
        info: Option<String>,
    ) -> Result<TransferState> {
        let previous = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            if !from.can_transition_to(next) {
                return Err(SyncError::InvalidTransition {
                    id: self.id,
                    from,
                    to: next,
                });
            }
            inner.state = next;
            match next {
                TransferState::Started if !from.is_active() => {
                    inner.started_at = Some(Utc::now());
                }
                TransferState::Completed => inner.completed_at = Some(Utc::now()),
                TransferState::Aborted | TransferState::Broken => {
                    if problem.is_some() {
                        inner.problem = problem;
                        inner.problem_info = info.clone();
                    }
                }
                _ => {}
            }
            from
        };

        if matches!(
            next,
            TransferState::Completed | TransferState::Aborted | TransferState::Broken
        ) {
            self.cancel.cancel();
        }

        self.announce(previous, next, problem, info);
        Ok(previous)
    }

    fn announce(
        &self,
        previous: TransferState,
        next: TransferState,
        problem: Option<TransferProblem>,
        info: Option<String>,
    ) {
        let id = self.id;
        let event = match next {
            TransferState::Requested => return,
            TransferState::Queued => TransferEvent::Queued { id },
            TransferState::Started if !previous.is_active() => {
                info!("{} {} started", self.direction.as_str(), self.version.path);
                TransferEvent::Started { id }
            }
            TransferState::Started
            | TransferState::Matching
            | TransferState::Verifying
            | TransferState::Copying => TransferEvent::StateChanged { id, state: next },
            TransferState::Completed => {
                info!("{} {} completed", self.direction.as_str(), self.version.path);
                TransferEvent::Completed { id }
            }
            TransferState::Aborted => {
                info!(
                    "{} {} aborted{}",
                    self.direction.as_str(),
                    self.version.path,
                    problem.map(|p| format!(" ({})", p)).unwrap_or_default()
                );
                TransferEvent::Aborted { id, problem }
            }
            TransferState::Broken => {
                let problem = problem.unwrap_or(TransferProblem::General);
                warn!(
                    "{} {} broken: {} {}",
                    self.direction.as_str(),
                    self.version.path,
                    problem,
                    info.as_deref().unwrap_or("")
                );
                TransferEvent::Broken { id, problem, info }
            }
        };
        self.events.emit(event);
    }

    pub fn set_queued(&self) -> Result<()> {
        self.transition(TransferState::Queued).map(|_| ())
    }

    pub fn set_started(&self) -> Result<()> {
        self.transition(TransferState::Started).map(|_| ())
    }

    /// Commit completion. Returns false if another outcome already won.
    pub fn complete(&self) -> bool {
        self.transition(TransferState::Completed).is_ok()
    }

    /// Commit an abort. Returns false if the record already finished.
    pub fn abort(&self, problem: Option<TransferProblem>) -> bool {
        self.transition_with(TransferState::Aborted, problem, None)
            .is_ok()
    }

    pub fn abort_with(&self, problem: TransferProblem, info: impl Into<String>) -> bool {
        self.transition_with(TransferState::Aborted, Some(problem), Some(info.into()))
            .is_ok()
    }

    /// Mark the record broken. Returns false if it already finished.
    pub fn set_broken(&self, problem: TransferProblem, info: impl Into<String>) -> bool {
        self.transition_with(TransferState::Broken, Some(problem), Some(info.into()))
            .is_ok()
    }

    /// Route a failure: retryable problems break the record, the rest abort it
    pub fn fail(&self, error: &SyncError) -> bool {
        let problem = error.problem();
        if problem.is_retryable() {
            self.set_broken(problem, error.to_string())
        } else {
            self.abort_with(problem, error.to_string())
        }
    }

    pub fn summary(&self) -> TransferSummary {
        let inner = self.inner.lock();
        TransferSummary {
            id: self.id,
            direction: self.direction,
            version: self.version.clone(),
            state: inner.state,
            priority: inner.priority,
            transferred: self.transferred(),
            problem: inner.problem,
            problem_info: inner.problem_info.clone(),
            peers: inner.peers.iter().cloned().collect(),
            created_at: self.created_at,
            started_at: inner.started_at,
            completed_at: inner.completed_at,
            retry_count: inner.retry_count,
        }
    }
}

impl std::fmt::Debug for TransferRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRecord")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("path", &self.version.path)
            .field("state", &self.state())
            .finish()
    }
}

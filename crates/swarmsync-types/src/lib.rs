//! Shared types for SwarmSync
//!
//! This crate contains the data structures exchanged between the transfer
//! core, its control collaborators (CLI, UI) and the peer messaging layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a TransferRecord
pub type TransferId = Uuid;

// ============================================================================
// Peers & File Versions
// ============================================================================

/// Opaque identity of a remote peer, assigned by the messaging layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Immutable snapshot of one version of a file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileVersion {
    /// Path relative to the synchronized folder, `/` separated
    pub path: String,
    pub size: u64,
    /// Hex SHA-256 of the content. Empty when the owner did not hash the file.
    pub content_hash: String,
    /// Monotonic per path
    pub version: u64,
    pub modified_by: PeerId,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl FileVersion {
    pub fn new(path: impl Into<String>, size: u64, version: u64) -> Self {
        Self {
            path: path.into(),
            size,
            content_hash: String::new(),
            version,
            modified_by: PeerId::default(),
            modified_at: Utc::now(),
            deleted: false,
        }
    }

    pub fn with_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = content_hash.into();
        self
    }

    pub fn modified(mut self, by: PeerId, at: DateTime<Utc>) -> Self {
        self.modified_by = by;
        self.modified_at = at;
        self
    }

    /// File name component of the path
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// True when `other` describes a strictly newer version of the same path
    pub fn is_superseded_by(&self, other: &FileVersion) -> bool {
        self.compare_version(other) == Some(Ordering::Less)
    }

    /// Ordering by version number, ties broken by modification time.
    /// Versions of different paths are not comparable.
    pub fn compare_version(&self, other: &FileVersion) -> Option<Ordering> {
        if self.path != other.path {
            return None;
        }
        Some(
            self.version
                .cmp(&other.version)
                .then(self.modified_at.cmp(&other.modified_at)),
        )
    }

    /// Same path, version, size and hash, with modification times equal
    /// within `tolerance_ms`.
    pub fn same_content(&self, other: &FileVersion, tolerance_ms: i64) -> bool {
        self.path == other.path
            && self.version == other.version
            && self.size == other.size
            && self.content_hash == other.content_hash
            && self.deleted == other.deleted
            && timestamps_match(self.modified_at, other.modified_at, tolerance_ms)
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self("local".to_string())
    }
}

/// Compare two timestamps allowing for filesystem resolution differences
pub fn timestamps_match(a: DateTime<Utc>, b: DateTime<Utc>, tolerance_ms: i64) -> bool {
    (a - b).num_milliseconds().abs() <= tolerance_ms
}

// ============================================================================
// Transfer Types
// ============================================================================

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Direction::Download),
            "upload" => Ok(Direction::Upload),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Lifecycle state of a TransferRecord
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Requested,
    Queued,
    Started,
    /// Scanning stale local data for reusable blocks
    Matching,
    /// Checking the assembled file against the target signature
    Verifying,
    /// Copying reusable blocks into the partial file
    Copying,
    Completed,
    Aborted,
    Broken,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Requested => "requested",
            TransferState::Queued => "queued",
            TransferState::Started => "started",
            TransferState::Matching => "matching",
            TransferState::Verifying => "verifying",
            TransferState::Copying => "copying",
            TransferState::Completed => "completed",
            TransferState::Aborted => "aborted",
            TransferState::Broken => "broken",
        }
    }

    /// Started or one of its working sub-states
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferState::Started
                | TransferState::Matching
                | TransferState::Verifying
                | TransferState::Copying
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Aborted)
    }

    /// Whether a record in this state may move to `next`.
    ///
    /// Completed and Aborted are final. Broken only allows an explicit abort.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;

        match (*self, next) {
            (Completed | Aborted, _) => false,
            (_, Aborted) => true,
            (Broken, _) => false,
            (_, Broken) => true,
            (Requested, Queued) => true,
            (Requested | Queued, Started) => true,
            (from, to) if from.is_active() && to.is_active() => from != to,
            (from, Completed) => from.is_active(),
            _ => false,
        }
    }
}

impl FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "requested" => TransferState::Requested,
            "queued" => TransferState::Queued,
            "started" => TransferState::Started,
            "matching" => TransferState::Matching,
            "verifying" => TransferState::Verifying,
            "copying" => TransferState::Copying,
            "completed" => TransferState::Completed,
            "aborted" => TransferState::Aborted,
            "broken" => TransferState::Broken,
            other => return Err(format!("unknown transfer state: {}", other)),
        })
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed reason attached to a broken or aborted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferProblem {
    FileNotFound,
    IoError,
    ChecksumMismatch,
    PeerDisconnected,
    NoSources,
    /// The remote side sent something unusable (bad range, short body)
    BrokenDownload,
    LocalModification,
    TargetDeleted,
    Superseded,
    General,
}

impl TransferProblem {
    /// Only retryable problems are retried automatically by the scheduler
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferProblem::FileNotFound
                | TransferProblem::IoError
                | TransferProblem::ChecksumMismatch
                | TransferProblem::PeerDisconnected
                | TransferProblem::NoSources
                | TransferProblem::BrokenDownload
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferProblem::FileNotFound => "file_not_found",
            TransferProblem::IoError => "io_error",
            TransferProblem::ChecksumMismatch => "checksum_mismatch",
            TransferProblem::PeerDisconnected => "peer_disconnected",
            TransferProblem::NoSources => "no_sources",
            TransferProblem::BrokenDownload => "broken_download",
            TransferProblem::LocalModification => "local_modification",
            TransferProblem::TargetDeleted => "target_deleted",
            TransferProblem::Superseded => "superseded",
            TransferProblem::General => "general",
        }
    }
}

impl FromStr for TransferProblem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "file_not_found" => TransferProblem::FileNotFound,
            "io_error" => TransferProblem::IoError,
            "checksum_mismatch" => TransferProblem::ChecksumMismatch,
            "peer_disconnected" => TransferProblem::PeerDisconnected,
            "no_sources" => TransferProblem::NoSources,
            "broken_download" => TransferProblem::BrokenDownload,
            "local_modification" => TransferProblem::LocalModification,
            "target_deleted" => TransferProblem::TargetDeleted,
            "superseded" => TransferProblem::Superseded,
            "general" => TransferProblem::General,
            other => return Err(format!("unknown transfer problem: {}", other)),
        })
    }
}

impl fmt::Display for TransferProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling tier, higher tiers start first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Point-in-time view of a TransferRecord, used for queries and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSummary {
    pub id: TransferId,
    pub direction: Direction,
    pub version: FileVersion,
    pub state: TransferState,
    pub priority: Priority,
    pub transferred: u64,
    pub problem: Option<TransferProblem>,
    pub problem_info: Option<String>,
    /// Contributing sources for downloads, the requesting peer for uploads
    pub peers: Vec<PeerId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

impl TransferSummary {
    pub fn progress(&self) -> f64 {
        if self.version.size == 0 {
            return if self.state == TransferState::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.transferred as f64 / self.version.size as f64) * 100.0
    }
}

// ============================================================================
// Bandwidth Types
// ============================================================================

/// Traffic class with its own bandwidth budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    LanInput,
    LanOutput,
    WanInput,
    WanOutput,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 4] = [
        TrafficClass::LanInput,
        TrafficClass::LanOutput,
        TrafficClass::WanInput,
        TrafficClass::WanOutput,
    ];

    /// Class used for a transfer in `direction` with a LAN or WAN peer
    pub fn for_transfer(direction: Direction, lan: bool) -> Self {
        match (direction, lan) {
            (Direction::Download, true) => TrafficClass::LanInput,
            (Direction::Download, false) => TrafficClass::WanInput,
            (Direction::Upload, true) => TrafficClass::LanOutput,
            (Direction::Upload, false) => TrafficClass::WanOutput,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::LanInput => "lan_input",
            TrafficClass::LanOutput => "lan_output",
            TrafficClass::WanInput => "wan_input",
            TrafficClass::WanOutput => "wan_output",
        }
    }
}

impl FromStr for TrafficClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrafficClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown traffic class: {}", s))
    }
}

/// Per-tick budget statistics of one traffic class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthStat {
    pub class: TrafficClass,
    /// Tokens available right after the previous replenish
    pub initial: u64,
    /// Tokens left unclaimed when this period ended
    pub residual: u64,
    /// Tokens granted during the period
    pub granted: u64,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Block Signatures
// ============================================================================

/// Weak and strong checksum of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDigest {
    pub weak: u32,
    /// Hex SHA-256 of the block
    pub strong: String,
}

/// Block-by-block description of a file version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartsRecord {
    pub block_size: u64,
    pub file_length: u64,
    pub blocks: Vec<BlockDigest>,
}

impl PartsRecord {
    /// Expected length of block `index`, the last one may be short
    pub fn block_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.block_size;
        self.file_length.saturating_sub(start).min(self.block_size)
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Folder that completed files are promoted into
    pub download_root: PathBuf,
    pub max_concurrent_downloads: u32,
    pub max_concurrent_uploads: u32,
    pub chunk_size: u64,
    pub max_requests_per_source: u32,
    pub stall_timeout_secs: u64,
    pub min_size_for_part_transfers: u64,
    pub tick_period_ms: u64,
    /// Bytes per second, 0 = unlimited
    pub lan_download_rate: u64,
    pub lan_upload_rate: u64,
    pub wan_download_rate: u64,
    pub wan_upload_rate: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub mtime_tolerance_ms: i64,
    pub partial_grace_period_hours: u64,
    pub keep_partial_on_abort: bool,
}

impl Settings {
    pub fn rate_for(&self, class: TrafficClass) -> u64 {
        match class {
            TrafficClass::LanInput => self.lan_download_rate,
            TrafficClass::LanOutput => self.lan_upload_rate,
            TrafficClass::WanInput => self.wan_download_rate,
            TrafficClass::WanOutput => self.wan_upload_rate,
        }
    }

    pub fn set_rate_for(&mut self, class: TrafficClass, rate: u64) {
        match class {
            TrafficClass::LanInput => self.lan_download_rate = rate,
            TrafficClass::LanOutput => self.lan_upload_rate = rate,
            TrafficClass::WanInput => self.wan_download_rate = rate,
            TrafficClass::WanOutput => self.wan_upload_rate = rate,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_root: dirs::download_dir()
                .map(|p| p.join("SwarmSync"))
                .unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent_downloads: 4,
            max_concurrent_uploads: 4,
            chunk_size: 1024 * 1024,
            max_requests_per_source: 2,
            stall_timeout_secs: 30,
            min_size_for_part_transfers: 8 * 1024,
            tick_period_ms: 100,
            lan_download_rate: 0,
            lan_upload_rate: 0,
            wan_download_rate: 0,
            wan_upload_rate: 0,
            max_retries: 5,
            retry_delay_secs: 30,
            mtime_tolerance_ms: 2000,
            partial_grace_period_hours: 72,
            keep_partial_on_abort: true,
        }
    }
}

// ============================================================================
// Messages & Events
// ============================================================================

/// Transfer control messages handed to the peer messaging layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferMessage {
    /// Ask the peer to upload a file version
    RequestDownload { version: FileVersion },
    /// The upload for this version is waiting for a free slot
    Queued { version: FileVersion },
    /// The upload is now being served
    UploadStarted { version: FileVersion },
    AbortDownload { version: FileVersion },
    AbortUpload { version: FileVersion },
    Broken {
        version: FileVersion,
        problem: TransferProblem,
    },
}

/// Events emitted by the core to its observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    Requested {
        id: TransferId,
        direction: Direction,
        version: FileVersion,
    },
    Queued {
        id: TransferId,
    },
    Started {
        id: TransferId,
    },
    StateChanged {
        id: TransferId,
        state: TransferState,
    },
    Progress {
        id: TransferId,
        transferred: u64,
        total: u64,
        speed: u64,
        eta: Option<u64>, // seconds
    },
    SourceAdded {
        id: TransferId,
        peer: PeerId,
    },
    SourceRemoved {
        id: TransferId,
        peer: PeerId,
    },
    Broken {
        id: TransferId,
        problem: TransferProblem,
        info: Option<String>,
    },
    Aborted {
        id: TransferId,
        problem: Option<TransferProblem>,
    },
    Completed {
        id: TransferId,
    },
    RemovedFromCompleted {
        id: TransferId,
    },
    BandwidthStats {
        stat: BandwidthStat,
    },
}

impl TransferEvent {
    /// Transfer the event refers to, if any
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            TransferEvent::Requested { id, .. }
            | TransferEvent::Queued { id }
            | TransferEvent::Started { id }
            | TransferEvent::StateChanged { id, .. }
            | TransferEvent::Progress { id, .. }
            | TransferEvent::SourceAdded { id, .. }
            | TransferEvent::SourceRemoved { id, .. }
            | TransferEvent::Broken { id, .. }
            | TransferEvent::Aborted { id, .. }
            | TransferEvent::Completed { id }
            | TransferEvent::RemovedFromCompleted { id } => Some(*id),
            TransferEvent::BandwidthStats { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_terminal_states_are_final() {
        for next in [
            TransferState::Started,
            TransferState::Queued,
            TransferState::Broken,
            TransferState::Aborted,
        ] {
            assert!(!TransferState::Completed.can_transition_to(next));
            assert!(!TransferState::Aborted.can_transition_to(next));
        }
    }

    #[test]
    fn test_broken_can_only_be_aborted() {
        assert!(TransferState::Broken.can_transition_to(TransferState::Aborted));
        assert!(!TransferState::Broken.can_transition_to(TransferState::Started));
        assert!(!TransferState::Broken.can_transition_to(TransferState::Completed));
    }

    #[test]
    fn test_completion_requires_active_state() {
        assert!(!TransferState::Queued.can_transition_to(TransferState::Completed));
        assert!(TransferState::Verifying.can_transition_to(TransferState::Completed));
        assert!(TransferState::Started.can_transition_to(TransferState::Matching));
        assert!(TransferState::Copying.can_transition_to(TransferState::Started));
    }

    #[test]
    fn test_version_ordering() {
        let now = Utc::now();
        let a = FileVersion::new("docs/a.txt", 10, 3).modified(PeerId::from("p"), now);
        let b = FileVersion::new("docs/a.txt", 10, 3)
            .modified(PeerId::from("p"), now + Duration::seconds(5));
        let c = FileVersion::new("docs/a.txt", 10, 4).modified(PeerId::from("p"), now);
        let other = FileVersion::new("docs/b.txt", 10, 9);

        assert!(a.is_superseded_by(&b));
        assert!(b.is_superseded_by(&c));
        assert!(!c.is_superseded_by(&a));
        assert_eq!(a.compare_version(&other), None);
    }

    #[test]
    fn test_same_content_tolerates_mtime_resolution() {
        let now = Utc::now();
        let a = FileVersion::new("a.bin", 10, 1).modified(PeerId::from("p"), now);
        let mut b = a.clone();
        b.modified_at = now + Duration::milliseconds(1500);
        assert!(a.same_content(&b, 2000));
        b.modified_at = now + Duration::milliseconds(2500);
        assert!(!a.same_content(&b, 2000));
    }

    #[test]
    fn test_problem_classification() {
        assert!(TransferProblem::ChecksumMismatch.is_retryable());
        assert!(TransferProblem::PeerDisconnected.is_retryable());
        assert!(!TransferProblem::LocalModification.is_retryable());
        assert!(!TransferProblem::TargetDeleted.is_retryable());
        assert_eq!(
            "checksum_mismatch".parse::<TransferProblem>(),
            Ok(TransferProblem::ChecksumMismatch)
        );
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
    }

    #[test]
    fn test_settings_missing_fields_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"chunk_size": 4096}"#).unwrap();
        assert_eq!(settings.chunk_size, 4096);
        assert_eq!(settings.mtime_tolerance_ms, 2000);
        assert_eq!(settings.rate_for(TrafficClass::WanInput), 0);
    }

    #[test]
    fn test_parts_record_last_block_is_short() {
        let record = PartsRecord {
            block_size: 4,
            file_length: 10,
            blocks: Vec::new(),
        };
        assert_eq!(record.block_len(0), 4);
        assert_eq!(record.block_len(2), 2);
        assert_eq!(record.block_len(3), 0);
    }
}

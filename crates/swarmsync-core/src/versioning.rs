//! Version tracking - newest accepted FileVersion per path

use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use swarmsync_types::FileVersion;
use tracing::debug;

/// Result of offering a version to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionUpdate {
    /// Newer than anything known; `previous` is what it replaced
    Accepted { previous: Option<FileVersion> },
    /// Same version as the one already known
    Unchanged,
    /// Older than the known version, refused
    Stale { current: FileVersion },
}

/// Keeps version numbers non-decreasing per path
#[derive(Default)]
pub struct VersionTracker {
    versions: RwLock<HashMap<String, FileVersion>>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, version: FileVersion) -> VersionUpdate {
        let mut versions = self.versions.write();
        match versions.get(&version.path) {
            Some(current) => match current.compare_version(&version) {
                Some(Ordering::Less) => {
                    debug!(
                        "{}: version {} replaces {}",
                        version.path, version.version, current.version
                    );
                    let previous = versions.insert(version.path.clone(), version);
                    VersionUpdate::Accepted { previous }
                }
                Some(Ordering::Equal) => VersionUpdate::Unchanged,
                _ => VersionUpdate::Stale {
                    current: current.clone(),
                },
            },
            None => {
                versions.insert(version.path.clone(), version);
                VersionUpdate::Accepted { previous: None }
            }
        }
    }

    pub fn latest(&self, path: &str) -> Option<FileVersion> {
        self.versions.read().get(path).cloned()
    }

    /// Whether `version` is still the newest known for its path
    pub fn is_latest(&self, version: &FileVersion) -> bool {
        self.versions
            .read()
            .get(&version.path)
            .map(|v| v.compare_version(version) != Some(Ordering::Greater))
            .unwrap_or(true)
    }

    pub fn forget(&self, path: &str) -> Option<FileVersion> {
        self.versions.write().remove(path)
    }

    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use swarmsync_types::PeerId;

    fn v(n: u64) -> FileVersion {
        FileVersion::new("docs/report.odt", 100, n)
    }

    #[test]
    fn test_versions_never_decrease() {
        let tracker = VersionTracker::new();
        assert_eq!(tracker.accept(v(2)), VersionUpdate::Accepted { previous: None });
        assert_eq!(tracker.accept(v(2)), VersionUpdate::Unchanged);
        assert!(matches!(tracker.accept(v(1)), VersionUpdate::Stale { current } if current.version == 2));

        match tracker.accept(v(3)) {
            VersionUpdate::Accepted { previous } => assert_eq!(previous.unwrap().version, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tracker.latest("docs/report.odt").unwrap().version, 3);
        assert!(!tracker.is_latest(&v(2)));
        assert!(tracker.is_latest(&v(3)));
    }

    #[test]
    fn test_timestamp_breaks_ties() {
        let tracker = VersionTracker::new();
        let now = Utc::now();
        let older = v(5).modified(PeerId::from("a"), now);
        let newer = v(5).modified(PeerId::from("b"), now + Duration::seconds(3));
        tracker.accept(older.clone());
        assert!(matches!(tracker.accept(newer), VersionUpdate::Accepted { .. }));
        assert!(matches!(tracker.accept(older), VersionUpdate::Stale { .. }));
        assert_eq!(tracker.len(), 1);
    }
}

use crate::cluster::{ClusterNode, Lease};
use crate::error::ControlError;
use crate::market::Allocation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Point-in-time durable state: everything a node needs to resume after a
/// restart, before trailing replicated records are applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at_ms: u64,
    pub term: u64,
    pub lease: Option<Lease>,
    pub allocations: Vec<Allocation>,
    pub nodes: Vec<ClusterNode>,
}

/// Snapshot file handling. Writes go through a sibling temp file and an
/// atomic rename so a crash mid-write never leaves a torn snapshot.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: &str) -> Self {
        Self {
            path: PathBuf::from(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, snapshot: &Snapshot) -> Result<(), ControlError> {
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| ControlError::Internal(format!("snapshot encode: {}", e)))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &data)
            .map_err(|e| ControlError::Internal(format!("snapshot write: {}", e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ControlError::Internal(format!("snapshot rename: {}", e)))?;

        tracing::info!(
            "persist: snapshot written, path={}, allocations={}, at={}",
            self.path.display(),
            snapshot.allocations.len(),
            humantime::format_rfc3339_seconds(std::time::SystemTime::now())
        );
        Ok(())
    }

    /// Load the last snapshot, if any. A corrupt file is reported and
    /// treated as absent rather than blocking startup.
    pub fn load(&self) -> Option<Snapshot> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(
                    "persist: snapshot unreadable, path={}, error={}",
                    self.path.display(),
                    e
                );
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::error!(
                    "persist: snapshot corrupt, path={}, error={}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{AllocationStatus, FrequencyRange};

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            taken_at_ms: 123_456,
            term: 7,
            lease: None,
            allocations: vec![Allocation {
                id: "alloc-1".into(),
                request_id: "r1".into(),
                tenant: "t1".into(),
                bandwidth_mbps: 200,
                spectrum_band: "mid".into(),
                frequency_range: FrequencyRange {
                    low_mhz: 2496.0,
                    high_mhz: 2736.0,
                },
                power_dbm: 23.0,
                expires_at_ms: 999,
                channel_id: None,
                status: AllocationStatus::Active,
            }],
            nodes: Vec::new(),
        }
    }

    #[test]
    fn test_write_load_roundtrip() {
        let path = std::env::temp_dir().join("aether_snapshot_roundtrip.json");
        let store = SnapshotStore::new(path.to_str().unwrap());

        store.write(&sample_snapshot()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.term, 7);
        assert_eq!(loaded.allocations.len(), 1);
        assert_eq!(loaded.allocations[0].id, "alloc-1");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_is_none() {
        let store = SnapshotStore::new("/nonexistent/dir/snapshot.json");
        assert!(store.load().is_none());
    }

    #[test]
    fn test_corrupt_file_is_none() {
        let path = std::env::temp_dir().join("aether_snapshot_corrupt.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = SnapshotStore::new(path.to_str().unwrap());
        assert!(store.load().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rewrite_replaces_previous() {
        let path = std::env::temp_dir().join("aether_snapshot_rewrite.json");
        let store = SnapshotStore::new(path.to_str().unwrap());

        store.write(&sample_snapshot()).unwrap();
        let mut next = sample_snapshot();
        next.term = 8;
        store.write(&next).unwrap();

        assert_eq!(store.load().unwrap().term, 8);
        std::fs::remove_file(&path).ok();
    }
}

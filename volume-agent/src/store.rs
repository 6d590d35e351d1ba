//! JSON persistence for volume records.
//!
//! The registry snapshot is written to a single JSON file (for example
//! `/var/db/volume-agent/volumes.json`) so records survive restarts.
//! Writes go through a `.new` file and a rename so a crash never leaves a
//! half-written snapshot in place.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::volume::{Volume, VolumeId};

/// On-disk registry snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Highest id ever handed out. Ids are not reused after a purge.
    #[serde(default)]
    pub last_id: u64,
    #[serde(default)]
    pub volumes: BTreeMap<VolumeId, Volume>,
}

impl RegistrySnapshot {
    /// The next id to allocate, never lower than any stored record.
    pub fn next_id(&self) -> u64 {
        let highest = self.volumes.keys().map(|id| id.get()).max().unwrap_or(0);
        self.last_id.max(highest) + 1
    }
}

/// Load a snapshot from a JSON file.
///
/// Returns an empty snapshot if the file doesn't exist.
/// Returns an error if the file exists but cannot be parsed.
pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<RegistrySnapshot> {
    let path = path.as_ref();

    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        debug!(path = %path.display(), "No registry state file, starting empty");
        return Ok(RegistrySnapshot::default());
    }

    let content = tokio::fs::read_to_string(path).await?;
    let snapshot: RegistrySnapshot = serde_json::from_str(&content)?;
    debug!(path = %path.display(), volumes = snapshot.volumes.len(), "Loaded registry state");
    Ok(snapshot)
}

/// Write a snapshot to a JSON file atomically.
///
/// 1. Write to `.new` file
/// 2. Copy current to `.old` (backup)
/// 3. Rename `.new` to current
pub async fn write_snapshot(path: impl AsRef<Path>, snapshot: &RegistrySnapshot) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let path = path.as_ref();
    let new_path = path.with_extension("json.new");
    let old_path = path.with_extension("json.old");

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_string_pretty(snapshot)?;
    let mut file = tokio::fs::File::create(&new_path).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::copy(path, &old_path).await?;
    }

    tokio::fs::rename(&new_path, path).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{AttachStatus, VolumeStatus};
    use tempfile::TempDir;

    fn sample_volume(id: u64) -> Volume {
        Volume {
            id: VolumeId::new(id),
            display_name: format!("vol{id}"),
            display_description: String::new(),
            size: 1,
            status: VolumeStatus::Available,
            attach_status: AttachStatus::Detached,
            fingerprint: None,
            user_id: "user".to_string(),
            project_id: "project".to_string(),
            host: None,
            deleted: false,
            created_at: 1,
            updated_at: 1,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volumes.json");

        let snapshot = load_snapshot(&path).await.unwrap();
        assert!(snapshot.volumes.is_empty());
        assert_eq!(snapshot.next_id(), 1);
    }

    #[tokio::test]
    async fn test_write_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("volumes.json");

        let mut snapshot = RegistrySnapshot::default();
        snapshot.volumes.insert(VolumeId::new(3), sample_volume(3));
        snapshot.last_id = 3;

        write_snapshot(&path, &snapshot).await.unwrap();
        let loaded = load_snapshot(&path).await.unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.next_id(), 4);
    }

    #[tokio::test]
    async fn test_write_keeps_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volumes.json");

        write_snapshot(&path, &RegistrySnapshot::default()).await.unwrap();
        let mut snapshot = RegistrySnapshot::default();
        snapshot.volumes.insert(VolumeId::new(1), sample_volume(1));
        write_snapshot(&path, &snapshot).await.unwrap();

        assert!(path.with_extension("json.old").exists());
        assert!(!path.with_extension("json.new").exists());
    }

    #[tokio::test]
    async fn test_load_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volumes.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        assert!(load_snapshot(&path).await.is_err());
    }

    #[test]
    fn test_next_id_after_purge() {
        // last_id wins when the highest record was purged
        let snapshot = RegistrySnapshot {
            last_id: 9,
            volumes: BTreeMap::from([(VolumeId::new(2), sample_volume(2))]),
        };
        assert_eq!(snapshot.next_id(), 10);
    }
}

//! Volume metadata registry.
//!
//! Holds every volume record behind a tokio `RwLock` and enforces the status
//! transition rules. The registry knows nothing about physical devices; the
//! provisioner and the [`VolumeApi`](crate::api::VolumeApi) drive it.
//!
//! `creating -> available` is only reachable through [`VolumeRegistry::mark_available`],
//! which is private to this crate and called by the provisioner alone.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, instrument, warn};

use crate::error::{RegistryError, Result};
use crate::metrics;
use crate::store::{self, RegistrySnapshot};
use crate::volume::{AttachStatus, Fingerprint, Owner, Volume, VolumeId, VolumeStatus};

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Outcome of a delete request against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteStart {
    /// Record moved to `deleting`; the caller must finish the delete.
    Started(Volume),
    /// Record was already `deleted`; nothing to do.
    AlreadyDeleted(Volume),
}

/// Registry of volume records.
pub struct VolumeRegistry {
    state: RwLock<RegistrySnapshot>,
    /// JSON file the snapshot is written to after each mutation
    state_path: Option<PathBuf>,
}

impl VolumeRegistry {
    /// Create an empty, memory-only registry.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistrySnapshot::default()),
            state_path: None,
        }
    }

    /// Open a registry persisted at `path`, loading existing records.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = store::load_snapshot(&path).await?;
        info!(
            path = %path.display(),
            volumes = snapshot.volumes.len(),
            "Opened volume registry"
        );
        metrics::set_volumes_count(live_count(&snapshot));
        Ok(Self {
            state: RwLock::new(snapshot),
            state_path: Some(path),
        })
    }

    async fn persist(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        if let Some(path) = &self.state_path {
            store::write_snapshot(path, snapshot).await?;
        }
        metrics::set_volumes_count(live_count(snapshot));
        Ok(())
    }

    /// Persist `next` and only then make it the live state.
    ///
    /// A failed write leaves the in-memory records untouched.
    async fn commit(
        &self,
        state: &mut RwLockWriteGuard<'_, RegistrySnapshot>,
        next: RegistrySnapshot,
    ) -> Result<()> {
        self.persist(&next).await?;
        **state = next;
        Ok(())
    }

    /// Apply `f` to a copy of a record under the write lock and commit it.
    async fn update<F>(&self, id: VolumeId, f: F) -> Result<Volume>
    where
        F: FnOnce(&mut Volume) -> Result<()>,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let volume = next
            .volumes
            .get_mut(&id)
            .ok_or(RegistryError::VolumeNotFound(id))?;
        f(volume)?;
        volume.updated_at = now_epoch();
        let updated = volume.clone();
        self.commit(&mut state, next).await?;
        Ok(updated)
    }

    /// Create a new record in `creating` / `detached` state.
    #[instrument(skip(self, owner, description))]
    pub async fn create(
        &self,
        owner: &Owner,
        size: u64,
        name: &str,
        description: &str,
    ) -> Result<Volume> {
        if size == 0 {
            return Err(RegistryError::InvalidSize(size));
        }

        let mut state = self.state.write().await;
        let id = VolumeId::new(state.next_id());
        let now = now_epoch();
        let volume = Volume {
            id,
            display_name: name.to_string(),
            display_description: description.to_string(),
            size,
            status: VolumeStatus::Creating,
            attach_status: AttachStatus::Detached,
            fingerprint: None,
            user_id: owner.user_id.clone(),
            project_id: owner.project_id.clone(),
            host: None,
            deleted: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let mut next = state.clone();
        next.last_id = id.get();
        next.volumes.insert(id, volume.clone());
        self.commit(&mut state, next).await?;

        info!(volume_id = %id, size, "Volume record created");
        Ok(volume)
    }

    /// Fetch a record. Soft-deleted records are still returned.
    pub async fn get(&self, id: VolumeId) -> Result<Volume> {
        self.state
            .read()
            .await
            .volumes
            .get(&id)
            .cloned()
            .ok_or(RegistryError::VolumeNotFound(id))
    }

    /// All records belonging to `owner`, soft-deleted ones included.
    pub async fn list(&self, owner: &Owner) -> Vec<Volume> {
        self.state
            .read()
            .await
            .volumes
            .values()
            .filter(|v| v.is_owned_by(owner))
            .cloned()
            .collect()
    }

    /// Provisioning finished. Only moves a record out of `creating`.
    ///
    /// Returns `false` if the record left `creating` in the meantime (for
    /// example it was deleted while the backend was still working).
    pub(crate) async fn mark_available(&self, id: VolumeId) -> Result<bool> {
        self.finish_provisioning(id, VolumeStatus::Available).await
    }

    /// Provisioning failed.
    pub(crate) async fn mark_error(&self, id: VolumeId) -> Result<bool> {
        self.finish_provisioning(id, VolumeStatus::Error).await
    }

    async fn finish_provisioning(&self, id: VolumeId, status: VolumeStatus) -> Result<bool> {
        let mut changed = false;
        self.update(id, |volume| {
            if volume.status == VolumeStatus::Creating {
                volume.status = status;
                changed = true;
            }
            Ok(())
        })
        .await?;

        if changed {
            info!(volume_id = %id, status = %status, "Provisioning finished");
        } else {
            warn!(volume_id = %id, status = %status, "Volume left 'creating' before provisioning finished, ignoring");
        }
        Ok(changed)
    }

    /// Record the host a volume is assigned to and mark it attached.
    #[instrument(skip(self))]
    pub async fn assign_host(&self, id: VolumeId, host: &str) -> Result<Volume> {
        self.update(id, |volume| {
            if volume.status != VolumeStatus::Available {
                return Err(RegistryError::InvalidState {
                    id,
                    status: volume.status,
                    reason: "only available volumes can be assigned to a host",
                });
            }
            if let Some(current) = &volume.host
                && current != host
            {
                return Err(RegistryError::VolumeInUse {
                    id,
                    host: current.clone(),
                });
            }
            volume.host = Some(host.to_string());
            volume.attach_status = AttachStatus::Attached;
            Ok(())
        })
        .await
    }

    /// Clear the host assignment. Idempotent.
    #[instrument(skip(self))]
    pub async fn release_host(&self, id: VolumeId) -> Result<Volume> {
        self.update(id, |volume| {
            if volume.host.is_none() {
                debug!(volume_id = %id, "Volume not assigned to a host");
            }
            volume.host = None;
            volume.attach_status = AttachStatus::Detached;
            Ok(())
        })
        .await
    }

    /// Store the filesystem fingerprint read after the first format.
    #[instrument(skip(self))]
    pub async fn set_fingerprint(&self, id: VolumeId, fingerprint: Fingerprint) -> Result<Volume> {
        self.update(id, |volume| {
            if volume.deleted {
                return Err(RegistryError::InvalidState {
                    id,
                    status: volume.status,
                    reason: "cannot record a fingerprint on a deleted volume",
                });
            }
            volume.fingerprint = Some(fingerprint);
            Ok(())
        })
        .await
    }

    /// Move a record to `deleting`.
    #[instrument(skip(self))]
    pub async fn begin_delete(&self, id: VolumeId) -> Result<DeleteStart> {
        let mut already_deleted = false;
        let volume = self
            .update(id, |volume| {
                if volume.status == VolumeStatus::Deleted {
                    already_deleted = true;
                    return Ok(());
                }
                if volume.attach_status == AttachStatus::Attached {
                    return Err(RegistryError::VolumeInUse {
                        id,
                        host: volume.host.clone().unwrap_or_default(),
                    });
                }
                volume.status = VolumeStatus::Deleting;
                Ok(())
            })
            .await?;

        if already_deleted {
            debug!(volume_id = %id, "Volume already deleted (idempotent)");
            return Ok(DeleteStart::AlreadyDeleted(volume));
        }
        Ok(DeleteStart::Started(volume))
    }

    /// Move a record from `deleting` to soft-deleted.
    #[instrument(skip(self))]
    pub async fn finish_delete(&self, id: VolumeId) -> Result<Volume> {
        self.update(id, |volume| {
            volume.status = VolumeStatus::Deleted;
            volume.deleted = true;
            volume.deleted_at = Some(now_epoch());
            Ok(())
        })
        .await
    }

    /// Drop soft-deleted records. Returns the purged ids.
    pub async fn purge_deleted(&self) -> Result<Vec<VolumeId>> {
        let mut state = self.state.write().await;
        let purged: Vec<VolumeId> = state
            .volumes
            .values()
            .filter(|v| v.deleted)
            .map(|v| v.id)
            .collect();
        if purged.is_empty() {
            return Ok(purged);
        }

        let mut next = state.clone();
        next.volumes.retain(|_, v| !v.deleted);
        self.commit(&mut state, next).await?;
        info!(count = purged.len(), "Purged deleted volume records");
        Ok(purged)
    }

    /// Drop a single soft-deleted record. A missing record is not an error.
    pub async fn purge(&self, id: VolumeId) -> Result<()> {
        let mut state = self.state.write().await;
        match state.volumes.get(&id) {
            None => return Ok(()),
            Some(volume) if !volume.deleted => {
                return Err(RegistryError::InvalidState {
                    id,
                    status: volume.status,
                    reason: "only deleted volumes can be purged",
                });
            }
            Some(_) => {}
        }

        let mut next = state.clone();
        next.volumes.remove(&id);
        self.commit(&mut state, next).await?;
        info!(volume_id = %id, "Purged volume record");
        Ok(())
    }
}

impl Default for VolumeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn live_count(snapshot: &RegistrySnapshot) -> usize {
    snapshot.volumes.values().filter(|v| !v.deleted).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn owner() -> Owner {
        Owner::new("user1", "project1")
    }

    #[tokio::test]
    async fn test_create_starts_creating_detached() {
        let registry = VolumeRegistry::new();
        let volume = registry
            .create(&owner(), 1, "TestVolume", "A volume that was created for testing.")
            .await
            .unwrap();

        assert_eq!(volume.status, VolumeStatus::Creating);
        assert_eq!(volume.attach_status, AttachStatus::Detached);
        assert_eq!(volume.size, 1);
        assert_eq!(volume.display_name, "TestVolume");
        assert_eq!(volume.user_id, "user1");
        assert_eq!(volume.project_id, "project1");
        assert!(volume.fingerprint.is_none());
        assert!(!volume.deleted);
    }

    #[tokio::test]
    async fn test_create_rejects_zero_size() {
        let registry = VolumeRegistry::new();
        let err = registry.create(&owner(), 0, "bad", "").await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSize(0)));
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let registry = VolumeRegistry::new();
        let a = registry.create(&owner(), 1, "a", "").await.unwrap();
        let b = registry.create(&owner(), 1, "b", "").await.unwrap();
        assert_eq!(b.id.get(), a.id.get() + 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let registry = VolumeRegistry::new();
        let err = registry.get(VolumeId::new(99)).await.unwrap_err();
        assert!(matches!(err, RegistryError::VolumeNotFound(id) if id.get() == 99));
    }

    #[tokio::test]
    async fn test_mark_available_only_from_creating() {
        let registry = VolumeRegistry::new();
        let volume = registry.create(&owner(), 1, "a", "").await.unwrap();

        assert!(registry.mark_available(volume.id).await.unwrap());
        assert_eq!(
            registry.get(volume.id).await.unwrap().status,
            VolumeStatus::Available
        );

        // Second completion is ignored
        assert!(!registry.mark_available(volume.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_late_provisioning_does_not_resurrect() {
        let registry = VolumeRegistry::new();
        let volume = registry.create(&owner(), 1, "a", "").await.unwrap();

        registry.begin_delete(volume.id).await.unwrap();
        registry.finish_delete(volume.id).await.unwrap();

        assert!(!registry.mark_available(volume.id).await.unwrap());
        assert_eq!(
            registry.get(volume.id).await.unwrap().status,
            VolumeStatus::Deleted
        );
    }

    #[tokio::test]
    async fn test_assign_requires_available() {
        let registry = VolumeRegistry::new();
        let volume = registry.create(&owner(), 1, "a", "").await.unwrap();

        let err = registry.assign_host(volume.id, "host-a").await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_assign_and_release_host() {
        let registry = VolumeRegistry::new();
        let volume = registry.create(&owner(), 1, "a", "").await.unwrap();
        registry.mark_available(volume.id).await.unwrap();

        let assigned = registry.assign_host(volume.id, "host-a").await.unwrap();
        assert_eq!(assigned.attach_status, AttachStatus::Attached);
        assert_eq!(assigned.host.as_deref(), Some("host-a"));

        // Same host again is fine, another host is not
        registry.assign_host(volume.id, "host-a").await.unwrap();
        let err = registry.assign_host(volume.id, "host-b").await.unwrap_err();
        assert!(matches!(err, RegistryError::VolumeInUse { .. }));

        let released = registry.release_host(volume.id).await.unwrap();
        assert_eq!(released.attach_status, AttachStatus::Detached);
        assert!(released.host.is_none());
        registry.release_host(volume.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_idempotent() {
        let registry = VolumeRegistry::new();
        let volume = registry.create(&owner(), 1, "a", "").await.unwrap();
        registry.mark_available(volume.id).await.unwrap();

        let start = registry.begin_delete(volume.id).await.unwrap();
        assert!(matches!(start, DeleteStart::Started(ref v) if v.status == VolumeStatus::Deleting));
        registry.finish_delete(volume.id).await.unwrap();

        let deleted = registry.get(volume.id).await.unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.status, VolumeStatus::Deleted);
        assert!(deleted.deleted_at.is_some());

        let again = registry.begin_delete(volume.id).await.unwrap();
        assert!(matches!(again, DeleteStart::AlreadyDeleted(_)));
    }

    #[tokio::test]
    async fn test_delete_rejected_while_attached() {
        let registry = VolumeRegistry::new();
        let volume = registry.create(&owner(), 1, "a", "").await.unwrap();
        registry.mark_available(volume.id).await.unwrap();
        registry.assign_host(volume.id, "host-a").await.unwrap();

        let err = registry.begin_delete(volume.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::VolumeInUse { ref host, .. } if host == "host-a"));
    }

    #[tokio::test]
    async fn test_fingerprint_recorded() {
        let registry = VolumeRegistry::new();
        let volume = registry.create(&owner(), 1, "a", "").await.unwrap();
        let fp = Fingerprint::generate();

        let updated = registry.set_fingerprint(volume.id, fp.clone()).await.unwrap();
        assert_eq!(updated.fingerprint, Some(fp));
    }

    #[tokio::test]
    async fn test_purge() {
        let registry = VolumeRegistry::new();
        let keep = registry.create(&owner(), 1, "keep", "").await.unwrap();
        let gone = registry.create(&owner(), 1, "gone", "").await.unwrap();

        assert!(registry.purge(keep.id).await.is_err());

        registry.begin_delete(gone.id).await.unwrap();
        registry.finish_delete(gone.id).await.unwrap();

        let purged = registry.purge_deleted().await.unwrap();
        assert_eq!(purged, vec![gone.id]);
        assert!(matches!(
            registry.get(gone.id).await,
            Err(RegistryError::VolumeNotFound(_))
        ));
        registry.get(keep.id).await.unwrap();

        // Ids are never reused
        let next = registry.create(&owner(), 1, "next", "").await.unwrap();
        assert!(next.id > gone.id);
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let registry = VolumeRegistry::new();
        registry.create(&owner(), 1, "mine", "").await.unwrap();
        registry
            .create(&Owner::new("other", "project1"), 1, "theirs", "")
            .await
            .unwrap();

        let mine = registry.list(&owner()).await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].display_name, "mine");
    }

    #[tokio::test]
    async fn test_failed_write_leaves_records_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        // parent of the state file is a regular file, so every write fails
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let registry = VolumeRegistry::open(blocker.join("volumes.json")).await.unwrap();

        let err = registry.create(&owner(), 1, "lost", "").await.unwrap_err();
        assert!(matches!(err, RegistryError::Io(_)));
        assert!(matches!(
            registry.get(VolumeId::new(1)).await,
            Err(RegistryError::VolumeNotFound(_))
        ));
        assert!(registry.list(&owner()).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("state");
        let path = dir.join("volumes.json");
        let registry = VolumeRegistry::open(&path).await.unwrap();
        let volume = registry.create(&owner(), 1, "a", "").await.unwrap();

        // swap the state directory for a file so the next write fails
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, b"").unwrap();

        let err = registry
            .set_fingerprint(volume.id, Fingerprint::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Io(_)));
        assert!(registry.get(volume.id).await.unwrap().fingerprint.is_none());
    }

    #[tokio::test]
    async fn test_persisted_registry_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volumes.json");

        let id = {
            let registry = VolumeRegistry::open(&path).await.unwrap();
            let volume = registry.create(&owner(), 2, "persisted", "").await.unwrap();
            registry.mark_available(volume.id).await.unwrap();
            volume.id
        };

        let reopened = VolumeRegistry::open(&path).await.unwrap();
        let volume = reopened.get(id).await.unwrap();
        assert_eq!(volume.display_name, "persisted");
        assert_eq!(volume.status, VolumeStatus::Available);

        let next = reopened.create(&owner(), 1, "next", "").await.unwrap();
        assert_eq!(next.id.get(), id.get() + 1);
    }
}

//! In-process block layer.
//!
//! Simulates attach, mkfs and mount so the full lifecycle can run on a
//! machine without an initiator or root. Each volume has a backing "disk"
//! that keeps its filesystem across detach/attach; every attach hands out a
//! fresh device node, so a device path from an earlier session goes stale
//! exactly like a real one. Mount points are real directories.
//!
//! Clones share state: two drivers built from the same `MemoryDriver` see
//! the same devices.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use volume_agent::{Fingerprint, Volume, VolumeId, VolumeStatus};

use super::{DriverError, DriverResult, HostAssignments, StorageDriver, lock};
use crate::types::DevicePath;

#[derive(Debug, Default)]
struct Disk {
    filesystem: Option<Fingerprint>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_device: u32,
    disks: HashMap<VolumeId, Disk>,
    /// Attached device -> volume
    attached: HashMap<DevicePath, VolumeId>,
    mounts: HashMap<PathBuf, DevicePath>,
}

impl MemoryState {
    fn device_of(&self, volume_id: VolumeId) -> Option<DevicePath> {
        self.attached
            .iter()
            .find(|(_, id)| **id == volume_id)
            .map(|(device, _)| device.clone())
    }

    fn disk_for(&mut self, device: &DevicePath) -> Option<&mut Disk> {
        let volume_id = *self.attached.get(device)?;
        self.disks.get_mut(&volume_id)
    }
}

#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
    assignments: Arc<HostAssignments>,
    rejected_hosts: Arc<HashSet<String>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`assign_to_host`](StorageDriver::assign_to_host) reject `host`,
    /// as a backend would for an unknown initiator.
    pub fn with_rejected_host(mut self, host: impl Into<String>) -> Self {
        let mut rejected = (*self.rejected_hosts).clone();
        rejected.insert(host.into());
        self.rejected_hosts = Arc::new(rejected);
        self
    }

    /// Devices currently attached, for diagnostics.
    pub fn attached_devices(&self) -> Vec<DevicePath> {
        lock(&self.state).attached.keys().cloned().collect()
    }
}

impl StorageDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn assign_to_host(&self, volume: &Volume, host: &str) -> DriverResult<()> {
        let reject = |reason: &str| DriverError::Assignment {
            volume_id: volume.id,
            host: host.to_string(),
            reason: reason.to_string(),
        };

        if self.rejected_hosts.contains(host) {
            return Err(reject("host rejected by backend"));
        }
        if volume.deleted || volume.status != VolumeStatus::Available {
            return Err(reject("volume is not available"));
        }

        self.assignments.assign(volume.id, host)?;
        lock(&self.state).disks.entry(volume.id).or_default();
        info!(volume_id = %volume.id, host = %host, "Volume assigned to host");
        Ok(())
    }

    fn unassign_from_host(&self, volume_id: VolumeId, host: &str) -> DriverResult<()> {
        if self.assignments.release(volume_id, host) {
            info!(volume_id = %volume_id, host = %host, "Volume unassigned from host");
        } else {
            debug!(volume_id = %volume_id, host = %host, "Volume was not assigned to host");
        }
        Ok(())
    }

    fn discover(&self, volume_id: VolumeId) -> DriverResult<DevicePath> {
        lock(&self.state)
            .device_of(volume_id)
            .ok_or_else(|| DriverError::DeviceNotFound(format!("volume {}", volume_id)))
    }

    fn setup(&self, volume_id: VolumeId) -> DriverResult<DevicePath> {
        self.assignments.require(volume_id)?;

        let mut state = lock(&self.state);
        if let Some(device) = state.device_of(volume_id) {
            debug!(volume_id = %volume_id, device = %device, "Volume already attached");
            return Ok(device);
        }

        let device = DevicePath::new(format!("/dev/memdisk{}", state.next_device));
        state.next_device += 1;
        state.disks.entry(volume_id).or_default();
        state.attached.insert(device.clone(), volume_id);

        info!(volume_id = %volume_id, device = %device, "Volume attached");
        Ok(device)
    }

    fn detach(&self, volume_id: VolumeId) -> DriverResult<()> {
        let mut state = lock(&self.state);
        let Some(device) = state.device_of(volume_id) else {
            debug!(volume_id = %volume_id, "Volume not attached, nothing to detach");
            return Ok(());
        };

        let before = state.mounts.len();
        state.mounts.retain(|_, mounted| *mounted != device);
        if state.mounts.len() != before {
            warn!(device = %device, "Detaching a mounted device, dropping its mounts");
        }
        state.attached.remove(&device);
        info!(volume_id = %volume_id, device = %device, "Volume detached");
        Ok(())
    }

    fn format(&self, device: &DevicePath) -> DriverResult<()> {
        let mut state = lock(&self.state);
        let disk = state
            .disk_for(device)
            .ok_or_else(|| DriverError::DeviceNotFound(device.to_string()))?;

        let fingerprint = Fingerprint::generate();
        info!(device = %device, fingerprint = %fingerprint, "Formatted device");
        disk.filesystem = Some(fingerprint);
        Ok(())
    }

    fn get_fingerprint(&self, device: &DevicePath) -> DriverResult<Fingerprint> {
        let mut state = lock(&self.state);
        state
            .disk_for(device)
            .and_then(|disk| disk.filesystem.clone())
            .ok_or_else(|| DriverError::DevicePathInvalidForFingerprint(device.to_string()))
    }

    fn mount(&self, device: &DevicePath, mount_point: &Path) -> DriverResult<()> {
        let mount_error = |reason: String| DriverError::Mount {
            device: device.to_string(),
            mount_point: mount_point.display().to_string(),
            reason,
        };

        let mut state = lock(&self.state);
        let formatted = state
            .disk_for(device)
            .ok_or_else(|| mount_error("no such device".to_string()))?
            .filesystem
            .is_some();
        if !formatted {
            return Err(mount_error("wrong fs type, bad superblock".to_string()));
        }

        match state.mounts.get(mount_point) {
            Some(current) if current == device => {
                debug!(device = %device, mount_point = %mount_point.display(), "Already mounted");
                return Ok(());
            }
            Some(current) => {
                return Err(mount_error(format!("{} already mounted there", current)));
            }
            None => {}
        }

        std::fs::create_dir_all(mount_point).map_err(|e| mount_error(e.to_string()))?;
        state
            .mounts
            .insert(mount_point.to_path_buf(), device.clone());
        info!(device = %device, mount_point = %mount_point.display(), "Mounted device");
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> DriverResult<()> {
        if lock(&self.state).mounts.remove(mount_point).is_none() {
            debug!(mount_point = %mount_point.display(), "Path is not mounted, skipping unmount");
            return Ok(());
        }
        info!(mount_point = %mount_point.display(), "Unmounted");
        Ok(())
    }

    fn is_mounted(&self, mount_point: &Path) -> DriverResult<bool> {
        Ok(lock(&self.state).mounts.contains_key(mount_point))
    }
}

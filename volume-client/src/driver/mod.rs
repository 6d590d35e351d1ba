//! Storage driver capability.
//!
//! A [`StorageDriver`] turns a volume id into a usable local block device:
//! host assignment, attach/discovery, formatting, fingerprint read-back and
//! mounting. The [`VolumeClient`](crate::client::VolumeClient) takes one by
//! injection, so a different backend (iSCSI, in-memory, a decorator such as
//! [`FormatGuard`]) is swapped in without touching the client.
//!
//! Driver calls are blocking; real drivers shell out to host tools.

mod guard;
pub mod iscsi;
pub mod memory;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;
use volume_agent::{Fingerprint, Volume, VolumeId};

use crate::types::DevicePath;

pub use guard::FormatGuard;
pub use iscsi::{IscsiDriver, IscsiSettings};
pub use memory::MemoryDriver;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device path '{0}' does not hold a filesystem with a UUID")]
    DevicePathInvalidForFingerprint(String),

    #[error("failed to mount {device} at {mount_point}: {reason}")]
    Mount {
        device: String,
        mount_point: String,
        reason: String,
    },

    #[error("failed to unmount {mount_point}: {reason}")]
    Unmount { mount_point: String, reason: String },

    #[error("volume {volume_id} cannot be assigned to host '{host}': {reason}")]
    Assignment {
        volume_id: VolumeId,
        host: String,
        reason: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Short label used in metrics.
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::DeviceNotFound(_) => "device_not_found",
            DriverError::DevicePathInvalidForFingerprint(_) => "invalid_device_path",
            DriverError::Mount { .. } => "mount_error",
            DriverError::Unmount { .. } => "unmount_error",
            DriverError::Assignment { .. } => "assignment_error",
            DriverError::InvalidArgument(_) => "invalid_argument",
            DriverError::CommandFailed { .. } => "command_failed",
            DriverError::Io(_) => "io_error",
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Block storage backend as seen from a compute host.
pub trait StorageDriver: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Record that `volume` belongs to `host`. Idempotent for the same host.
    fn assign_to_host(&self, volume: &Volume, host: &str) -> DriverResult<()>;

    /// Undo [`assign_to_host`](Self::assign_to_host). A no-op if the volume is
    /// not assigned to `host`.
    fn unassign_from_host(&self, volume_id: VolumeId, host: &str) -> DriverResult<()>;

    /// Resolve an attached volume to its local device.
    fn discover(&self, volume_id: VolumeId) -> DriverResult<DevicePath>;

    /// Verify assignment, attach the volume and return its device.
    fn setup(&self, volume_id: VolumeId) -> DriverResult<DevicePath>;

    /// Drop the local attachment. Idempotent.
    fn detach(&self, volume_id: VolumeId) -> DriverResult<()>;

    /// Write a fresh filesystem to `device`.
    fn format(&self, device: &DevicePath) -> DriverResult<()>;

    /// Read the filesystem UUID of `device`.
    fn get_fingerprint(&self, device: &DevicePath) -> DriverResult<Fingerprint>;

    /// Mount `device` at `mount_point`, creating the directory if needed.
    fn mount(&self, device: &DevicePath, mount_point: &Path) -> DriverResult<()>;

    /// Unmount `mount_point`. A no-op if nothing is mounted there.
    fn unmount(&self, mount_point: &Path) -> DriverResult<()>;

    /// Whether `mount_point` is a live mount on this host.
    fn is_mounted(&self, mount_point: &Path) -> DriverResult<bool>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Validate that a host name is safe to record and pass to tools.
pub(crate) fn validate_host(host: &str) -> Result<(), String> {
    if host.is_empty() {
        return Err("host name cannot be empty".to_string());
    }
    let valid = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
    if !valid {
        return Err("host name contains invalid characters".to_string());
    }
    Ok(())
}

/// Volume to host assignment table shared by drivers.
///
/// A volume belongs to at most one host; that is what keeps two hosts from
/// formatting the same volume.
#[derive(Debug, Default)]
pub struct HostAssignments {
    inner: Mutex<HashMap<VolumeId, String>>,
}

impl HostAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, volume_id: VolumeId, host: &str) -> DriverResult<()> {
        validate_host(host).map_err(|reason| DriverError::Assignment {
            volume_id,
            host: host.to_string(),
            reason,
        })?;

        let mut table = lock(&self.inner);
        match table.get(&volume_id) {
            Some(current) if current == host => {
                debug!(volume_id = %volume_id, host = %host, "Volume already assigned to host");
                Ok(())
            }
            Some(current) => Err(DriverError::Assignment {
                volume_id,
                host: host.to_string(),
                reason: format!("already assigned to '{}'", current),
            }),
            None => {
                table.insert(volume_id, host.to_string());
                Ok(())
            }
        }
    }

    /// Returns whether an assignment was removed.
    pub fn release(&self, volume_id: VolumeId, host: &str) -> bool {
        let mut table = lock(&self.inner);
        if table.get(&volume_id).is_some_and(|current| current == host) {
            table.remove(&volume_id);
            return true;
        }
        false
    }

    pub fn host_of(&self, volume_id: VolumeId) -> Option<String> {
        lock(&self.inner).get(&volume_id).cloned()
    }

    /// Error unless `volume_id` is assigned to some host.
    pub fn require(&self, volume_id: VolumeId) -> DriverResult<String> {
        self.host_of(volume_id)
            .ok_or_else(|| DriverError::Assignment {
                volume_id,
                host: String::new(),
                reason: "volume is not assigned to any host".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_host() {
        assert!(validate_host("vagrant-host").is_ok());
        assert!(validate_host("compute-1.example.com").is_ok());
        assert!(validate_host("").is_err());
        assert!(validate_host("host;reboot").is_err());
        assert!(validate_host("host name").is_err());
    }

    #[test]
    fn test_assign_is_idempotent_per_host() {
        let table = HostAssignments::new();
        let id = VolumeId::new(1);

        table.assign(id, "host-a").unwrap();
        table.assign(id, "host-a").unwrap();
        assert_eq!(table.host_of(id).as_deref(), Some("host-a"));

        let err = table.assign(id, "host-b").unwrap_err();
        assert!(matches!(err, DriverError::Assignment { .. }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let table = HostAssignments::new();
        let id = VolumeId::new(1);
        table.assign(id, "host-a").unwrap();

        // wrong host leaves the assignment in place
        assert!(!table.release(id, "host-b"));
        assert!(table.release(id, "host-a"));
        assert!(!table.release(id, "host-a"));
        assert!(table.require(id).is_err());
    }
}

//! Host-side volume client.
//!
//! Drives one [`StorageDriver`] for one compute host and keeps the registry
//! in step: host assignment goes to both, the first format's fingerprint is
//! written back to the record. Driver calls run on the blocking pool.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use volume_agent::{Fingerprint, RegistryError, Volume, VolumeApi, VolumeId};

use crate::driver::{DriverError, DriverResult, StorageDriver, lock};
use crate::metrics;
use crate::types::DevicePath;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Host-level failure, including a format that left no new filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Where a volume stands on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Unattached,
    Attached {
        device: DevicePath,
    },
    Formatted {
        device: DevicePath,
        fingerprint: Fingerprint,
    },
    Mounted {
        device: DevicePath,
        mount_point: PathBuf,
    },
}

impl SessionState {
    fn device(&self) -> Option<&DevicePath> {
        match self {
            SessionState::Unattached => None,
            SessionState::Attached { device }
            | SessionState::Formatted { device, .. }
            | SessionState::Mounted { device, .. } => Some(device),
        }
    }
}

pub struct VolumeClient {
    driver: Arc<dyn StorageDriver>,
    api: Arc<VolumeApi>,
    host: String,
    sessions: Mutex<HashMap<VolumeId, SessionState>>,
}

impl VolumeClient {
    pub fn new(driver: Arc<dyn StorageDriver>, api: Arc<VolumeApi>, host: impl Into<String>) -> Self {
        let host = host.into();
        info!(driver = driver.name(), host = %host, "Volume client ready");
        Self {
            driver,
            api,
            host,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Same registry and host, different driver. Sessions start empty.
    pub fn with_driver(&self, driver: Arc<dyn StorageDriver>) -> Self {
        Self::new(driver, Arc::clone(&self.api), self.host.clone())
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session_state(&self, volume_id: VolumeId) -> SessionState {
        lock(&self.sessions)
            .get(&volume_id)
            .cloned()
            .unwrap_or(SessionState::Unattached)
    }

    async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StorageDriver) -> DriverResult<T> + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        let result = tokio::task::spawn_blocking(move || {
            metrics::observe(driver.name(), operation, || f(driver.as_ref()))
        })
        .await
        .map_err(|e| ClientError::Io(io::Error::other(e)))?;
        Ok(result?)
    }

    fn set_session(&self, volume_id: VolumeId, state: SessionState) {
        lock(&self.sessions).insert(volume_id, state);
    }

    /// Apply `f` to the session that holds `device`, if any.
    fn update_session_by_device(&self, device: &DevicePath, f: impl FnOnce(&mut SessionState)) {
        let mut sessions = lock(&self.sessions);
        if let Some(state) = sessions
            .values_mut()
            .find(|state| state.device() == Some(device))
        {
            f(state);
        }
    }

    /// Assign a volume to this client's host in the driver and the registry.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn assign_to_host(&self, volume_id: VolumeId) -> Result<Volume> {
        let volume = self.api.get(volume_id).await?;

        let host = self.host.clone();
        self.call("assign_to_host", move |driver| driver.assign_to_host(&volume, &host))
            .await?;

        match self.api.add_to_host(volume_id, &self.host).await {
            Ok(volume) => {
                info!(volume_id = %volume_id, "Volume assigned");
                Ok(volume)
            }
            Err(e) => {
                let host = self.host.clone();
                if let Err(undo) = self
                    .call("unassign_from_host", move |driver| {
                        driver.unassign_from_host(volume_id, &host)
                    })
                    .await
                {
                    warn!(volume_id = %volume_id, error = %undo, "Failed to roll back driver assignment");
                }
                Err(e.into())
            }
        }
    }

    /// Attach an assigned volume and return its device.
    ///
    /// The registry record is the source of truth for the assignment: a
    /// volume the record places on this host is re-assigned in the driver
    /// first, so a driver built after `assign_to_host` (another process)
    /// still sets it up.
    #[instrument(skip(self))]
    pub async fn setup_volume(&self, volume_id: VolumeId) -> Result<DevicePath> {
        let volume = self.api.get(volume_id).await?;
        if volume.host.as_deref() == Some(self.host.as_str()) {
            let host = self.host.clone();
            self.call("assign_to_host", move |driver| driver.assign_to_host(&volume, &host))
                .await?;
        }

        let device = self
            .call("setup", move |driver| driver.setup(volume_id))
            .await?;
        info!(volume_id = %volume_id, device = %device, "Volume set up");
        self.set_session(volume_id, SessionState::Attached { device: device.clone() });
        Ok(device)
    }

    pub async fn discover(&self, volume_id: VolumeId) -> Result<DevicePath> {
        let device = self
            .call("discover", move |driver| driver.discover(volume_id))
            .await?;
        lock(&self.sessions)
            .entry(volume_id)
            .or_insert_with(|| SessionState::Attached { device: device.clone() });
        Ok(device)
    }

    /// Format `device` and return the new fingerprint.
    ///
    /// The fingerprint is read back afterwards; it must exist and differ
    /// from whatever was on the device before, otherwise the format is
    /// reported as an I/O failure.
    #[instrument(skip(self, device), fields(device = %device))]
    pub async fn format(&self, device: &DevicePath) -> Result<Fingerprint> {
        let dev = device.clone();
        let before = self
            .call("get_fingerprint", move |driver| driver.get_fingerprint(&dev))
            .await
            .ok();

        let dev = device.clone();
        self.call("format", move |driver| driver.format(&dev)).await?;

        let dev = device.clone();
        let after = match self
            .call("get_fingerprint", move |driver| driver.get_fingerprint(&dev))
            .await
        {
            Ok(fingerprint) => fingerprint,
            Err(ClientError::Driver(DriverError::DevicePathInvalidForFingerprint(_))) => {
                error!(device = %device, "No filesystem found after format");
                return Err(ClientError::Io(io::Error::other(format!(
                    "format of {} did not produce a filesystem",
                    device
                ))));
            }
            Err(e) => return Err(e),
        };

        if before.as_ref() == Some(&after) {
            error!(device = %device, fingerprint = %after, "Fingerprint unchanged after format");
            return Err(ClientError::Io(io::Error::other(format!(
                "format of {} left filesystem {} in place",
                device, after
            ))));
        }

        info!(device = %device, fingerprint = %after, "Device formatted");
        let fingerprint = after.clone();
        self.update_session_by_device(device, move |state| {
            *state = SessionState::Formatted {
                device: device.clone(),
                fingerprint,
            };
        });
        Ok(after)
    }

    /// Make sure a volume carries a filesystem and return its fingerprint.
    ///
    /// A volume whose record already has a fingerprint is left alone: no
    /// setup and no format. Otherwise it is set up, formatted and the new
    /// fingerprint is stored in the registry.
    #[instrument(skip(self))]
    pub async fn initialize(&self, volume_id: VolumeId) -> Result<Fingerprint> {
        let volume = self.api.get(volume_id).await?;
        if let Some(fingerprint) = volume.fingerprint {
            debug!(volume_id = %volume_id, fingerprint = %fingerprint, "Volume already initialized");
            return Ok(fingerprint);
        }

        let device = self.setup_volume(volume_id).await?;
        let fingerprint = self.format(&device).await?;
        self.api
            .update_fingerprint(volume_id, fingerprint.clone())
            .await?;
        info!(volume_id = %volume_id, fingerprint = %fingerprint, "Volume initialized");
        Ok(fingerprint)
    }

    pub async fn mount(&self, device: &DevicePath, mount_point: &Path) -> Result<()> {
        let dev = device.clone();
        let target = mount_point.to_path_buf();
        self.call("mount", move |driver| driver.mount(&dev, &target))
            .await?;

        self.update_session_by_device(device, |state| {
            *state = SessionState::Mounted {
                device: device.clone(),
                mount_point: mount_point.to_path_buf(),
            };
        });
        Ok(())
    }

    /// Unmount and confirm the mount point left the mount table.
    #[instrument(skip(self, mount_point), fields(mount_point = %mount_point.display()))]
    pub async fn unmount(&self, mount_point: &Path) -> Result<()> {
        let target = mount_point.to_path_buf();
        self.call("unmount", move |driver| driver.unmount(&target))
            .await?;

        let target = mount_point.to_path_buf();
        if self
            .call("is_mounted", move |driver| driver.is_mounted(&target))
            .await?
        {
            error!(mount_point = %mount_point.display(), "Still mounted after unmount");
            return Err(DriverError::Unmount {
                mount_point: mount_point.display().to_string(),
                reason: "still present in the mount table".to_string(),
            }
            .into());
        }

        let mut sessions = lock(&self.sessions);
        for state in sessions.values_mut() {
            let device = match state {
                SessionState::Mounted {
                    device,
                    mount_point: mounted,
                } if mounted.as_path() == mount_point => device.clone(),
                _ => continue,
            };
            *state = SessionState::Attached { device };
        }
        Ok(())
    }

    /// Detach a volume from this host and release its assignment.
    ///
    /// The assignment is released for the host recorded in the registry,
    /// falling back to this client's host.
    #[instrument(skip(self))]
    pub async fn remove_volume(&self, volume_id: VolumeId) -> Result<Volume> {
        let volume = self.api.get(volume_id).await?;

        self.call("detach", move |driver| driver.detach(volume_id))
            .await?;

        let host = volume.host.unwrap_or_else(|| self.host.clone());
        self.call("unassign_from_host", move |driver| {
            driver.unassign_from_host(volume_id, &host)
        })
        .await?;

        let volume = self.api.remove_from_host(volume_id).await?;
        lock(&self.sessions).remove(&volume_id);
        info!(volume_id = %volume_id, "Volume removed from host");
        Ok(volume)
    }

    pub async fn get_fingerprint(&self, device: &DevicePath) -> Result<Fingerprint> {
        let dev = device.clone();
        self.call("get_fingerprint", move |driver| driver.get_fingerprint(&dev))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use volume_agent::{Owner, PollSettings, VolumeStatus, poll_until};

    async fn available_volume(api: &VolumeApi) -> VolumeId {
        let volume = api
            .create(&Owner::new("user", "project"), 1, "v", "")
            .await
            .unwrap();
        poll_until(
            || api.get(volume.id),
            |v| v.status == VolumeStatus::Available,
            PollSettings::default(),
        )
        .await
        .unwrap();
        volume.id
    }

    #[tokio::test]
    async fn test_session_follows_lifecycle() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mount_point = temp_dir.path().join("1");
        let api = Arc::new(VolumeApi::in_memory());
        let client = VolumeClient::new(Arc::new(MemoryDriver::new()), Arc::clone(&api), "host-a");
        let id = available_volume(&api).await;

        assert_eq!(client.session_state(id), SessionState::Unattached);
        client.assign_to_host(id).await.unwrap();
        let device = client.setup_volume(id).await.unwrap();
        assert_eq!(
            client.session_state(id),
            SessionState::Attached {
                device: device.clone()
            }
        );

        let fingerprint = client.format(&device).await.unwrap();
        assert!(matches!(
            client.session_state(id),
            SessionState::Formatted { fingerprint: ref fp, .. } if *fp == fingerprint
        ));

        client.mount(&device, &mount_point).await.unwrap();
        assert!(matches!(client.session_state(id), SessionState::Mounted { .. }));

        client.unmount(&mount_point).await.unwrap();
        assert_eq!(
            client.session_state(id),
            SessionState::Attached {
                device: device.clone()
            }
        );

        client.remove_volume(id).await.unwrap();
        assert_eq!(client.session_state(id), SessionState::Unattached);
    }

    #[tokio::test]
    async fn test_assign_rolls_back_when_registry_refuses() {
        let api = Arc::new(VolumeApi::in_memory());
        let driver = Arc::new(MemoryDriver::new());
        let id = available_volume(&api).await;

        // another host already holds the record
        api.add_to_host(id, "host-b").await.unwrap();

        let client = VolumeClient::new(driver.clone(), Arc::clone(&api), "host-a");
        let err = client.assign_to_host(id).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Registry(RegistryError::VolumeInUse { .. })
        ));

        // the driver-side assignment was undone, so host-b can take it
        let volume = api.get(id).await.unwrap();
        driver.assign_to_host(&volume, "host-b").unwrap();
    }

    #[tokio::test]
    async fn test_reformat_gives_new_fingerprint() {
        let api = Arc::new(VolumeApi::in_memory());
        let client = VolumeClient::new(Arc::new(MemoryDriver::new()), Arc::clone(&api), "host-a");
        let id = available_volume(&api).await;
        client.assign_to_host(id).await.unwrap();
        let device = client.setup_volume(id).await.unwrap();

        let first = client.format(&device).await.unwrap();
        let second = client.format(&device).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(client.get_fingerprint(&device).await.unwrap(), second);
    }
}

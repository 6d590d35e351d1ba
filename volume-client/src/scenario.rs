//! End-to-end volume lifecycle.
//!
//! [`LifecycleStory`] walks one volume from create to delete against a real
//! [`VolumeApi`] and [`VolumeClient`], checking the observable result of
//! every step. The story object carries what earlier steps produced (volume,
//! device, fingerprints) so steps can also be driven one at a time.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use volume_agent::{
    AttachStatus, Fingerprint, Owner, PollError, PollSettings, RegistryError, Volume, VolumeApi,
    VolumeId, VolumeStatus, poll_until,
};

use crate::client::{ClientError, VolumeClient};
use crate::driver::FormatGuard;
use crate::types::DevicePath;

pub const MARKER_FILE: &str = "test.txt";
pub const MARKER_CONTENTS: &str = "Yep, it's mounted alright.";

#[derive(Error, Debug)]
pub enum StoryError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("waiting on volume: {0}")]
    Poll(#[from] PollError<RegistryError>),

    #[error("marker file: {0}")]
    Io(#[from] std::io::Error),

    #[error("step '{step}' needs a {what} from an earlier step")]
    MissingContext {
        step: &'static str,
        what: &'static str,
    },

    #[error("step '{step}' failed: {reason}")]
    Check { step: &'static str, reason: String },
}

type Result<T> = std::result::Result<T, StoryError>;

#[derive(Debug, Clone)]
pub struct StoryConfig {
    pub owner: Owner,
    pub name: String,
    pub description: String,
    /// GiB
    pub size: u64,
    /// Per-volume mount points are created below this directory
    pub mount_root: PathBuf,
    pub poll: PollSettings,
}

impl StoryConfig {
    pub fn new(owner: Owner, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            name: "TestVolume".to_string(),
            description: "A volume that was created for testing.".to_string(),
            size: 1,
            mount_root: mount_root.into(),
            poll: PollSettings::default(),
        }
    }
}

/// What a completed story observed.
#[derive(Debug, Clone, Serialize)]
pub struct StoryReport {
    pub volume_id: VolumeId,
    pub original_fingerprint: Fingerprint,
    pub initialized_fingerprint: Fingerprint,
    /// `None` once the record has been purged
    pub final_status: Option<VolumeStatus>,
}

pub struct LifecycleStory {
    api: Arc<VolumeApi>,
    client: VolumeClient,
    config: StoryConfig,
    volume: Option<Volume>,
    device: Option<DevicePath>,
    mount_point: Option<PathBuf>,
    original_fingerprint: Option<Fingerprint>,
    initialized_fingerprint: Option<Fingerprint>,
    final_status: Option<VolumeStatus>,
}

fn check(step: &'static str, ok: bool, reason: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(StoryError::Check {
            step,
            reason: reason(),
        })
    }
}

impl LifecycleStory {
    pub fn new(api: Arc<VolumeApi>, client: VolumeClient, config: StoryConfig) -> Self {
        Self {
            api,
            client,
            config,
            volume: None,
            device: None,
            mount_point: None,
            original_fingerprint: None,
            initialized_fingerprint: None,
            final_status: None,
        }
    }

    pub fn volume(&self) -> Option<&Volume> {
        self.volume.as_ref()
    }

    pub fn device(&self) -> Option<&DevicePath> {
        self.device.as_ref()
    }

    pub fn client(&self) -> &VolumeClient {
        &self.client
    }

    fn volume_id(&self, step: &'static str) -> Result<VolumeId> {
        self.volume
            .as_ref()
            .map(|volume| volume.id)
            .ok_or(StoryError::MissingContext {
                step,
                what: "volume",
            })
    }

    fn require_device(&self, step: &'static str) -> Result<DevicePath> {
        self.device.clone().ok_or(StoryError::MissingContext {
            step,
            what: "device",
        })
    }

    /// Run every step in order.
    pub async fn run(mut self) -> Result<StoryReport> {
        self.add_volume().await?;
        self.wait_until_available().await?;
        self.assign().await?;
        self.setup().await?;
        self.format().await?;
        self.mount_and_write_marker().await?;
        self.unmount().await?;
        self.grab_fingerprint().await?;
        self.remove().await?;
        self.initialize_formats().await?;
        self.remove_again().await?;
        self.initialize_again().await?;
        self.delete().await?;
        self.confirm_missing().await?;

        let volume_id = self.volume_id("report")?;
        let (Some(original_fingerprint), Some(initialized_fingerprint)) =
            (self.original_fingerprint, self.initialized_fingerprint)
        else {
            return Err(StoryError::MissingContext {
                step: "report",
                what: "fingerprint",
            });
        };

        info!(volume_id = %volume_id, "Lifecycle story complete");
        Ok(StoryReport {
            volume_id,
            original_fingerprint,
            initialized_fingerprint,
            final_status: self.final_status,
        })
    }

    pub async fn add_volume(&mut self) -> Result<()> {
        let config = &self.config;
        let volume = self
            .api
            .create(&config.owner, config.size, &config.name, &config.description)
            .await?;
        info!(step = "add_volume", volume_id = %volume.id, status = %volume.status, "Volume created");
        self.volume = Some(volume);
        Ok(())
    }

    pub async fn wait_until_available(&mut self) -> Result<()> {
        let id = self.volume_id("wait_until_available")?;
        let api = &self.api;
        let volume = poll_until(
            || api.get(id),
            |volume| matches!(volume.status, VolumeStatus::Available | VolumeStatus::Error),
            self.config.poll,
        )
        .await?;

        check("wait_until_available", volume.status == VolumeStatus::Available, || {
            format!("volume {} ended in status '{}'", id, volume.status)
        })?;
        info!(step = "wait_until_available", volume_id = %id, "Volume available");
        self.volume = Some(volume);
        Ok(())
    }

    pub async fn assign(&mut self) -> Result<()> {
        let id = self.volume_id("assign")?;
        let volume = self.client.assign_to_host(id).await?;
        check("assign", volume.attach_status == AttachStatus::Attached, || {
            format!("attach status is '{}'", volume.attach_status)
        })?;
        info!(step = "assign", volume_id = %id, host = %self.client.host(), "Volume assigned");
        self.volume = Some(volume);
        Ok(())
    }

    pub async fn setup(&mut self) -> Result<()> {
        let id = self.volume_id("setup")?;
        let device = self.client.setup_volume(id).await?;
        info!(step = "setup", volume_id = %id, device = %device, "Volume attached");
        self.device = Some(device);
        Ok(())
    }

    pub async fn format(&mut self) -> Result<()> {
        let device = self.require_device("format")?;
        let fingerprint = self.client.format(&device).await?;
        info!(step = "format", device = %device, fingerprint = %fingerprint, "Volume formatted");
        self.original_fingerprint = Some(fingerprint);
        Ok(())
    }

    pub async fn mount_and_write_marker(&mut self) -> Result<()> {
        let id = self.volume_id("mount")?;
        let device = self.require_device("mount")?;
        let mount_point = self.config.mount_root.join(id.to_string());

        self.client.mount(&device, &mount_point).await?;

        let marker = mount_point.join(MARKER_FILE);
        tokio::fs::write(&marker, MARKER_CONTENTS).await?;
        let read_back = tokio::fs::read_to_string(&marker).await?;
        check("mount", read_back == MARKER_CONTENTS, || {
            format!("marker file {} reads back '{}'", marker.display(), read_back)
        })?;

        info!(step = "mount", device = %device, mount_point = %mount_point.display(), "Marker file written");
        self.mount_point = Some(mount_point);
        Ok(())
    }

    pub async fn unmount(&mut self) -> Result<()> {
        let mount_point = self.mount_point.take().ok_or(StoryError::MissingContext {
            step: "unmount",
            what: "mount point",
        })?;
        // the client re-checks the mount table before returning
        self.client.unmount(&mount_point).await?;
        info!(step = "unmount", mount_point = %mount_point.display(), "Unmounted");
        Ok(())
    }

    pub async fn grab_fingerprint(&mut self) -> Result<()> {
        let device = self.require_device("grab_fingerprint")?;
        let fingerprint = self.client.get_fingerprint(&device).await?;
        check(
            "grab_fingerprint",
            self.original_fingerprint.as_ref() == Some(&fingerprint),
            || format!("device reports {}, format reported {:?}", fingerprint, self.original_fingerprint),
        )?;
        info!(step = "grab_fingerprint", fingerprint = %fingerprint, "Fingerprint read back");
        Ok(())
    }

    /// Remove the volume from the host; the old device must be unusable.
    pub async fn remove(&mut self) -> Result<()> {
        let id = self.volume_id("remove")?;
        let stale = self.require_device("remove")?;

        let volume = self.client.remove_volume(id).await?;
        check("remove", volume.attach_status == AttachStatus::Detached, || {
            format!("attach status is '{}'", volume.attach_status)
        })?;

        match self.client.format(&stale).await {
            Ok(fingerprint) => {
                return Err(StoryError::Check {
                    step: "remove",
                    reason: format!("format of stale device {} succeeded ({})", stale, fingerprint),
                });
            }
            Err(e) => info!(step = "remove", device = %stale, error = %e, "Stale device rejected format"),
        }

        self.device = None;
        self.volume = Some(volume);
        Ok(())
    }

    /// Reassign and initialize: the record has no fingerprint, so this formats.
    pub async fn initialize_formats(&mut self) -> Result<()> {
        let id = self.volume_id("initialize")?;
        let before = self.api.get(id).await?;
        check("initialize", before.fingerprint.is_none(), || {
            format!("record already holds {:?}", before.fingerprint)
        })?;
        self.client.assign_to_host(id).await?;

        let fingerprint = self.client.initialize(id).await?;
        check(
            "initialize",
            self.original_fingerprint.as_ref() != Some(&fingerprint),
            || format!("fingerprint {} did not change", fingerprint),
        )?;

        let volume = self.api.get(id).await?;
        check(
            "initialize",
            volume.fingerprint.as_ref() == Some(&fingerprint),
            || format!("registry holds {:?}", volume.fingerprint),
        )?;

        info!(step = "initialize", volume_id = %id, fingerprint = %fingerprint, "Volume initialized");
        self.initialized_fingerprint = Some(fingerprint);
        self.volume = Some(volume);
        Ok(())
    }

    /// Initialize a removed volume through a driver that refuses to format.
    ///
    /// The record already has a fingerprint, so nothing is set up or formatted.
    pub async fn initialize_again(&mut self) -> Result<()> {
        let id = self.volume_id("initialize_again")?;
        let guarded = self
            .client
            .with_driver(Arc::new(FormatGuard::new(Arc::clone(self.client.driver()))));

        let fingerprint = guarded.initialize(id).await?;
        check(
            "initialize_again",
            self.initialized_fingerprint.as_ref() == Some(&fingerprint),
            || format!("fingerprint changed to {}", fingerprint),
        )?;
        if let Ok(device) = guarded.discover(id).await {
            return Err(StoryError::Check {
                step: "initialize_again",
                reason: format!("volume {} was attached at {}", id, device),
            });
        }
        info!(step = "initialize_again", volume_id = %id, "Initialize left the filesystem alone");
        Ok(())
    }

    pub async fn remove_again(&mut self) -> Result<()> {
        let id = self.volume_id("remove_again")?;
        let volume = self.client.remove_volume(id).await?;
        info!(step = "remove_again", volume_id = %id, "Volume removed");
        self.volume = Some(volume);
        Ok(())
    }

    pub async fn delete(&mut self) -> Result<()> {
        let id = self.volume_id("delete")?;
        self.api.delete(id).await?;
        info!(step = "delete", volume_id = %id, "Volume deleted");
        Ok(())
    }

    /// The volume is gone: no device on this host, and the registry reports
    /// it deleted or no longer knows it.
    pub async fn confirm_missing(&mut self) -> Result<()> {
        let id = self.volume_id("confirm_missing")?;

        match self.client.discover(id).await {
            Ok(device) => {
                return Err(StoryError::Check {
                    step: "confirm_missing",
                    reason: format!("volume {} still discoverable at {}", id, device),
                });
            }
            Err(e) => info!(step = "confirm_missing", volume_id = %id, error = %e, "Volume not discoverable"),
        }

        let api = &self.api;
        let status = match poll_until(|| api.get(id), |volume| volume.deleted, self.config.poll).await
        {
            Ok(volume) => Some(volume.status),
            Err(PollError::Fetch(RegistryError::VolumeNotFound(_))) => None,
            Err(e) => {
                warn!(volume_id = %id, error = %e, "Volume did not reach deleted");
                return Err(e.into());
            }
        };

        info!(step = "confirm_missing", volume_id = %id, status = ?status, "Volume confirmed missing");
        self.final_status = status;
        Ok(())
    }
}

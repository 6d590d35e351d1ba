//! open-iscsi initiator driver.
//!
//! Each volume is exported as target `<base_iqn>:volume-<id hex>`. Assignment
//! is bookkept locally; the target's ACLs are managed on the storage side.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};
use volume_agent::{Fingerprint, Volume, VolumeId};

use super::{DriverError, DriverResult, HostAssignments, StorageDriver};
use crate::platform;
use crate::types::{DevicePath, FsType};

/// Default wait after login for udev to create device nodes.
pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct IscsiSettings {
    /// Target name prefix, e.g. `iqn.2024-01.org.example`
    pub base_iqn: String,
    /// `host:port` portals; more than one enables multipath
    pub portals: Vec<String>,
    pub fs_type: FsType,
    pub settle_time: Duration,
}

impl IscsiSettings {
    pub fn new(base_iqn: impl Into<String>, portals: Vec<String>) -> Self {
        Self {
            base_iqn: base_iqn.into(),
            portals,
            fs_type: FsType::default(),
            settle_time: DEFAULT_SETTLE_TIME,
        }
    }

    pub fn with_fs_type(mut self, fs_type: FsType) -> Self {
        self.fs_type = fs_type;
        self
    }
}

pub struct IscsiDriver {
    settings: IscsiSettings,
    assignments: HostAssignments,
}

impl IscsiDriver {
    pub fn new(settings: IscsiSettings) -> DriverResult<Self> {
        if settings.base_iqn.trim().is_empty() {
            return Err(DriverError::InvalidArgument(
                "base IQN cannot be empty".to_string(),
            ));
        }
        if settings.portals.is_empty() {
            return Err(DriverError::InvalidArgument(
                "at least one iSCSI portal is required".to_string(),
            ));
        }
        info!(base_iqn = %settings.base_iqn, portals = ?settings.portals, fs_type = %settings.fs_type, "iSCSI driver configured");
        Ok(Self {
            settings,
            assignments: HostAssignments::new(),
        })
    }

    pub fn target_iqn(&self, volume_id: VolumeId) -> String {
        target_iqn(&self.settings.base_iqn, volume_id)
    }
}

fn target_iqn(base_iqn: &str, volume_id: VolumeId) -> String {
    format!("{}:{}", base_iqn.trim_end_matches(':'), volume_id.backend_name())
}

impl StorageDriver for IscsiDriver {
    fn name(&self) -> &'static str {
        "iscsi"
    }

    fn assign_to_host(&self, volume: &Volume, host: &str) -> DriverResult<()> {
        if volume.deleted {
            return Err(DriverError::Assignment {
                volume_id: volume.id,
                host: host.to_string(),
                reason: "volume is deleted".to_string(),
            });
        }
        self.assignments.assign(volume.id, host)?;
        info!(volume_id = %volume.id, host = %host, target_iqn = %self.target_iqn(volume.id), "Volume assigned to host");
        Ok(())
    }

    fn unassign_from_host(&self, volume_id: VolumeId, host: &str) -> DriverResult<()> {
        if !self.assignments.release(volume_id, host) {
            debug!(volume_id = %volume_id, host = %host, "Volume was not assigned to host");
        }
        Ok(())
    }

    fn discover(&self, volume_id: VolumeId) -> DriverResult<DevicePath> {
        let iqn = self.target_iqn(volume_id);
        platform::find_iscsi_device(&iqn).map_err(|e| {
            debug!(volume_id = %volume_id, error = %e, "Device discovery failed");
            DriverError::DeviceNotFound(format!("volume {} ({})", volume_id, iqn))
        })
    }

    fn setup(&self, volume_id: VolumeId) -> DriverResult<DevicePath> {
        self.assignments.require(volume_id)?;

        let iqn = self.target_iqn(volume_id);
        if platform::is_iscsi_connected(&iqn) {
            debug!(target_iqn = %iqn, "iSCSI session already exists");
            return platform::find_iscsi_device(&iqn);
        }
        platform::connect_iscsi(&iqn, &self.settings.portals, self.settings.settle_time)
    }

    fn detach(&self, volume_id: VolumeId) -> DriverResult<()> {
        platform::disconnect_iscsi(&self.target_iqn(volume_id))
    }

    fn format(&self, device: &DevicePath) -> DriverResult<()> {
        platform::format_device(device, self.settings.fs_type)
    }

    fn get_fingerprint(&self, device: &DevicePath) -> DriverResult<Fingerprint> {
        platform::read_fs_uuid(device)
    }

    fn mount(&self, device: &DevicePath, mount_point: &Path) -> DriverResult<()> {
        platform::validate_mount_point(mount_point)?;
        platform::mount_device(device, mount_point, self.settings.fs_type)
    }

    fn unmount(&self, mount_point: &Path) -> DriverResult<()> {
        platform::validate_mount_point(mount_point)?;
        platform::unmount(mount_point)
    }

    fn is_mounted(&self, mount_point: &Path) -> DriverResult<bool> {
        platform::is_mounted(mount_point)
            .inspect_err(|e| warn!(error = %e, "Could not read mount table"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> IscsiSettings {
        IscsiSettings::new("iqn.2024-01.org.example", vec!["10.0.0.10:3260".to_string()])
    }

    #[test]
    fn test_target_iqn() {
        assert_eq!(
            target_iqn("iqn.2024-01.org.example", VolumeId::new(42)),
            "iqn.2024-01.org.example:volume-0000002a"
        );
        assert_eq!(
            target_iqn("iqn.2024-01.org.example:", VolumeId::new(1)),
            "iqn.2024-01.org.example:volume-00000001"
        );
    }

    #[test]
    fn test_new_validates_settings() {
        assert!(IscsiDriver::new(settings()).is_ok());
        assert!(IscsiDriver::new(IscsiSettings::new("", vec!["a:3260".to_string()])).is_err());
        assert!(IscsiDriver::new(IscsiSettings::new("iqn.x", Vec::new())).is_err());
    }

    #[test]
    fn test_setup_requires_assignment() {
        let driver = IscsiDriver::new(settings()).unwrap();
        let err = driver.setup(VolumeId::new(7)).unwrap_err();
        assert!(matches!(err, DriverError::Assignment { .. }));
    }

    #[test]
    fn test_unassign_without_assignment_is_noop() {
        let driver = IscsiDriver::new(settings()).unwrap();
        driver.unassign_from_host(VolumeId::new(7), "host").unwrap();
        driver.unassign_from_host(VolumeId::new(7), "host").unwrap();
    }

    #[test]
    fn test_mount_point_validated() {
        let driver = IscsiDriver::new(settings()).unwrap();
        let err = driver
            .mount(&DevicePath::from("/dev/sdb"), Path::new("relative"))
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }
}

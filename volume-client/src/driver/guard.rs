use std::path::Path;
use std::sync::Arc;

use tracing::error;
use volume_agent::{Fingerprint, Volume, VolumeId};

use super::{DriverError, DriverResult, StorageDriver};
use crate::types::DevicePath;

/// Decorator that refuses every `format` call.
///
/// Wrap the host's driver with this when attaching volumes that already hold
/// data: a stray format becomes an error instead of data loss.
pub struct FormatGuard {
    inner: Arc<dyn StorageDriver>,
}

impl FormatGuard {
    pub fn new(inner: Arc<dyn StorageDriver>) -> Self {
        Self { inner }
    }
}

impl StorageDriver for FormatGuard {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn assign_to_host(&self, volume: &Volume, host: &str) -> DriverResult<()> {
        self.inner.assign_to_host(volume, host)
    }

    fn unassign_from_host(&self, volume_id: VolumeId, host: &str) -> DriverResult<()> {
        self.inner.unassign_from_host(volume_id, host)
    }

    fn discover(&self, volume_id: VolumeId) -> DriverResult<DevicePath> {
        self.inner.discover(volume_id)
    }

    fn setup(&self, volume_id: VolumeId) -> DriverResult<DevicePath> {
        self.inner.setup(volume_id)
    }

    fn detach(&self, volume_id: VolumeId) -> DriverResult<()> {
        self.inner.detach(volume_id)
    }

    fn format(&self, device: &DevicePath) -> DriverResult<()> {
        error!(device = %device, "Refusing to format a guarded device");
        Err(DriverError::InvalidArgument(format!(
            "format of {} refused: device is format-guarded",
            device
        )))
    }

    fn get_fingerprint(&self, device: &DevicePath) -> DriverResult<Fingerprint> {
        self.inner.get_fingerprint(device)
    }

    fn mount(&self, device: &DevicePath, mount_point: &Path) -> DriverResult<()> {
        self.inner.mount(device, mount_point)
    }

    fn unmount(&self, mount_point: &Path) -> DriverResult<()> {
        self.inner.unmount(mount_point)
    }

    fn is_mounted(&self, mount_point: &Path) -> DriverResult<bool> {
        self.inner.is_mounted(mount_point)
    }
}

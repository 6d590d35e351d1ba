use tracing::info;

use super::ZfsManager;
use crate::error::BackendError;
use crate::provisioner::ProvisioningBackend;
use crate::volume::Volume;

/// Provisions each volume as a zvol named after its backend name.
pub struct ZfsBackend {
    manager: ZfsManager,
}

impl ZfsBackend {
    pub fn new(manager: ZfsManager) -> Self {
        Self { manager }
    }
}

impl ProvisioningBackend for ZfsBackend {
    fn name(&self) -> &'static str {
        "zfs"
    }

    fn provision(&self, volume: &Volume) -> Result<(), BackendError> {
        let name = volume.id.backend_name();
        let dataset = self.manager.create_zvol(&name, volume.size_bytes())?;
        info!(
            volume_id = %volume.id,
            zvol = %dataset.name,
            device = %self.manager.device_path(&name),
            "Volume backed by zvol"
        );
        Ok(())
    }

    fn destroy(&self, volume: &Volume) -> Result<(), BackendError> {
        self.manager.destroy_zvol(&volume.id.backend_name())?;
        Ok(())
    }
}

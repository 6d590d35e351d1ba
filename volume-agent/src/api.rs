//! Volume API facade.
//!
//! Ties the registry to the provisioning backend. This is what clients and
//! the CLI talk to: create schedules background provisioning, delete walks
//! the record through `deleting` to `deleted` and tears down the backend
//! volume in between.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::error::{RegistryError, Result};
use crate::metrics::OperationTimer;
use crate::provisioner::{MetadataOnly, ProvisioningBackend, Provisioner};
use crate::registry::{DeleteStart, VolumeRegistry};
use crate::volume::{Fingerprint, Owner, Volume, VolumeId};

/// Tunables for [`VolumeApi`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiSettings {
    /// Extra latency before provisioning starts
    pub provision_delay: Duration,
    /// Purge soft-deleted records this long after delete. `None` keeps them.
    pub purge_after: Option<Duration>,
}

pub struct VolumeApi {
    registry: Arc<VolumeRegistry>,
    provisioner: Provisioner,
    settings: ApiSettings,
}

impl VolumeApi {
    pub fn new(
        registry: Arc<VolumeRegistry>,
        backend: Arc<dyn ProvisioningBackend>,
        settings: ApiSettings,
    ) -> Self {
        info!(backend = backend.name(), "Volume API ready");
        let provisioner = Provisioner::new(Arc::clone(&registry), backend, settings.provision_delay);
        Self {
            registry,
            provisioner,
            settings,
        }
    }

    /// In-memory registry with no physical backend.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(VolumeRegistry::new()),
            Arc::new(MetadataOnly),
            ApiSettings::default(),
        )
    }

    /// Create a volume record and start provisioning it.
    ///
    /// The returned record is still `creating`; poll [`VolumeApi::get`] for
    /// `available`.
    #[instrument(skip(self, owner, description), fields(user_id = %owner.user_id))]
    pub async fn create(
        &self,
        owner: &Owner,
        size: u64,
        name: &str,
        description: &str,
    ) -> Result<Volume> {
        let timer = OperationTimer::new("create");
        let volume = match self.registry.create(owner, size, name, description).await {
            Ok(volume) => volume,
            Err(e) => {
                timer.failure(error_code(&e));
                return Err(e);
            }
        };

        self.provisioner.schedule(volume.clone());
        timer.success();
        Ok(volume)
    }

    pub async fn get(&self, id: VolumeId) -> Result<Volume> {
        self.registry.get(id).await
    }

    pub async fn list(&self, owner: &Owner) -> Vec<Volume> {
        self.registry.list(owner).await
    }

    /// Delete a volume. Repeating the call on a deleted volume is a no-op.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: VolumeId) -> Result<()> {
        let timer = OperationTimer::new("delete");

        let volume = match self.registry.begin_delete(id).await {
            Ok(DeleteStart::Started(volume)) => volume,
            Ok(DeleteStart::AlreadyDeleted(_)) => {
                timer.success();
                return Ok(());
            }
            Err(e) => {
                timer.failure(error_code(&e));
                return Err(e);
            }
        };

        let backend = Arc::clone(self.provisioner.backend());
        let destroyed = tokio::task::spawn_blocking(move || backend.destroy(&volume))
            .await
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))
            .and_then(|r| r.map_err(RegistryError::from));

        if let Err(e) = destroyed {
            // Record stays in 'deleting' so the delete can be retried.
            error!(volume_id = %id, error = %e, "Backend destroy failed");
            timer.failure("backend_error");
            return Err(e);
        }

        self.registry.finish_delete(id).await?;
        info!(volume_id = %id, "Volume deleted");
        timer.success();

        if let Some(retention) = self.settings.purge_after {
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                if let Err(e) = registry.purge(id).await {
                    warn!(volume_id = %id, error = %e, "Failed to purge deleted volume");
                }
            });
        }
        Ok(())
    }

    /// Assign a volume to a compute host (attach status becomes `attached`).
    pub async fn add_to_host(&self, id: VolumeId, host: &str) -> Result<Volume> {
        self.registry.assign_host(id, host).await
    }

    /// Release a volume from its host (attach status becomes `detached`).
    pub async fn remove_from_host(&self, id: VolumeId) -> Result<Volume> {
        self.registry.release_host(id).await
    }

    pub async fn update_fingerprint(&self, id: VolumeId, fingerprint: Fingerprint) -> Result<Volume> {
        self.registry.set_fingerprint(id, fingerprint).await
    }

    pub async fn purge_deleted(&self) -> Result<Vec<VolumeId>> {
        self.registry.purge_deleted().await
    }

    /// Drop one soft-deleted record. Unknown ids are a no-op; live records
    /// are rejected.
    pub async fn purge(&self, id: VolumeId) -> Result<()> {
        self.registry.purge(id).await
    }
}

fn error_code(e: &RegistryError) -> &'static str {
    match e {
        RegistryError::VolumeNotFound(_) => "not_found",
        RegistryError::InvalidSize(_) => "invalid_argument",
        RegistryError::InvalidState { .. } => "failed_precondition",
        RegistryError::VolumeInUse { .. } => "in_use",
        RegistryError::Backend(_) => "backend_error",
        RegistryError::Json(_) | RegistryError::Io(_) => "internal",
    }
}

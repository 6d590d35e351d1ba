//! Background provisioning.
//!
//! A freshly created record sits in `creating` until the provisioner has
//! asked the backend for the physical volume. Success flips it to
//! `available`, failure to `error`. This is the only path to `available`.
//! A record that leaves `creating` before the backend call is skipped; one
//! that leaves it during the call has its fresh backend volume destroyed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::BackendError;
use crate::metrics::OperationTimer;
use crate::registry::VolumeRegistry;
use crate::volume::{Volume, VolumeStatus};

/// Physical storage behind the registry.
///
/// Calls are blocking (they shell out to storage tools); the provisioner runs
/// them on the blocking pool.
pub trait ProvisioningBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the physical volume for a new record.
    fn provision(&self, volume: &Volume) -> Result<(), BackendError>;

    /// Destroy the physical volume. Must succeed if it is already gone.
    fn destroy(&self, volume: &Volume) -> Result<(), BackendError>;
}

/// Backend for deployments where the storage array provisions on its own
/// and the registry only tracks metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataOnly;

impl ProvisioningBackend for MetadataOnly {
    fn name(&self) -> &'static str {
        "metadata-only"
    }

    fn provision(&self, _volume: &Volume) -> Result<(), BackendError> {
        Ok(())
    }

    fn destroy(&self, _volume: &Volume) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Runs backend provisioning off the request path.
#[derive(Clone)]
pub struct Provisioner {
    registry: Arc<VolumeRegistry>,
    backend: Arc<dyn ProvisioningBackend>,
    /// Extra latency before the backend is called
    delay: Duration,
}

impl Provisioner {
    pub fn new(
        registry: Arc<VolumeRegistry>,
        backend: Arc<dyn ProvisioningBackend>,
        delay: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            delay,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ProvisioningBackend> {
        &self.backend
    }

    /// Provision `volume` in the background.
    pub fn schedule(&self, volume: Volume) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let backend = Arc::clone(&self.backend);
        let delay = self.delay;

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let id = volume.id;
            match registry.get(id).await {
                Ok(current) if current.status == VolumeStatus::Creating => {}
                Ok(current) => {
                    info!(volume_id = %id, status = %current.status, "Volume left creating, skipping provisioning");
                    return;
                }
                Err(e) => {
                    warn!(volume_id = %id, error = %e, "Volume record gone, skipping provisioning");
                    return;
                }
            }

            let timer = OperationTimer::new("provision");
            let provision_backend = Arc::clone(&backend);
            let provisioned = volume.clone();
            let result =
                tokio::task::spawn_blocking(move || provision_backend.provision(&provisioned)).await;

            let outcome = match result {
                Ok(Ok(())) => {
                    timer.success();
                    match registry.mark_available(id).await {
                        Ok(false) => {
                            discard(backend, volume).await;
                            Ok(false)
                        }
                        other => other,
                    }
                }
                Ok(Err(e)) => {
                    error!(volume_id = %id, error = %e, "Provisioning failed");
                    timer.failure("backend_error");
                    registry.mark_error(id).await
                }
                Err(e) => {
                    error!(volume_id = %id, error = %e, "Provisioning task panicked");
                    timer.failure("panic");
                    registry.mark_error(id).await
                }
            };

            match outcome {
                Ok(true) => info!(volume_id = %id, "Provisioning complete"),
                Ok(false) => {}
                Err(e) => error!(volume_id = %id, error = %e, "Failed to record provisioning result"),
            }
        })
    }
}

/// Destroy a backend volume whose record was deleted while it was provisioned.
async fn discard(backend: Arc<dyn ProvisioningBackend>, volume: Volume) {
    let id = volume.id;
    match tokio::task::spawn_blocking(move || backend.destroy(&volume)).await {
        Ok(Ok(())) => info!(volume_id = %id, "Destroyed backend volume of deleted record"),
        Ok(Err(e)) => error!(volume_id = %id, error = %e, "Failed to destroy backend volume of deleted record"),
        Err(e) => error!(volume_id = %id, error = %e, "Destroy task panicked"),
    }
}

use thiserror::Error;

use crate::volume::{VolumeId, VolumeStatus};
use crate::zfs::ZfsError;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("volume {0} not found")]
    VolumeNotFound(VolumeId),

    #[error("invalid volume size {0}: size must be a positive number of GiB")]
    InvalidSize(u64),

    #[error("volume {id} is {status}: {reason}")]
    InvalidState {
        id: VolumeId,
        status: VolumeStatus,
        reason: &'static str,
    },

    #[error("volume {id} is attached to host '{host}'")]
    VolumeInUse { id: VolumeId, host: String },

    #[error("provisioning backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("failed to parse registry state: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised by a provisioning backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Zfs(#[from] ZfsError),

    #[error("backend rejected volume {id}: {reason}")]
    Rejected { id: VolumeId, reason: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

//! ZFS zvol backing store for provisioned volumes.

pub mod backend;
pub mod dataset;

pub use backend::ZfsBackend;
pub use dataset::{Dataset, ZfsManager};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZfsError {
    #[error("parent dataset '{0}' not found")]
    ParentNotFound(String),

    #[error("zvol '{0}' not found")]
    ZvolNotFound(String),

    #[error("zvol '{0}' already exists")]
    ZvolExists(String),

    #[error("invalid dataset name: {0}")]
    InvalidName(String),

    #[error("`zfs {command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to parse zfs output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ZfsError>;

//! Volume registry and provisioning agent
//!
//! Owns volume metadata records and the status lifecycle
//! (`creating -> available -> deleting -> deleted`), independent of the
//! physical block device.
//!
//! - `registry`: the record store and its transition rules
//! - `api`: the facade clients use (create, get, delete, host bookkeeping)
//! - `provisioner`: background `creating -> available` via a backend
//! - `zfs`: zvol provisioning backend
//! - `poll`: retry-until-predicate helper for waiting on status changes
//! - `metrics`: Prometheus metrics collection

pub mod api;
pub mod error;
pub mod metrics;
pub mod poll;
pub mod provisioner;
pub mod registry;
pub mod store;
pub mod volume;
pub mod zfs;

pub use api::{ApiSettings, VolumeApi};
pub use error::{BackendError, RegistryError};
pub use poll::{PollError, PollSettings, poll_until};
pub use provisioner::{MetadataOnly, ProvisioningBackend};
pub use registry::VolumeRegistry;
pub use volume::{AttachStatus, Fingerprint, Owner, Volume, VolumeId, VolumeStatus};
pub use zfs::{ZfsBackend, ZfsManager};

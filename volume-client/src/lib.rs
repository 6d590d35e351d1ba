//! Host-side volume lifecycle
//!
//! Attaches registry volumes to this compute host and manages their
//! filesystems.
//!
//! - `driver`: the [`StorageDriver`](driver::StorageDriver) capability and
//!   its iSCSI and in-memory implementations
//! - `client`: [`VolumeClient`], which pairs a driver with the volume API
//! - `scenario`: the end-to-end lifecycle walk used by `volume-lifecycle story`
//! - `platform`: Linux host tooling behind the iSCSI driver

pub mod client;
pub mod driver;
pub mod metrics;
pub mod platform;
pub mod scenario;
pub mod types;

pub use client::{ClientError, SessionState, VolumeClient};
pub use driver::{DriverError, FormatGuard, IscsiDriver, IscsiSettings, MemoryDriver, StorageDriver};
pub use scenario::{LifecycleStory, StoryConfig, StoryError, StoryReport};
pub use types::{DevicePath, DriverKind, FsType};

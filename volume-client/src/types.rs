//! Type-safe wrappers for driver parameters.
//!
//! Each type implements `FromStr` for parsing at the CLI boundary.

use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// DevicePath
// ============================================================================

/// Host-local block device node (e.g. `/dev/sdb`, `/dev/mapper/mpatha`).
///
/// Only meaningful for the session that discovered it; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevicePath(String);

impl DevicePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DevicePath {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DevicePath {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<Path> for DevicePath {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

// ============================================================================
// FsType
// ============================================================================

/// Filesystem written by `format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsType {
    #[default]
    Ext4,
    Xfs,
}

impl FsType {
    /// mkfs binary and its "don't prompt" flag.
    pub const fn mkfs(self) -> (&'static str, &'static str) {
        match self {
            FsType::Ext4 => ("mkfs.ext4", "-F"),
            FsType::Xfs => ("mkfs.xfs", "-f"),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
        }
    }
}

impl Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = FsTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ext4" | "" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            _ => Err(FsTypeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unsupported filesystem type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unsupported filesystem '{0}': expected 'ext4' or 'xfs'")]
pub struct FsTypeParseError(String);

// ============================================================================
// DriverKind
// ============================================================================

/// Which [`StorageDriver`](crate::driver::StorageDriver) the CLI builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    /// In-process simulated block devices
    #[default]
    Memory,
    /// open-iscsi initiator on this host
    Iscsi,
}

impl Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Memory => write!(f, "memory"),
            DriverKind::Iscsi => write!(f, "iscsi"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = DriverKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" | "loopback" => Ok(DriverKind::Memory),
            "iscsi" => Ok(DriverKind::Iscsi),
            _ => Err(DriverKindParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown driver '{0}': expected 'memory' or 'iscsi'")]
pub struct DriverKindParseError(String);

// ============================================================================
// Portals
// ============================================================================

/// Default iSCSI port.
pub const ISCSI_DEFAULT_PORT: u16 = 3260;

/// Parse a comma-separated portal list, appending the default port where
/// it is missing. Empty entries are dropped.
pub fn parse_portals(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            if p.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
                p.to_string()
            } else {
                format!("{}:{}", p, ISCSI_DEFAULT_PORT)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_type_parse() {
        assert_eq!("ext4".parse::<FsType>().unwrap(), FsType::Ext4);
        assert_eq!("XFS".parse::<FsType>().unwrap(), FsType::Xfs);
        assert_eq!("".parse::<FsType>().unwrap(), FsType::Ext4);
        assert!("zfs".parse::<FsType>().is_err());
        assert!("ntfs".parse::<FsType>().is_err());
    }

    #[test]
    fn test_fs_type_mkfs() {
        assert_eq!(FsType::Ext4.mkfs(), ("mkfs.ext4", "-F"));
        assert_eq!(FsType::Xfs.mkfs(), ("mkfs.xfs", "-f"));
    }

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("memory".parse::<DriverKind>().unwrap(), DriverKind::Memory);
        assert_eq!("ISCSI".parse::<DriverKind>().unwrap(), DriverKind::Iscsi);
        assert!("nvme".parse::<DriverKind>().is_err());
        assert_eq!(DriverKind::default().to_string(), "memory");
    }

    #[test]
    fn test_parse_portals() {
        assert_eq!(parse_portals("10.0.0.1"), vec!["10.0.0.1:3260"]);
        assert_eq!(
            parse_portals("10.0.0.1:3261, 10.0.0.2,"),
            vec!["10.0.0.1:3261", "10.0.0.2:3260"]
        );
        assert!(parse_portals("").is_empty());
    }

    #[test]
    fn test_device_path_is_plain_string() {
        let device = DevicePath::from("/dev/sdb");
        assert_eq!(device.as_str(), "/dev/sdb");
        assert_eq!(device.to_string(), "/dev/sdb");
        assert_eq!(serde_json::to_string(&device).unwrap(), "\"/dev/sdb\"");
    }
}

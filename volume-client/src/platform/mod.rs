//! Host operations for the iSCSI driver
//!
//! Linux-only: open-iscsi for attach, mkfs/blkid for filesystems, and the
//! host mount table.

mod linux;

use crate::driver::DriverError;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, DriverError>;

pub use linux::{
    connect_iscsi, disconnect_iscsi, find_iscsi_device, format_device, is_iscsi_connected,
    is_mounted, mount_device, read_fs_uuid, unmount,
};

/// Validate that a mount point is safe to hand to `mount`/`umount`.
pub fn validate_mount_point(path: &std::path::Path) -> PlatformResult<()> {
    let Some(path_str) = path.to_str() else {
        return Err(DriverError::InvalidArgument(
            "mount point must be valid UTF-8".to_string(),
        ));
    };

    if path_str.is_empty() {
        return Err(DriverError::InvalidArgument(
            "mount point cannot be empty".to_string(),
        ));
    }

    if !path.is_absolute() {
        return Err(DriverError::InvalidArgument(
            "mount point must be absolute".to_string(),
        ));
    }

    let dangerous_chars = [
        ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
    ];
    if let Some(c) = dangerous_chars.iter().find(|c| path_str.contains(**c)) {
        return Err(DriverError::InvalidArgument(format!(
            "mount point contains dangerous character: '{}'",
            c
        )));
    }

    if path_str.contains("..") {
        return Err(DriverError::InvalidArgument(
            "mount point cannot contain '..' (path traversal)".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_validate_mount_point_valid() {
        assert!(validate_mount_point(Path::new("/testsmnt/1")).is_ok());
        assert!(validate_mount_point(Path::new("/var/lib/volumes/a-b_c")).is_ok());
    }

    #[test]
    fn test_validate_mount_point_invalid() {
        assert!(validate_mount_point(Path::new("")).is_err());
        assert!(validate_mount_point(Path::new("relative/mnt")).is_err());
        assert!(validate_mount_point(Path::new("/var/../etc")).is_err());
        assert!(validate_mount_point(Path::new("/mnt;ls")).is_err());
        assert!(validate_mount_point(Path::new("/mnt$HOME")).is_err());
        assert!(validate_mount_point(Path::new("/mnt`id`")).is_err());
    }
}

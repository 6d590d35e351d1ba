//! Linux host operations for the iSCSI driver
//!
//! Uses Linux-specific tools:
//! - iscsiadm for iSCSI (open-iscsi)
//! - mkfs.ext4/mkfs.xfs for filesystem formatting
//! - blkid for filesystem UUIDs
//! - mount/umount and /proc/mounts

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use volume_agent::Fingerprint;

use super::PlatformResult;
use crate::driver::DriverError;
use crate::types::{DevicePath, FsType};

fn run(program: &str, args: &[&str]) -> PlatformResult<Output> {
    Command::new(program).args(args).output().map_err(|e| {
        error!(error = %e, program, "Failed to execute command");
        DriverError::Io(e)
    })
}

fn command_failed(program: &str, output: &Output) -> DriverError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    error!(stderr = %stderr, program, "Command failed");
    DriverError::CommandFailed {
        command: program.to_string(),
        stderr: stderr.trim().to_string(),
    }
}

/// If `device` is claimed by device-mapper multipath, return the dm device.
///
/// Checks /sys/block/<device>/holders/ for dm-* entries and prefers the
/// friendly /dev/mapper name.
fn resolve_multipath_device(device: &str) -> String {
    let dev_name = device.rsplit('/').next().unwrap_or(device);
    let holders_path = format!("/sys/block/{}/holders", dev_name);

    let Ok(entries) = fs::read_dir(&holders_path) else {
        return device.to_string();
    };

    for entry in entries.flatten() {
        let holder_name = entry.file_name();
        let holder = holder_name.to_string_lossy();
        if !holder.starts_with("dm-") {
            continue;
        }

        if let Ok(mapper_entries) = fs::read_dir("/dev/mapper") {
            for mapper_entry in mapper_entries.flatten() {
                if let Ok(link_target) = fs::read_link(mapper_entry.path())
                    && link_target.to_string_lossy().ends_with(&*holder)
                {
                    let mapper_path = mapper_entry.path().to_string_lossy().to_string();
                    info!(original = %device, multipath = %mapper_path, "Device is multipathed");
                    return mapper_path;
                }
            }
        }

        let dm_device = format!("/dev/{}", holder);
        info!(original = %device, multipath = %dm_device, "Device is multipathed");
        return dm_device;
    }

    device.to_string()
}

/// Whether an iSCSI session to `target_iqn` exists.
pub fn is_iscsi_connected(target_iqn: &str) -> bool {
    match Command::new("iscsiadm").args(["-m", "session"]).output() {
        Ok(out) if out.status.success() => {
            String::from_utf8_lossy(&out.stdout).contains(target_iqn)
        }
        _ => false,
    }
}

/// Log in to `target_iqn` through each portal and return the device.
///
/// With more than one portal a failed login on one path is tolerated as long
/// as another succeeds; the returned device is then the multipath device.
pub fn connect_iscsi(
    target_iqn: &str,
    portals: &[String],
    settle_time: Duration,
) -> PlatformResult<DevicePath> {
    if portals.is_empty() {
        return Err(DriverError::InvalidArgument(
            "at least one iSCSI portal is required".to_string(),
        ));
    }
    let multipath_mode = portals.len() > 1;

    info!(target_iqn = %target_iqn, portals = ?portals, multipath = multipath_mode, "Connecting to iSCSI target");

    let mut successful_logins = 0;
    for portal in portals {
        let discover = run(
            "iscsiadm",
            &["-m", "discovery", "-t", "sendtargets", "-p", portal],
        )?;
        if !discover.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&discover.stderr),
                portal = %portal,
                "iscsiadm discovery returned error (may be expected if target already known)"
            );
        }

        let login = run(
            "iscsiadm",
            &["-m", "node", "-T", target_iqn, "-p", portal, "--login"],
        )?;
        if login.status.success() {
            info!(target_iqn = %target_iqn, portal = %portal, "iSCSI login successful");
            successful_logins += 1;
            continue;
        }

        let stderr = String::from_utf8_lossy(&login.stderr);
        if stderr.contains("already present") || stderr.contains("session already exists") {
            info!(target_iqn = %target_iqn, portal = %portal, "iSCSI session already exists");
            successful_logins += 1;
        } else if multipath_mode {
            warn!(stderr = %stderr, portal = %portal, "iscsiadm login failed for portal (continuing with other portals)");
        } else {
            return Err(command_failed("iscsiadm", &login));
        }
    }

    if successful_logins == 0 {
        return Err(DriverError::CommandFailed {
            command: "iscsiadm".to_string(),
            stderr: "failed to login to any iSCSI portal".to_string(),
        });
    }

    // Let udev create the device nodes (and dm-multipath combine paths)
    let settle = if multipath_mode { settle_time * 3 } else { settle_time };
    debug!(settle_ms = settle.as_millis() as u64, "Waiting for device(s) to settle");
    std::thread::sleep(settle);

    let device = find_iscsi_device(target_iqn)?;
    info!(device = %device, paths = successful_logins, "iSCSI target connected");
    Ok(device)
}

/// Find the local device of a logged-in iSCSI target.
///
/// Looks at the stable /dev/disk/by-path/ links first, then falls back to
/// `iscsiadm -m session -P 3`.
pub fn find_iscsi_device(target_iqn: &str) -> PlatformResult<DevicePath> {
    if let Ok(entries) = fs::read_dir("/dev/disk/by-path") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // ip-<ip>:<port>-iscsi-<iqn>-lun-<lun>
            if name.contains("-iscsi-")
                && name.contains(target_iqn)
                && let Ok(link_target) = fs::canonicalize(entry.path())
            {
                let raw_device = link_target.to_string_lossy().to_string();
                return Ok(DevicePath::new(resolve_multipath_device(&raw_device)));
            }
        }
    }

    let output = run("iscsiadm", &["-m", "session", "-P", "3"])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Some(disk) = parse_session_disk(&stdout, target_iqn) {
        return Ok(DevicePath::new(resolve_multipath_device(&format!(
            "/dev/{}",
            disk
        ))));
    }

    Err(DriverError::DeviceNotFound(format!(
        "no block device for iSCSI target {}",
        target_iqn
    )))
}

/// Pick the "Attached scsi disk sdX" line that follows `target_iqn` in
/// `iscsiadm -m session -P 3` output.
fn parse_session_disk<'a>(session_output: &'a str, target_iqn: &str) -> Option<&'a str> {
    let mut in_target = false;
    for line in session_output.lines() {
        let trimmed = line.trim();
        if let Some(target) = trimmed.strip_prefix("Target:") {
            in_target = target.split_whitespace().next() == Some(target_iqn);
            continue;
        }
        if in_target
            && trimmed.starts_with("Attached scsi disk")
            && let Some(device) = trimmed.split_whitespace().nth(3)
        {
            return Some(device);
        }
    }
    None
}

/// Log out of an iSCSI target. Not being logged in counts as success.
pub fn disconnect_iscsi(target_iqn: &str) -> PlatformResult<()> {
    info!(target_iqn = %target_iqn, "Disconnecting from iSCSI target");

    let output = run("iscsiadm", &["-m", "node", "-T", target_iqn, "--logout"])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No matching sessions") || stderr.contains("not logged in") {
            debug!(target_iqn = %target_iqn, "iSCSI target was not logged in");
            return Ok(());
        }
        return Err(command_failed("iscsiadm", &output));
    }

    Ok(())
}

/// Write a fresh filesystem to `device`.
pub fn format_device(device: &DevicePath, fs_type: FsType) -> PlatformResult<()> {
    if !Path::new(device.as_str()).exists() {
        return Err(DriverError::DeviceNotFound(device.to_string()));
    }

    let (mkfs, force) = fs_type.mkfs();
    info!(device = %device, fs_type = %fs_type, "Formatting device");

    let output = run(mkfs, &[force, device.as_str()])?;
    if !output.status.success() {
        return Err(command_failed(mkfs, &output));
    }
    Ok(())
}

/// Read the filesystem UUID of `device` with blkid.
///
/// Anything other than a canonical UUID (no such device, no filesystem, a
/// filesystem with a short serial) is reported as an invalid device path.
pub fn read_fs_uuid(device: &DevicePath) -> PlatformResult<Fingerprint> {
    // -c /dev/null bypasses the cache so a fresh mkfs is seen
    let output = run(
        "blkid",
        &["-c", "/dev/null", "-s", "UUID", "-o", "value", device.as_str()],
    )?;

    if !output.status.success() {
        debug!(device = %device, "blkid found no filesystem");
        return Err(DriverError::DevicePathInvalidForFingerprint(
            device.to_string(),
        ));
    }

    parse_blkid_uuid(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| DriverError::DevicePathInvalidForFingerprint(device.to_string()))
}

fn parse_blkid_uuid(stdout: &str) -> Option<Fingerprint> {
    stdout.lines().next()?.parse().ok()
}

/// Mount `device` at `target` with the given filesystem type.
pub fn mount_device(device: &DevicePath, target: &Path, fs_type: FsType) -> PlatformResult<()> {
    info!(device = %device, target = %target.display(), fs_type = %fs_type, "Mounting device");

    let mount_error = |reason: String| DriverError::Mount {
        device: device.to_string(),
        mount_point: target.display().to_string(),
        reason,
    };

    if is_mounted(target)? {
        debug!(target = %target.display(), "Path already mounted");
        return Ok(());
    }

    fs::create_dir_all(target).map_err(|e| mount_error(e.to_string()))?;

    let target_str = target.to_string_lossy();
    let output = run(
        "mount",
        &["-t", fs_type.as_str(), device.as_str(), &target_str],
    )?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "mount failed");
        return Err(mount_error(stderr.trim().to_string()));
    }

    Ok(())
}

/// Unmount a path. A path that is not mounted is left alone.
pub fn unmount(target: &Path) -> PlatformResult<()> {
    info!(target = %target.display(), "Unmounting");

    if !is_mounted(target)? {
        debug!(target = %target.display(), "Path is not mounted, skipping unmount");
        return Ok(());
    }

    let output = run("umount", &[&target.to_string_lossy()])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not mounted") || stderr.contains("no mount point") {
            warn!(target = %target.display(), "Path was not mounted");
            return Ok(());
        }
        error!(stderr = %stderr, "umount failed");
        return Err(DriverError::Unmount {
            mount_point: target.display().to_string(),
            reason: stderr.trim().to_string(),
        });
    }

    Ok(())
}

/// Check /proc/mounts for `target`.
pub fn is_mounted(target: &Path) -> PlatformResult<bool> {
    let mounts = fs::read_to_string("/proc/mounts")?;
    Ok(mount_table_contains(&mounts, target))
}

/// /proc/mounts escapes whitespace in paths as octal (`\040` for space).
fn mount_table_contains(mounts: &str, target: &Path) -> bool {
    let target = target.to_string_lossy();
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|mount_point| unescape_mount_path(mount_point) == target)
    })
}

fn unescape_mount_path(path: &str) -> String {
    path.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION_OUTPUT: &str = "\
iSCSI Transport Class version 2.0-870
Target: iqn.2024-01.org.example:volume-00000001 (non-flash)
	Current Portal: 10.0.0.10:3260,1
		Attached SCSI devices:
		Host Number: 2	State: running
		scsi2 Channel 00 Id 0 Lun: 0
			Attached scsi disk sdb		State: running
Target: iqn.2024-01.org.example:volume-00000002 (non-flash)
	Current Portal: 10.0.0.10:3260,1
		scsi3 Channel 00 Id 0 Lun: 0
			Attached scsi disk sdc		State: running
";

    #[test]
    fn test_parse_session_disk() {
        assert_eq!(
            parse_session_disk(SESSION_OUTPUT, "iqn.2024-01.org.example:volume-00000001"),
            Some("sdb")
        );
        assert_eq!(
            parse_session_disk(SESSION_OUTPUT, "iqn.2024-01.org.example:volume-00000002"),
            Some("sdc")
        );
        assert_eq!(
            parse_session_disk(SESSION_OUTPUT, "iqn.2024-01.org.example:volume-00000003"),
            None
        );
    }

    #[test]
    fn test_parse_blkid_uuid() {
        let fp = parse_blkid_uuid("0c8a3b8e-5a3f-4a45-9d0e-3f4c1b2a7e61\n").unwrap();
        assert_eq!(fp.as_str(), "0c8a3b8e-5a3f-4a45-9d0e-3f4c1b2a7e61");

        // vfat volume ids are not UUIDs
        assert!(parse_blkid_uuid("A1B2-C3D4\n").is_none());
        assert!(parse_blkid_uuid("").is_none());
    }

    #[test]
    fn test_mount_table_contains() {
        let mounts = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb /testsmnt/1 ext4 rw,relatime 0 0
/dev/sdc /mnt/with\\040space xfs rw 0 0
";
        assert!(mount_table_contains(mounts, Path::new("/testsmnt/1")));
        assert!(mount_table_contains(mounts, Path::new("/mnt/with space")));
        assert!(!mount_table_contains(mounts, Path::new("/testsmnt")));
        assert!(!mount_table_contains(mounts, Path::new("/testsmnt/10")));
    }

    #[test]
    fn test_format_missing_device() {
        let err = format_device(&DevicePath::from("/dev/does-not-exist-0"), FsType::Ext4)
            .unwrap_err();
        assert!(matches!(err, DriverError::DeviceNotFound(_)));
    }
}

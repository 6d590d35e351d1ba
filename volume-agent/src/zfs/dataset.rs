use std::process::{Command, Output};
use tracing::{debug, info, instrument, warn};

use super::{Result, ZfsError};

/// Map a failed `zfs` invocation to an error.
///
/// "does not exist" and "already exists" get their own variants so callers
/// can make create/destroy idempotent.
fn check_command_result(output: &Output, command: &str, dataset: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("does not exist") || stderr.contains("not found") {
        return Err(ZfsError::ZvolNotFound(dataset.to_string()));
    }
    if stderr.contains("already exists") {
        return Err(ZfsError::ZvolExists(dataset.to_string()));
    }

    Err(ZfsError::CommandFailed {
        command: command.to_string(),
        stderr: stderr.trim().to_string(),
    })
}

/// Validate that a zvol name is safe to pass to `zfs`.
/// Only allows alphanumeric characters, underscores, hyphens, and periods.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ZfsError::InvalidName("name cannot be empty".into()));
    }
    if name.contains("..") {
        return Err(ZfsError::InvalidName("path traversal not allowed".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ZfsError::InvalidName(format!(
            "invalid characters in name '{}'",
            name
        )));
    }
    Ok(())
}

/// A zvol as reported by `zfs list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Full dataset name (e.g., "tank/volumes/volume-00000001")
    pub name: String,
    /// Referenced space in bytes
    pub referenced: u64,
    pub volsize: Option<u64>,
}

/// Creates and destroys zvols under a parent dataset.
#[derive(Debug, Clone)]
pub struct ZfsManager {
    parent_dataset: String,
}

impl ZfsManager {
    /// Create a manager, verifying the parent dataset exists.
    pub fn new(parent_dataset: String) -> Result<Self> {
        if parent_dataset.is_empty() {
            return Err(ZfsError::InvalidName(
                "parent dataset name cannot be empty".to_string(),
            ));
        }

        let output = Command::new("zfs")
            .args(["list", "-H", "-o", "name", &parent_dataset])
            .output()?;

        if !output.status.success() {
            return Err(ZfsError::ParentNotFound(parent_dataset));
        }

        info!(dataset = %parent_dataset, "ZFS manager initialized");
        Ok(Self { parent_dataset })
    }

    fn full_path(&self, name: &str) -> String {
        format!("{}/{}", self.parent_dataset, name)
    }

    /// Device node for a zvol, as seen on the storage host.
    pub fn device_path(&self, name: &str) -> String {
        format!("/dev/zvol/{}", self.full_path(name))
    }

    /// Create a zvol of `size_bytes`.
    #[instrument(skip(self))]
    pub fn create_zvol(&self, name: &str, size_bytes: u64) -> Result<Dataset> {
        validate_name(name)?;
        let full_name = self.full_path(name);

        // Let zfs create fail if already exists (avoids TOCTOU race)
        let output = Command::new("zfs")
            .args([
                "create",
                "-V",
                &size_bytes.to_string(),
                "-o",
                "volmode=dev",
                &full_name,
            ])
            .output()?;

        if let Err(e) = check_command_result(&output, "create", &full_name) {
            warn!(zvol = %full_name, error = %e, "Failed to create zvol");
            return Err(e);
        }

        info!(zvol = %full_name, size_bytes, "zvol created");
        self.get_dataset(name)
    }

    /// Destroy a zvol. A zvol that does not exist counts as destroyed.
    #[instrument(skip(self))]
    pub fn destroy_zvol(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let full_name = self.full_path(name);

        if !self.dataset_exists(&full_name)? {
            debug!(zvol = %full_name, "zvol already destroyed");
            return Ok(());
        }

        let output = Command::new("zfs").args(["destroy", &full_name]).output()?;
        match check_command_result(&output, "destroy", &full_name) {
            Ok(()) | Err(ZfsError::ZvolNotFound(_)) => {
                info!(zvol = %full_name, "zvol destroyed");
                Ok(())
            }
            Err(e) => {
                warn!(zvol = %full_name, error = %e, "Failed to destroy zvol");
                Err(e)
            }
        }
    }

    pub fn get_dataset(&self, name: &str) -> Result<Dataset> {
        validate_name(name)?;
        let full_name = self.full_path(name);

        let output = Command::new("zfs")
            .args(["list", "-H", "-p", "-o", "name,refer,volsize", &full_name])
            .output()?;
        check_command_result(&output, "list", &full_name)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .next()
            .ok_or_else(|| ZfsError::ParseError("empty output from zfs list".to_string()))?;

        parse_dataset_line(line)
    }

    fn dataset_exists(&self, full_name: &str) -> Result<bool> {
        let output = Command::new("zfs")
            .args(["list", "-H", "-o", "name", full_name])
            .output()?;

        Ok(output.status.success())
    }
}

/// Parse one tab-separated `name refer volsize` line (`zfs list -H -p`).
fn parse_dataset_line(line: &str) -> Result<Dataset> {
    let mut fields = line.split('\t');
    let (Some(name), Some(refer), Some(volsize)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(ZfsError::ParseError(format!(
            "expected 3 fields: {}",
            line
        )));
    };

    let volsize = match volsize.trim() {
        "-" | "none" => None,
        value => Some(parse_size(value)?),
    };

    Ok(Dataset {
        name: name.to_string(),
        referenced: parse_size(refer)?,
        volsize,
    })
}

fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim();
    if size_str == "-" {
        return Ok(0);
    }

    size_str
        .parse::<u64>()
        .map_err(|_| ZfsError::ParseError(format!("invalid size value: {}", size_str)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1073741824").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("-").unwrap(), 0);
        assert!(parse_size("1G").is_err());
    }

    #[test]
    fn test_parse_dataset_line() {
        let dataset = parse_dataset_line("tank/vols/volume-00000001\t57344\t1073741824").unwrap();
        assert_eq!(dataset.name, "tank/vols/volume-00000001");
        assert_eq!(dataset.referenced, 57344);
        assert_eq!(dataset.volsize, Some(1073741824));

        let fs = parse_dataset_line("tank/vols\t98304\t-").unwrap();
        assert_eq!(fs.volsize, None);

        assert!(parse_dataset_line("tank/vols\t98304").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("volume-00000001").is_ok());
        assert!(validate_name("vol_1.a").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("vol/name").is_err());
        assert!(validate_name("vol@snap").is_err());
        assert!(validate_name("vol;rm -rf /").is_err());
        assert!(validate_name("../../etc").is_err());
    }

    #[test]
    fn test_device_path() {
        let manager = ZfsManager {
            parent_dataset: "tank/volumes".to_string(),
        };
        assert_eq!(
            manager.device_path("volume-00000001"),
            "/dev/zvol/tank/volumes/volume-00000001"
        );
    }
}

//! Volume records and the identifiers that travel with them.
//!
//! A [`Volume`] is owned by the registry. [`Fingerprint`] is the filesystem
//! UUID read back from a formatted device; it can only be built by parsing a
//! canonical UUID string or by generating a fresh one, so a malformed value
//! never leaves this module.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// VolumeId
// ============================================================================

/// Registry-assigned numeric volume identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(u64);

impl VolumeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Backend object name for this volume, e.g. `volume-0000002a`.
    ///
    /// Used as the zvol name and as the suffix of the iSCSI target name.
    pub fn backend_name(self) -> String {
        format!("volume-{:08x}", self.0)
    }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VolumeId {
    type Err = VolumeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(VolumeId)
            .map_err(|_| VolumeIdParseError(s.to_string()))
    }
}

/// Error returned when parsing a non-numeric volume id.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid volume id '{0}': expected a non-negative integer")]
pub struct VolumeIdParseError(String);

// ============================================================================
// Status enums
// ============================================================================

/// Provisioning status of a volume record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    /// Record exists, backend has not finished provisioning.
    Creating,
    /// Provisioned and ready to be assigned.
    Available,
    Deleting,
    /// Soft-deleted; still visible until purged.
    Deleted,
    /// Backend provisioning failed.
    Error,
}

impl Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeStatus::Creating => write!(f, "creating"),
            VolumeStatus::Available => write!(f, "available"),
            VolumeStatus::Deleting => write!(f, "deleting"),
            VolumeStatus::Deleted => write!(f, "deleted"),
            VolumeStatus::Error => write!(f, "error"),
        }
    }
}

/// Whether a volume is currently assigned to a compute host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachStatus {
    Attached,
    #[default]
    Detached,
}

impl Display for AttachStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachStatus::Attached => write!(f, "attached"),
            AttachStatus::Detached => write!(f, "detached"),
        }
    }
}

// ============================================================================
// Owner
// ============================================================================

/// The user and project a volume belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user_id: String,
    pub project_id: String,
}

impl Owner {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
        }
    }
}

// ============================================================================
// Fingerprint
// ============================================================================

static FINGERPRINT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("Invalid regex pattern")
});

/// Filesystem UUID in canonical 8-4-4-4-12 lowercase hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Generate a fresh random fingerprint.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    /// Returns true if `text` is already in canonical form.
    pub fn is_canonical(text: &str) -> bool {
        FINGERPRINT_PATTERN.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    /// Accepts surrounding whitespace and uppercase hex (as printed by some
    /// tools), and normalizes to the canonical lowercase form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        if Self::is_canonical(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(FingerprintParseError(s.to_string()))
        }
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Error returned when a string is not a canonical filesystem UUID.
#[derive(Debug, Clone, thiserror::Error)]
#[error("'{0}' is not a filesystem UUID")]
pub struct FingerprintParseError(String);

// ============================================================================
// Volume
// ============================================================================

/// Volume metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub display_name: String,
    pub display_description: String,
    /// Size in GiB
    pub size: u64,
    pub status: VolumeStatus,
    pub attach_status: AttachStatus,
    /// Set the first time the volume is formatted, never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    pub user_id: String,
    pub project_id: String,
    /// Compute host the volume is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    /// Creation timestamp (Unix epoch)
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl Volume {
    pub fn owner(&self) -> Owner {
        Owner::new(&self.user_id, &self.project_id)
    }

    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        self.user_id == owner.user_id && self.project_id == owner.project_id
    }

    /// Size in bytes, as handed to block backends.
    pub fn size_bytes(&self) -> u64 {
        self.size.saturating_mul(1024 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_name() {
        assert_eq!(VolumeId::new(1).backend_name(), "volume-00000001");
        assert_eq!(VolumeId::new(0x2a).backend_name(), "volume-0000002a");
    }

    #[test]
    fn test_volume_id_parse() {
        assert_eq!("42".parse::<VolumeId>().unwrap(), VolumeId::new(42));
        assert_eq!(" 7 ".parse::<VolumeId>().unwrap(), VolumeId::new(7));
        assert!("volume-1".parse::<VolumeId>().is_err());
        assert!("-1".parse::<VolumeId>().is_err());
    }

    #[test]
    fn test_generated_fingerprint_is_canonical() {
        for _ in 0..32 {
            let fp = Fingerprint::generate();
            assert!(Fingerprint::is_canonical(fp.as_str()), "{fp}");
        }
    }

    #[test]
    fn test_fingerprint_parse() {
        let fp: Fingerprint = "3F2504E0-4F89-11D3-9A0C-0305E82C3301\n".parse().unwrap();
        assert_eq!(fp.as_str(), "3f2504e0-4f89-11d3-9a0c-0305e82c3301");

        assert!("".parse::<Fingerprint>().is_err());
        assert!("gdfjghsfjkhggrsyiyerreygghdsghsdfjhf".parse::<Fingerprint>().is_err());
        // vfat serials are not UUIDs
        assert!("1234-ABCD".parse::<Fingerprint>().is_err());
        assert!("3f2504e04f8911d39a0c0305e82c3301".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_fingerprint_serde_rejects_garbage() {
        let ok: Fingerprint =
            serde_json::from_str("\"3f2504e0-4f89-11d3-9a0c-0305e82c3301\"").unwrap();
        assert_eq!(ok.as_str(), "3f2504e0-4f89-11d3-9a0c-0305e82c3301");
        assert!(serde_json::from_str::<Fingerprint>("\"not-a-uuid\"").is_err());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&VolumeStatus::Available).unwrap(),
            "\"available\""
        );
        assert_eq!(VolumeStatus::Creating.to_string(), "creating");
        assert_eq!(AttachStatus::default(), AttachStatus::Detached);
    }
}

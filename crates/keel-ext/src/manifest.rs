use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use keel_core::{KeelError, Result};

/// File name of the manifest inside an extension directory.
pub const MANIFEST_FILE: &str = "extension.toml";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").expect("static regex"));
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)").expect("static regex"));

/// Extension manifest: loaded from `extension.toml` next to the entry file.
///
/// ```toml
/// name = "demo"
/// version = "1.0.0"
/// description = "Echoes its arguments"
/// author = "Keel Community"
/// entryPoint = "demo.wasm"
/// permissions = ["commands", "storage:read", "storage:write"]
///
/// [hostCompatibility]
/// minVersion = "0.1.0"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    /// Path of the code file, relative to the extension directory.
    pub entry_point: String,
    /// Raw permission tokens as written by the author. Unknown tokens are kept
    /// so the permission classifier can deny them.
    pub permissions: Vec<String>,
    pub host_compatibility: HostCompatibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// BLAKE3 hash of the entry file for integrity verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCompatibility {
    pub min_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

/// Every field optional so a missing one can be reported by name instead of
/// as an opaque deserialization error.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    author: Option<String>,
    entry_point: Option<String>,
    permissions: Option<Vec<String>>,
    host_compatibility: Option<RawHostCompatibility>,
    license: Option<String>,
    repository: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    checksum: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHostCompatibility {
    min_version: Option<String>,
    max_version: Option<String>,
}

fn invalid(field: &str, reason: impl Into<String>) -> KeelError {
    KeelError::ManifestInvalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| invalid(field, "required field is missing"))
}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    let value = required(value, field)?;
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(value)
}

/// Whether `name` is usable as an extension name (and thus a directory name).
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Parse the `MAJOR.MINOR.PATCH` prefix of a version string.
pub fn version_prefix(s: &str) -> Option<Version> {
    let caps = VERSION_RE.captures(s)?;
    let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
    Some(Version::new(part(1)?, part(2)?, part(3)?))
}

impl ExtensionManifest {
    /// Parse and structurally validate raw manifest bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| invalid("manifest", format!("not valid UTF-8: {e}")))?;
        Self::from_toml(text)
    }

    /// Parse and structurally validate a TOML manifest.
    pub fn from_toml(s: &str) -> Result<Self> {
        let raw: RawManifest = toml::from_str(s)
            .map_err(|e| invalid("manifest", format!("failed to parse {MANIFEST_FILE}: {e}")))?;

        let name = non_empty(raw.name, "name")?;
        if !NAME_RE.is_match(&name) {
            return Err(invalid(
                "name",
                format!("'{name}' must be lowercase letters, digits, '.', '_' or '-' (max 64)"),
            ));
        }

        let version = non_empty(raw.version, "version")?;
        if version_prefix(&version).is_none() {
            return Err(invalid(
                "version",
                format!("'{version}' is not a MAJOR.MINOR.PATCH version"),
            ));
        }

        let description = required(raw.description, "description")?;
        let author = non_empty(raw.author, "author")?;
        let entry_point = non_empty(raw.entry_point, "entryPoint")?;
        let permissions = required(raw.permissions, "permissions")?;

        let compat = required(raw.host_compatibility, "hostCompatibility")?;
        let min_version = non_empty(compat.min_version, "hostCompatibility.minVersion")?;
        if version_prefix(&min_version).is_none() {
            return Err(invalid(
                "hostCompatibility.minVersion",
                format!("'{min_version}' is not a MAJOR.MINOR.PATCH version"),
            ));
        }
        if let Some(max) = &compat.max_version {
            if version_prefix(max).is_none() {
                return Err(invalid(
                    "hostCompatibility.maxVersion",
                    format!("'{max}' is not a MAJOR.MINOR.PATCH version"),
                ));
            }
        }

        let checksum = raw.checksum.map(|c| c.trim().to_string());
        if let Some(c) = &checksum {
            if c.len() != 64 || !c.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(invalid(
                    "checksum",
                    "must be the 64-character BLAKE3 hex digest of the entry file",
                ));
            }
        }

        Ok(Self {
            name,
            version,
            description,
            author,
            entry_point,
            permissions,
            host_compatibility: HostCompatibility {
                min_version,
                max_version: compat.max_version,
            },
            license: raw.license,
            repository: raw.repository,
            keywords: raw.keywords,
            checksum,
        })
    }

    /// Get the semver version (prefix only, pre-release tags dropped).
    pub fn semver(&self) -> Option<Version> {
        version_prefix(&self.version)
    }

    /// Check the manifest's host range against the running host version.
    pub fn check_compatibility(&self, host_version: &str) -> Result<()> {
        let host = version_prefix(host_version)
            .ok_or_else(|| invalid("hostCompatibility", format!("host version '{host_version}' is malformed")))?;
        let compat = &self.host_compatibility;

        if let Some(min) = version_prefix(&compat.min_version) {
            if host < min {
                return Err(invalid(
                    "hostCompatibility",
                    format!("requires host >= {min}, running {host}"),
                ));
            }
        }
        if let Some(max) = compat.max_version.as_deref().and_then(version_prefix) {
            if host > max {
                return Err(invalid(
                    "hostCompatibility",
                    format!("requires host <= {max}, running {host}"),
                ));
            }
        }
        Ok(())
    }

    /// Verify the entry file integrity.
    pub fn verify_checksum(&self, entry_bytes: &[u8]) -> bool {
        match &self.checksum {
            Some(expected) => {
                let actual = blake3::hash(entry_bytes).to_hex().to_string();
                actual.eq_ignore_ascii_case(expected.trim())
            }
            None => true,
        }
    }
}

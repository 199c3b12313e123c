use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{UpdateError, Version};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArchiveFormat {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveFormat::Zip => write!(f, "zip"),
            ArchiveFormat::TarGz => write!(f, "tar.gz"),
        }
    }
}

impl std::str::FromStr for ArchiveFormat {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "tgz" => Ok(ArchiveFormat::TarGz),
            other => Err(UpdateError::InvalidRequest {
                reason: format!("unsupported archive format: {other}"),
            }),
        }
    }
}

/// Describes the artifact that should be installed and how to check it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UpdateManifest {
    pub version: Version,
    pub source_url: String,
    /// SHA-256 of the archive bytes, bare hex or `sha256:<hex>`.
    pub expected_checksum: String,
    pub archive_format: ArchiveFormat,
    /// Canonical digest of the unpacked tree. Defaults to the digest of the
    /// verified archive's own contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_checksum: Option<String>,
}

impl UpdateManifest {
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.version.as_str().trim().is_empty() {
            return Err(UpdateError::InvalidRequest {
                reason: "manifest version must not be empty".to_string(),
            });
        }
        normalize_checksum(&self.expected_checksum)?;
        if let Some(tree) = &self.tree_checksum {
            normalize_checksum(tree)?;
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256 without the optional `sha256:` prefix.
pub fn normalize_checksum(raw: &str) -> Result<String, UpdateError> {
    let trimmed = raw.trim();
    let hex = match trimmed.split_once(':') {
        Some((algo, rest)) if algo.eq_ignore_ascii_case("sha256") => rest,
        Some((algo, _)) => {
            return Err(UpdateError::InvalidRequest {
                reason: format!("unsupported checksum algorithm: {algo}"),
            })
        }
        None => trimmed,
    };

    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UpdateError::InvalidRequest {
            reason: format!("checksum is not a 64 digit sha256 hex string: {raw}"),
        });
    }
    Ok(hex.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn manifest_parses_from_feed_json() {
        let json = format!(
            r#"{{
                "version": "2024.06.1",
                "source_url": "https://updates.example.com/app-2024.06.1.zip",
                "expected_checksum": "sha256:{DIGEST}",
                "archive_format": "zip"
            }}"#
        );
        let manifest: UpdateManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(manifest.version, Version::new("2024.06.1"));
        assert_eq!(manifest.archive_format, ArchiveFormat::Zip);
        assert!(manifest.tree_checksum.is_none());
        manifest.validate().unwrap();
    }

    #[test]
    fn manifest_rejects_unknown_fields() {
        let json = serde_json::json!({
            "version": "1",
            "source_url": "u",
            "expected_checksum": "x",
            "archive_format": "zip",
            "extra": 1
        });
        let result: Result<UpdateManifest, _> = serde_json::from_value(json);
        assert!(result.unwrap_err().to_string().contains("unknown field"));
    }

    #[test]
    fn tgz_alias_maps_to_tar_gz() {
        let format: ArchiveFormat = serde_json::from_str("\"tgz\"").unwrap();
        assert_eq!(format, ArchiveFormat::TarGz);
        assert_eq!("TAR.GZ".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
    }

    #[test]
    fn checksum_normalization() {
        let prefixed = format!("SHA256:{}", DIGEST.to_uppercase());
        assert_eq!(normalize_checksum(&prefixed).unwrap(), DIGEST);
        assert_eq!(normalize_checksum(DIGEST).unwrap(), DIGEST);
        assert!(normalize_checksum("md5:abcd").is_err());
        assert!(normalize_checksum("abc123").is_err());
    }
}

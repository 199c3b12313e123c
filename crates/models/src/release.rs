use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{UpdateManifest, Version};

/// A downloaded and unpacked candidate, owned by one update cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingArtifact {
    pub staging_path: PathBuf,
    pub manifest: UpdateManifest,
    pub extracted_at: DateTime<Utc>,
    /// Canonical digest of the archive's contents, computed before extraction.
    pub tree_checksum: String,
    pub file_count: usize,
    pub unpacked_bytes: u64,
}

/// A release tree the install pointer resolves to (or used to).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstalledRelease {
    pub release_id: String,
    pub install_path: PathBuf,
    pub release_dir: PathBuf,
    pub active_version: Version,
    pub installed_at: DateTime<Utc>,
}

/// Role a stored release plays for the install pointer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseSlot {
    Active,
    Previous,
    Retired,
}

impl ReleaseSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseSlot::Active => "active",
            ReleaseSlot::Previous => "previous",
            ReleaseSlot::Retired => "retired",
        }
    }
}

/// Sidecar metadata written next to each release directory, so a pointer can
/// be traced back to its version even if the store lags behind the disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseMetadata {
    pub release_id: String,
    pub version: Version,
    pub installed_at: DateTime<Utc>,
    pub tree_checksum: String,
}

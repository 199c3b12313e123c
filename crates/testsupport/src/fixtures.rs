use liveswap_models::{ArchiveFormat, Config, UpdateManifest, Version};
use std::path::Path;

use crate::archives::{sha256_hex, tar_gz_bytes, zip_bytes, ArchiveEntry};

/// Config rooted at `dir` with timings short enough for tests.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_data_dir(dir);
    config.server.port_admin_api = 0;
    config.fetch.connect_timeout_ms = 2_000;
    config.fetch.read_timeout_ms = 2_000;
    config.fetch.max_artifact_bytes = 8 * 1024 * 1024;
    config.policy.cycle_timeout_ms = 10_000;
    config.policy.backoff_base_ms = 60_000;
    config.policy.backoff_max_ms = 120_000;
    config
}

/// A small application tree whose `VERSION` file names its release.
pub fn app_release(version: &str) -> Vec<ArchiveEntry> {
    vec![
        ArchiveEntry::dir("bin/"),
        ArchiveEntry::file("bin/app", format!("#!/bin/sh\necho {version}\n")).with_mode(0o755),
        ArchiveEntry::file("VERSION", version),
        ArchiveEntry::file("data/registry.csv", format!("id,version\n1,{version}\n")),
    ]
}

pub fn archive_bytes(entries: &[ArchiveEntry], format: ArchiveFormat) -> Vec<u8> {
    match format {
        ArchiveFormat::Zip => zip_bytes(entries),
        ArchiveFormat::TarGz => tar_gz_bytes(entries),
    }
}

/// Manifest whose raw checksum matches `bytes`.
pub fn manifest_for(
    version: &str,
    url: String,
    bytes: &[u8],
    format: ArchiveFormat,
) -> UpdateManifest {
    UpdateManifest {
        version: Version::new(version),
        source_url: url,
        expected_checksum: sha256_hex(bytes),
        archive_format: format,
        tree_checksum: None,
    }
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::UpdateError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub data: DataConfig,
    pub install: InstallConfig,
    pub fetch: FetchConfig,
    pub extract: ExtractConfig,
    pub policy: PolicyConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port_admin_api: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub dir: String,
    pub db_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InstallConfig {
    /// The pointer the serving process reads its tree through.
    pub install_path: PathBuf,
    pub releases_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// Release trees kept on disk, active and previous included.
    pub keep_releases: usize,
    /// Version recorded for a plain directory found at `install_path` on startup.
    pub adopt_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FetchConfig {
    pub max_artifact_bytes: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExtractConfig {
    pub max_entries: usize,
    pub max_unpacked_bytes: u64,
    /// Paths (or `*.ext` suffix patterns) every archive must contain.
    pub required_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    Reject,
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub cycle_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub on_busy: BusyPolicy,
    pub allow_downgrade: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FeedConfig {
    /// JSON manifest endpoint consulted when a trigger carries no manifest.
    pub manifest_url: Option<String>,
    /// Disabled unless set; no update cadence is assumed.
    pub poll_interval_secs: Option<u64>,
    pub check_on_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1".to_string(),
                port_admin_api: 8081,
            },
            data: DataConfig {
                dir: "data".to_string(),
                db_url: "sqlite://data/liveswap.db".to_string(),
            },
            install: InstallConfig {
                install_path: PathBuf::from("data/current"),
                releases_dir: PathBuf::from("data/releases"),
                staging_dir: PathBuf::from("data/staging"),
                keep_releases: 3,
                adopt_version: None,
            },
            fetch: FetchConfig {
                max_artifact_bytes: 512 * 1024 * 1024, // 512MB
                connect_timeout_ms: 10_000,
                read_timeout_ms: 20_000,
                user_agent: format!("liveswap/{}", env!("CARGO_PKG_VERSION")),
            },
            extract: ExtractConfig {
                max_entries: 100_000,
                max_unpacked_bytes: 2 * 1024 * 1024 * 1024, // 2GB
                required_paths: Vec::new(),
            },
            policy: PolicyConfig {
                cycle_timeout_ms: 30 * 60 * 1000, // 30 minutes
                backoff_base_ms: 30_000,
                backoff_max_ms: 6 * 60 * 60 * 1000, // 6 hours
                on_busy: BusyPolicy::Reject,
                allow_downgrade: false,
            },
            feed: FeedConfig {
                manifest_url: None,
                poll_interval_secs: None,
                check_on_startup: false,
            },
        }
    }
}

impl Config {
    /// Config rooted at `dir`, with every on-disk path placed beneath it.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        let dir: PathBuf = dir.into();
        let mut config = Self::default();
        config.data.dir = dir.display().to_string();
        config.data.db_url = format!("sqlite://{}", dir.join("liveswap.db").display());
        config.install.install_path = dir.join("current");
        config.install.releases_dir = dir.join("releases");
        config.install.staging_dir = dir.join("staging");
        config
    }

    pub fn validate(&self) -> Result<(), UpdateError> {
        let fail = |reason: &str| {
            Err(UpdateError::Config {
                reason: reason.to_string(),
            })
        };

        if self.install.keep_releases < 2 {
            return fail("install.keep_releases must be at least 2 to retain a rollback release");
        }
        if self.install.install_path.file_name().is_none() {
            return fail("install.install_path must name a file system entry");
        }
        if self.install.staging_dir.starts_with(&self.install.install_path)
            || self.install.releases_dir.starts_with(&self.install.install_path)
        {
            return fail("staging and releases directories must live outside install.install_path");
        }
        if self.install.staging_dir == self.install.releases_dir {
            return fail("install.staging_dir and install.releases_dir must differ");
        }
        if self.fetch.max_artifact_bytes == 0 {
            return fail("fetch.max_artifact_bytes must be positive");
        }
        if self.policy.backoff_base_ms == 0
            || self.policy.backoff_max_ms < self.policy.backoff_base_ms
        {
            return fail("policy.backoff_max_ms must be >= policy.backoff_base_ms > 0");
        }
        if self.feed.poll_interval_secs == Some(0) {
            return fail("feed.poll_interval_secs must be positive when set");
        }
        Ok(())
    }
}

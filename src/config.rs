//! Layered configuration loading.
//!
//! Priority, lowest to highest: built-in defaults, the TOML file, then
//! `LIVESWAP_` environment variables with `__` separating nested keys
//! (`LIVESWAP_POLICY__ALLOW_DOWNGRADE=true` sets `policy.allow_downgrade`).

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    Figment,
};
use liveswap_models::Config;
use std::path::{Path, PathBuf};
use tracing::info;

/// Files tried in order when no explicit path is given.
pub const CONFIG_SEARCH_PATHS: [&str; 2] = ["configs/default.toml", "config/config.toml"];

pub const ENV_PREFIX: &str = "LIVESWAP_";

/// Variables under the prefix that belong to the binaries, not the config tree.
const ENV_IGNORED: [&str; 2] = ["config", "endpoint"];

/// Builds the provider chain without extracting, so callers can add layers.
pub fn config_figment(explicit: Option<&Path>) -> Result<Figment> {
    let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

    match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            if let Some(path) = CONFIG_SEARCH_PATHS.iter().map(PathBuf::from).find(|p| p.exists()) {
                info!("Using config file {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }
    }

    Ok(figment.merge(Env::prefixed(ENV_PREFIX).ignore(&ENV_IGNORED).split("__")))
}

/// Loads and validates the service configuration.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config: Config = config_figment(explicit)?
        .extract()
        .context("failed to load configuration")?;
    config.validate()?;
    Ok(config)
}

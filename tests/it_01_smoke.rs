mod common;

use common::spawn_daemon;
use liveswap::{config_figment, load_config};
use liveswap_models::{BusyPolicy, Config, RunningOn, UpdateState};
use liveswap_testsupport::test_config;
use std::path::PathBuf;

#[tokio::test(flavor = "multi_thread")]
async fn smoke_test() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let daemon = spawn_daemon(test_config(dir.path())).await?;

    assert_eq!(daemon.client.health().await?, "OK");

    let metrics = daemon.client.metrics().await?;
    assert!(metrics.contains("liveswap_cycles_total"));
    assert!(metrics.contains("liveswap_installs_total"));

    let status = daemon.client.status().await?;
    assert_eq!(status.state, UpdateState::Idle);
    assert_eq!(status.running_on, RunningOn::None);
    assert_eq!(status.consecutive_failures, 0);
    assert!(!status.halted);

    assert!(daemon.client.history(10).await?.records.is_empty());
    daemon.stop();
    Ok(())
}

#[test]
fn config_file_overrides_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("liveswap.toml");
    std::fs::write(
        &path,
        r#"
[install]
install_path = "/srv/app/current"
releases_dir = "/srv/app/releases"
staging_dir = "/srv/app/staging"
keep_releases = 5
adopt_version = "0.9.0"

[policy]
cycle_timeout_ms = 60000
backoff_base_ms = 1000
backoff_max_ms = 8000
on_busy = "queue"
allow_downgrade = true
"#,
    )?;

    let config = load_config(Some(path.as_path()))?;
    assert_eq!(config.install.install_path, PathBuf::from("/srv/app/current"));
    assert_eq!(config.install.keep_releases, 5);
    assert_eq!(config.install.adopt_version.as_deref(), Some("0.9.0"));
    assert_eq!(config.policy.on_busy, BusyPolicy::Queue);
    assert!(config.policy.allow_downgrade);
    // Untouched sections keep their defaults
    assert_eq!(config.server, Config::default().server);
    assert_eq!(config.fetch, Config::default().fetch);
    Ok(())
}

#[test]
fn config_loader_rejects_bad_input() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    assert!(load_config(Some(dir.path().join("missing.toml").as_path())).is_err());

    let unknown = dir.path().join("unknown.toml");
    std::fs::write(&unknown, "[policy]\nretry_forever = true\n")?;
    assert!(load_config(Some(unknown.as_path())).is_err());

    let one_release = dir.path().join("one.toml");
    std::fs::write(&one_release, "[install]\nkeep_releases = 1\n")?;
    let err = load_config(Some(one_release.as_path())).unwrap_err();
    assert!(err.to_string().contains("keep_releases"));

    // The raw provider chain still extracts, validation is what refuses it
    let raw: Config = config_figment(Some(one_release.as_path()))?.extract()?;
    assert_eq!(raw.install.keep_releases, 1);
    Ok(())
}

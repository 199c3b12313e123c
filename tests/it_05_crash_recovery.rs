#![cfg(unix)]

mod common;

use common::{
    dir_is_empty, installed_version, publish, spawn_daemon, spawn_daemon_with, wait_until,
    CrashBeforeInstall,
};
use liveswap_models::{ArchiveFormat, TriggerOutcome, UpdateOutcome, UpdateState, Version};
use liveswap_testsupport::{test_config, ArtifactServer};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn restart_after_crash_keeps_last_good_release() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ArtifactServer::start().await;
    let config = test_config(dir.path());

    let daemon = spawn_daemon(config.clone()).await?;
    daemon.client.trigger(Some(publish(&server, "1.0.0", ArchiveFormat::Zip))).await?.unwrap_ok();
    daemon.client.wait_for_settled(Duration::from_secs(15)).await?;
    daemon.stop();

    // The cycle task dies right as it enters the install phase
    let crashing = spawn_daemon_with(config.clone(), |o| {
        o.with_observer(Arc::new(CrashBeforeInstall))
    })
    .await?;
    let v2 = publish(&server, "2.0.0", ArchiveFormat::TarGz);
    let outcome = crashing.client.trigger(Some(v2.clone())).await?.unwrap_ok();
    assert!(matches!(outcome, TriggerOutcome::Started { .. }));
    wait_until(&crashing.client, |s| s.state == UpdateState::Installing).await?;
    crashing.stop();

    let daemon = spawn_daemon(config.clone()).await?;
    let status = daemon.client.status().await?;
    assert_eq!(status.state, UpdateState::Idle);
    assert_eq!(status.active_version, Some(Version::new("1.0.0")));
    assert_eq!(installed_version(&config).as_deref(), Some("1.0.0"));
    assert!(dir_is_empty(&config.install.staging_dir));

    let newest = &daemon.client.history(1).await?.records[0];
    assert_eq!(newest.outcome, UpdateOutcome::Interrupted);
    assert_eq!(newest.version, "2.0.0");

    // The interrupted version installs cleanly on the next attempt
    daemon.client.trigger(Some(v2)).await?.unwrap_ok();
    let status = daemon.client.wait_for_settled(Duration::from_secs(15)).await?;
    assert_eq!(status.active_version, Some(Version::new("2.0.0")));
    assert_eq!(status.previous_version, Some(Version::new("1.0.0")));

    daemon.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_pointer_is_restored_on_startup() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ArtifactServer::start().await;
    let config = test_config(dir.path());

    let daemon = spawn_daemon(config.clone()).await?;
    daemon.client.trigger(Some(publish(&server, "1.0.0", ArchiveFormat::Zip))).await?.unwrap_ok();
    daemon.client.wait_for_settled(Duration::from_secs(15)).await?;
    daemon.stop();

    std::fs::remove_file(&config.install.install_path)?;
    assert!(installed_version(&config).is_none());

    let daemon = spawn_daemon(config.clone()).await?;
    let status = daemon.client.status().await?;
    assert!(!status.halted);
    assert_eq!(installed_version(&config).as_deref(), Some("1.0.0"));

    daemon.stop();
    Ok(())
}

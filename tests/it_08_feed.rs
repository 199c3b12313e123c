mod common;

use common::{publish, spawn_daemon, spawn_daemon_with, wait_until};
use liveswap::{FeedPoller, HttpManifestSource};
use liveswap_models::{ArchiveFormat, TriggerOutcome, UpdateOutcome, Version};
use liveswap_testsupport::{test_config, ArtifactServer};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn empty_trigger_pulls_manifest_from_feed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ArtifactServer::start().await;
    let config = test_config(dir.path());
    let feed = HttpManifestSource::new(server.url("latest.json"), &config.fetch)?;
    let daemon = spawn_daemon_with(config, |o| o.with_feed(Arc::new(feed))).await?;

    // Nothing published yet
    let outcome = daemon.client.trigger(None).await?.unwrap_ok();
    assert!(matches!(outcome, TriggerOutcome::Skipped { .. }));

    let manifest = publish(&server, "4.2.0", ArchiveFormat::Zip);
    server.put_json("latest.json", &manifest);
    let outcome = daemon.client.trigger(None).await?.unwrap_ok();
    assert!(matches!(outcome, TriggerOutcome::Started { .. }));
    let status = daemon.client.wait_for_settled(Duration::from_secs(15)).await?;
    assert_eq!(status.active_version, Some(Version::new("4.2.0")));

    daemon.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn poller_installs_new_releases_as_they_appear() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ArtifactServer::start().await;
    let config = test_config(dir.path());
    let feed = HttpManifestSource::new(server.url("latest.json"), &config.fetch)?;
    let daemon = spawn_daemon_with(config, |o| o.with_feed(Arc::new(feed))).await?;

    let poller = FeedPoller::new(daemon.orchestrator.clone(), Duration::from_millis(100));
    let handle = tokio::spawn(async move { poller.start().await });

    server.put_json("latest.json", &publish(&server, "1.0.0", ArchiveFormat::TarGz));
    wait_until(&daemon.client, |s| s.active_version == Some(Version::new("1.0.0"))).await?;

    server.put_json("latest.json", &publish(&server, "1.1.0", ArchiveFormat::TarGz));
    wait_until(&daemon.client, |s| {
        s.active_version == Some(Version::new("1.1.0")) && !s.state.is_in_flight()
    })
    .await?;
    handle.abort();

    // Polling an unchanged feed leaves no trace in history
    let installs: Vec<_> = daemon
        .client
        .history(50)
        .await?
        .records
        .into_iter()
        .map(|r| r.outcome)
        .collect();
    assert_eq!(installs, vec![UpdateOutcome::Installed, UpdateOutcome::Installed]);

    daemon.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_trigger_without_feed_is_bad_request() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let daemon = spawn_daemon(test_config(dir.path())).await?;

    let (status, shape) = daemon.client.trigger(None).await?.unwrap_err();
    assert_eq!(status, 400);
    assert_eq!(shape.error_type, "InvalidRequestError");

    daemon.stop();
    Ok(())
}

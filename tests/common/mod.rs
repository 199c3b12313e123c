#![allow(dead_code)]

use anyhow::Result;
use liveswap::{serve, AppState, MetricsService, UpdateOrchestrator, UpdateStore};
use liveswap_control::CycleObserver;
use liveswap_models::{ArchiveFormat, Config, UpdateManifest, UpdateState, UpdateStatus};
use liveswap_testsupport::{app_release, archive_bytes, manifest_for, AdminClient, ArtifactServer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A running service: recovered orchestrator plus the admin API on an ephemeral port.
pub struct Daemon {
    pub config: Config,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub client: AdminClient,
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl Daemon {
    pub fn stop(self) {
        self.orchestrator.shutdown();
        self.handle.abort();
    }
}

pub async fn spawn_daemon(config: Config) -> Result<Daemon> {
    spawn_daemon_with(config, |o| o).await
}

/// Boots like the server binary does, letting the caller attach observers or a feed.
pub async fn spawn_daemon_with(
    config: Config,
    customize: impl FnOnce(UpdateOrchestrator) -> UpdateOrchestrator,
) -> Result<Daemon> {
    let store = UpdateStore::open(&config.data.db_url).await?;
    let metrics = Arc::new(MetricsService::new()?);
    let orchestrator = Arc::new(customize(
        UpdateOrchestrator::new(config.clone(), store, metrics.clone()).await?,
    ));
    orchestrator.recover().await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let state = AppState::new(orchestrator.clone(), metrics);
    let handle = tokio::spawn(async move {
        let _ = serve(listener, state).await;
    });

    Ok(Daemon {
        config,
        orchestrator,
        client: AdminClient::new(base_url.clone()),
        base_url,
        handle,
    })
}

/// Serves `version` as an archive of `format` and returns its manifest.
pub fn publish(server: &ArtifactServer, version: &str, format: ArchiveFormat) -> UpdateManifest {
    let bytes = archive_bytes(&app_release(version), format);
    let name = format!("app-{}.{}", version, format);
    server.put(&name, bytes.clone());
    manifest_for(version, server.url(&name), &bytes, format)
}

pub fn installed_version(config: &Config) -> Option<String> {
    std::fs::read_to_string(config.install.install_path.join("VERSION")).ok()
}

pub fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

/// Polls the admin API until `done` holds.
pub async fn wait_until(
    client: &AdminClient,
    done: impl Fn(&UpdateStatus) -> bool,
) -> Result<UpdateStatus> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let status = client.status().await?;
        if done(&status) {
            return Ok(status);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition never held; last status {:?}", status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Simulates a process crash the moment a cycle starts installing.
pub struct CrashBeforeInstall;

impl CycleObserver for CrashBeforeInstall {
    fn on_transition(&self, _cycle_id: &str, _from: UpdateState, to: UpdateState) {
        if to == UpdateState::Installing {
            panic!("simulated crash before install");
        }
    }
}

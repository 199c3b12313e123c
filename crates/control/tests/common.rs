#![allow(dead_code)]

use liveswap_control::{CycleObserver, UpdateOrchestrator, UpdateStore};
use liveswap_metrics::MetricsService;
use liveswap_models::{ArchiveFormat, Config, UpdateManifest, UpdateState, UpdateStatus};
use liveswap_testsupport::{app_release, archive_bytes, manifest_for, test_config, ArtifactServer};
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub server: ArtifactServer,
    pub config: Config,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let server = ArtifactServer::start().await;
        Self { dir, server, config }
    }

    pub async fn orchestrator(&self) -> Arc<UpdateOrchestrator> {
        self.build(|o| o).await
    }

    pub async fn build(
        &self,
        customize: impl FnOnce(UpdateOrchestrator) -> UpdateOrchestrator,
    ) -> Arc<UpdateOrchestrator> {
        let store = UpdateStore::open(&self.config.data.db_url).await.unwrap();
        let metrics = Arc::new(MetricsService::new().unwrap());
        let orchestrator = UpdateOrchestrator::new(self.config.clone(), store, metrics)
            .await
            .unwrap();
        Arc::new(customize(orchestrator))
    }

    /// Serves a release archive and returns a manifest that matches it.
    pub fn publish(&self, version: &str, format: ArchiveFormat) -> UpdateManifest {
        let bytes = archive_bytes(&app_release(version), format);
        let name = artifact_name(version, format);
        self.server.put(&name, bytes.clone());
        manifest_for(version, self.server.url(&name), &bytes, format)
    }

    pub fn installed_version(&self) -> Option<String> {
        std::fs::read_to_string(self.config.install.install_path.join("VERSION")).ok()
    }

    pub fn staging_is_empty(&self) -> bool {
        dir_is_empty(&self.config.install.staging_dir)
    }
}

pub fn artifact_name(version: &str, format: ArchiveFormat) -> String {
    format!("app-{}.{}", version, format)
}

pub fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

/// Waits until `done` holds for the published status.
pub async fn wait_for(
    orchestrator: &UpdateOrchestrator,
    done: impl Fn(&UpdateStatus) -> bool,
) -> UpdateStatus {
    let mut rx = orchestrator.subscribe();
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let status = rx.borrow_and_update().clone();
            if done(&status) {
                return status;
            }
            rx.changed().await.expect("status channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("status never settled: {:?}", orchestrator.status()))
}

/// Records every transition it sees.
#[derive(Default)]
pub struct Transitions {
    pub seen: Mutex<Vec<(UpdateState, UpdateState)>>,
}

impl CycleObserver for Transitions {
    fn on_transition(&self, _cycle_id: &str, from: UpdateState, to: UpdateState) {
        self.seen.lock().unwrap().push((from, to));
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

/// Holds the cycle task on entering `state` until `open` is called or
/// `max_wait` passes. Needs a multi-threaded runtime.
pub struct Gate {
    state: UpdateState,
    max_wait: Duration,
    open_tx: Mutex<mpsc::Sender<()>>,
    open_rx: Mutex<mpsc::Receiver<()>>,
}

impl Gate {
    pub fn new(state: UpdateState, max_wait: Duration) -> Arc<Self> {
        let (open_tx, open_rx) = mpsc::channel();
        Arc::new(Self {
            state,
            max_wait,
            open_tx: Mutex::new(open_tx),
            open_rx: Mutex::new(open_rx),
        })
    }

    pub fn open(&self) {
        let _ = self.open_tx.lock().unwrap().send(());
    }
}

impl CycleObserver for Gate {
    fn on_transition(&self, _cycle_id: &str, _from: UpdateState, to: UpdateState) {
        if to == self.state {
            let _ = self.open_rx.lock().unwrap().recv_timeout(self.max_wait);
        }
    }
}

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use liveswap_metrics::{MetricsService, TracingService};
use liveswap_models::{
    normalize_checksum, BusyPolicy, Config, CycleReport, InstalledRelease, RunningOn,
    StagingArtifact, TriggerOutcome, UpdateError, UpdateManifest, UpdateOutcome, UpdateRecord,
    UpdateState, UpdateStatus, VerifyStage, Version,
};
use liveswap_packaging::{
    ArchiveExtractor, ArtifactFetcher, AtomicInstaller, IntegrityVerifier, PointerState,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::feed::ManifestSource;
use crate::store::{Progress, UpdateStore};

/// Sees every state change of a cycle, after it has been persisted.
pub trait CycleObserver: Send + Sync {
    fn on_transition(&self, cycle_id: &str, from: UpdateState, to: UpdateState);
}

/// Drives fetch, verify, extract, verify and install for one manifest at a
/// time, and owns retries, rollback and crash recovery.
pub struct UpdateOrchestrator {
    config: Config,
    store: UpdateStore,
    fetcher: ArtifactFetcher,
    extractor: ArchiveExtractor,
    installer: AtomicInstaller,
    backoff: Backoff,
    metrics: Arc<MetricsService>,
    feed: Option<Arc<dyn ManifestSource>>,
    observers: Vec<Arc<dyn CycleObserver>>,
    cycle_lock: Arc<tokio::sync::Mutex<()>>,
    pending: Mutex<Option<UpdateManifest>>,
    cancel: Mutex<Option<CancellationToken>>,
    retry: Mutex<Option<JoinHandle<()>>>,
    status_tx: watch::Sender<UpdateStatus>,
}

fn slot<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn idle_status() -> UpdateStatus {
    UpdateStatus {
        state: UpdateState::Idle,
        cycle_id: None,
        target_version: None,
        active_version: None,
        previous_version: None,
        running_on: RunningOn::None,
        last_success_at: None,
        last_failure_at: None,
        last_error_kind: None,
        consecutive_failures: 0,
        next_retry_at: None,
        pending_version: None,
        halted: false,
        halt_reason: None,
    }
}

enum Precheck {
    AlreadyCurrent,
    Skipped(String),
}

impl UpdateOrchestrator {
    pub async fn new(
        config: Config,
        store: UpdateStore,
        metrics: Arc<MetricsService>,
    ) -> Result<Self, UpdateError> {
        config.validate()?;
        for dir in [&config.install.releases_dir, &config.install.staging_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| UpdateError::io(dir, e))?;
        }

        let fetcher = ArtifactFetcher::new(&config.fetch)?
            .protect(config.install.install_path.clone())
            .protect(config.install.releases_dir.clone());
        let extractor = ArchiveExtractor::new(&config.extract);
        let installer = AtomicInstaller::new(config.install.releases_dir.clone());
        let backoff = Backoff::from_policy(&config.policy);
        let (status_tx, _) = watch::channel(idle_status());

        let orchestrator = Self {
            config,
            store,
            fetcher,
            extractor,
            installer,
            backoff,
            metrics,
            feed: None,
            observers: Vec::new(),
            cycle_lock: Arc::new(tokio::sync::Mutex::new(())),
            pending: Mutex::new(None),
            cancel: Mutex::new(None),
            retry: Mutex::new(None),
            status_tx,
        };
        orchestrator.refresh_status().await?;
        Ok(orchestrator)
    }

    pub fn with_feed(mut self, feed: Arc<dyn ManifestSource>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_feed(&self) -> bool {
        self.feed.is_some()
    }

    pub fn status(&self) -> UpdateStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
        self.status_tx.subscribe()
    }

    /// Starts a cycle in the background and returns immediately.
    #[instrument(skip(self, manifest), fields(version = %manifest.version))]
    pub async fn trigger_update(
        self: &Arc<Self>,
        manifest: UpdateManifest,
    ) -> Result<TriggerOutcome, UpdateError> {
        manifest.validate()?;
        if self.store.load_progress().await?.halted {
            return Ok(TriggerOutcome::Halted {
                status: self.refresh_status().await?,
            });
        }

        let guard = match Arc::clone(&self.cycle_lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return self.when_busy(manifest).await,
        };

        match self.precheck(&manifest).await? {
            Some(Precheck::AlreadyCurrent) => {
                return Ok(TriggerOutcome::AlreadyCurrent {
                    status: self.refresh_status().await?,
                })
            }
            Some(Precheck::Skipped(reason)) => {
                return Ok(TriggerOutcome::Skipped {
                    reason,
                    status: self.refresh_status().await?,
                })
            }
            None => {}
        }

        let cycle_id = uuid::Uuid::new_v4().to_string();
        let token = self.begin(&cycle_id, &manifest).await?;
        let status = self.status();

        let this = Arc::clone(self);
        let id = cycle_id.clone();
        tokio::spawn(async move {
            let _ = this.run_locked(guard, id, manifest, token).await;
        });

        Ok(TriggerOutcome::Started { cycle_id, status })
    }

    /// Runs a whole cycle on the caller's task.
    #[instrument(skip(self, manifest), fields(version = %manifest.version))]
    pub async fn run_update(
        self: &Arc<Self>,
        manifest: UpdateManifest,
    ) -> Result<CycleReport, UpdateError> {
        manifest.validate()?;
        let progress = self.store.load_progress().await?;
        if progress.halted {
            return Err(UpdateError::Halted {
                reason: progress
                    .halt_reason
                    .unwrap_or_else(|| "manual intervention required".to_string()),
            });
        }

        let guard = Arc::clone(&self.cycle_lock)
            .try_lock_owned()
            .map_err(|_| UpdateError::UpdateInProgress)?;

        let quick = |outcome| CycleReport {
            cycle_id: String::new(),
            version: manifest.version.clone(),
            outcome,
            release: None,
            bytes_downloaded: 0,
            duration_ms: 0,
        };
        match self.precheck(&manifest).await? {
            Some(Precheck::AlreadyCurrent) => {
                self.refresh_status().await?;
                return Ok(quick(UpdateOutcome::AlreadyCurrent));
            }
            Some(Precheck::Skipped(_)) => {
                self.refresh_status().await?;
                return Ok(quick(UpdateOutcome::Skipped));
            }
            None => {}
        }

        let cycle_id = uuid::Uuid::new_v4().to_string();
        let token = self.begin(&cycle_id, &manifest).await?;
        Arc::clone(self).run_locked(guard, cycle_id, manifest, token).await
    }

    /// Asks the feed for a manifest and triggers it.
    pub async fn trigger_from_feed(self: &Arc<Self>) -> Result<TriggerOutcome, UpdateError> {
        let feed = self.feed.as_ref().ok_or_else(|| UpdateError::InvalidRequest {
            reason: "no manifest given and no manifest feed is configured".to_string(),
        })?;

        match feed.latest().await? {
            Some(manifest) => self.trigger_update(manifest).await,
            None => Ok(TriggerOutcome::Skipped {
                reason: "feed offered no manifest".to_string(),
                status: self.refresh_status().await?,
            }),
        }
    }

    /// Background check: only triggers when the feed offers something newer
    /// than the active release and than any release rolled back from, and no
    /// retry is already scheduled.
    pub async fn poll_feed(self: &Arc<Self>) -> Result<Option<TriggerOutcome>, UpdateError> {
        let Some(feed) = self.feed.as_ref() else {
            return Ok(None);
        };
        let progress = self.store.load_progress().await?;
        if progress.halted || progress.retry_manifest.is_some() {
            debug!("Skipping feed poll (halted: {})", progress.halted);
            return Ok(None);
        }

        let Some(manifest) = feed.latest().await? else {
            return Ok(None);
        };
        if let Some(rolled_back) = &progress.rolled_back_from {
            if manifest.version <= *rolled_back {
                debug!(
                    "Feed offers {}, which was rolled back from {}",
                    manifest.version, rolled_back
                );
                return Ok(None);
            }
        }
        if let Some(active) = self.store.active_release().await? {
            let newer = manifest.version > active.active_version;
            let downgrade =
                manifest.version < active.active_version && self.config.policy.allow_downgrade;
            if !newer && !downgrade {
                debug!("Feed offers {}, active is {}", manifest.version, active.active_version);
                return Ok(None);
            }
        }
        Ok(Some(self.trigger_update(manifest).await?))
    }

    /// Cancels the running cycle, the queued manifest and any scheduled
    /// retry. A cycle that has started installing is left to finish and does
    /// not count as cancelled.
    pub async fn cancel(&self) -> Result<bool, UpdateError> {
        let mut cancelled = false;
        if let Some(token) = slot(&self.cancel).as_ref() {
            if !token.is_cancelled() {
                token.cancel();
                cancelled = true;
            }
        }
        if slot(&self.pending).take().is_some() {
            cancelled = true;
        }
        if self.cancel_retry() {
            cancelled = true;
        }

        let mut progress = self.store.load_progress().await?;
        if progress.retry_manifest.is_some() {
            progress.clear_retry();
            self.store.save_progress(&progress).await?;
            cancelled = true;
        }

        if cancelled {
            info!("Update work cancelled on request");
        }
        self.refresh_status().await?;
        Ok(cancelled)
    }

    /// Re-points the install path at the previous release.
    #[instrument(skip(self))]
    pub async fn rollback(&self) -> Result<InstalledRelease, UpdateError> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| UpdateError::UpdateInProgress)?;

        let previous = self
            .store
            .previous_release()
            .await?
            .ok_or(UpdateError::NoRollbackAvailable)?;
        let present = tokio::fs::metadata(&previous.release_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !present {
            warn!("Previous release {} is gone from disk", previous.release_dir.display());
            return Err(UpdateError::NoRollbackAvailable);
        }

        let from = self.store.active_release().await?.map(|r| r.active_version);

        if let Err(e) = self.installer.activate(&previous).await {
            if e.is_indeterminate() {
                self.halt(e.to_string()).await?;
            }
            self.refresh_status().await?;
            return Err(e);
        }
        self.store.set_active(&previous.release_id).await?;

        let version = previous.active_version.as_str();
        let record = UpdateRecord::new(None, version, UpdateOutcome::RolledBack)
            .with_message(format!(
                "rolled back from {}",
                from.as_ref().map(Version::as_str).unwrap_or("none")
            ));
        self.store.append_record(&record).await?;
        self.metrics.record_rollback();
        TracingService::log_rollback(from.as_ref().map(Version::as_str), &previous);

        self.cancel_retry();
        slot(&self.pending).take();
        let mut progress = self.store.load_progress().await?;
        progress.clear_retry();
        if from.is_some() {
            progress.rolled_back_from = from;
        }
        if progress.halted {
            info!("Rollback restored a usable pointer; clearing halt");
            progress.halted = false;
            progress.halt_reason = None;
        }
        self.store.save_progress(&progress).await?;
        self.refresh_status().await?;
        Ok(previous)
    }

    /// Clears a halt once the install pointer resolves to a release again.
    pub async fn resume(&self) -> Result<UpdateStatus, UpdateError> {
        let _guard = self.cycle_lock.lock().await;
        let mut progress = self.store.load_progress().await?;
        if !progress.halted {
            return self.refresh_status().await;
        }

        let install_path = &self.config.install.install_path;
        match AtomicInstaller::inspect(install_path)? {
            PointerState::Release(target) => {
                if !self.reconcile_release(&target).await? {
                    warn!(
                        "Resuming with {} pointing at untracked tree {}",
                        install_path.display(),
                        target.display()
                    );
                }
                progress = self.store.load_progress().await?;
                progress.halted = false;
                progress.halt_reason = None;
                self.store.save_progress(&progress).await?;
                info!("Automatic updates resumed");
                self.refresh_status().await
            }
            other => Err(UpdateError::Halted {
                reason: format!("install pointer is still unusable: {other:?}"),
            }),
        }
    }

    pub async fn history(&self, limit: u32) -> Result<Vec<UpdateRecord>, UpdateError> {
        self.store.history(limit.clamp(1, 1000)).await
    }

    /// Startup pass: records interrupted cycles, clears staging, reconciles the
    /// store with the pointer on disk and re-arms a persisted retry.
    #[instrument(skip(self))]
    pub async fn recover(self: &Arc<Self>) -> Result<UpdateStatus, UpdateError> {
        {
            let _guard = self.cycle_lock.lock().await;
            let mut progress = self.store.load_progress().await?;

            if progress.state.is_in_flight() {
                let version = progress
                    .target_version
                    .as_ref()
                    .map(|v| v.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(
                    "Cycle {} for {} was interrupted while {}",
                    progress.cycle_id.as_deref().unwrap_or("-"),
                    version,
                    progress.state.as_str()
                );
                if let Some(path) = &progress.staging_path {
                    remove_dir(path).await;
                }
                let cycle_id = progress.cycle_id.clone();
                let record = UpdateRecord::new(cycle_id, version, UpdateOutcome::Interrupted)
                    .with_message(format!("process stopped while {}", progress.state.as_str()));
                self.store.append_record(&record).await?;
                progress.clear_cycle();
                self.store.save_progress(&progress).await?;
            } else if progress.state != UpdateState::Idle {
                progress.clear_cycle();
                self.store.save_progress(&progress).await?;
            }

            self.clear_staging().await?;
            self.reconcile_pointer().await?;
        }

        let progress = self.store.load_progress().await?;
        if !progress.halted {
            if let Some(manifest) = progress.retry_manifest {
                let delay = progress
                    .next_retry_at
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                info!("Re-arming retry of {} in {}ms", manifest.version, delay.as_millis());
                self.schedule_retry(manifest, delay);
            }
        }
        self.refresh_status().await
    }

    /// Stops the in-memory retry timer; a persisted retry survives restart.
    pub fn shutdown(&self) {
        self.cancel_retry();
        if let Some(token) = slot(&self.cancel).as_ref() {
            token.cancel();
        }
    }

    async fn when_busy(&self, manifest: UpdateManifest) -> Result<TriggerOutcome, UpdateError> {
        match self.config.policy.on_busy {
            BusyPolicy::Reject => {
                debug!("Rejecting {}: a cycle is running", manifest.version);
                Ok(TriggerOutcome::AlreadyRunning {
                    status: self.refresh_status().await?,
                })
            }
            BusyPolicy::Queue => {
                let version = manifest.version.clone();
                let replaced = slot(&self.pending).replace(manifest);
                match replaced {
                    Some(old) => info!("Queued {} in place of {}", version, old.version),
                    None => info!("Queued {} behind the running cycle", version),
                }
                Ok(TriggerOutcome::Queued {
                    status: self.refresh_status().await?,
                })
            }
        }
    }

    async fn precheck(&self, manifest: &UpdateManifest) -> Result<Option<Precheck>, UpdateError> {
        let Some(active) = self.store.active_release().await? else {
            return Ok(None);
        };

        if manifest.version == active.active_version {
            info!("{} is already installed", manifest.version);
            let record =
                UpdateRecord::new(None, manifest.version.as_str(), UpdateOutcome::AlreadyCurrent);
            self.store.append_record(&record).await?;
            return Ok(Some(Precheck::AlreadyCurrent));
        }

        if manifest.version < active.active_version && !self.config.policy.allow_downgrade {
            let reason = format!(
                "{} is older than active release {} and downgrades are disabled",
                manifest.version, active.active_version
            );
            info!("Skipping update: {}", reason);
            let record = UpdateRecord::new(None, manifest.version.as_str(), UpdateOutcome::Skipped)
                .with_message(reason.clone());
            self.store.append_record(&record).await?;
            return Ok(Some(Precheck::Skipped(reason)));
        }
        Ok(None)
    }

    async fn begin(
        &self,
        cycle_id: &str,
        manifest: &UpdateManifest,
    ) -> Result<CancellationToken, UpdateError> {
        let token = CancellationToken::new();
        *slot(&self.cancel) = Some(token.clone());
        self.cancel_retry();

        let mut progress = self.store.load_progress().await?;
        let from = progress.state;
        progress.state = UpdateState::Fetching;
        progress.cycle_id = Some(cycle_id.to_string());
        progress.staging_path = Some(self.cycle_dir(cycle_id));
        progress.target_version = Some(manifest.version.clone());
        progress.clear_retry();
        self.store.save_progress(&progress).await?;

        self.metrics.record_cycle_started();
        TracingService::log_cycle_started(cycle_id, manifest);
        self.refresh_status().await?;
        self.notify(cycle_id, from, UpdateState::Fetching);
        Ok(token)
    }

    async fn run_locked(
        self: Arc<Self>,
        guard: OwnedMutexGuard<()>,
        cycle_id: String,
        manifest: UpdateManifest,
        token: CancellationToken,
    ) -> Result<CycleReport, UpdateError> {
        let started = Instant::now();
        let result = self.run_cycle(&cycle_id, &manifest, &token).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_cycle_duration(duration_ms as f64);

        let report = match result {
            Ok((release, bytes_downloaded)) => {
                if let Err(e) = self.on_success(&cycle_id, &manifest, &release, duration_ms).await {
                    error!("Failed to record install of cycle {}: {}", cycle_id, e);
                    self.settle(&cycle_id).await;
                }
                Ok(CycleReport {
                    cycle_id: cycle_id.clone(),
                    version: manifest.version.clone(),
                    outcome: UpdateOutcome::Installed,
                    release: Some(release),
                    bytes_downloaded,
                    duration_ms,
                })
            }
            Err(err) => {
                if let Err(e) = self.on_failure(&cycle_id, &manifest, &err).await {
                    error!("Failed to record failure of cycle {}: {}", cycle_id, e);
                }
                Err(err)
            }
        };

        *slot(&self.cancel) = None;
        drop(guard);
        tokio::spawn(Arc::clone(&self).drain_pending());
        report
    }

    async fn run_cycle(
        &self,
        cycle_id: &str,
        manifest: &UpdateManifest,
        token: &CancellationToken,
    ) -> Result<(InstalledRelease, u64), UpdateError> {
        let cycle_dir = self.cycle_dir(cycle_id);
        let result = self.run_phases(cycle_id, manifest, token, &cycle_dir).await;
        remove_dir(&cycle_dir).await;
        result
    }

    async fn run_phases(
        &self,
        cycle_id: &str,
        manifest: &UpdateManifest,
        token: &CancellationToken,
        cycle_dir: &Path,
    ) -> Result<(InstalledRelease, u64), UpdateError> {
        let timeout_ms = self.config.policy.cycle_timeout_ms;
        let prepare = self.prepare(cycle_id, manifest, token, cycle_dir);
        tokio::pin!(prepare);
        let (staged, bytes_downloaded) = tokio::select! {
            biased;
            result = &mut prepare => result?,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                token.cancel();
                // Blocking workers stop at their next checkpoint; the cycle
                // directory is removed only after they have.
                if let Err(e) = prepare.await {
                    debug!("Cycle {} wound down after timeout: {}", cycle_id, e);
                }
                return Err(UpdateError::CycleTimedOut { timeout_ms });
            }
        };
        // Past this point the cycle runs to completion; cancel() can no longer reach it.
        slot(&self.cancel).take();
        if token.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        self.transition(cycle_id, UpdateState::Installing).await?;
        let release = self
            .installer
            .install(&staged, &self.config.install.install_path)
            .await?;
        if let Err(e) = self.store.promote_release(&release, &staged.tree_checksum).await {
            error!(
                "Installed {} but could not record it; recovery will reconcile from disk: {}",
                release.release_id, e
            );
        }
        Ok((release, bytes_downloaded))
    }

    async fn prepare(
        &self,
        cycle_id: &str,
        manifest: &UpdateManifest,
        token: &CancellationToken,
        cycle_dir: &Path,
    ) -> Result<(StagingArtifact, u64), UpdateError> {
        tokio::fs::create_dir_all(cycle_dir)
            .await
            .map_err(|e| UpdateError::io(cycle_dir, e))?;

        let archive_path = cycle_dir.join(format!("artifact.{}", manifest.archive_format));
        let fetched = self.fetcher.fetch(&manifest.source_url, &archive_path, token).await?;
        self.metrics.record_bytes_downloaded(fetched.bytes_written);

        self.transition(cycle_id, UpdateState::VerifyingRaw).await?;
        let raw = IntegrityVerifier::check(&archive_path, &manifest.expected_checksum).await?;
        if !raw.matches {
            return Err(UpdateError::ChecksumMismatch {
                stage: VerifyStage::Raw,
                expected: normalize_checksum(&manifest.expected_checksum)
                    .unwrap_or_else(|_| manifest.expected_checksum.clone()),
                actual: raw.actual,
            });
        }
        if token.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        self.transition(cycle_id, UpdateState::Extracting).await?;
        let staged = self
            .extractor
            .extract(&archive_path, &cycle_dir.join("tree"), manifest, token)
            .await?;
        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            debug!("Could not remove {}: {}", archive_path.display(), e);
        }

        self.transition(cycle_id, UpdateState::VerifyingExtracted).await?;
        let expected = manifest
            .tree_checksum
            .clone()
            .unwrap_or_else(|| staged.tree_checksum.clone());
        let tree = IntegrityVerifier::check(&staged.staging_path, &expected).await?;
        if !tree.matches {
            return Err(UpdateError::ChecksumMismatch {
                stage: VerifyStage::Extracted,
                expected: normalize_checksum(&expected).unwrap_or(expected),
                actual: tree.actual,
            });
        }
        Ok((staged, fetched.bytes_written))
    }

    async fn on_success(
        &self,
        cycle_id: &str,
        manifest: &UpdateManifest,
        release: &InstalledRelease,
        duration_ms: u64,
    ) -> Result<(), UpdateError> {
        let version = manifest.version.as_str();
        let outcome = UpdateOutcome::Installed;
        let record = UpdateRecord::new(Some(cycle_id.to_string()), version, outcome);
        self.store.append_record(&record).await?;
        self.metrics.record_install();
        TracingService::log_release_promoted(release);
        TracingService::log_cycle_finished(cycle_id, version, outcome, duration_ms);

        self.cancel_retry();
        let mut progress = self.store.load_progress().await?;
        let from = progress.state;
        progress.clear_cycle();
        progress.clear_retry();
        progress.rolled_back_from = None;
        self.store.save_progress(&progress).await?;
        self.refresh_status().await?;
        self.notify(cycle_id, from, UpdateState::Idle);

        self.prune_releases().await;
        self.refresh_status().await?;
        Ok(())
    }

    async fn on_failure(
        self: &Arc<Self>,
        cycle_id: &str,
        manifest: &UpdateManifest,
        err: &UpdateError,
    ) -> Result<(), UpdateError> {
        let version = manifest.version.as_str();
        self.store
            .append_record(&UpdateRecord::failed(Some(cycle_id.to_string()), version, err))
            .await?;
        self.metrics.record_cycle_failed(err.kind());
        TracingService::log_cycle_failed(cycle_id, version, err);

        self.transition(cycle_id, UpdateState::Failed).await?;

        let mut progress = self.store.load_progress().await?;
        let mut retry_in = None;
        if err.is_indeterminate() {
            let reason = err.to_string();
            TracingService::log_manual_intervention_required(&reason);
            progress.halted = true;
            progress.halt_reason = Some(reason);
        } else if matches!(err, UpdateError::Cancelled) {
            info!("Cycle {} was cancelled; not retrying", cycle_id);
        } else {
            let failures = self.store.consecutive_failures().await?;
            let delay = self.backoff.delay(failures);
            progress.retry_manifest = Some(manifest.clone());
            let delay_ms = delay.as_millis() as i64;
            progress.next_retry_at = Some(Utc::now() + chrono::Duration::milliseconds(delay_ms));
            TracingService::log_retry_scheduled(version, failures, delay.as_millis() as u64);
            retry_in = Some(delay);
        }
        progress.clear_cycle();
        self.store.save_progress(&progress).await?;

        if let Some(delay) = retry_in {
            self.schedule_retry(manifest.clone(), delay);
        }
        self.refresh_status().await?;
        self.notify(cycle_id, UpdateState::Failed, UpdateState::Idle);
        Ok(())
    }

    /// Best effort return to idle after the bookkeeping of a cycle failed.
    async fn settle(&self, cycle_id: &str) {
        let mut progress = match self.store.load_progress().await {
            Ok(progress) => progress,
            Err(e) => {
                warn!("Could not read progress to settle cycle {}: {}", cycle_id, e);
                return;
            }
        };
        let from = progress.state;
        progress.clear_cycle();
        if let Err(e) = self.store.save_progress(&progress).await {
            warn!("Could not settle cycle {}: {}", cycle_id, e);
        }
        if let Err(e) = self.refresh_status().await {
            warn!("Could not refresh status after cycle {}: {}", cycle_id, e);
        }
        self.notify(cycle_id, from, UpdateState::Idle);
    }

    async fn transition(&self, cycle_id: &str, to: UpdateState) -> Result<(), UpdateError> {
        let mut progress = self.store.load_progress().await?;
        let from = progress.state;
        progress.state = to;
        self.store.save_progress(&progress).await?;
        debug!("Cycle {}: {} -> {}", cycle_id, from.as_str(), to.as_str());
        self.refresh_status().await?;
        self.notify(cycle_id, from, to);
        Ok(())
    }

    fn notify(&self, cycle_id: &str, from: UpdateState, to: UpdateState) {
        for observer in &self.observers {
            observer.on_transition(cycle_id, from, to);
        }
    }

    fn schedule_retry(self: &Arc<Self>, manifest: UpdateManifest, delay: Duration) {
        let handle = tokio::spawn(Arc::clone(self).retry_after(manifest, delay));
        if let Some(old) = slot(&self.retry).replace(handle) {
            old.abort();
        }
    }

    fn retry_after(
        self: Arc<Self>,
        manifest: UpdateManifest,
        delay: Duration,
    ) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(delay).await;
            // The handle belongs to this task; drop it so the new cycle does not abort us.
            slot(&self.retry).take();

            match self.store.load_progress().await {
                Ok(progress) if progress.halted => {
                    info!("Retry of {} skipped: updates are halted", manifest.version);
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("Could not read progress before retry: {}", e),
            }

            info!("Retrying update to {}", manifest.version);
            match self.trigger_update(manifest.clone()).await {
                Ok(TriggerOutcome::AlreadyRunning { .. }) => {
                    let mut pending = slot(&self.pending);
                    if pending.is_none() {
                        *pending = Some(manifest);
                    }
                }
                Ok(outcome) => debug!("Retry outcome: {:?}", outcome),
                Err(e) => warn!("Retry of {} could not start: {}", manifest.version, e),
            }
        }
        .boxed()
    }

    fn drain_pending(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let next = slot(&self.pending).take();
            if let Some(manifest) = next {
                info!("Starting queued update to {}", manifest.version);
                if let Err(e) = self.trigger_update(manifest).await {
                    warn!("Queued update could not start: {}", e);
                }
            }
        }
        .boxed()
    }

    fn cancel_retry(&self) -> bool {
        match slot(&self.retry).take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    async fn halt(&self, reason: String) -> Result<(), UpdateError> {
        TracingService::log_manual_intervention_required(&reason);
        self.cancel_retry();
        let mut progress = self.store.load_progress().await?;
        progress.halted = true;
        progress.halt_reason = Some(reason);
        self.store.save_progress(&progress).await
    }

    async fn prune_releases(&self) {
        let mut protect = Vec::new();
        match (self.store.active_release().await, self.store.previous_release().await) {
            (Ok(active), Ok(previous)) => {
                protect.extend(active.map(|r| r.release_dir));
                protect.extend(previous.map(|r| r.release_dir));
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Skipping prune, release slots unreadable: {}", e);
                return;
            }
        }
        let pointer = AtomicInstaller::inspect(&self.config.install.install_path);
        if let Ok(PointerState::Release(target)) = pointer {
            protect.push(target);
        }

        match self.installer.prune(self.config.install.keep_releases, protect).await {
            Ok(removed) => {
                for dir in removed {
                    if let Err(e) = self.store.forget_release(&dir).await {
                        warn!("Pruned {} but could not forget it: {}", dir.display(), e);
                    }
                }
            }
            Err(e) => warn!("Release prune failed: {}", e),
        }
    }

    async fn clear_staging(&self) -> Result<(), UpdateError> {
        let staging = &self.config.install.staging_dir;
        let mut entries = match tokio::fs::read_dir(staging).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(UpdateError::io(staging, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UpdateError::io(staging, e))?
        {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let removed = if is_dir {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => debug!("Removed stale staging entry {}", path.display()),
                Err(e) => warn!("Could not remove stale staging entry {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    async fn reconcile_pointer(&self) -> Result<(), UpdateError> {
        let install_path = &self.config.install.install_path;
        match AtomicInstaller::inspect(install_path)? {
            PointerState::Release(target) => {
                if !self.reconcile_release(&target).await? {
                    self.halt(format!(
                        "{} resolves to untracked tree {}",
                        install_path.display(),
                        target.display()
                    ))
                    .await?;
                }
            }
            PointerState::Missing => {
                if let Some(active) = self.store.active_release().await? {
                    if active.release_dir.is_dir() {
                        warn!(
                            "{} is missing; re-pointing at active release {}",
                            install_path.display(),
                            active.release_id
                        );
                        self.installer.activate(&active).await?;
                    } else {
                        self.halt(format!(
                            "{} is missing and active release {} is gone",
                            install_path.display(),
                            active.release_dir.display()
                        ))
                        .await?;
                    }
                }
            }
            PointerState::Dangling(target) => {
                self.halt(format!(
                    "{} dangles at {}",
                    install_path.display(),
                    target.display()
                ))
                .await?;
            }
            PointerState::PlainDir => match &self.config.install.adopt_version {
                Some(version) => {
                    let release = self
                        .installer
                        .adopt(install_path, &Version::new(version.as_str()))
                        .await?;
                    let checksum = IntegrityVerifier::digest(&release.release_dir).await?;
                    self.store.promote_release(&release, &checksum).await?;
                    TracingService::log_release_promoted(&release);
                }
                None => warn!(
                    "{} is an unmanaged directory; set install.adopt_version to take it over",
                    install_path.display()
                ),
            },
            PointerState::Unexpected => {
                self.halt(format!(
                    "{} is neither a directory nor a symlink",
                    install_path.display()
                ))
                .await?;
            }
        }
        Ok(())
    }

    /// Brings the store in line with a pointer target. `false` if the tree
    /// is neither recorded nor carries release metadata.
    async fn reconcile_release(&self, target: &Path) -> Result<bool, UpdateError> {
        let target = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
        if let Some((release, slot)) = self.store.release_by_dir(&target).await? {
            if slot != liveswap_models::ReleaseSlot::Active {
                info!("Store caught up with pointer: {} is active", release.release_id);
                self.store.set_active(&release.release_id).await?;
            }
            return Ok(true);
        }

        match AtomicInstaller::read_metadata(&target)? {
            Some(meta) => {
                let release = InstalledRelease {
                    release_id: meta.release_id,
                    install_path: self.config.install.install_path.clone(),
                    release_dir: target,
                    active_version: meta.version,
                    installed_at: meta.installed_at,
                };
                info!("Recording release {} found on disk", release.release_id);
                self.store.promote_release(&release, &meta.tree_checksum).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn refresh_status(&self) -> Result<UpdateStatus, UpdateError> {
        let progress = self.store.load_progress().await?;
        let active = self.store.active_release().await?;
        let previous = self.store.previous_release().await?;
        let last_success_at = self.store.last_success_at().await?;
        let last_failure = self.store.last_failure().await?;
        let consecutive_failures = self.store.consecutive_failures().await?;
        let pending_version = slot(&self.pending).as_ref().map(|m| m.version.clone());

        let running_on = match (&active, &previous) {
            (None, _) => RunningOn::None,
            (Some(_), None) => RunningOn::Latest,
            (Some(a), Some(p)) if a.installed_at >= p.installed_at => RunningOn::Latest,
            _ => RunningOn::Previous,
        };

        let status = UpdateStatus {
            state: if progress.halted { UpdateState::Halted } else { progress.state },
            cycle_id: progress.cycle_id,
            target_version: progress.target_version,
            active_version: active.map(|r| r.active_version),
            previous_version: previous.map(|r| r.active_version),
            running_on,
            last_success_at,
            last_failure_at: last_failure.map(|(at, _)| at),
            last_error_kind: last_failure.and_then(|(_, kind)| kind),
            consecutive_failures,
            next_retry_at: progress.next_retry_at,
            pending_version,
            halted: progress.halted,
            halt_reason: progress.halt_reason,
        };
        self.status_tx.send_replace(status.clone());
        Ok(status)
    }

    fn cycle_dir(&self, cycle_id: &str) -> PathBuf {
        self.config.install.staging_dir.join(cycle_id)
    }
}

async fn remove_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

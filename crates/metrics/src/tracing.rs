use liveswap_models::{InstalledRelease, UpdateError, UpdateManifest, UpdateOutcome};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub struct TracingService;

impl TracingService {
    /// JSON logs with RFC 3339 timestamps; `RUST_LOG` overrides the `info` default.
    pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing_subscriber::fmt()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .try_init()?;

        Ok(())
    }

    pub fn log_cycle_started(cycle_id: &str, manifest: &UpdateManifest) {
        info!(
            cycle_id = %cycle_id,
            version = %manifest.version,
            source_url = %manifest.source_url,
            archive_format = %manifest.archive_format,
            "Update cycle started"
        );
    }

    pub fn log_cycle_finished(
        cycle_id: &str,
        version: &str,
        outcome: UpdateOutcome,
        duration_ms: u64,
    ) {
        info!(
            cycle_id = %cycle_id,
            version = %version,
            outcome = %outcome.as_str(),
            duration_ms = duration_ms,
            "Update cycle finished"
        );
    }

    pub fn log_cycle_failed(cycle_id: &str, version: &str, err: &UpdateError) {
        error!(
            cycle_id = %cycle_id,
            version = %version,
            error_kind = %err.kind(),
            error_message = %err,
            "Update cycle failed"
        );
    }

    pub fn log_release_promoted(release: &InstalledRelease) {
        info!(
            release_id = %release.release_id,
            version = %release.active_version,
            release_dir = %release.release_dir.display(),
            install_path = %release.install_path.display(),
            "Release promoted"
        );
    }

    pub fn log_rollback(from: Option<&str>, to: &InstalledRelease) {
        warn!(
            from_version = %from.unwrap_or("none"),
            to_version = %to.active_version,
            release_dir = %to.release_dir.display(),
            "Rolled back to previous release"
        );
    }

    pub fn log_retry_scheduled(version: &str, attempt: u32, delay_ms: u64) {
        warn!(
            version = %version,
            consecutive_failures = attempt,
            delay_ms = delay_ms,
            "Update retry scheduled"
        );
    }

    /// Raised when the install pointer may no longer resolve; automatic updates stop.
    pub fn log_manual_intervention_required(reason: &str) {
        error!(
            alert = "manual_intervention_required",
            reason = %reason,
            "Install pointer state is indeterminate; automatic updates halted"
        );
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, InstalledRelease, UpdateError, UpdateManifest, UpdateOutcome, Version};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Fetching,
    VerifyingRaw,
    Extracting,
    VerifyingExtracted,
    Installing,
    Failed,
    Halted,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Fetching => "fetching",
            UpdateState::VerifyingRaw => "verifying_raw",
            UpdateState::Extracting => "extracting",
            UpdateState::VerifyingExtracted => "verifying_extracted",
            UpdateState::Installing => "installing",
            UpdateState::Failed => "failed",
            UpdateState::Halted => "halted",
        }
    }

    /// States that only exist while a cycle holds the lock.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UpdateState::Fetching
                | UpdateState::VerifyingRaw
                | UpdateState::Extracting
                | UpdateState::VerifyingExtracted
                | UpdateState::Installing
        )
    }
}

impl std::str::FromStr for UpdateState {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(UpdateState::Idle),
            "fetching" => Ok(UpdateState::Fetching),
            "verifying_raw" => Ok(UpdateState::VerifyingRaw),
            "extracting" => Ok(UpdateState::Extracting),
            "verifying_extracted" => Ok(UpdateState::VerifyingExtracted),
            "installing" => Ok(UpdateState::Installing),
            "failed" => Ok(UpdateState::Failed),
            "halted" => Ok(UpdateState::Halted),
            other => Err(UpdateError::Database {
                reason: format!("unknown update state: {other}"),
            }),
        }
    }
}

/// Whether the active tree is the newest installed release or one restored by rollback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunningOn {
    Latest,
    Previous,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateStatus {
    pub state: UpdateState,
    pub cycle_id: Option<String>,
    pub target_version: Option<Version>,
    pub active_version: Option<Version>,
    pub previous_version: Option<Version>,
    pub running_on: RunningOn,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error_kind: Option<ErrorKind>,
    pub consecutive_failures: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub pending_version: Option<Version>,
    pub halted: bool,
    pub halt_reason: Option<String>,
}

/// Result of asking the orchestrator to start a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started { cycle_id: String, status: UpdateStatus },
    AlreadyRunning { status: UpdateStatus },
    Queued { status: UpdateStatus },
    AlreadyCurrent { status: UpdateStatus },
    Skipped { reason: String, status: UpdateStatus },
    Halted { status: UpdateStatus },
}

impl TriggerOutcome {
    pub fn status(&self) -> &UpdateStatus {
        match self {
            TriggerOutcome::Started { status, .. }
            | TriggerOutcome::AlreadyRunning { status }
            | TriggerOutcome::Queued { status }
            | TriggerOutcome::AlreadyCurrent { status }
            | TriggerOutcome::Skipped { status, .. }
            | TriggerOutcome::Halted { status } => status,
        }
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleReport {
    pub cycle_id: String,
    pub version: Version,
    pub outcome: UpdateOutcome,
    pub release: Option<InstalledRelease>,
    pub bytes_downloaded: u64,
    pub duration_ms: u64,
}

/// Body of `POST /admin/update`; without a manifest the configured feed is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerRequest {
    #[serde(default)]
    pub manifest: Option<UpdateManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelResponse {
    pub cancelled: bool,
}

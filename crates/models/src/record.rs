use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, UpdateError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Installed,
    AlreadyCurrent,
    Failed,
    RolledBack,
    Interrupted,
    Skipped,
}

impl UpdateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::Installed => "installed",
            UpdateOutcome::AlreadyCurrent => "already_current",
            UpdateOutcome::Failed => "failed",
            UpdateOutcome::RolledBack => "rolled_back",
            UpdateOutcome::Interrupted => "interrupted",
            UpdateOutcome::Skipped => "skipped",
        }
    }

    /// Outcomes that count towards the retry backoff.
    pub fn is_failure(&self) -> bool {
        matches!(self, UpdateOutcome::Failed | UpdateOutcome::Interrupted)
    }
}

impl std::str::FromStr for UpdateOutcome {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installed" => Ok(UpdateOutcome::Installed),
            "already_current" => Ok(UpdateOutcome::AlreadyCurrent),
            "failed" => Ok(UpdateOutcome::Failed),
            "rolled_back" => Ok(UpdateOutcome::RolledBack),
            "interrupted" => Ok(UpdateOutcome::Interrupted),
            "skipped" => Ok(UpdateOutcome::Skipped),
            other => Err(UpdateError::Database {
                reason: format!("unknown update outcome: {other}"),
            }),
        }
    }
}

/// Append-only history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRecord {
    pub record_id: String,
    pub cycle_id: Option<String>,
    pub version: String,
    pub outcome: UpdateOutcome,
    pub timestamp: DateTime<Utc>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl UpdateRecord {
    pub fn new(
        cycle_id: Option<String>,
        version: impl Into<String>,
        outcome: UpdateOutcome,
    ) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            cycle_id,
            version: version.into(),
            outcome,
            timestamp: Utc::now(),
            error_kind: None,
            error_message: None,
        }
    }

    pub fn failed(
        cycle_id: Option<String>,
        version: impl Into<String>,
        error: &UpdateError,
    ) -> Self {
        Self {
            error_kind: Some(error.kind()),
            error_message: Some(error.to_string()),
            ..Self::new(cycle_id, version, UpdateOutcome::Failed)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub records: Vec<UpdateRecord>,
}

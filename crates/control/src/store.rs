use chrono::{DateTime, Utc};
use liveswap_models::{
    ErrorKind, InstalledRelease, ReleaseSlot, UpdateError, UpdateManifest, UpdateOutcome,
    UpdateRecord, UpdateState, Version,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, instrument};

/// Persisted progress of the updater, one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub state: UpdateState,
    pub cycle_id: Option<String>,
    pub staging_path: Option<PathBuf>,
    pub target_version: Option<Version>,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub retry_manifest: Option<UpdateManifest>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Version an operator rolled back from; feed polls leave it and older
    /// versions alone until a newer install succeeds.
    pub rolled_back_from: Option<Version>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: UpdateState::Idle,
            cycle_id: None,
            staging_path: None,
            target_version: None,
            halted: false,
            halt_reason: None,
            retry_manifest: None,
            next_retry_at: None,
            rolled_back_from: None,
        }
    }
}

impl Progress {
    pub fn clear_cycle(&mut self) {
        self.state = UpdateState::Idle;
        self.cycle_id = None;
        self.staging_path = None;
        self.target_version = None;
    }

    pub fn clear_retry(&mut self) {
        self.retry_manifest = None;
        self.next_retry_at = None;
    }
}

/// SQLite-backed history, release slots and updater progress.
#[derive(Clone)]
pub struct UpdateStore {
    pool: SqlitePool,
}

impl UpdateStore {
    pub async fn open(db_url: &str) -> Result<Self, UpdateError> {
        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::new(pool).await
    }

    pub async fn new(pool: SqlitePool) -> Result<Self, UpdateError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| UpdateError::Database { reason: e.to_string() })?;
        Ok(Self { pool })
    }

    #[instrument(skip(self, record), fields(outcome = record.outcome.as_str()))]
    pub async fn append_record(&self, record: &UpdateRecord) -> Result<(), UpdateError> {
        sqlx::query(
            r#"
            INSERT INTO update_records (
                record_id, cycle_id, version, outcome, error_kind, error_message, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.record_id)
        .bind(&record.cycle_id)
        .bind(&record.version)
        .bind(record.outcome.as_str())
        .bind(record.error_kind.map(|k| k.as_str()))
        .bind(&record.error_message)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn history(&self, limit: u32) -> Result<Vec<UpdateRecord>, UpdateError> {
        let rows = sqlx::query("SELECT * FROM update_records ORDER BY seq DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Failures since the last successful install or already-current check.
    pub async fn consecutive_failures(&self) -> Result<u32, UpdateError> {
        let rows = sqlx::query("SELECT outcome FROM update_records ORDER BY seq DESC")
            .fetch_all(&self.pool)
            .await?;

        let mut failures = 0;
        for row in rows {
            let outcome: UpdateOutcome = row.try_get::<String, _>("outcome")?.parse()?;
            match outcome {
                UpdateOutcome::Installed | UpdateOutcome::AlreadyCurrent => break,
                o if o.is_failure() => failures += 1,
                _ => {}
            }
        }
        Ok(failures)
    }

    pub async fn last_success_at(&self) -> Result<Option<DateTime<Utc>>, UpdateError> {
        let row = sqlx::query(
            r#"
            SELECT recorded_at FROM update_records
            WHERE outcome = 'installed'
            ORDER BY seq DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("recorded_at")?),
            None => None,
        })
    }

    pub async fn last_failure(
        &self,
    ) -> Result<Option<(DateTime<Utc>, Option<ErrorKind>)>, UpdateError> {
        let row = sqlx::query(
            r#"
            SELECT recorded_at, error_kind FROM update_records
            WHERE outcome IN ('failed', 'interrupted')
            ORDER BY seq DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind = match row.try_get::<Option<String>, _>("error_kind")? {
            Some(kind) => Some(kind.parse()?),
            None => None,
        };
        Ok(Some((row.try_get("recorded_at")?, kind)))
    }

    pub async fn active_release(&self) -> Result<Option<InstalledRelease>, UpdateError> {
        self.release_in_slot(ReleaseSlot::Active).await
    }

    pub async fn previous_release(&self) -> Result<Option<InstalledRelease>, UpdateError> {
        self.release_in_slot(ReleaseSlot::Previous).await
    }

    async fn release_in_slot(
        &self,
        slot: ReleaseSlot,
    ) -> Result<Option<InstalledRelease>, UpdateError> {
        let row = sqlx::query("SELECT * FROM releases WHERE slot = ?")
            .bind(slot.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_release).transpose()
    }

    pub async fn release_by_dir(
        &self,
        release_dir: &Path,
    ) -> Result<Option<(InstalledRelease, ReleaseSlot)>, UpdateError> {
        let row = sqlx::query("SELECT * FROM releases WHERE release_dir = ?")
            .bind(release_dir.to_string_lossy().as_ref())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let slot = match row.try_get::<String, _>("slot")?.as_str() {
            "active" => ReleaseSlot::Active,
            "previous" => ReleaseSlot::Previous,
            _ => ReleaseSlot::Retired,
        };
        Ok(Some((row_to_release(&row)?, slot)))
    }

    /// Makes `release` active; the old active becomes previous and the old
    /// previous is retired. One transaction.
    #[instrument(skip(self, release), fields(release_id = %release.release_id))]
    pub async fn promote_release(
        &self,
        release: &InstalledRelease,
        tree_checksum: &str,
    ) -> Result<(), UpdateError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO releases (
                release_id, version, release_dir, install_path, installed_at, slot, tree_checksum
            ) VALUES (?, ?, ?, ?, ?, 'retired', ?)
            "#,
        )
        .bind(&release.release_id)
        .bind(release.active_version.as_str())
        .bind(release.release_dir.to_string_lossy().as_ref())
        .bind(release.install_path.to_string_lossy().as_ref())
        .bind(release.installed_at)
        .bind(tree_checksum)
        .execute(&mut *tx)
        .await?;

        activate_in_tx(&mut tx, &release.release_id).await?;
        tx.commit().await?;

        info!("Promoted release {} ({})", release.release_id, release.active_version);
        Ok(())
    }

    /// Marks an already recorded release active, shifting the others down.
    pub async fn set_active(&self, release_id: &str) -> Result<(), UpdateError> {
        let mut tx = self.pool.begin().await?;
        activate_in_tx(&mut tx, release_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drops a pruned release from the table.
    pub async fn forget_release(&self, release_dir: &Path) -> Result<(), UpdateError> {
        sqlx::query("DELETE FROM releases WHERE release_dir = ? AND slot = 'retired'")
            .bind(release_dir.to_string_lossy().as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_progress(&self) -> Result<Progress, UpdateError> {
        let row = sqlx::query("SELECT * FROM updater_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(Progress::default());
        };

        let retry_manifest = match row.try_get::<Option<String>, _>("retry_manifest")? {
            Some(json) => Some(serde_json::from_str(&json).map_err(|e| UpdateError::Database {
                reason: format!("invalid persisted retry manifest: {e}"),
            })?),
            None => None,
        };

        Ok(Progress {
            state: row.try_get::<String, _>("state")?.parse()?,
            cycle_id: row.try_get("cycle_id")?,
            staging_path: row.try_get::<Option<String>, _>("staging_path")?.map(PathBuf::from),
            target_version: row.try_get::<Option<String>, _>("target_version")?.map(Version::new),
            halted: row.try_get::<i64, _>("halted")? != 0,
            halt_reason: row.try_get("halt_reason")?,
            retry_manifest,
            next_retry_at: row.try_get("next_retry_at")?,
            rolled_back_from: row
                .try_get::<Option<String>, _>("rolled_back_from")?
                .map(Version::new),
        })
    }

    pub async fn save_progress(&self, progress: &Progress) -> Result<(), UpdateError> {
        let retry_manifest = progress
            .retry_manifest
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| UpdateError::Internal { reason: e.to_string() })?;

        sqlx::query(
            r#"
            INSERT INTO updater_state (
                id, state, cycle_id, staging_path, target_version, halted, halt_reason,
                retry_manifest, next_retry_at, rolled_back_from, updated_at
            ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                cycle_id = excluded.cycle_id,
                staging_path = excluded.staging_path,
                target_version = excluded.target_version,
                halted = excluded.halted,
                halt_reason = excluded.halt_reason,
                retry_manifest = excluded.retry_manifest,
                next_retry_at = excluded.next_retry_at,
                rolled_back_from = excluded.rolled_back_from,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(progress.state.as_str())
        .bind(&progress.cycle_id)
        .bind(progress.staging_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .bind(progress.target_version.as_ref().map(|v| v.as_str().to_string()))
        .bind(progress.halted as i64)
        .bind(&progress.halt_reason)
        .bind(retry_manifest)
        .bind(progress.next_retry_at)
        .bind(progress.rolled_back_from.as_ref().map(|v| v.as_str().to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn activate_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    release_id: &str,
) -> Result<(), UpdateError> {
    let current: Option<String> = sqlx::query("SELECT slot FROM releases WHERE release_id = ?")
        .bind(release_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| row.try_get("slot"))
        .transpose()?;

    match current.as_deref() {
        None => {
            return Err(UpdateError::Database {
                reason: format!("unknown release {release_id}"),
            })
        }
        Some("active") => return Ok(()),
        Some(_) => {}
    }

    // Slot order matters: each statement keeps at most one active and one previous row.
    sqlx::query("UPDATE releases SET slot = 'retired' WHERE slot = 'previous' AND release_id != ?")
        .bind(release_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE releases SET slot = 'retired' WHERE release_id = ?")
        .bind(release_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE releases SET slot = 'previous' WHERE slot = 'active'")
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE releases SET slot = 'active' WHERE release_id = ?")
        .bind(release_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn row_to_record(row: &SqliteRow) -> Result<UpdateRecord, UpdateError> {
    let error_kind = match row.try_get::<Option<String>, _>("error_kind")? {
        Some(kind) => Some(kind.parse()?),
        None => None,
    };

    Ok(UpdateRecord {
        record_id: row.try_get("record_id")?,
        cycle_id: row.try_get("cycle_id")?,
        version: row.try_get("version")?,
        outcome: row.try_get::<String, _>("outcome")?.parse()?,
        timestamp: row.try_get("recorded_at")?,
        error_kind,
        error_message: row.try_get("error_message")?,
    })
}

fn row_to_release(row: &SqliteRow) -> Result<InstalledRelease, UpdateError> {
    Ok(InstalledRelease {
        release_id: row.try_get("release_id")?,
        install_path: PathBuf::from(row.try_get::<String, _>("install_path")?),
        release_dir: PathBuf::from(row.try_get::<String, _>("release_dir")?),
        active_version: Version::new(row.try_get::<String, _>("version")?),
        installed_at: row.try_get("installed_at")?,
    })
}

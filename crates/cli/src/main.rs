use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use liveswap_models::{
    ArchiveFormat, CancelResponse, HistoryResponse, InstalledRelease, TriggerOutcome,
    TriggerRequest, UpdateManifest, UpdateStatus, Version,
};
use reqwest::{Client, Response};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "liveswap-cli")]
#[command(about = "Operator CLI for the liveswap admin API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "LIVESWAP_ENDPOINT", default_value = "http://127.0.0.1:8081")]
    endpoint: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the updater status
    Status,
    /// Start an update cycle
    Trigger {
        /// Manifest JSON file; without it (and without --version) the server's feed is used
        #[arg(long, conflicts_with = "version")]
        manifest: Option<PathBuf>,
        /// Release version
        #[arg(long, requires_all = ["url", "checksum"])]
        version: Option<String>,
        /// Artifact URL
        #[arg(long)]
        url: Option<String>,
        /// SHA-256 of the artifact
        #[arg(long)]
        checksum: Option<String>,
        /// Archive format (zip, tar.gz)
        #[arg(long, default_value = "tar.gz")]
        format: String,
    },
    /// Re-activate the previous release
    Rollback,
    /// Cancel the running cycle, queued trigger and scheduled retry
    Cancel,
    /// Clear a halt after manual repair
    Resume,
    /// Show recent update attempts
    History {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::new();
    let endpoint = cli.endpoint.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Status => show_status(&client, &endpoint).await?,
        Commands::Trigger {
            manifest,
            version,
            url,
            checksum,
            format,
        } => {
            let manifest = match (manifest, version) {
                (Some(path), _) => Some(read_manifest(&path)?),
                (None, Some(version)) => Some(UpdateManifest {
                    version: Version::new(version),
                    source_url: url.context("--url is required with --version")?,
                    expected_checksum: checksum.context("--checksum is required with --version")?,
                    archive_format: format.parse::<ArchiveFormat>()?,
                    tree_checksum: None,
                }),
                (None, None) => None,
            };
            trigger(&client, &endpoint, manifest).await?;
        }
        Commands::Rollback => rollback(&client, &endpoint).await?,
        Commands::Cancel => cancel(&client, &endpoint).await?,
        Commands::Resume => resume(&client, &endpoint).await?,
        Commands::History { limit } => history(&client, &endpoint, limit).await?,
    }

    Ok(())
}

fn read_manifest(path: &Path) -> Result<UpdateManifest> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let manifest: UpdateManifest =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(manifest)
}

async fn expect_success(response: Response, action: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response.text().await?;
    error!("{} failed ({}): {}", action, status, error_text);
    bail!("{action} failed ({status}): {error_text}");
}

async fn show_status(client: &Client, endpoint: &str) -> Result<()> {
    let response = client.get(format!("{endpoint}/admin/update/status")).send().await?;
    let status: UpdateStatus = expect_success(response, "Status").await?.json().await?;
    print_status(&status);
    Ok(())
}

fn print_status(status: &UpdateStatus) {
    let version = |v: &Option<Version>| {
        v.as_ref()
            .map(|v| v.as_str().to_string())
            .unwrap_or_else(|| "-".into())
    };
    println!("State:                {}", status.state.as_str());
    println!("Active version:       {}", version(&status.active_version));
    println!("Previous version:     {}", version(&status.previous_version));
    println!("Running on:           {:?}", status.running_on);
    if let Some(target) = &status.target_version {
        println!("Target version:       {target}");
    }
    if let Some(pending) = &status.pending_version {
        println!("Queued version:       {pending}");
    }
    if let Some(at) = status.last_success_at {
        println!("Last success:         {}", at.to_rfc3339());
    }
    if let Some(at) = status.last_failure_at {
        let kind = status.last_error_kind.map(|k| k.as_str()).unwrap_or("-");
        println!("Last failure:         {} ({})", at.to_rfc3339(), kind);
    }
    println!("Consecutive failures: {}", status.consecutive_failures);
    if let Some(at) = status.next_retry_at {
        println!("Next retry:           {}", at.to_rfc3339());
    }
    if status.halted {
        println!(
            "HALTED:               {}",
            status.halt_reason.as_deref().unwrap_or("manual intervention required")
        );
    }
}

async fn trigger(client: &Client, endpoint: &str, manifest: Option<UpdateManifest>) -> Result<()> {
    match &manifest {
        Some(m) => info!("Triggering update to {}", m.version),
        None => info!("Triggering update from feed"),
    }

    let response = client
        .post(format!("{endpoint}/admin/update"))
        .json(&TriggerRequest { manifest })
        .send()
        .await?;
    let outcome: TriggerOutcome = expect_success(response, "Trigger").await?.json().await?;

    match &outcome {
        TriggerOutcome::Started { cycle_id, .. } => println!("Update started (cycle {cycle_id})"),
        TriggerOutcome::AlreadyRunning { .. } => println!("An update is already in progress"),
        TriggerOutcome::Queued { .. } => println!("Update queued behind the running cycle"),
        TriggerOutcome::AlreadyCurrent { .. } => println!("Already running that version"),
        TriggerOutcome::Skipped { reason, .. } => println!("Skipped: {reason}"),
        TriggerOutcome::Halted { .. } => {
            println!("Automatic updates are halted; run `resume` after repair")
        }
    }
    print_status(outcome.status());
    Ok(())
}

async fn rollback(client: &Client, endpoint: &str) -> Result<()> {
    let response = client.post(format!("{endpoint}/admin/update/rollback")).send().await?;
    let release: InstalledRelease = expect_success(response, "Rollback").await?.json().await?;
    println!(
        "Rolled back to {} ({})",
        release.active_version,
        release.release_dir.display()
    );
    Ok(())
}

async fn cancel(client: &Client, endpoint: &str) -> Result<()> {
    let response = client.post(format!("{endpoint}/admin/update/cancel")).send().await?;
    let result: CancelResponse = expect_success(response, "Cancel").await?.json().await?;
    if result.cancelled {
        println!("Cancelled pending update work");
    } else {
        println!("Nothing to cancel");
    }
    Ok(())
}

async fn resume(client: &Client, endpoint: &str) -> Result<()> {
    let response = client.post(format!("{endpoint}/admin/update/resume")).send().await?;
    let status: UpdateStatus = expect_success(response, "Resume").await?.json().await?;
    print_status(&status);
    Ok(())
}

async fn history(client: &Client, endpoint: &str, limit: u32) -> Result<()> {
    let response = client
        .get(format!("{endpoint}/admin/update/history"))
        .query(&[("limit", limit)])
        .send()
        .await?;
    let history: HistoryResponse = expect_success(response, "History").await?.json().await?;

    for record in history.records {
        let detail = match (record.error_kind, &record.error_message) {
            (Some(kind), Some(message)) => format!(" [{}] {}", kind, message),
            (None, Some(message)) => format!(" {message}"),
            _ => String::new(),
        };
        println!(
            "{}  {:<15} {}{}",
            record.timestamp.to_rfc3339(),
            record.outcome.as_str(),
            record.version,
            detail
        );
    }
    Ok(())
}

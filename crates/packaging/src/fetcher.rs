use futures::StreamExt;
use liveswap_models::{FetchConfig, UpdateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    pub bytes_written: u64,
    pub path: PathBuf,
}

/// Streams remote artifacts to local files with size and time bounds.
pub struct ArtifactFetcher {
    client: reqwest::Client,
    max_artifact_bytes: u64,
    read_timeout: Duration,
    protected: Vec<PathBuf>,
}

impl ArtifactFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| UpdateError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            max_artifact_bytes: config.max_artifact_bytes,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            protected: Vec::new(),
        })
    }

    /// Registers a live path the fetcher must never write beneath.
    pub fn protect(mut self, path: impl Into<PathBuf>) -> Self {
        self.protected.push(path.into());
        self
    }

    #[instrument(skip(self, token))]
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        token: &CancellationToken,
    ) -> Result<FetchResult, UpdateError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid_url(url));
        }
        self.check_destination(destination)?;

        let response = self.request(parsed, url, token).await?;
        let file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| UpdateError::io(destination, e))?;

        // Only a file this call created is ours to remove.
        let result = self.write_body(response, file, url, destination, token).await;
        if result.is_err() {
            match tokio::fs::remove_file(destination).await {
                Ok(()) => debug!("Removed partial download {}", destination.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "Failed to remove partial download {}: {}",
                    destination.display(),
                    e
                ),
            }
        }
        result
    }

    async fn request(
        &self,
        parsed: reqwest::Url,
        url: &str,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, UpdateError> {
        let request = self.client.get(parsed).send();
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(UpdateError::Cancelled),
            response = tokio::time::timeout(self.read_timeout, request) => response
                .map_err(|_| network(url, "timed out waiting for response"))?
                .map_err(|e| network(url, &e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if let Some(len) = response.content_length() {
            if len > self.max_artifact_bytes {
                return Err(UpdateError::TooLarge {
                    size: len,
                    max_size: self.max_artifact_bytes,
                });
            }
        }
        Ok(response)
    }

    async fn write_body(
        &self,
        response: reqwest::Response,
        mut file: tokio::fs::File,
        url: &str,
        destination: &Path,
        token: &CancellationToken,
    ) -> Result<FetchResult, UpdateError> {
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(UpdateError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next
                    .map_err(|_| network(url, "read timed out"))?,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| network(url, &e.to_string()))?;

            written += chunk.len() as u64;
            if written > self.max_artifact_bytes {
                return Err(UpdateError::TooLarge {
                    size: written,
                    max_size: self.max_artifact_bytes,
                });
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| UpdateError::io(destination, e))?;
        }

        file.flush().await.map_err(|e| UpdateError::io(destination, e))?;
        file.sync_all().await.map_err(|e| UpdateError::io(destination, e))?;

        info!("Downloaded {} bytes from {} to {}", written, url, destination.display());
        Ok(FetchResult {
            bytes_written: written,
            path: destination.to_path_buf(),
        })
    }

    fn check_destination(&self, destination: &Path) -> Result<(), UpdateError> {
        let resolved = resolve_for_comparison(destination);
        for live in &self.protected {
            let live = resolve_for_comparison(live);
            if resolved.starts_with(&live) {
                return Err(UpdateError::InvalidRequest {
                    reason: format!(
                        "download destination {} lies inside live path {}",
                        destination.display(),
                        live.display()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Canonicalizes the longest existing prefix of `path`, keeping the rest as is.
fn resolve_for_comparison(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return rest.iter().rev().fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn invalid_url(url: &str) -> UpdateError {
    network(url, "invalid url")
}

fn network(url: &str, reason: &str) -> UpdateError {
    UpdateError::Network {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

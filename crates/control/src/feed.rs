use async_trait::async_trait;
use liveswap_models::{FetchConfig, UpdateError, UpdateManifest};
use reqwest::{Client, StatusCode};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument};

/// Where the orchestrator learns about newer releases.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// `Ok(None)` when the feed has nothing to offer right now.
    async fn latest(&self) -> Result<Option<UpdateManifest>, UpdateError>;
}

/// Fetches a JSON manifest from a fixed URL.
pub struct HttpManifestSource {
    client: Client,
    url: String,
}

impl HttpManifestSource {
    pub fn new(url: impl Into<String>, config: &FetchConfig) -> Result<Self, UpdateError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| UpdateError::Internal {
                reason: format!("failed to build feed client: {e}"),
            })?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn latest(&self) -> Result<Option<UpdateManifest>, UpdateError> {
        let network = |e: reqwest::Error| UpdateError::Network {
            url: self.url.clone(),
            reason: e.to_string(),
        };

        let response = self.client.get(&self.url).send().await.map_err(network)?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                debug!("Feed has no manifest");
                return Ok(None);
            }
            status if !status.is_success() => {
                return Err(UpdateError::HttpStatus {
                    url: self.url.clone(),
                    status: status.as_u16(),
                })
            }
            _ => {}
        }

        let body = response.bytes().await.map_err(network)?;
        let manifest: UpdateManifest =
            serde_json::from_slice(&body).map_err(|e| UpdateError::InvalidRequest {
                reason: format!("feed returned an invalid manifest: {e}"),
            })?;
        manifest.validate()?;
        Ok(Some(manifest))
    }
}

/// A feed whose offer is set in-process.
#[derive(Default)]
pub struct StaticManifestSource {
    slot: Mutex<Option<UpdateManifest>>,
}

impl StaticManifestSource {
    pub fn new(manifest: Option<UpdateManifest>) -> Self {
        Self {
            slot: Mutex::new(manifest),
        }
    }

    pub fn set(&self, manifest: Option<UpdateManifest>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = manifest;
        }
    }
}

#[async_trait]
impl ManifestSource for StaticManifestSource {
    async fn latest(&self) -> Result<Option<UpdateManifest>, UpdateError> {
        self.slot
            .lock()
            .map(|slot| slot.clone())
            .map_err(|_| UpdateError::Internal {
                reason: "manifest slot poisoned".to_string(),
            })
    }
}

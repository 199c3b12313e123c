use anyhow::Result;
use liveswap_models::{
    CancelResponse, ErrorShape, HistoryResponse, InstalledRelease, TriggerOutcome, TriggerRequest,
    UpdateManifest, UpdateStatus,
};
use reqwest::{Client, Response};
use std::time::Duration;

/// Thin client for the admin API, used by end-to-end tests.
pub struct AdminClient {
    client: Client,
    base_url: String,
}

/// Either the decoded body or the API's error shape with its status code.
#[derive(Debug)]
pub enum ApiResult<T> {
    Ok(T),
    Err(u16, ErrorShape),
}

impl<T> ApiResult<T> {
    pub fn unwrap_ok(self) -> T {
        match self {
            ApiResult::Ok(value) => value,
            ApiResult::Err(status, shape) => panic!("expected success, got {status}: {shape:?}"),
        }
    }

    pub fn unwrap_err(self) -> (u16, ErrorShape) {
        match self {
            ApiResult::Ok(_) => panic!("expected an error response"),
            ApiResult::Err(status, shape) => (status, shape),
        }
    }
}

impl AdminClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    pub async fn health(&self) -> Result<String> {
        let response = self
            .client
            .get(&format!("{}/healthz", self.base_url))
            .send()
            .await?;
        Ok(response.text().await?)
    }

    pub async fn status(&self) -> Result<UpdateStatus> {
        let response = self
            .client
            .get(&format!("{}/admin/update/status", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            anyhow::bail!("Get status failed: {}", error_text);
        }

        Ok(response.json().await?)
    }

    pub async fn trigger(
        &self,
        manifest: Option<UpdateManifest>,
    ) -> Result<ApiResult<TriggerOutcome>> {
        let response = self
            .client
            .post(&format!("{}/admin/update", self.base_url))
            .json(&TriggerRequest { manifest })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn rollback(&self) -> Result<ApiResult<InstalledRelease>> {
        let response = self
            .client
            .post(&format!("{}/admin/update/rollback", self.base_url))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn cancel(&self) -> Result<CancelResponse> {
        let response = self
            .client
            .post(&format!("{}/admin/update/cancel", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            anyhow::bail!("Cancel failed: {}", error_text);
        }

        Ok(response.json().await?)
    }

    pub async fn resume(&self) -> Result<ApiResult<UpdateStatus>> {
        let response = self
            .client
            .post(&format!("{}/admin/update/resume", self.base_url))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn history(&self, limit: u32) -> Result<HistoryResponse> {
        let response = self
            .client
            .get(&format!("{}/admin/update/history?limit={}", self.base_url, limit))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            anyhow::bail!("Get history failed: {}", error_text);
        }

        Ok(response.json().await?)
    }

    pub async fn metrics(&self) -> Result<String> {
        let response = self
            .client
            .get(&format!("{}/metrics", self.base_url))
            .send()
            .await?;
        Ok(response.text().await?)
    }

    /// Polls status until no cycle is in flight.
    pub async fn wait_for_settled(&self, timeout: Duration) -> Result<UpdateStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            if !status.state.is_in_flight() && status.pending_version.is_none() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("update still in flight after {:?}: {:?}", timeout, status.state);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<ApiResult<T>> {
    let status = response.status();
    if status.is_success() {
        Ok(ApiResult::Ok(response.json().await?))
    } else {
        Ok(ApiResult::Err(status.as_u16(), response.json().await?))
    }
}

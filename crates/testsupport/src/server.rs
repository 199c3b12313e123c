use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
struct Shared {
    artifacts: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

/// In-process HTTP server that hands out artifacts and feed documents.
pub struct ArtifactServer {
    addr: SocketAddr,
    shared: Shared,
    handle: JoinHandle<()>,
}

impl ArtifactServer {
    pub async fn start() -> Self {
        let shared = Shared::default();
        let app = Router::new()
            .route("/artifacts/:name", get(serve_artifact))
            .route("/delayed/:ms/:name", get(serve_delayed))
            .route("/slow/:ms", get(serve_slow))
            .route("/status/:code", get(serve_status))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, shared, handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn put(&self, name: &str, bytes: Vec<u8>) {
        self.shared.artifacts.lock().unwrap().insert(name.to_string(), bytes);
    }

    pub fn put_json<T: serde::Serialize>(&self, name: &str, value: &T) {
        self.put(name, serde_json::to_vec(value).unwrap());
    }

    pub fn url(&self, name: &str) -> String {
        format!("{}/artifacts/{}", self.base_url(), name)
    }

    /// A URL whose response headers arrive only after `delay`.
    pub fn slow_url(&self, delay: Duration) -> String {
        format!("{}/slow/{}", self.base_url(), delay.as_millis())
    }

    /// Same artifact as [`Self::url`], held back for `delay` first.
    pub fn delayed_url(&self, name: &str, delay: Duration) -> String {
        format!("{}/delayed/{}/{}", self.base_url(), delay.as_millis(), name)
    }

    pub fn status_url(&self, code: u16) -> String {
        format!("{}/status/{}", self.base_url(), code)
    }

    /// Requests seen for `name`, successful or not.
    pub fn hits(&self, name: &str) -> usize {
        self.shared.hits.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

impl Drop for ArtifactServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_artifact(
    State(shared): State<Shared>,
    Path(name): Path<String>,
) -> Result<Vec<u8>, StatusCode> {
    *shared.hits.lock().unwrap().entry(name.clone()).or_insert(0) += 1;
    shared
        .artifacts
        .lock()
        .unwrap()
        .get(&name)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

async fn serve_delayed(
    State(shared): State<Shared>,
    Path((ms, name)): Path<(u64, String)>,
) -> Result<Vec<u8>, StatusCode> {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    serve_artifact(State(shared), Path(name)).await
}

async fn serve_slow(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "late"
}

async fn serve_status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub mod config;

// Re-export commonly used items for convenience
pub use config::{config_figment, load_config, CONFIG_SEARCH_PATHS, ENV_PREFIX};
pub use liveswap_api::{serve, start_server, AppState};
pub use liveswap_control::{FeedPoller, HttpManifestSource, UpdateOrchestrator, UpdateStore};
pub use liveswap_metrics::{MetricsService, TracingService};
pub use liveswap_models::Config;
pub use liveswap_packaging::{ArchiveExtractor, ArtifactFetcher, AtomicInstaller, IntegrityVerifier};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::orchestrator::UpdateOrchestrator;

/// Periodically asks the manifest feed for a newer release.
pub struct FeedPoller {
    orchestrator: Arc<UpdateOrchestrator>,
    interval: Duration,
}

impl FeedPoller {
    pub fn new(orchestrator: Arc<UpdateOrchestrator>, interval: Duration) -> Self {
        Self { orchestrator, interval }
    }

    #[instrument(skip(self))]
    pub async fn start(&self) {
        info!("Starting feed poller every {}s", self.interval.as_secs());

        let mut interval = interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup checks are configured separately.
        interval.tick().await;

        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }

    pub async fn poll_once(&self) {
        match self.orchestrator.poll_feed().await {
            Ok(Some(outcome)) => info!("Feed poll triggered update: {:?}", outcome),
            Ok(None) => debug!("Feed poll found nothing to do"),
            Err(e) => warn!("Feed poll failed: {}", e),
        }
    }
}

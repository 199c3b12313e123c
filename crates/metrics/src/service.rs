use liveswap_models::{ErrorKind, UpdateError};
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

pub struct MetricsService {
    registry: Registry,
    cycles_total: Counter,
    cycle_failures_total: CounterVec,
    installs_total: Counter,
    rollbacks_total: Counter,
    bytes_downloaded_total: Counter,
    cycle_duration_ms: Histogram,
}

fn internal(e: impl std::fmt::Display) -> UpdateError {
    UpdateError::Internal { reason: e.to_string() }
}

impl MetricsService {
    pub fn new() -> Result<Self, UpdateError> {
        let registry = Registry::new();

        let cycles_total = Counter::new(
            "liveswap_cycles_total",
            "Total number of update cycles started",
        )
        .map_err(internal)?;

        let cycle_failures_total = CounterVec::new(
            Opts::new("liveswap_cycle_failures_total", "Total number of failed update cycles"),
            &["kind"],
        )
        .map_err(internal)?;

        let installs_total = Counter::new(
            "liveswap_installs_total",
            "Total number of releases installed",
        )
        .map_err(internal)?;

        let rollbacks_total = Counter::new(
            "liveswap_rollbacks_total",
            "Total number of rollbacks performed",
        )
        .map_err(internal)?;

        let bytes_downloaded_total = Counter::new(
            "liveswap_bytes_downloaded_total",
            "Total artifact bytes downloaded",
        )
        .map_err(internal)?;

        let cycle_duration_ms = Histogram::with_opts(
            HistogramOpts::new(
                "liveswap_cycle_duration_ms",
                "Update cycle duration in milliseconds",
            )
            .buckets(vec![
                100.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 60_000.0, 300_000.0, 1_800_000.0,
            ]),
        )
        .map_err(internal)?;

        registry.register(Box::new(cycles_total.clone())).map_err(internal)?;
        registry.register(Box::new(cycle_failures_total.clone())).map_err(internal)?;
        registry.register(Box::new(installs_total.clone())).map_err(internal)?;
        registry.register(Box::new(rollbacks_total.clone())).map_err(internal)?;
        registry.register(Box::new(bytes_downloaded_total.clone())).map_err(internal)?;
        registry.register(Box::new(cycle_duration_ms.clone())).map_err(internal)?;

        Ok(Self {
            registry,
            cycles_total,
            cycle_failures_total,
            installs_total,
            rollbacks_total,
            bytes_downloaded_total,
            cycle_duration_ms,
        })
    }

    pub fn record_cycle_started(&self) {
        self.cycles_total.inc();
    }

    pub fn record_cycle_failed(&self, kind: ErrorKind) {
        self.cycle_failures_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_install(&self) {
        self.installs_total.inc();
    }

    pub fn record_rollback(&self) {
        self.rollbacks_total.inc();
    }

    pub fn record_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded_total.inc_by(bytes as f64);
    }

    pub fn record_cycle_duration(&self, duration_ms: f64) {
        self.cycle_duration_ms.observe(duration_ms);
    }

    pub fn get_prometheus_metrics(&self) -> Result<String, UpdateError> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();

        encoder.encode(&metric_families, &mut buffer).map_err(internal)?;

        String::from_utf8(buffer).map_err(internal)
    }
}

//! Logging/tracing initialization and the process-wide metrics registry.
//!
//! Grounded on the teacher's startup telemetry wiring: `tracing-subscriber`
//! with an `EnvFilter` plus a JSON formatter in production, pretty in dev.
//! Metrics are exposed through a small [`Metrics`] struct backed by
//! `prometheus`, read by the Monitor loop (C12) and `/system/status`.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Initialize global tracing. `json` selects the structured formatter used
/// in production deployments; pretty-printing is used otherwise.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter);
    if json {
        builder.json().with_current_span(true).init();
    } else {
        builder.init();
    }
}

/// Process-wide Prometheus metrics, shared via the [`crate::runtime::Runtime`].
pub struct Metrics {
    pub registry: Registry,
    pub jobs_submitted: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_failed: IntCounter,
    pub jobs_stopped: IntCounter,
    pub jobs_running: IntGauge,
    pub storage_queue_depth: IntGauge,
    pub storage_records_stored: IntCounter,
    pub storage_records_rejected: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub keypool_no_key_available: IntCounter,
    pub alerts_active: IntGauge,
    pub ttl_records_reclaimed: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        macro_rules! counter {
            ($name:expr, $help:expr) => {{
                let c = IntCounter::new($name, $help).expect("valid metric");
                registry.register(Box::new(c.clone())).expect("register");
                c
            }};
        }
        macro_rules! gauge {
            ($name:expr, $help:expr) => {{
                let g = IntGauge::new($name, $help).expect("valid metric");
                registry.register(Box::new(g.clone())).expect("register");
                g
            }};
        }

        Self {
            jobs_submitted: counter!("jobs_submitted_total", "Jobs submitted"),
            jobs_completed: counter!("jobs_completed_total", "Jobs completed"),
            jobs_failed: counter!("jobs_failed_total", "Jobs failed"),
            jobs_stopped: counter!("jobs_stopped_total", "Jobs stopped"),
            jobs_running: gauge!("jobs_running", "Jobs currently running"),
            storage_queue_depth: gauge!("storage_queue_depth", "Async storage queue depth"),
            storage_records_stored: counter!("storage_records_stored_total", "Records stored"),
            storage_records_rejected: counter!(
                "storage_records_rejected_total",
                "Records rejected by policy"
            ),
            cache_hits: counter!("cache_hits_total", "Cache hits"),
            cache_misses: counter!("cache_misses_total", "Cache misses"),
            keypool_no_key_available: counter!(
                "keypool_no_key_available_total",
                "NoKeyAvailable occurrences"
            ),
            alerts_active: gauge!("alerts_active", "Currently active alerts"),
            ttl_records_reclaimed: counter!("ttl_records_reclaimed_total", "Records reclaimed by TTL cleanup"),
            registry,
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buf).expect("encode");
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

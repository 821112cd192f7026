// Prometheus metrics for the ratekeeper coordinator
//
// Exposed on the status server's /metrics endpoint:
// - Token grants, denials and queue wait times (per operation)
// - Queue depth (gauge)
// - Circuit breaker state and fail-fast rejections
// - Upstream retries
// - Quota reservations
// - Store backend errors

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use std::sync::{Arc, Once};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Limiter metrics
    pub static ref TOKENS_GRANTED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratekeeper_tokens_granted_total", "Tokens granted to callers"),
        &["operation", "path"]
    ).expect("Failed to create tokens granted metric");

    pub static ref ACQUIRE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratekeeper_acquire_failures_total", "Acquire calls that returned an error"),
        &["operation", "reason"]
    ).expect("Failed to create acquire failures metric");

    pub static ref QUEUE_WAIT_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("ratekeeper_queue_wait_seconds", "Time queued callers waited for a grant"),
        &["operation"]
    ).expect("Failed to create queue wait metric");

    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("ratekeeper_queue_depth", "Callers currently queued per operation"),
        &["operation"]
    ).expect("Failed to create queue depth metric");

    // Breaker metrics
    pub static ref CIRCUIT_STATE: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("ratekeeper_circuit_state", "Breaker state (0 closed, 1 half-open, 2 open)"),
        &["circuit"]
    ).expect("Failed to create circuit state metric");

    pub static ref CIRCUIT_REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratekeeper_circuit_rejections_total", "Calls rejected by an open circuit"),
        &["circuit"]
    ).expect("Failed to create circuit rejections metric");

    // Retry metrics
    pub static ref RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratekeeper_retries_total", "Retries after upstream rate limiting"),
        &["operation"]
    ).expect("Failed to create retries metric");

    // Quota metrics
    pub static ref QUOTA_RESERVATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratekeeper_quota_reservations_total", "Persistent quota reservations"),
        &["owner", "result"]
    ).expect("Failed to create quota reservations metric");

    // Store metrics
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratekeeper_store_errors_total", "Store backend failures"),
        &["backend", "policy"]
    ).expect("Failed to create store errors metric");
}

static INIT: Once = Once::new();

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init() -> prometheus::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = register_all();
    });
    result
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(TOKENS_GRANTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACQUIRE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(CIRCUIT_STATE.clone()))?;
    REGISTRY.register(Box::new(CIRCUIT_REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_RESERVATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_ERRORS_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

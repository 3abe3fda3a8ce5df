//! Metrics collection module for the key-value service
//!
//! Prometheus collectors for the proposal path, the apply path, and the
//! ingress handlers, exposed through the management endpoint.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Proposals by outcome (committed / rejected / timeout)
    pub static ref PROPOSAL_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("proposal_total", "proposals by outcome"),
        &["outcome"]
    )
    .unwrap();

    /// Applied commands by kind (set / delete / invalid / malformed)
    pub static ref APPLY_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("apply_total", "applied log entries by command kind"),
        &["op"]
    )
    .unwrap();

    /// Ingress request counter by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Ingress request latency by method
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();
}

/// Registers all collectors with the global registry. Double registration
/// is ignored, so restarting an embedded server in tests is harmless.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSAL_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLY_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
}

/// Counts and times one ingress request around `handler`.
pub async fn record_metrics<F, Fut, T>(method_name: &'static str, handler: F) -> T
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = T> + Send,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}

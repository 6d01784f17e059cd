//! Prometheus Metrics Module
//!
//! Presence counters and gauges exposed on `/metrics` for scraping.

use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Once;

use lazy_static::lazy_static;

static METRICS_REGISTERED: Once = Once::new();

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Heartbeats accepted (rate-limited ones excluded)
    pub static ref HEARTBEATS_TOTAL: Counter = Counter::with_opts(
        Opts::new("presenced_heartbeats_total", "Heartbeats accepted")
    ).expect("Failed to create heartbeats_total metric");

    /// Status transitions published, by resulting status
    pub static ref TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("presenced_transitions_total", "Status transitions published"),
        &["status"]
    ).expect("Failed to create transitions_total metric");

    /// Users confirmed offline by the reaper
    pub static ref REAPED_TOTAL: Counter = Counter::with_opts(
        Opts::new("presenced_reaped_total", "Expired users confirmed offline")
    ).expect("Failed to create reaped_total metric");

    /// Bus publishes that failed and were dropped
    pub static ref PUBLISH_FAILURES_TOTAL: Counter = Counter::with_opts(
        Opts::new("presenced_publish_failures_total", "Dropped bus publishes")
    ).expect("Failed to create publish_failures_total metric");

    /// Currently connected presence sockets
    pub static ref ACTIVE_SESSIONS: Gauge = Gauge::with_opts(
        Opts::new("presenced_active_sessions", "Connected presence sockets")
    ).expect("Failed to create active_sessions metric");

    /// Live topic subscriptions across all sockets
    pub static ref ACTIVE_SUBSCRIPTIONS: Gauge = Gauge::with_opts(
        Opts::new("presenced_active_subscriptions", "Live topic subscriptions")
    ).expect("Failed to create active_subscriptions metric");
}

/// Register all metrics with the global registry; safe to call repeatedly.
pub fn register_default_metrics() {
    METRICS_REGISTERED.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(HEARTBEATS_TOTAL.clone()),
            Box::new(TRANSITIONS_TOTAL.clone()),
            Box::new(REAPED_TOTAL.clone()),
            Box::new(PUBLISH_FAILURES_TOTAL.clone()),
            Box::new(ACTIVE_SESSIONS.clone()),
            Box::new(ACTIVE_SUBSCRIPTIONS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!("metric registration skipped: {}", e);
            }
        }
    });
}

/// Encode the registry in the Prometheus text format.
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_encode() {
        register_default_metrics();
        register_default_metrics(); // idempotent
        HEARTBEATS_TOTAL.inc();
        TRANSITIONS_TOTAL.with_label_values(&["online"]).inc();
        let text = encode();
        assert!(text.contains("presenced_heartbeats_total"));
        assert!(text.contains("presenced_transitions_total"));
    }
}

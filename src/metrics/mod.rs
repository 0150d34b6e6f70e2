mod slowlog;
mod tracker;

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    self, opts, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, GaugeVec, HistogramVec, IntCounter, IntCounterVec,
};

pub use slowlog::Slowlog;
pub use tracker::Tracker;

static FRONT_CONNECTIONS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!(
            "shardline_front_connection",
            "each front nodes connections gauge"
        ),
        &["cluster"]
    )
    .expect("front connections gauge registration must succeed")
});

static FRONT_CONNECTION_INCR: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "shardline_front_connection_incr",
            "count of front connections since start"
        ),
        &["cluster"]
    )
    .expect("front connections counter registration must succeed")
});

static GLOBAL_ERROR: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "shardline_global_error",
        "shardline global error counter"
    ))
    .expect("global error counter registration must succeed")
});

static BACKEND_ERROR: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "shardline_backend_error",
            "backend pipeline errors by kind"
        ),
        &["cluster", "kind"]
    )
    .expect("backend error counter registration must succeed")
});

static NODE_EJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "shardline_node_ejected",
            "count of health monitor ejections per node"
        ),
        &["cluster", "node"]
    )
    .expect("node ejection counter registration must succeed")
});

static REDIRECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("shardline_redirect", "cluster redirects followed by kind"),
        &["cluster", "kind"]
    )
    .expect("redirect counter registration must succeed")
});

static SLOWLOG: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("shardline_slowlog", "client messages over the slowlog threshold"),
        &["cluster"]
    )
    .expect("slowlog counter registration must succeed")
});

static TOTAL_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "shardline_total_timer",
        "set up each cluster command proxy total timer",
        &["cluster"],
        vec![1_000.0, 10_000.0, 40_000.0, 100_000.0, 200_000.0]
    )
    .expect("total timer histogram registration must succeed")
});

static REMOTE_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "shardline_remote_timer",
        "set up each cluster command proxy remote timer",
        &["cluster"],
        vec![1_000.0, 10_000.0, 100_000.0]
    )
    .expect("remote timer histogram registration must succeed")
});

/// Record a new front connection.
pub fn front_conn_open(cluster: &str) {
    FRONT_CONNECTION_INCR.with_label_values(&[cluster]).inc();
    FRONT_CONNECTIONS.with_label_values(&[cluster]).inc();
}

/// Record a front connection closure.
pub fn front_conn_close(cluster: &str) {
    FRONT_CONNECTIONS.with_label_values(&[cluster]).dec();
}

pub fn front_connections_current(cluster: &str) -> u64 {
    FRONT_CONNECTIONS.with_label_values(&[cluster]).get().max(0.0) as u64
}

pub fn front_connections_total(cluster: &str) -> u64 {
    FRONT_CONNECTION_INCR.with_label_values(&[cluster]).get()
}

/// Increment the global error counter.
pub fn global_error_incr() {
    GLOBAL_ERROR.inc();
}

pub fn backend_error_incr(cluster: &str, kind: &str) {
    BACKEND_ERROR.with_label_values(&[cluster, kind]).inc();
}

pub fn backend_errors(cluster: &str, kind: &str) -> u64 {
    BACKEND_ERROR.with_label_values(&[cluster, kind]).get()
}

pub fn node_ejected_incr(cluster: &str, node: &str) {
    NODE_EJECTED.with_label_values(&[cluster, node]).inc();
}

pub fn node_ejections(cluster: &str, node: &str) -> u64 {
    NODE_EJECTED.with_label_values(&[cluster, node]).get()
}

pub fn redirect_incr(cluster: &str, kind: &str) {
    REDIRECTS.with_label_values(&[cluster, kind]).inc();
}

pub fn slowlog_incr(cluster: &str) {
    SLOWLOG.with_label_values(&[cluster]).inc();
}

pub fn slowlog_count(cluster: &str) -> u64 {
    SLOWLOG.with_label_values(&[cluster]).get()
}

/// Create a tracker for total command latency.
pub fn total_tracker(cluster: &str) -> Tracker {
    Tracker::new(TOTAL_TIMER.with_label_values(&[cluster]))
}

/// Record the backend round trip of one command.
pub fn remote_observe(cluster: &str, elapsed: Duration) {
    REMOTE_TIMER
        .with_label_values(&[cluster])
        .observe(elapsed.as_secs_f64() * 1_000_000.0);
}

/// Render every registered metric in the text exposition format.
pub fn gather_text() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %err, "failed to encode prometheus metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_counter_is_labelled() {
        let before = backend_errors("metrics-test", "timeout");
        backend_error_incr("metrics-test", "timeout");
        assert_eq!(backend_errors("metrics-test", "timeout"), before + 1);
        assert!(gather_text().contains("shardline_backend_error"));
    }
}

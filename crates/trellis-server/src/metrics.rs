// Metrics for the HTTP surfaces and the raft node
// Registry-level counters are described by trellis_registry::metrics

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use trellis_consistency::RaftNode;

/// Describe every metric; call once at startup
pub fn init_metrics() {
    describe_counter!(
        "http_requests_total",
        "Total number of HTTP requests received"
    );
    describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    describe_counter!(
        "http_requests_errors_total",
        "Total number of HTTP request errors"
    );

    describe_gauge!("raft_term", "Current Raft term");
    describe_gauge!("raft_log_index", "Last applied Raft log index");
    describe_gauge!("raft_is_leader", "1 when this node leads the registry log");

    trellis_registry::metrics::describe();

    tracing::info!("Metrics initialized");
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
    histogram!("http_request_duration_seconds", "method" => method.to_string(), "path" => path.to_string()).record(duration_secs);

    if status >= 400 {
        counter!("http_requests_errors_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
    }
}

/// Publish the node's raft gauges
pub fn record_raft_state(node: &RaftNode) {
    gauge!("raft_term").set(node.current_term() as f64);
    gauge!("raft_log_index").set(node.last_applied_index().unwrap_or(0) as f64);
    gauge!("raft_is_leader").set(if node.is_leader() { 1.0 } else { 0.0 });
}

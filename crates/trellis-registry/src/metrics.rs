// Metrics for registry services
// Counters are recorded through the `metrics` facade; the server installs the recorder

use metrics::{counter, describe_counter, histogram};

/// Register metric descriptions; call once at startup
pub fn describe() {
    describe_counter!("registry_writes_total", "Total number of registry log commands");
    describe_counter!("fanout_calls_total", "Total number of peer fanout calls");
    describe_counter!(
        "fanout_peer_errors_total",
        "Total number of failed peer calls inside a fanout"
    );
    describe_counter!("promotions_total", "Total number of completed promotions");
    describe_counter!("promotions_failed_total", "Total number of failed promotions");
    describe_counter!("provision_tickets_issued_total", "Total number of issued tickets");
    describe_counter!(
        "provision_tickets_redeemed_total",
        "Total number of redeemed tickets"
    );
    describe_counter!("heartbeats_total", "Total number of service heartbeats");
    describe_counter!(
        "heartbeats_expired_total",
        "Total number of services marked down by heartbeat expiry"
    );
}

pub fn record_registry_write(op: &'static str) {
    counter!("registry_writes_total", "op" => op).increment(1);
}

pub fn record_fanout(mode: &'static str, peers: usize) {
    counter!("fanout_calls_total", "mode" => mode).increment(1);
    histogram!("fanout_peers", "mode" => mode).record(peers as f64);
}

pub fn record_fanout_peer_error() {
    counter!("fanout_peer_errors_total").increment(1);
}

pub fn record_promotion(graceful: bool, success: bool) {
    let graceful = if graceful { "true" } else { "false" };
    if success {
        counter!("promotions_total", "graceful" => graceful).increment(1);
    } else {
        counter!("promotions_failed_total", "graceful" => graceful).increment(1);
    }
}

pub fn record_ticket_issued(kind: &'static str) {
    counter!("provision_tickets_issued_total", "kind" => kind).increment(1);
}

pub fn record_ticket_redeemed(kind: &'static str) {
    counter!("provision_tickets_redeemed_total", "kind" => kind).increment(1);
}

pub fn record_heartbeat() {
    counter!("heartbeats_total").increment(1);
}

pub fn record_heartbeat_expired() {
    counter!("heartbeats_expired_total").increment(1);
}

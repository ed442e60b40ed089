// Metric names and recording helpers for the coordination layer
// Descriptions are registered by the server binary at startup

use metrics::{counter, gauge};

pub const ELECTIONS_TOTAL: &str = "parley_elections_total";
pub const CLOCK_SYNC_ROUNDS_TOTAL: &str = "parley_clock_sync_rounds_total";
pub const CLOCK_OFFSET_MS: &str = "parley_clock_offset_ms";
pub const REPLICATION_PROPAGATED_TOTAL: &str = "parley_replication_propagated_total";
pub const REPLICATION_APPLIED_TOTAL: &str = "parley_replication_applied_total";
pub const REPLICATION_SKIPPED_TOTAL: &str = "parley_replication_skipped_total";
pub const CLOCK_SYNC_RESPONDERS: &str = "parley_clock_sync_responders";
pub const DOMAIN_REQUESTS_TOTAL: &str = "parley_domain_requests_total";

/// Record the end of an election, labelled with its outcome
pub fn record_election(outcome: &str) {
    counter!(ELECTIONS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_clock_sync_round(responders: usize) {
    counter!(CLOCK_SYNC_ROUNDS_TOTAL).increment(1);
    gauge!(CLOCK_SYNC_RESPONDERS).set(responders as f64);
}

pub fn set_clock_offset(offset_ms: i64) {
    gauge!(CLOCK_OFFSET_MS).set(offset_ms as f64);
}

pub fn record_propagated(kind: &str) {
    counter!(REPLICATION_PROPAGATED_TOTAL, "operation" => kind.to_string()).increment(1);
}

pub fn record_applied(kind: &str) {
    counter!(REPLICATION_APPLIED_TOTAL, "operation" => kind.to_string()).increment(1);
}

/// Record a replicated operation that was not applied
pub fn record_skipped(reason: &str) {
    counter!(REPLICATION_SKIPPED_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_domain_request(service: &str, success: bool) {
    counter!(
        DOMAIN_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "status" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

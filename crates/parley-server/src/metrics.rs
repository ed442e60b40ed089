// Metric descriptions and the optional Prometheus exporter
// Recording helpers live next to the code they measure, in parley_core::metrics

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use parley_core::metrics::{
    CLOCK_OFFSET_MS, CLOCK_SYNC_RESPONDERS, CLOCK_SYNC_ROUNDS_TOTAL, DOMAIN_REQUESTS_TOTAL,
    ELECTIONS_TOTAL, REPLICATION_APPLIED_TOTAL, REPLICATION_PROPAGATED_TOTAL,
    REPLICATION_SKIPPED_TOTAL,
};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // Election metrics
    describe_counter!(ELECTIONS_TOTAL, "Total number of elections, by outcome");

    // Clock sync metrics
    describe_counter!(
        CLOCK_SYNC_ROUNDS_TOTAL,
        "Total number of Berkeley rounds run as coordinator"
    );
    describe_gauge!(
        CLOCK_SYNC_RESPONDERS,
        "Number of peers that answered the last clock sync round"
    );
    describe_gauge!(CLOCK_OFFSET_MS, "Current wall clock offset in milliseconds");

    // Replication metrics
    describe_counter!(
        REPLICATION_PROPAGATED_TOTAL,
        "Total number of local mutations broadcast to the group"
    );
    describe_counter!(
        REPLICATION_APPLIED_TOTAL,
        "Total number of remote mutations applied"
    );
    describe_counter!(
        REPLICATION_SKIPPED_TOTAL,
        "Total number of replicated operations not applied, by reason"
    );

    // Domain metrics
    describe_counter!(
        DOMAIN_REQUESTS_TOTAL,
        "Total number of client requests, by service and status"
    );

    tracing::info!("Metrics initialized");
}

/// Serve metrics in the Prometheus text format on `address`
pub fn install_exporter(address: &str) -> anyhow::Result<()> {
    let address: SocketAddr = address.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()?;
    tracing::info!("Prometheus exporter listening on {}", address);
    Ok(())
}

// Parley server library: TCP transport, broadcast proxy and process startup
// The binary in main.rs picks one role and runs it until shutdown

pub mod metrics; // Metric descriptions and Prometheus exporter
pub mod model; // Command line and configuration loading
pub mod startup; // Logging, shutdown and role runners
pub mod transport; // TCP frames, peer transport and broadcast proxy

pub use model::{Cli, Role, load_configuration};

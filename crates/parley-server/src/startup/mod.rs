//! Application startup utilities module.
//!
//! Logging, shutdown handling and the three process roles.

mod logging;
mod roles;
mod shutdown;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use roles::{run_peer, run_proxy, run_reference};
pub use shutdown::{ShutdownSignal, run_with_shutdown, wait_for_shutdown_signal};

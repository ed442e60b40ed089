//! Parley Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Parley components:
//! - Error types
//! - Name validation
//! - Wall-clock and host helpers

pub mod error;
pub mod utils;

pub use error::ParleyError;
pub use utils::{is_valid_name, local_hostname, now_millis, now_secs_f64};

/// Topic carrying coordinator announcements
pub const TOPIC_SERVERS: &str = "servers";

/// Topic carrying replicated operations
pub const TOPIC_REPLICATION: &str = "replication";

//! Utility functions for Parley
//!
//! Common helper functions used across the codebase.

use std::sync::LazyLock;

/// Pattern for user and channel names
static VALID_NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-zA-Z0-9_.:@-]+$").expect("Invalid regex pattern"));

/// Validate a user or channel name
///
/// Allowed characters: alphanumeric, underscore, dot, colon, at sign, hyphen.
/// Empty names are rejected.
///
/// # Examples
///
/// ```
/// use parley_common::is_valid_name;
///
/// assert!(is_valid_name("alice"));
/// assert!(is_valid_name("team-ops.2"));
/// assert!(!is_valid_name("with spaces"));
/// assert!(!is_valid_name(""));
/// ```
pub fn is_valid_name(name: &str) -> bool {
    VALID_NAME_PATTERN.is_match(name)
}

/// Get the local host name, falling back to "localhost"
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Current wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current wall clock in fractional seconds since the Unix epoch
pub fn now_secs_f64() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

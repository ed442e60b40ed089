//! Server-side configuration models

pub mod config;

pub use config::{Cli, Role, load_configuration};

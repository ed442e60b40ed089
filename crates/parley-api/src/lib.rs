//! Parley API - wire models
//!
//! Everything that crosses the transport: the `Message` envelope, service
//! tags, coordination payloads, replicated operations and domain records.

pub mod domain;
pub mod model;
pub mod remote;
pub mod replication;

pub use model::{ClockValue, PeerIdentity, RankedPeer};
pub use remote::model::{Message, ServiceTag};

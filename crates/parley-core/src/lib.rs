//! Parley Core - peer coordination
//!
//! This crate provides:
//! - Lamport logical clock
//! - Reference registry and peer membership
//! - Bully election and Berkeley clock synchronization
//! - Replicate-and-apply of domain mutations
//! - Domain store with snapshot persistence
//! - Transport abstraction with an in-process implementation

pub mod handler;
pub mod metrics;
pub mod model;
pub mod service;

// Re-export commonly used types
pub use model::Configuration;
pub use service::{
    DomainStore, Election, ElectionPhase, Endpoint, LogicalClock, MemoryNetwork, PeerNode,
    PeerTransport, ReferenceRegistry, TransportError,
};

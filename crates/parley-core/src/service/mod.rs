// Peer coordination services

pub mod client;
pub mod clock_sync;
pub mod coordinator_event;
pub mod election;
pub mod logical_clock;
pub mod membership;
pub mod memory;
pub mod peer;
pub mod persistence;
pub mod registry;
pub mod replication;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use client::{PeerClient, RpcError};
pub use clock_sync::ClockSync;
pub use election::{AnnouncementPolicy, Election, ElectionPhase};
pub use logical_clock::LogicalClock;
pub use membership::Membership;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use peer::PeerNode;
pub use registry::ReferenceRegistry;
pub use replication::{ReplicationApplier, Replicator};
pub use store::DomainStore;
pub use transport::{Endpoint, InboundRequest, PeerTransport, Publication, TransportError};

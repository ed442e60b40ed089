//! Replicate-and-apply of domain mutations
//!
//! Local handlers call [`Replicator::propagate`] after committing a mutation;
//! the replication subscription loop hands every broadcast to
//! [`Replicator::handle_publication`]. Three mechanisms keep the group free of
//! loops and double applies:
//!
//! - operations carrying this peer's own `originId` are discarded, since the
//!   broadcast channel echoes to the publisher's own subscription;
//! - `(originId, incarnation, clock)` triples already applied are remembered
//!   in a bounded cache and discarded on redelivery. The incarnation is fresh
//!   for every `Replicator`, so a restarted origin never collides with the
//!   clocks of its previous run;
//! - applying runs inside a task-local scope in which `propagate` is a no-op.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use moka::sync::Cache;
use uuid::Uuid;
use tracing::{debug, info, warn};

use parley_api::{
    Message, PeerIdentity,
    replication::{Operation, OperationId, ReplicatedOperation},
};
use parley_common::{ParleyError, TOPIC_REPLICATION};

use super::client::PeerClient;
use crate::{metrics, model::Configuration};

tokio::task_local! {
    static APPLYING_REPLICATED: bool;
}

/// Whether the current task is applying a replicated operation
pub fn is_applying_replicated() -> bool {
    APPLYING_REPLICATED.try_with(|applying| *applying).unwrap_or(false)
}

/// Result of applying one operation to local state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyEffect {
    Applied,
    /// The natural key already existed; nothing changed
    AlreadyPresent,
}

/// Local state that replicated operations are applied to
#[async_trait]
pub trait ReplicationApplier: Send + Sync {
    async fn apply_operation(&self, operation: &Operation) -> Result<ApplyEffect, ParleyError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyPresent,
    SelfOrigin,
    Duplicate,
    Rejected,
}

#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// Number of applied operation ids remembered for duplicate detection
    pub dedup_capacity: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 100_000,
        }
    }
}

impl ReplicationConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            dedup_capacity: config.replication_dedup_capacity(),
        }
    }
}

pub struct Replicator {
    identity: PeerIdentity,
    incarnation: String,
    client: Arc<PeerClient>,
    applier: Arc<dyn ReplicationApplier>,
    applied: Cache<OperationId, ()>,
    propagated_count: AtomicU64,
    applied_count: AtomicU64,
}

impl Replicator {
    pub fn new(
        identity: PeerIdentity,
        config: ReplicationConfig,
        client: Arc<PeerClient>,
        applier: Arc<dyn ReplicationApplier>,
    ) -> Self {
        Self {
            identity,
            incarnation: Uuid::new_v4().to_string(),
            client,
            applier,
            applied: Cache::new(config.dedup_capacity),
            propagated_count: AtomicU64::new(0),
            applied_count: AtomicU64::new(0),
        }
    }

    /// Identifier of this process instance, carried on every broadcast
    pub fn incarnation(&self) -> &str {
        &self.incarnation
    }

    /// Number of operations this peer has broadcast
    pub fn propagated_count(&self) -> u64 {
        self.propagated_count.load(Ordering::SeqCst)
    }

    /// Number of remote operations applied to local state
    pub fn applied_count(&self) -> u64 {
        self.applied_count.load(Ordering::SeqCst)
    }

    /// Broadcast a committed local mutation
    ///
    /// Returns whether a broadcast was sent. Inside an apply scope nothing is
    /// sent; failures are logged only.
    pub async fn propagate(&self, operation: &Operation) -> bool {
        if is_applying_replicated() {
            debug!("Suppressed propagation of {} while applying", operation.kind());
            return false;
        }

        let clock = self.client.clock().tick();
        let message = match ReplicatedOperation::new(operation, self.identity.clone(), clock)
            .and_then(|replicated| replicated.with_incarnation(&self.incarnation).to_message())
        {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to encode {} for replication: {}", operation.kind(), e);
                return false;
            }
        };

        match self.client.publish(TOPIC_REPLICATION, &message).await {
            Ok(()) => {
                self.propagated_count.fetch_add(1, Ordering::SeqCst);
                metrics::record_propagated(&operation.kind().to_string());
                debug!("Propagated {} at clock {}", operation.kind(), clock);
                true
            }
            Err(e) => {
                warn!("Failed to propagate {}: {}", operation.kind(), e);
                false
            }
        }
    }

    /// Decode and apply one broadcast from the `replication` topic
    pub async fn handle_publication(&self, payload: &[u8]) -> ApplyOutcome {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable replication broadcast: {}", e);
                metrics::record_skipped("malformed");
                return ApplyOutcome::Rejected;
            }
        };
        if let Some(remote) = message.clock() {
            self.client.clock().observe(remote);
        }

        match ReplicatedOperation::from_message(&message) {
            Ok(replicated) => self.apply(replicated).await,
            Err(e) => {
                warn!("Dropping invalid replication broadcast: {}", e);
                metrics::record_skipped("malformed");
                ApplyOutcome::Rejected
            }
        }
    }

    /// Apply an operation received from another peer. Never fails.
    pub async fn apply(&self, replicated: ReplicatedOperation) -> ApplyOutcome {
        if replicated.origin_id.id == self.identity.id {
            metrics::record_skipped("self_origin");
            return ApplyOutcome::SelfOrigin;
        }

        let id = replicated.id();
        if self.applied.contains_key(&id) {
            debug!("Duplicate replicated operation {}@{}", id.origin, id.clock);
            metrics::record_skipped("duplicate");
            return ApplyOutcome::Duplicate;
        }

        let operation = match replicated.decode_operation() {
            Ok(operation) => operation,
            Err(e) => {
                warn!(
                    "Skipping replicated operation from {}: {}",
                    replicated.origin_id, e
                );
                metrics::record_skipped("invalid");
                return ApplyOutcome::Rejected;
            }
        };

        let result = APPLYING_REPLICATED
            .scope(true, self.applier.apply_operation(&operation))
            .await;

        match result {
            Ok(ApplyEffect::Applied) => {
                self.applied.insert(id, ());
                self.applied_count.fetch_add(1, Ordering::SeqCst);
                metrics::record_applied(&operation.kind().to_string());
                info!(
                    "Applied replicated {} from {} (clock {})",
                    operation.kind(),
                    replicated.origin_id,
                    replicated.clock
                );
                ApplyOutcome::Applied
            }
            Ok(ApplyEffect::AlreadyPresent) => {
                self.applied.insert(id, ());
                debug!("Replicated {} already present", operation.kind());
                metrics::record_skipped("already_present");
                ApplyOutcome::AlreadyPresent
            }
            Err(e) => {
                warn!(
                    "Failed to apply replicated {} from {}: {}",
                    operation.kind(),
                    replicated.origin_id,
                    e
                );
                metrics::record_skipped("apply_error");
                ApplyOutcome::Rejected
            }
        }
    }
}

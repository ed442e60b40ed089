// Coordinator change event handling
// Notifies in-process subscribers whenever the adopted coordinator changes

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use parley_api::{ClockValue, PeerIdentity};
use parley_common::now_millis;

/// Why the coordinator changed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorChangeType {
    /// This peer won an election
    Elected,
    /// An announcement from another peer was adopted
    Adopted,
}

impl std::fmt::Display for CoordinatorChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorChangeType::Elected => write!(f, "ELECTED"),
            CoordinatorChangeType::Adopted => write!(f, "ADOPTED"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorChangeEvent {
    pub change_type: CoordinatorChangeType,
    pub coordinator: PeerIdentity,
    pub previous: Option<PeerIdentity>,
    /// Logical clock of the announcement that caused the change
    pub clock: ClockValue,
    pub timestamp: i64,
}

impl CoordinatorChangeEvent {
    pub fn elected(coordinator: PeerIdentity, previous: Option<PeerIdentity>, clock: ClockValue) -> Self {
        Self {
            change_type: CoordinatorChangeType::Elected,
            coordinator,
            previous,
            clock,
            timestamp: now_millis(),
        }
    }

    pub fn adopted(coordinator: PeerIdentity, previous: Option<PeerIdentity>, clock: ClockValue) -> Self {
        Self {
            change_type: CoordinatorChangeType::Adopted,
            coordinator,
            previous,
            clock,
            timestamp: now_millis(),
        }
    }
}

/// Trait for handling coordinator change events
#[async_trait]
pub trait CoordinatorChangeListener: Send + Sync {
    async fn on_coordinator_change(&self, event: &CoordinatorChangeEvent);
}

/// Coordinator change event publisher
/// Broadcasts events to subscribers and calls registered listeners in order
pub struct CoordinatorEventPublisher {
    broadcast_tx: broadcast::Sender<CoordinatorChangeEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn CoordinatorChangeListener>>>>,
    running: Arc<RwLock<bool>>,
}

impl CoordinatorEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size);
        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        info!("Starting coordinator change event publisher");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopped coordinator change event publisher");
    }

    pub async fn register_listener(&self, listener: Arc<dyn CoordinatorChangeListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!(
            "Registered coordinator change listener, total: {}",
            listeners.len()
        );
    }

    /// Publish an event; dropped silently while the publisher is stopped
    pub async fn publish(&self, event: CoordinatorChangeEvent) {
        if !*self.running.read().await {
            return;
        }

        let _ = self.broadcast_tx.send(event.clone());

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_coordinator_change(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorChangeEvent> {
        self.broadcast_tx.subscribe()
    }
}

impl Default for CoordinatorEventPublisher {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Logs every coordinator change
pub struct LoggingCoordinatorChangeListener;

#[async_trait]
impl CoordinatorChangeListener for LoggingCoordinatorChangeListener {
    async fn on_coordinator_change(&self, event: &CoordinatorChangeEvent) {
        match (&event.change_type, &event.previous) {
            (CoordinatorChangeType::Elected, _) => {
                info!(
                    "[CoordinatorEvent] Elected self as coordinator: {} (clock {})",
                    event.coordinator, event.clock
                );
            }
            (CoordinatorChangeType::Adopted, Some(previous)) => {
                info!(
                    "[CoordinatorEvent] Coordinator changed: {} -> {} (clock {})",
                    previous, event.coordinator, event.clock
                );
            }
            (CoordinatorChangeType::Adopted, None) => {
                info!(
                    "[CoordinatorEvent] Coordinator adopted: {} (clock {})",
                    event.coordinator, event.clock
                );
            }
        }
    }
}

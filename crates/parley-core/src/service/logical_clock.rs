// Lamport logical clock shared by every component of a peer

use std::sync::atomic::{AtomicU64, Ordering};

use parley_api::ClockValue;

/// Monotonic Lamport counter
///
/// Starts at 0 on every process start and is never persisted.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local or outgoing event and return the new value
    pub fn tick(&self) -> ClockValue {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a value received from another process: `max(local, remote) + 1`
    pub fn observe(&self, remote: ClockValue) -> ClockValue {
        let previous = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(local.max(remote).saturating_add(1))
            })
            .unwrap_or_else(|current| current);
        previous.max(remote).saturating_add(1)
    }

    pub fn current(&self) -> ClockValue {
        self.value.load(Ordering::SeqCst)
    }
}

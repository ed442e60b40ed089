// Reference registry: rank assignment and liveness of peers
// Ranks start at 1 and are handed out in registration order; a peer keeps
// its rank for the lifetime of the registry even after it expires.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

use parley_api::{PeerIdentity, RankedPeer};
use parley_common::{ParleyError, is_valid_name};

use crate::model::Configuration;

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Silence after which a peer is removed from the live list
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl RegistryConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(config.reference_heartbeat_timeout_ms()),
            sweep_interval: Duration::from_millis(config.reference_sweep_interval_ms()),
        }
    }
}

struct LivePeer {
    name: String,
    last_heartbeat: Instant,
}

struct RegistryInner {
    next_rank: i64,
    ranks: HashMap<String, i64>,
    live: HashMap<String, LivePeer>,
}

pub struct ReferenceRegistry {
    config: RegistryConfig,
    inner: Mutex<RegistryInner>,
}

impl ReferenceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RegistryInner {
                next_rank: 1,
                ranks: HashMap::new(),
                live: HashMap::new(),
            }),
        }
    }

    /// Register a peer (or refresh it) and return its rank
    pub fn register(&self, identity: &PeerIdentity) -> Result<i64, ParleyError> {
        if !is_valid_name(&identity.id) {
            return Err(ParleyError::IllegalArgument(format!(
                "invalid peer id '{}'",
                identity.id
            )));
        }

        let mut inner = self.inner.lock();
        let existing = inner.ranks.get(&identity.id).copied();
        let rank = match existing {
            Some(rank) => rank,
            None => {
                let rank = inner.next_rank;
                inner.next_rank += 1;
                inner.ranks.insert(identity.id.clone(), rank);
                info!("Peer {} registered with rank {}", identity, rank);
                rank
            }
        };
        inner.live.insert(
            identity.id.clone(),
            LivePeer {
                name: identity.name.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        Ok(rank)
    }

    /// Refresh a live peer; false when the peer is unknown or expired
    pub fn heartbeat(&self, identity: &PeerIdentity) -> bool {
        let mut inner = self.inner.lock();
        match inner.live.get_mut(&identity.id) {
            Some(peer) => {
                peer.last_heartbeat = Instant::now();
                debug!("Heartbeat from {}", identity);
                true
            }
            None => {
                debug!("Heartbeat from unknown peer {}", identity);
                false
            }
        }
    }

    /// Live peers ordered by election priority
    pub fn list(&self) -> Vec<RankedPeer> {
        let inner = self.inner.lock();
        let mut peers: Vec<RankedPeer> = inner
            .live
            .iter()
            .filter_map(|(id, peer)| {
                inner.ranks.get(id).map(|rank| {
                    RankedPeer::new(PeerIdentity::new(peer.name.clone(), id.clone()), *rank)
                })
            })
            .collect();
        peers.sort_by(|a, b| a.priority_cmp(b));
        peers
    }

    /// Remove peers silent for longer than the heartbeat timeout
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout;
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .live
            .iter()
            .filter(|(_, peer)| now.duration_since(peer.last_heartbeat) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.live.remove(id);
            info!("Peer {} expired after {:?} without heartbeat", id, timeout);
        }
        expired
    }

    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.sweep();
            }
        })
    }
}

impl Default for ReferenceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

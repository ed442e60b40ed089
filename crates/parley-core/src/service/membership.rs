//! Peer membership backed by the reference service
//!
//! A peer obtains its rank once at startup, keeps a cached list of the other
//! live peers, and proves its own liveness with periodic heartbeats. Every
//! failure falls back to the cached state; nothing here is fatal.

use std::{sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_api::{
    PeerIdentity, RankedPeer, ServiceTag,
    remote::model::{
        EmptyPayload, ListResponse, RankResponse, RegistrationRequest, STATUS_UNKNOWN,
        StatusResponse,
    },
};

use super::{
    client::{PeerClient, RpcError},
    transport::Endpoint,
};
use crate::model::Configuration;

/// Membership configuration
#[derive(Clone, Debug)]
pub struct MembershipConfig {
    /// Timeout of every reference service RPC
    pub reference_timeout: Duration,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Interval between background refreshes of the peer list
    pub refresh_interval: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            reference_timeout: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(10000),
            refresh_interval: Duration::from_millis(5000),
        }
    }
}

impl MembershipConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            reference_timeout: Duration::from_millis(config.reference_timeout_ms()),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms()),
            refresh_interval: Duration::from_millis(config.membership_refresh_interval_ms()),
        }
    }
}

pub struct Membership {
    identity: PeerIdentity,
    config: MembershipConfig,
    client: Arc<PeerClient>,
    rank: RwLock<Option<i64>>,
    peers: RwLock<Vec<RankedPeer>>,
}

impl Membership {
    pub fn new(identity: PeerIdentity, config: MembershipConfig, client: Arc<PeerClient>) -> Self {
        Self {
            identity,
            config,
            client,
            rank: RwLock::new(None),
            peers: RwLock::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Own rank, if registration succeeded
    pub fn rank(&self) -> Option<i64> {
        *self.rank.read()
    }

    /// Own identity with its rank, if registration succeeded
    pub fn self_ranked(&self) -> Option<RankedPeer> {
        self.rank()
            .map(|rank| RankedPeer::new(self.identity.clone(), rank))
    }

    /// Ask the reference service for a rank and cache it
    pub async fn register(&self) -> Result<i64, RpcError> {
        let response: RankResponse = self
            .client
            .call(
                &Endpoint::Reference,
                ServiceTag::Rank,
                &RegistrationRequest::from_identity(&self.identity),
                self.config.reference_timeout,
            )
            .await?;

        let previous = self.rank.write().replace(response.rank);
        if previous != Some(response.rank) {
            info!(
                "Registered {} with the reference service, rank {}",
                self.identity, response.rank
            );
        }
        Ok(response.rank)
    }

    /// Return the cached rank or register to obtain one
    pub async fn ensure_registered(&self) -> Option<i64> {
        if let Some(rank) = self.rank() {
            return Some(rank);
        }
        match self.register().await {
            Ok(rank) => Some(rank),
            Err(e) => {
                warn!("Registration of {} failed: {}", self.identity, e);
                None
            }
        }
    }

    /// Fetch the live peers (self excluded); the previous cache on failure
    pub async fn refresh(&self) -> Vec<RankedPeer> {
        let result: Result<ListResponse, RpcError> = self
            .client
            .call(
                &Endpoint::Reference,
                ServiceTag::List,
                &EmptyPayload {},
                self.config.reference_timeout,
            )
            .await;

        match result {
            Ok(response) => {
                let mut peers: Vec<RankedPeer> = response
                    .list
                    .into_iter()
                    .filter(|peer| peer.id != self.identity.id)
                    .collect();
                peers.sort_by(|a, b| a.priority_cmp(b));
                debug!("Refreshed peer list: {} other peers", peers.len());
                *self.peers.write() = peers.clone();
                peers
            }
            Err(e) => {
                warn!("Peer list refresh failed, keeping cached list: {}", e);
                self.cached()
            }
        }
    }

    /// Last known list of other peers, ordered by election priority
    pub fn cached(&self) -> Vec<RankedPeer> {
        self.peers.read().clone()
    }

    pub fn peer(&self, id: &str) -> Option<RankedPeer> {
        self.peers.read().iter().find(|p| p.id == id).cloned()
    }

    /// Send one heartbeat; re-register when the reference service forgot us
    pub async fn heartbeat(&self) {
        let result: Result<StatusResponse, RpcError> = self
            .client
            .call(
                &Endpoint::Reference,
                ServiceTag::Heartbeat,
                &RegistrationRequest::from_identity(&self.identity),
                self.config.reference_timeout,
            )
            .await;

        match result {
            Ok(response) if response.status == STATUS_UNKNOWN => {
                warn!(
                    "Reference service does not know {}, registering again",
                    self.identity
                );
                if let Err(e) = self.register().await {
                    warn!("Re-registration failed: {}", e);
                }
            }
            Ok(_) => debug!("Heartbeat acknowledged"),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }

    /// Spawn the periodic heartbeat task
    pub fn start_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let membership = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(membership.config.heartbeat_interval);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                membership.heartbeat().await;
            }
        })
    }

    /// Spawn the periodic peer list refresh task
    pub fn start_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let membership = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(membership.config.refresh_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                membership.refresh().await;
            }
        })
    }
}

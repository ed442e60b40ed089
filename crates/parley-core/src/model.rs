// Core configuration model
// Wraps the layered `config::Config` with typed getters and defaults

use parley_api::PeerIdentity;
use parley_common::local_hostname;

pub const DEFAULT_PEER_ID: &str = "127.0.0.1:5561";
pub const DEFAULT_DOMAIN_ADDRESS: &str = "127.0.0.1:5555";
pub const DEFAULT_REFERENCE_ADDRESS: &str = "127.0.0.1:5560";
pub const DEFAULT_PROXY_PUBLISH_ADDRESS: &str = "127.0.0.1:5557";
pub const DEFAULT_PROXY_SUBSCRIBE_ADDRESS: &str = "127.0.0.1:5558";

#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    // ===================== Peer =====================

    /// Peer display name (default: host name)
    pub fn peer_name(&self) -> String {
        self.config
            .get_string("parley.peer.name")
            .unwrap_or_else(|_| local_hostname())
    }

    /// Peer id, also the address of its coordination endpoint
    pub fn peer_id(&self) -> String {
        self.config
            .get_string("parley.peer.id")
            .unwrap_or_else(|_| DEFAULT_PEER_ID.to_string())
    }

    pub fn peer_identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.peer_name(), self.peer_id())
    }

    /// Address of the client-facing domain endpoint
    pub fn domain_address(&self) -> String {
        self.config
            .get_string("parley.peer.domain-address")
            .unwrap_or_else(|_| DEFAULT_DOMAIN_ADDRESS.to_string())
    }

    // ===================== Reference service =====================

    pub fn reference_address(&self) -> String {
        self.config
            .get_string("parley.reference.address")
            .unwrap_or_else(|_| DEFAULT_REFERENCE_ADDRESS.to_string())
    }

    /// Silence after which the reference service forgets a peer (default: 30000ms)
    pub fn reference_heartbeat_timeout_ms(&self) -> u64 {
        self.config
            .get_int("parley.reference.heartbeat-timeout-ms")
            .unwrap_or(30000) as u64
    }

    /// Interval of the reference service expiry sweep (default: 10000ms)
    pub fn reference_sweep_interval_ms(&self) -> u64 {
        self.config
            .get_int("parley.reference.sweep-interval-ms")
            .unwrap_or(10000) as u64
    }

    // ===================== Broadcast proxy =====================

    pub fn proxy_publish_address(&self) -> String {
        self.config
            .get_string("parley.proxy.publish-address")
            .unwrap_or_else(|_| DEFAULT_PROXY_PUBLISH_ADDRESS.to_string())
    }

    pub fn proxy_subscribe_address(&self) -> String {
        self.config
            .get_string("parley.proxy.subscribe-address")
            .unwrap_or_else(|_| DEFAULT_PROXY_SUBSCRIBE_ADDRESS.to_string())
    }

    /// Longest a single write to the proxy may take before the connection
    /// is dropped (default: 2000ms)
    pub fn proxy_publish_timeout_ms(&self) -> u64 {
        self.config
            .get_int("parley.proxy.publish-timeout-ms")
            .unwrap_or(2000) as u64
    }

    // ===================== Timeouts and intervals =====================

    /// Peer-to-peer RPC timeout in milliseconds (default: 2000ms)
    pub fn peer_timeout_ms(&self) -> u64 {
        self.config
            .get_int("parley.rpc.peer-timeout-ms")
            .unwrap_or(2000) as u64
    }

    /// Reference service RPC timeout in milliseconds (default: 5000ms)
    pub fn reference_timeout_ms(&self) -> u64 {
        self.config
            .get_int("parley.rpc.reference-timeout-ms")
            .unwrap_or(5000) as u64
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.config
            .get_int("parley.heartbeat.interval-ms")
            .unwrap_or(10000) as u64
    }

    pub fn membership_refresh_interval_ms(&self) -> u64 {
        self.config
            .get_int("parley.membership.refresh-interval-ms")
            .unwrap_or(5000) as u64
    }

    // ===================== Coordination =====================

    /// Number of domain requests between clock sync triggers (default: 10)
    pub fn clock_sync_every_requests(&self) -> u64 {
        self.config
            .get_int("parley.clock-sync.every-requests")
            .map(|n| n.max(1) as u64)
            .unwrap_or(10)
    }

    pub fn announcement_policy(&self) -> String {
        self.config
            .get_string("parley.election.announcement-policy")
            .unwrap_or_else(|_| "last-writer-wins".to_string())
    }

    // ===================== Replication and persistence =====================

    /// Capacity of the replicated-operation dedup cache (default: 100000)
    pub fn replication_dedup_capacity(&self) -> u64 {
        self.config
            .get_int("parley.replication.dedup-capacity")
            .unwrap_or(100_000) as u64
    }

    pub fn data_dir(&self) -> String {
        self.config
            .get_string("parley.data.dir")
            .unwrap_or_else(|_| "data".to_string())
    }

    pub fn persistence_batch_ms(&self) -> u64 {
        self.config
            .get_int("parley.persistence.batch-ms")
            .unwrap_or(200) as u64
    }

    // ===================== Metrics =====================

    /// Prometheus exporter listen address; the exporter is off when unset
    pub fn metrics_address(&self) -> Option<String> {
        self.config
            .get_string("parley.metrics.address")
            .ok()
            .filter(|s| !s.trim().is_empty())
    }
}

//! Bully leader election
//!
//! The peer with the best `(rank, id)` among the live peers becomes the
//! coordinator. A candidate probes every better peer; any answer means a
//! better peer is alive and will take over, so the candidate becomes a
//! follower and waits for the announcement. When nobody better answers the
//! candidate declares itself and announces on the `servers` topic.
//!
//! The election never fails: it ends as `Coordinator` or `Follower`, or stays
//! `Idle` when the own rank cannot be obtained from the reference service.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use parley_api::{
    ClockValue, Message, PeerIdentity, RankedPeer, ServiceTag,
    remote::model::{CoordinatorAnnouncement, ElectionRequest, ElectionResponse},
};
use parley_common::{ParleyError, TOPIC_SERVERS};

use super::{
    client::PeerClient,
    coordinator_event::{CoordinatorChangeEvent, CoordinatorEventPublisher},
    membership::Membership,
    transport::Endpoint,
};
use crate::{metrics, model::Configuration};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ElectionPhase {
    #[default]
    Idle,
    Electing,
    Coordinator,
    Follower,
}

impl std::fmt::Display for ElectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionPhase::Idle => write!(f, "IDLE"),
            ElectionPhase::Electing => write!(f, "ELECTING"),
            ElectionPhase::Coordinator => write!(f, "COORDINATOR"),
            ElectionPhase::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// How announcements from other peers are adopted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnnouncementPolicy {
    /// Every announcement replaces the current coordinator
    #[default]
    LastWriterWins,
    /// Announcements carrying a logical clock lower than the last adopted
    /// announcement are ignored
    ClockFenced,
}

impl std::str::FromStr for AnnouncementPolicy {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "last-writer-wins" | "lww" => Ok(AnnouncementPolicy::LastWriterWins),
            "clock-fenced" | "fenced" => Ok(AnnouncementPolicy::ClockFenced),
            other => Err(ParleyError::Config(format!(
                "unknown announcement policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ElectionConfig {
    /// Timeout of each probe sent to a better peer
    pub probe_timeout: Duration,
    pub policy: AnnouncementPolicy,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(2000),
            policy: AnnouncementPolicy::default(),
        }
    }
}

impl ElectionConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        let policy = config.announcement_policy().parse().unwrap_or_else(|e| {
            warn!("{}, falling back to last-writer-wins", e);
            AnnouncementPolicy::LastWriterWins
        });
        Self {
            probe_timeout: Duration::from_millis(config.peer_timeout_ms()),
            policy,
        }
    }
}

/// Snapshot of the election state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ElectionState {
    pub coordinator: Option<PeerIdentity>,
    pub phase: ElectionPhase,
    /// Logical clock of the last adopted announcement
    pub fence: Option<ClockValue>,
}

/// Clears the in-progress flag when an election ends, however it ends
struct ElectingGuard<'a>(&'a AtomicBool);

impl Drop for ElectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Election {
    identity: PeerIdentity,
    config: ElectionConfig,
    client: Arc<PeerClient>,
    membership: Arc<Membership>,
    events: Arc<CoordinatorEventPublisher>,
    state: RwLock<ElectionState>,
    in_progress: AtomicBool,
    passive: AtomicBool,
}

impl Election {
    pub fn new(
        config: ElectionConfig,
        client: Arc<PeerClient>,
        membership: Arc<Membership>,
        events: Arc<CoordinatorEventPublisher>,
    ) -> Self {
        Self {
            identity: membership.identity().clone(),
            config,
            client,
            membership,
            events,
            state: RwLock::new(ElectionState::default()),
            in_progress: AtomicBool::new(false),
            passive: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state.read().clone()
    }

    pub fn phase(&self) -> ElectionPhase {
        self.state.read().phase
    }

    pub fn coordinator(&self) -> Option<PeerIdentity> {
        self.state.read().coordinator.clone()
    }

    pub fn is_coordinator(&self) -> bool {
        self.state
            .read()
            .coordinator
            .as_ref()
            .is_some_and(|c| c.id == self.identity.id)
    }

    pub fn is_electing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// A passive peer never starts elections and never answers probes
    pub fn set_passive(&self, passive: bool) {
        if passive {
            warn!("{} entering passive election mode", self.identity);
        }
        self.passive.store(passive, Ordering::SeqCst);
    }

    pub fn is_passive(&self) -> bool {
        self.passive.load(Ordering::SeqCst)
    }

    /// Run one bully election and return the resulting phase
    pub async fn start(self: &Arc<Self>) -> ElectionPhase {
        if self.is_passive() {
            debug!("Passive peer does not start elections");
            return self.phase();
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Election already in progress");
            return self.phase();
        }
        let _guard = ElectingGuard(&self.in_progress);

        let Some(rank) = self.membership.ensure_registered().await else {
            warn!("Own rank is unknown, election postponed");
            self.state.write().phase = ElectionPhase::Idle;
            metrics::record_election("idle");
            return ElectionPhase::Idle;
        };

        self.state.write().phase = ElectionPhase::Electing;
        let me = RankedPeer::new(self.identity.clone(), rank);
        let better: Vec<RankedPeer> = self
            .membership
            .refresh()
            .await
            .into_iter()
            .filter(|peer| peer.outranks(&me))
            .collect();
        info!(
            "{} (rank {}) starting election, {} better peers",
            self.identity,
            rank,
            better.len()
        );

        for peer in &better {
            if self.probe(peer).await {
                info!("{} answered the election probe, following", peer.identity());
                self.state.write().phase = ElectionPhase::Follower;
                metrics::record_election("follower");
                return ElectionPhase::Follower;
            }
        }

        self.declare(rank).await;
        metrics::record_election("coordinator");
        ElectionPhase::Coordinator
    }

    /// Whether a better peer answered the probe with OK
    async fn probe(&self, peer: &RankedPeer) -> bool {
        let result = self
            .client
            .call::<_, ElectionResponse>(
                &Endpoint::Peer(peer.id.clone()),
                ServiceTag::Election,
                &ElectionRequest {
                    candidate: self.identity.clone(),
                },
                self.config.probe_timeout,
            )
            .await;

        match result {
            Ok(response) => response.is_ok(),
            Err(e) => {
                debug!("Election probe to {} failed: {}", peer.id, e);
                false
            }
        }
    }

    async fn declare(&self, rank: i64) {
        let clock = self.client.clock().tick();
        let previous = {
            let mut state = self.state.write();
            state.phase = ElectionPhase::Coordinator;
            state.fence = Some(state.fence.map_or(clock, |f| f.max(clock)));
            state.coordinator.replace(self.identity.clone())
        };
        info!("{} declared itself coordinator", self.identity);

        let announcement = CoordinatorAnnouncement {
            coordinator: self.identity.clone(),
            rank: Some(rank),
        };
        match Message::new(ServiceTag::Election, &announcement, clock) {
            Ok(message) => {
                if let Err(e) = self.client.publish(TOPIC_SERVERS, &message).await {
                    warn!("Failed to announce coordinator: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode coordinator announcement: {}", e),
        }

        if previous.as_ref() != Some(&self.identity) {
            self.events
                .publish(CoordinatorChangeEvent::elected(
                    self.identity.clone(),
                    previous,
                    clock,
                ))
                .await;
        }
    }

    /// Answer an inbound probe and take over in the background
    pub fn handle_probe(self: &Arc<Self>, request: &ElectionRequest) -> ElectionResponse {
        debug!("Election probe from {}", request.candidate);
        if !self.is_electing() && !self.is_passive() {
            let election = self.clone();
            tokio::spawn(async move {
                election.start().await;
            });
        }
        ElectionResponse::ok()
    }

    /// Adopt a coordinator announcement received on the `servers` topic
    ///
    /// Returns whether the announcement was adopted.
    pub async fn on_announcement(
        self: &Arc<Self>,
        announcement: CoordinatorAnnouncement,
        clock: ClockValue,
    ) -> bool {
        let coordinator = announcement.coordinator;
        let previous = {
            let mut state = self.state.write();
            if self.config.policy == AnnouncementPolicy::ClockFenced
                && state.fence.is_some_and(|fence| clock < fence)
            {
                debug!(
                    "Ignoring stale announcement of {} (clock {} < {:?})",
                    coordinator, clock, state.fence
                );
                return false;
            }
            state.phase = if coordinator.id == self.identity.id {
                ElectionPhase::Coordinator
            } else {
                ElectionPhase::Follower
            };
            state.fence = Some(state.fence.map_or(clock, |f| f.max(clock)));
            state.coordinator.replace(coordinator.clone())
        };

        if previous.as_ref() != Some(&coordinator) {
            info!("Adopted coordinator {} (clock {})", coordinator, clock);
            self.events
                .publish(CoordinatorChangeEvent::adopted(
                    coordinator.clone(),
                    previous,
                    clock,
                ))
                .await;
        }

        if coordinator.id != self.identity.id && self.should_take_over(&coordinator, announcement.rank)
        {
            info!("{} outranks announced coordinator {}, taking over", self.identity, coordinator);
            let election = self.clone();
            tokio::spawn(async move {
                election.start().await;
            });
        }
        true
    }

    fn should_take_over(&self, coordinator: &PeerIdentity, announced_rank: Option<i64>) -> bool {
        if self.is_passive() || self.is_electing() {
            return false;
        }
        let (Some(me), Some(rank)) = (
            self.membership.self_ranked(),
            announced_rank.or_else(|| self.membership.peer(&coordinator.id).map(|p| p.rank)),
        ) else {
            return false;
        };
        me.outranks(&RankedPeer::new(coordinator.clone(), rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{
        logical_clock::LogicalClock, membership::MembershipConfig, memory::MemoryNetwork,
    };

    fn election(policy: AnnouncementPolicy) -> Arc<Election> {
        let network = MemoryNetwork::new();
        let client = Arc::new(PeerClient::new(
            network.transport(),
            Arc::new(LogicalClock::new()),
        ));
        let membership = Arc::new(Membership::new(
            PeerIdentity::new("me", "me:1"),
            MembershipConfig {
                reference_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            client.clone(),
        ));
        let config = ElectionConfig {
            probe_timeout: Duration::from_millis(20),
            policy,
        };
        Arc::new(Election::new(
            config,
            client,
            membership,
            Arc::new(CoordinatorEventPublisher::default()),
        ))
    }

    fn announcement(id: &str) -> CoordinatorAnnouncement {
        CoordinatorAnnouncement {
            coordinator: PeerIdentity::new(id, id),
            rank: None,
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "last-writer-wins".parse::<AnnouncementPolicy>().unwrap(),
            AnnouncementPolicy::LastWriterWins
        );
        assert_eq!(
            "Clock-Fenced".parse::<AnnouncementPolicy>().unwrap(),
            AnnouncementPolicy::ClockFenced
        );
        assert!("newest".parse::<AnnouncementPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_last_writer_wins_adopts_older_announcement() {
        let election = election(AnnouncementPolicy::LastWriterWins);
        assert!(election.on_announcement(announcement("a:1"), 10).await);
        assert!(election.on_announcement(announcement("b:1"), 4).await);

        let state = election.state();
        assert_eq!(state.coordinator.unwrap().id, "b:1");
        assert_eq!(state.phase, ElectionPhase::Follower);
    }

    #[tokio::test]
    async fn test_clock_fenced_ignores_older_announcement() {
        let election = election(AnnouncementPolicy::ClockFenced);
        assert!(election.on_announcement(announcement("a:1"), 10).await);
        assert!(!election.on_announcement(announcement("b:1"), 4).await);
        assert_eq!(election.coordinator().unwrap().id, "a:1");

        assert!(election.on_announcement(announcement("b:1"), 11).await);
        assert_eq!(election.coordinator().unwrap().id, "b:1");
    }

    #[tokio::test]
    async fn test_own_announcement_makes_coordinator() {
        let election = election(AnnouncementPolicy::LastWriterWins);
        election.on_announcement(announcement("me:1"), 3).await;
        assert!(election.is_coordinator());
        assert_eq!(election.phase(), ElectionPhase::Coordinator);
    }

    #[tokio::test]
    async fn test_unknown_rank_stays_idle() {
        let election = election(AnnouncementPolicy::LastWriterWins);
        assert_eq!(election.start().await, ElectionPhase::Idle);
        assert!(!election.is_electing());
    }

    #[tokio::test]
    async fn test_passive_peer_does_not_elect() {
        let election = election(AnnouncementPolicy::LastWriterWins);
        election.set_passive(true);
        assert_eq!(election.start().await, ElectionPhase::Idle);
        assert!(election.coordinator().is_none());
    }
}

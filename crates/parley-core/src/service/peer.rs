//! Peer orchestration
//!
//! A [`PeerNode`] owns every component of one peer and the tasks that drive
//! them:
//!
//! - the domain request loop, which also counts requests for clock sync;
//! - the coordination RPC loop (`election`, `clock`, `clockAdjust`);
//! - the `servers` announcement subscription;
//! - the `replication` subscription;
//! - the heartbeat and membership refresh timers.
//!
//! Elections and clock sync rounds are spawned on demand from these tasks.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use parley_api::{Message, PeerIdentity, remote::model::CoordinatorAnnouncement};
use parley_common::{TOPIC_REPLICATION, TOPIC_SERVERS};

use super::{
    client::PeerClient,
    clock_sync::{ClockSync, ClockSyncConfig},
    coordinator_event::{CoordinatorEventPublisher, LoggingCoordinatorChangeListener},
    election::{Election, ElectionConfig, ElectionPhase},
    logical_clock::LogicalClock,
    membership::{Membership, MembershipConfig},
    replication::{ReplicationConfig, Replicator},
    store::DomainStore,
    transport::{Endpoint, InboundRequest, PeerTransport, Publication, TransportError},
};
use crate::{
    handler::{
        DomainContext, HandlerRegistry, coordination_handlers, domain_handlers,
        spawn_request_loop,
    },
    metrics,
    model::Configuration,
};

pub struct PeerNode {
    identity: PeerIdentity,
    domain_address: String,
    clock: Arc<LogicalClock>,
    client: Arc<PeerClient>,
    membership: Arc<Membership>,
    election: Arc<Election>,
    clock_sync: Arc<ClockSync>,
    replicator: Arc<Replicator>,
    store: Arc<DomainStore>,
    events: Arc<CoordinatorEventPublisher>,
    domain: Arc<HandlerRegistry>,
    coordination: Arc<HandlerRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerNode {
    /// Wire every component of a peer on top of `transport` and `store`
    pub fn new(
        configuration: &Configuration,
        transport: Arc<dyn PeerTransport>,
        store: Arc<DomainStore>,
    ) -> Arc<Self> {
        let identity = configuration.peer_identity();
        let clock = Arc::new(LogicalClock::new());
        let client = Arc::new(PeerClient::new(transport, clock.clone()));
        let events = Arc::new(CoordinatorEventPublisher::default());

        let membership = Arc::new(Membership::new(
            identity.clone(),
            MembershipConfig::from_configuration(configuration),
            client.clone(),
        ));
        let election = Arc::new(Election::new(
            ElectionConfig::from_configuration(configuration),
            client.clone(),
            membership.clone(),
            events.clone(),
        ));
        let clock_sync = Arc::new(ClockSync::new(
            ClockSyncConfig::from_configuration(configuration),
            client.clone(),
            membership.clone(),
            election.clone(),
        ));
        let replicator = Arc::new(Replicator::new(
            identity.clone(),
            ReplicationConfig::from_configuration(configuration),
            client.clone(),
            store.clone(),
        ));

        let domain = Arc::new(domain_handlers(
            DomainContext {
                store: store.clone(),
                replicator: replicator.clone(),
                client: client.clone(),
            },
            clock.clone(),
        ));
        let coordination = Arc::new(coordination_handlers(
            election.clone(),
            clock_sync.clone(),
            clock.clone(),
        ));

        Arc::new(Self {
            identity,
            domain_address: configuration.domain_address(),
            clock,
            client,
            membership,
            election,
            clock_sync,
            replicator,
            store,
            events,
            domain,
            coordination,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn domain_address(&self) -> &str {
        &self.domain_address
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn election(&self) -> &Arc<Election> {
        &self.election
    }

    pub fn clock_sync(&self) -> &Arc<ClockSync> {
        &self.clock_sync
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub fn store(&self) -> &Arc<DomainStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<CoordinatorEventPublisher> {
        &self.events
    }

    /// Bind endpoints, start background tasks and run the first election
    ///
    /// A coordination endpoint that is already bound puts the peer in passive
    /// election mode instead of failing. Any other bind or subscribe failure
    /// is returned.
    pub async fn start(self: &Arc<Self>) -> Result<ElectionPhase, TransportError> {
        info!("Starting peer {}", self.identity);
        self.events.start().await;
        self.events
            .register_listener(Arc::new(LoggingCoordinatorChangeListener))
            .await;

        match self.membership.register().await {
            Ok(rank) => info!("Registered as {} with rank {}", self.identity, rank),
            Err(e) => warn!("Registration with the reference service failed: {}", e),
        }

        let transport = self.client.transport().clone();
        let mut tasks = Vec::new();

        match transport.bind(&Endpoint::Peer(self.identity.id.clone())).await {
            Ok(inbox) => tasks.push(spawn_request_loop(self.coordination.clone(), inbox)),
            Err(TransportError::AddressInUse(address)) => {
                warn!(
                    "Coordination endpoint {} is in use, peer {} stays out of elections",
                    address, self.identity
                );
                self.election.set_passive(true);
            }
            Err(e) => return Err(e),
        }

        let domain_inbox = transport
            .bind(&Endpoint::Domain(self.domain_address.clone()))
            .await?;
        tasks.push(self.spawn_domain_loop(domain_inbox));

        let announcements = transport.subscribe(&[TOPIC_SERVERS]).await?;
        tasks.push(self.spawn_announcement_loop(announcements));

        let replication = transport.subscribe(&[TOPIC_REPLICATION]).await?;
        tasks.push(self.spawn_replication_loop(replication));

        tasks.push(self.membership.start_heartbeat());
        tasks.push(self.membership.start_refresh());
        self.tasks.lock().extend(tasks);

        let phase = if self.election.is_passive() {
            self.election.phase()
        } else {
            self.election.start().await
        };
        info!("Peer {} started ({})", self.identity, phase);
        Ok(phase)
    }

    /// Serve one raw client request
    ///
    /// Every request counts towards the clock sync cadence.
    pub async fn handle_client_request(self: &Arc<Self>, payload: &[u8]) -> Vec<u8> {
        let reply = self.domain.dispatch(payload).await;

        if let Ok(message) = Message::decode(&reply) {
            metrics::record_domain_request(&message.service, !message.is_error());
        }

        if self.clock_sync.record_request() && !self.election.is_passive() {
            let clock_sync = self.clock_sync.clone();
            tokio::spawn(async move {
                let outcome = clock_sync.trigger().await;
                debug!("Clock sync trigger: {:?}", outcome);
            });
        }
        reply
    }

    fn spawn_domain_loop(self: &Arc<Self>, mut inbox: mpsc::Receiver<InboundRequest>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(request) = inbox.recv().await {
                let node = node.clone();
                tokio::spawn(async move {
                    let reply = node.handle_client_request(&request.payload).await;
                    request.respond(reply);
                });
            }
            debug!("Domain request loop finished");
        })
    }

    fn spawn_announcement_loop(
        self: &Arc<Self>,
        mut announcements: mpsc::Receiver<Publication>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(publication) = announcements.recv().await {
                node.handle_announcement(&publication.payload).await;
            }
            debug!("Announcement subscription finished");
        })
    }

    /// Apply one broadcast from the `servers` topic; malformed ones are dropped
    pub async fn handle_announcement(self: &Arc<Self>, payload: &[u8]) -> bool {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable announcement: {}", e);
                return false;
            }
        };
        let clock = match message.clock() {
            Some(remote) => {
                self.clock.observe(remote);
                remote
            }
            None => 0,
        };

        match message.data_as::<CoordinatorAnnouncement>() {
            Ok(announcement) => self.election.on_announcement(announcement, clock).await,
            Err(e) => {
                warn!("Dropping invalid announcement: {}", e);
                false
            }
        }
    }

    fn spawn_replication_loop(
        self: &Arc<Self>,
        mut replication: mpsc::Receiver<Publication>,
    ) -> JoinHandle<()> {
        let replicator = self.replicator.clone();
        tokio::spawn(async move {
            while let Some(publication) = replication.recv().await {
                let outcome = replicator.handle_publication(&publication.payload).await;
                debug!("Replication broadcast: {:?}", outcome);
            }
            debug!("Replication subscription finished");
        })
    }

    /// Abort every background task
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.events.stop().await;
        info!("Peer {} stopped, {} tasks aborted", self.identity, tasks.len());
    }
}

//! Berkeley physical clock synchronization
//!
//! Each peer keeps a signed millisecond offset added to its wall clock. The
//! coordinator periodically samples every peer's adjusted clock, averages
//! the differences (its own difference counting as zero) and sends every
//! responder the correction that moves it onto the average.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_api::{
    PeerIdentity, RankedPeer, ServiceTag,
    remote::model::{ClockAdjustRequest, ClockResponse, EmptyPayload, StatusResponse},
};
use parley_common::now_millis;

use super::{
    client::PeerClient,
    election::{Election, ElectionPhase},
    membership::Membership,
    transport::Endpoint,
};
use crate::{metrics, model::Configuration};

#[derive(Clone, Debug)]
pub struct ClockSyncConfig {
    /// Number of domain requests between triggers
    pub every_requests: u64,
    /// Timeout of each `clock` and `clockAdjust` RPC
    pub peer_timeout: Duration,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            every_requests: 10,
            peer_timeout: Duration::from_millis(2000),
        }
    }
}

impl ClockSyncConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            every_requests: config.clock_sync_every_requests(),
            peer_timeout: Duration::from_millis(config.peer_timeout_ms()),
        }
    }
}

/// Difference between a peer's estimated clock and the coordinator's
#[derive(Clone, Debug, PartialEq)]
pub struct ClockSample {
    pub peer: PeerIdentity,
    pub delta_ms: f64,
}

/// Corrections computed from one round of samples
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncPlan {
    pub average_ms: f64,
    /// Correction applied to the coordinator's own offset
    pub self_adjust: i64,
    /// Correction sent to each responder
    pub adjustments: Vec<(PeerIdentity, i64)>,
}

/// Average the samples together with the coordinator's own zero delta.
///
/// Corrections are rounded to the nearest millisecond, ties away from zero.
///
/// ```
/// use parley_api::PeerIdentity;
/// use parley_core::service::clock_sync::{ClockSample, plan_adjustments};
///
/// let plan = plan_adjustments(&[
///     ClockSample { peer: PeerIdentity::new("b", "b:1"), delta_ms: 100.0 },
///     ClockSample { peer: PeerIdentity::new("c", "c:1"), delta_ms: -50.0 },
/// ]);
/// assert_eq!(plan.self_adjust, 17);
/// assert_eq!(plan.adjustments[0].1, -83);
/// assert_eq!(plan.adjustments[1].1, 67);
/// ```
pub fn plan_adjustments(samples: &[ClockSample]) -> SyncPlan {
    let total: f64 = samples.iter().map(|s| s.delta_ms).sum();
    let average_ms = total / (samples.len() + 1) as f64;
    SyncPlan {
        average_ms,
        self_adjust: average_ms.round() as i64,
        adjustments: samples
            .iter()
            .map(|s| (s.peer.clone(), (average_ms - s.delta_ms).round() as i64))
            .collect(),
    }
}

/// What a trigger ended up doing
#[derive(Clone, Debug, PartialEq)]
pub enum SyncOutcome {
    /// Passive peer, or a round already running
    Skipped,
    /// This peer is the coordinator and ran a round
    Round(SyncPlan),
    /// Follower whose coordinator answered
    CoordinatorReachable,
    /// Follower that could not reach a coordinator and ran an election
    ElectionTriggered(ElectionPhase),
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ClockSync {
    config: ClockSyncConfig,
    client: Arc<PeerClient>,
    membership: Arc<Membership>,
    election: Arc<Election>,
    offset_ms: AtomicI64,
    requests: AtomicU64,
    running: AtomicBool,
}

impl ClockSync {
    pub fn new(
        config: ClockSyncConfig,
        client: Arc<PeerClient>,
        membership: Arc<Membership>,
        election: Arc<Election>,
    ) -> Self {
        Self {
            config,
            client,
            membership,
            election,
            offset_ms: AtomicI64::new(0),
            requests: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    /// Wall clock in milliseconds corrected by the current offset
    pub fn adjusted_now_ms(&self) -> i64 {
        now_millis() + self.offset_ms()
    }

    /// Add a correction to the offset and return the new offset
    pub fn apply_adjustment(&self, adjust_ms: i64) -> i64 {
        let offset = self.offset_ms.fetch_add(adjust_ms, Ordering::SeqCst) + adjust_ms;
        metrics::set_clock_offset(offset);
        debug!("Clock offset adjusted by {}ms to {}ms", adjust_ms, offset);
        offset
    }

    /// Count one domain request; true when a sync is due
    pub fn record_request(&self) -> bool {
        let count = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        count % self.config.every_requests.max(1) == 0
    }

    /// Run the sync step appropriate for this peer's role
    pub async fn trigger(&self) -> SyncOutcome {
        if self.election.is_passive() {
            return SyncOutcome::Skipped;
        }
        if self.election.is_coordinator() {
            return match self.run_round().await {
                Some(plan) => SyncOutcome::Round(plan),
                None => SyncOutcome::Skipped,
            };
        }
        self.check_coordinator().await
    }

    /// Follower path: make sure the coordinator is alive, elect otherwise
    async fn check_coordinator(&self) -> SyncOutcome {
        if let Some(coordinator) = self.election.coordinator() {
            let result = self
                .client
                .call::<_, ClockResponse>(
                    &Endpoint::Peer(coordinator.id.clone()),
                    ServiceTag::Clock,
                    &EmptyPayload {},
                    self.config.peer_timeout,
                )
                .await;
            match result {
                Ok(_) => return SyncOutcome::CoordinatorReachable,
                Err(e) => warn!("Coordinator {} unreachable: {}", coordinator, e),
            }
        } else {
            info!("No coordinator known");
        }
        SyncOutcome::ElectionTriggered(self.election.start().await)
    }

    /// Coordinator path: one Berkeley round. None when a round is already running.
    pub async fn run_round(&self) -> Option<SyncPlan> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Clock sync round already running");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let peers = self.membership.refresh().await;
        let base = self.adjusted_now_ms();
        let started = Instant::now();

        let samples: Vec<ClockSample> = join_all(peers.iter().map(|peer| self.sample(peer, base, started)))
            .await
            .into_iter()
            .flatten()
            .collect();

        let plan = plan_adjustments(&samples);
        self.apply_adjustment(plan.self_adjust);

        join_all(
            plan.adjustments
                .iter()
                .map(|(peer, adjust)| self.send_adjustment(peer, *adjust)),
        )
        .await;

        info!(
            "Clock sync round: {} responders, average delta {:.2}ms",
            samples.len(),
            plan.average_ms
        );
        metrics::record_clock_sync_round(samples.len());
        Some(plan)
    }

    async fn sample(&self, peer: &RankedPeer, base: i64, started: Instant) -> Option<ClockSample> {
        let t0 = Instant::now();
        let result = self
            .client
            .call::<_, ClockResponse>(
                &Endpoint::Peer(peer.id.clone()),
                ServiceTag::Clock,
                &EmptyPayload {},
                self.config.peer_timeout,
            )
            .await;
        let t1 = Instant::now();

        match result {
            Ok(response) => {
                let rtt_ms = (t1 - t0).as_secs_f64() * 1000.0;
                let estimate = response.time as f64 + rtt_ms / 2.0;
                let local = base as f64 + (t1 - started).as_secs_f64() * 1000.0;
                Some(ClockSample {
                    peer: peer.identity(),
                    delta_ms: estimate - local,
                })
            }
            Err(e) => {
                debug!("Clock sample from {} failed: {}", peer.id, e);
                None
            }
        }
    }

    async fn send_adjustment(&self, peer: &PeerIdentity, adjust: i64) {
        let result = self
            .client
            .call::<_, StatusResponse>(
                &Endpoint::Peer(peer.id.clone()),
                ServiceTag::ClockAdjust,
                &ClockAdjustRequest { adjust },
                self.config.peer_timeout,
            )
            .await;
        if let Err(e) = result {
            warn!("Clock adjustment for {} failed: {}", peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, delta_ms: f64) -> ClockSample {
        ClockSample {
            peer: PeerIdentity::new(id, id),
            delta_ms,
        }
    }

    #[test]
    fn test_plan_without_responders() {
        let plan = plan_adjustments(&[]);
        assert_eq!(plan.average_ms, 0.0);
        assert_eq!(plan.self_adjust, 0);
        assert!(plan.adjustments.is_empty());
    }

    #[test]
    fn test_plan_converges_all_clocks() {
        let samples = [sample("b", 100.0), sample("c", -50.0)];
        let plan = plan_adjustments(&samples);
        assert!((plan.average_ms - 16.666).abs() < 0.01);

        // Every adjusted clock lands on the same value (within rounding)
        let coordinator = plan.self_adjust as f64;
        for ((_, adjust), s) in plan.adjustments.iter().zip(samples.iter()) {
            let peer = s.delta_ms + *adjust as f64;
            assert!((peer - coordinator).abs() <= 1.0);
        }
    }

    #[test]
    fn test_rounding_ties_away_from_zero() {
        let plan = plan_adjustments(&[sample("b", 1.0)]);
        assert_eq!(plan.average_ms, 0.5);
        assert_eq!(plan.self_adjust, 1);
        assert_eq!(plan.adjustments[0].1, -1);
    }
}

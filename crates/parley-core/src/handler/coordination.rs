// Peer-to-peer coordination handlers: election probes and clock sync

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use parley_api::{
    Message, ServiceTag,
    remote::model::{ClockAdjustRequest, ClockResponse, ElectionRequest, StatusResponse},
};
use parley_common::ParleyError;

use super::rpc::{HandlerRegistry, PayloadHandler, reply};
use crate::service::{clock_sync::ClockSync, election::Election, logical_clock::LogicalClock};

/// Answers `election` probes with OK and takes over in the background
pub struct ElectionHandler {
    pub election: Arc<Election>,
}

#[async_trait]
impl PayloadHandler for ElectionHandler {
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
        let probe: ElectionRequest = request.data_as()?;
        reply(&self.election.handle_probe(&probe))
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Election
    }
}

/// Returns this peer's adjusted wall clock
pub struct ClockHandler {
    pub clock_sync: Arc<ClockSync>,
}

#[async_trait]
impl PayloadHandler for ClockHandler {
    async fn handle(&self, _request: &Message) -> Result<Value, ParleyError> {
        reply(&ClockResponse {
            time: self.clock_sync.adjusted_now_ms(),
        })
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Clock
    }
}

/// Applies a correction sent by the coordinator
pub struct ClockAdjustHandler {
    pub clock_sync: Arc<ClockSync>,
}

#[async_trait]
impl PayloadHandler for ClockAdjustHandler {
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
        let adjust: ClockAdjustRequest = request.data_as()?;
        self.clock_sync.apply_adjustment(adjust.adjust);
        reply(&StatusResponse::ok())
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::ClockAdjust
    }
}

/// Handler registry serving a peer's coordination endpoint
pub fn coordination_handlers(
    election: Arc<Election>,
    clock_sync: Arc<ClockSync>,
    clock: Arc<LogicalClock>,
) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new(clock);
    handlers.register_handler(Arc::new(ElectionHandler { election }));
    handlers.register_handler(Arc::new(ClockHandler {
        clock_sync: clock_sync.clone(),
    }));
    handlers.register_handler(Arc::new(ClockAdjustHandler { clock_sync }));
    handlers
}

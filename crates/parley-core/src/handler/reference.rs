// Reference service handlers: rank, heartbeat and list

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use parley_api::{
    Message, ServiceTag,
    remote::model::{
        ListResponse, RankResponse, RegistrationRequest, STATUS_OK, STATUS_UNKNOWN,
        StatusResponse,
    },
};
use parley_common::ParleyError;

use super::rpc::{HandlerRegistry, PayloadHandler, reply};
use crate::service::{logical_clock::LogicalClock, registry::ReferenceRegistry};

pub struct RankHandler {
    pub registry: Arc<ReferenceRegistry>,
}

#[async_trait]
impl PayloadHandler for RankHandler {
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
        let registration: RegistrationRequest = request.data_as()?;
        let rank = self.registry.register(&registration.identity())?;
        reply(&RankResponse { rank })
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Rank
    }
}

pub struct HeartbeatHandler {
    pub registry: Arc<ReferenceRegistry>,
}

#[async_trait]
impl PayloadHandler for HeartbeatHandler {
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
        let registration: RegistrationRequest = request.data_as()?;
        let status = if self.registry.heartbeat(&registration.identity()) {
            STATUS_OK
        } else {
            STATUS_UNKNOWN
        };
        reply(&StatusResponse {
            status: status.to_string(),
        })
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Heartbeat
    }
}

pub struct ListHandler {
    pub registry: Arc<ReferenceRegistry>,
}

#[async_trait]
impl PayloadHandler for ListHandler {
    async fn handle(&self, _request: &Message) -> Result<Value, ParleyError> {
        reply(&ListResponse {
            list: self.registry.list(),
        })
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::List
    }
}

/// Handler registry serving the reference service endpoint
pub fn reference_handlers(
    registry: Arc<ReferenceRegistry>,
    clock: Arc<LogicalClock>,
) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new(clock);
    handlers.register_handler(Arc::new(RankHandler {
        registry: registry.clone(),
    }));
    handlers.register_handler(Arc::new(HeartbeatHandler {
        registry: registry.clone(),
    }));
    handlers.register_handler(Arc::new(ListHandler { registry }));
    handlers
}

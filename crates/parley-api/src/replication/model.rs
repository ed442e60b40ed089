//! Replicated operation models
//!
//! A replicated operation travels on the `replication` topic as
//! `{"service": "replication", "data": {operation, operationData, originId, incarnation, timestamp, clock}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_common::{ParleyError, now_secs_f64};

use crate::{
    domain::{ChannelRecord, PrivateMessageRecord, PublicationRecord, UserRecord},
    model::{ClockValue, PeerIdentity},
    remote::model::{Message, ServiceTag},
};

/// Kind of a replicated mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Login,
    Channel,
    Publish,
    Message,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Login => write!(f, "login"),
            OperationKind::Channel => write!(f, "channel"),
            OperationKind::Publish => write!(f, "publish"),
            OperationKind::Message => write!(f, "message"),
        }
    }
}

/// A decoded, kind-specific mutation
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Login(UserRecord),
    Channel(ChannelRecord),
    Publish(PublicationRecord),
    Message(PrivateMessageRecord),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Login(_) => OperationKind::Login,
            Operation::Channel(_) => OperationKind::Channel,
            Operation::Publish(_) => OperationKind::Publish,
            Operation::Message(_) => OperationKind::Message,
        }
    }

    fn to_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Operation::Login(r) => serde_json::to_value(r),
            Operation::Channel(r) => serde_json::to_value(r),
            Operation::Publish(r) => serde_json::to_value(r),
            Operation::Message(r) => serde_json::to_value(r),
        }
    }
}

/// Identity of one replicated operation
///
/// The origin's logical clock restarts at zero with every process, so the
/// clock is only unique together with the origin's incarnation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperationId {
    pub origin: String,
    pub incarnation: String,
    pub clock: ClockValue,
}

/// Replication envelope body
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedOperation {
    pub operation: OperationKind,
    pub operation_data: Value,
    pub origin_id: PeerIdentity,
    /// Process instance of the origin peer
    #[serde(default)]
    pub incarnation: String,
    #[serde(default)]
    pub timestamp: f64,
    pub clock: ClockValue,
}

impl ReplicatedOperation {
    pub fn new(
        operation: &Operation,
        origin_id: PeerIdentity,
        clock: ClockValue,
    ) -> Result<Self, ParleyError> {
        Ok(Self {
            operation: operation.kind(),
            operation_data: operation
                .to_data()
                .map_err(|e| ParleyError::Decode(e.to_string()))?,
            origin_id,
            incarnation: String::new(),
            timestamp: now_secs_f64(),
            clock,
        })
    }

    pub fn with_incarnation(mut self, incarnation: impl Into<String>) -> Self {
        self.incarnation = incarnation.into();
        self
    }

    pub fn id(&self) -> OperationId {
        OperationId {
            origin: self.origin_id.id.clone(),
            incarnation: self.incarnation.clone(),
            clock: self.clock,
        }
    }

    /// Decode `operationData` according to `operation`
    pub fn decode_operation(&self) -> Result<Operation, ParleyError> {
        let data = self.operation_data.clone();
        let decoded = match self.operation {
            OperationKind::Login => serde_json::from_value(data).map(Operation::Login),
            OperationKind::Channel => serde_json::from_value(data).map(Operation::Channel),
            OperationKind::Publish => serde_json::from_value(data).map(Operation::Publish),
            OperationKind::Message => serde_json::from_value(data).map(Operation::Message),
        };
        decoded.map_err(|e| ParleyError::Decode(format!("{} operation: {}", self.operation, e)))
    }

    pub fn to_message(&self) -> Result<Message, ParleyError> {
        Message::new(ServiceTag::Replication, self, self.clock)
    }

    pub fn from_message(message: &Message) -> Result<Self, ParleyError> {
        if message.tag() != Some(ServiceTag::Replication) {
            return Err(ParleyError::IllegalArgument(format!(
                "expected replication message, got '{}'",
                message.service
            )));
        }
        message.data_as()
    }
}

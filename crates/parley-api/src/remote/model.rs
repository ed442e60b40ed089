//! Request/reply envelope and coordination payloads
//!
//! Every message on the wire is `{"service": <tag>, "data": {..., "clock": n}}`.
//! The payload structs below describe the `data` object of each service.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use parley_common::{ParleyError, now_secs_f64};

use crate::model::{ClockValue, PeerIdentity, RankedPeer};

pub const CLOCK_FIELD: &str = "clock";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const STATUS_FIELD: &str = "status";

pub const STATUS_OK: &str = "OK";
pub const STATUS_SUCCESS: &str = "sucesso";
pub const STATUS_ERROR: &str = "erro";
pub const STATUS_UNKNOWN: &str = "unknown";

/// Affirmative reply to an election probe
pub const ELECTION_OK: &str = "OK";

/// Service tags understood by peers, the reference service and clients
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceTag {
    Rank,
    Heartbeat,
    List,
    Election,
    Clock,
    ClockAdjust,
    Replication,
    Login,
    Users,
    Channel,
    Channels,
    Publish,
    Message,
}

impl ServiceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceTag::Rank => "rank",
            ServiceTag::Heartbeat => "heartbeat",
            ServiceTag::List => "list",
            ServiceTag::Election => "election",
            ServiceTag::Clock => "clock",
            ServiceTag::ClockAdjust => "clockAdjust",
            ServiceTag::Replication => "replication",
            ServiceTag::Login => "login",
            ServiceTag::Users => "users",
            ServiceTag::Channel => "channel",
            ServiceTag::Channels => "channels",
            ServiceTag::Publish => "publish",
            ServiceTag::Message => "message",
        }
    }

    /// Parse a tag, accepting the legacy client aliases
    pub fn parse(tag: &str) -> Option<Self> {
        let service = match tag {
            "rank" => ServiceTag::Rank,
            "heartbeat" => ServiceTag::Heartbeat,
            "list" => ServiceTag::List,
            "election" => ServiceTag::Election,
            "clock" => ServiceTag::Clock,
            "clockAdjust" => ServiceTag::ClockAdjust,
            "replication" => ServiceTag::Replication,
            "login" => ServiceTag::Login,
            "users" | "listar" => ServiceTag::Users,
            "channel" | "cadastrarCanal" => ServiceTag::Channel,
            "channels" | "listarCanal" => ServiceTag::Channels,
            "publish" => ServiceTag::Publish,
            "message" => ServiceTag::Message,
            _ => return None,
        };
        Some(service)
    }
}

impl std::fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ServiceTag {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceTag::parse(s)
            .ok_or_else(|| ParleyError::IllegalArgument(format!("unknown service '{}'", s)))
    }
}

/// Message envelope
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub service: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Message {
    /// Build a message from a payload that serializes to a JSON object.
    ///
    /// The logical clock is always written; the wall-clock timestamp only
    /// when the payload does not carry one already.
    pub fn new<T: Serialize>(
        service: ServiceTag,
        payload: &T,
        clock: ClockValue,
    ) -> Result<Self, ParleyError> {
        Self::with_tag(service.as_str(), payload, clock)
    }

    pub fn with_tag<T: Serialize>(
        service: &str,
        payload: &T,
        clock: ClockValue,
    ) -> Result<Self, ParleyError> {
        let data = match serde_json::to_value(payload)
            .map_err(|e| ParleyError::Decode(e.to_string()))?
        {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ParleyError::IllegalArgument(format!(
                    "payload for '{}' is not an object: {}",
                    service, other
                )));
            }
        };

        let mut message = Self {
            service: service.to_string(),
            data,
        };
        message
            .data
            .entry(TIMESTAMP_FIELD)
            .or_insert_with(|| Value::from(now_secs_f64()));
        message.data.insert(CLOCK_FIELD.to_string(), Value::from(clock));
        Ok(message)
    }

    /// Explicit error reply
    pub fn error(service: &str, description: &str, clock: ClockValue) -> Self {
        let mut data = Map::new();
        data.insert(STATUS_FIELD.to_string(), Value::from(STATUS_ERROR));
        data.insert("description".to_string(), Value::from(description));
        data.insert(TIMESTAMP_FIELD.to_string(), Value::from(now_secs_f64()));
        data.insert(CLOCK_FIELD.to_string(), Value::from(clock));
        Self {
            service: if service.is_empty() {
                "unknown".to_string()
            } else {
                service.to_string()
            },
            data,
        }
    }

    pub fn tag(&self) -> Option<ServiceTag> {
        ServiceTag::parse(&self.service)
    }

    /// Logical clock carried by the sender, if any
    pub fn clock(&self) -> Option<ClockValue> {
        self.data.get(CLOCK_FIELD).and_then(Value::as_u64)
    }

    pub fn status(&self) -> Option<&str> {
        self.data.get(STATUS_FIELD).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.status() == Some(STATUS_ERROR)
    }

    /// Decode the `data` object into a typed payload
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ParleyError> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| ParleyError::Decode(format!("{} payload: {}", self.service, e)))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParleyError> {
        serde_json::to_vec(self).map_err(|e| ParleyError::Decode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParleyError> {
        serde_json::from_slice(bytes).map_err(|e| ParleyError::Decode(e.to_string()))
    }
}

// ===================== Reference service payloads =====================

/// `rank` and `heartbeat` request body
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Peer display name (the original protocol calls it `user`)
    pub user: String,
    pub id: String,
}

impl RegistrationRequest {
    pub fn from_identity(identity: &PeerIdentity) -> Self {
        Self {
            user: identity.name.clone(),
            id: identity.id.clone(),
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.user.clone(), self.id.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RankResponse {
    pub rank: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub list: Vec<RankedPeer>,
}

/// Empty request body
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyPayload {}

// ===================== Peer-to-peer payloads =====================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectionRequest {
    pub candidate: PeerIdentity,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectionResponse {
    pub election: String,
}

impl ElectionResponse {
    pub fn ok() -> Self {
        Self {
            election: ELECTION_OK.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.election == ELECTION_OK
    }
}

/// Reply to a `clock` sample: adjusted wall clock in milliseconds
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockResponse {
    pub time: i64,
}

/// `clockAdjust` request: signed correction in milliseconds
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockAdjustRequest {
    pub adjust: i64,
}

/// Coordinator announcement published on the `servers` topic
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorAnnouncement {
    pub coordinator: PeerIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
}

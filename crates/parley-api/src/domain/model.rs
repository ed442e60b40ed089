//! Domain records
//!
//! These are both the request bodies of the client services and the
//! payloads of replicated operations.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user: String,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    #[serde(alias = "canal")]
    pub channel: String,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub user: String,
    pub channel: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivateMessageRecord {
    pub src: String,
    pub dst: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: f64,
}

/// Delivery broadcast to subscribers of a channel (topic = channel name)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    pub user: String,
    pub channel: String,
    pub message: String,
    pub timestamp: f64,
}

impl From<&PublicationRecord> for ChannelDelivery {
    fn from(record: &PublicationRecord) -> Self {
        Self {
            kind: "channel".to_string(),
            topic: record.channel.clone(),
            user: record.user.clone(),
            channel: record.channel.clone(),
            message: record.message.clone(),
            timestamp: record.timestamp,
        }
    }
}

/// Delivery broadcast to a single user (topic = destination user)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDelivery {
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    pub src: String,
    pub dst: String,
    pub message: String,
    pub timestamp: f64,
}

impl From<&PrivateMessageRecord> for UserDelivery {
    fn from(record: &PrivateMessageRecord) -> Self {
        Self {
            kind: "user".to_string(),
            topic: record.dst.clone(),
            src: record.src.clone(),
            dst: record.dst.clone(),
            message: record.message.clone(),
            timestamp: record.timestamp,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsersResponse {
    pub users: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelsResponse {
    pub channels: Vec<String>,
}

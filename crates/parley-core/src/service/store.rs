// In-memory domain store: users, channels, publications and private messages
// Users and channels are keyed by name; publications and messages are append-only

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use parley_api::{
    domain::{ChannelRecord, PrivateMessageRecord, PublicationRecord, UserRecord},
    replication::Operation,
};
use parley_common::{ParleyError, TOPIC_REPLICATION, TOPIC_SERVERS, is_valid_name};

use super::{
    persistence::{SnapshotNotifier, StoreSnapshot},
    replication::{ApplyEffect, ReplicationApplier},
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("channel already exists: {0}")]
    ChannelExists(String),

    #[error("channel does not exist: {0}")]
    ChannelNotFound(String),

    #[error("user does not exist: {0}")]
    UserNotFound(String),

    #[error("channel name is reserved: {0}")]
    ReservedChannel(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl From<StoreError> for ParleyError {
    fn from(e: StoreError) -> Self {
        ParleyError::IllegalArgument(e.to_string())
    }
}

fn validate_name(field: &'static str, name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::MissingField(field));
    }
    if !is_valid_name(name) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub struct DomainStore {
    users: RwLock<BTreeMap<String, UserRecord>>,
    channels: RwLock<BTreeMap<String, ChannelRecord>>,
    publications: RwLock<Vec<PublicationRecord>>,
    messages: RwLock<Vec<PrivateMessageRecord>>,
    notifier: Option<SnapshotNotifier>,
}

impl DomainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a store from a snapshot
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        *store.users.write() = snapshot
            .users
            .into_iter()
            .map(|u| (u.user.clone(), u))
            .collect();
        *store.channels.write() = snapshot
            .channels
            .into_iter()
            .map(|c| (c.channel.clone(), c))
            .collect();
        *store.publications.write() = snapshot.publications;
        *store.messages.write() = snapshot.messages;
        store
    }

    /// Notify `notifier` after every mutation
    pub fn with_notifier(mut self, notifier: SnapshotNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn changed(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.notify();
        }
    }

    pub fn add_user(&self, record: UserRecord) -> Result<(), StoreError> {
        validate_name("user", &record.user)?;
        {
            let mut users = self.users.write();
            if users.contains_key(&record.user) {
                return Err(StoreError::UserExists(record.user));
            }
            users.insert(record.user.clone(), record);
        }
        self.changed();
        Ok(())
    }

    pub fn add_channel(&self, record: ChannelRecord) -> Result<(), StoreError> {
        validate_name("channel", &record.channel)?;
        if record.channel == TOPIC_SERVERS || record.channel == TOPIC_REPLICATION {
            return Err(StoreError::ReservedChannel(record.channel));
        }
        {
            let mut channels = self.channels.write();
            if channels.contains_key(&record.channel) {
                return Err(StoreError::ChannelExists(record.channel));
            }
            channels.insert(record.channel.clone(), record);
        }
        self.changed();
        Ok(())
    }

    /// Append a publication to an existing channel
    pub fn add_publication(&self, record: PublicationRecord) -> Result<(), StoreError> {
        if record.channel.is_empty() {
            return Err(StoreError::MissingField("channel"));
        }
        if !self.has_channel(&record.channel) {
            return Err(StoreError::ChannelNotFound(record.channel));
        }
        self.publications.write().push(record);
        self.changed();
        Ok(())
    }

    /// Append a private message to an existing user
    pub fn add_message(&self, record: PrivateMessageRecord) -> Result<(), StoreError> {
        if record.dst.is_empty() {
            return Err(StoreError::MissingField("dst"));
        }
        if !self.has_user(&record.dst) {
            return Err(StoreError::UserNotFound(record.dst));
        }
        self.messages.write().push(record);
        self.changed();
        Ok(())
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.users.read().contains_key(user)
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.read().contains_key(channel)
    }

    pub fn users(&self) -> Vec<String> {
        self.users.read().keys().cloned().collect()
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn publications(&self) -> Vec<PublicationRecord> {
        self.publications.read().clone()
    }

    pub fn messages(&self) -> Vec<PrivateMessageRecord> {
        self.messages.read().clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            users: self.users.read().values().cloned().collect(),
            channels: self.channels.read().values().cloned().collect(),
            publications: self.publications(),
            messages: self.messages(),
        }
    }

    /// Append a record unless an identical one is already stored
    fn append_unique<T: PartialEq + Clone>(list: &RwLock<Vec<T>>, record: &T) -> bool {
        let mut list = list.write();
        if list.iter().any(|existing| existing == record) {
            return false;
        }
        list.push(record.clone());
        true
    }
}

// Replicated publications and messages skip the channel/user precondition:
// the target may have been created on another origin whose broadcast arrives later.
#[async_trait]
impl ReplicationApplier for DomainStore {
    async fn apply_operation(&self, operation: &Operation) -> Result<ApplyEffect, ParleyError> {
        let applied = match operation {
            Operation::Login(record) => match self.add_user(record.clone()) {
                Err(StoreError::UserExists(_)) => false,
                other => other.map(|_| true)?,
            },
            Operation::Channel(record) => match self.add_channel(record.clone()) {
                Err(StoreError::ChannelExists(_)) => false,
                other => other.map(|_| true)?,
            },
            Operation::Publish(record) => {
                if record.channel.is_empty() {
                    return Err(StoreError::MissingField("channel").into());
                }
                if !self.has_channel(&record.channel) {
                    debug!("Replicated publication for unknown channel {}", record.channel);
                }
                let appended = Self::append_unique(&self.publications, record);
                if appended {
                    self.changed();
                }
                appended
            }
            Operation::Message(record) => {
                if record.dst.is_empty() {
                    return Err(StoreError::MissingField("dst").into());
                }
                let appended = Self::append_unique(&self.messages, record);
                if appended {
                    self.changed();
                }
                appended
            }
        };

        Ok(if applied {
            ApplyEffect::Applied
        } else {
            ApplyEffect::AlreadyPresent
        })
    }
}

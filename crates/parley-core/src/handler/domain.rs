//! Client-facing domain handlers
//!
//! | service (aliases)            | replicated |
//! |------------------------------|------------|
//! | `login`                      | yes        |
//! | `users` (`listar`)           | no         |
//! | `channel` (`cadastrarCanal`) | yes        |
//! | `channels` (`listarCanal`)   | no         |
//! | `publish`                    | yes        |
//! | `message`                    | yes        |
//!
//! Mutating handlers commit to the local [`DomainStore`] first and hand the
//! mutation to the [`Replicator`] afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use parley_api::{
    Message, ServiceTag,
    domain::{
        ChannelDelivery, ChannelRecord, ChannelsResponse, PrivateMessageRecord,
        PublicationRecord, UserDelivery, UserRecord, UsersResponse,
    },
    remote::model::{CLOCK_FIELD, STATUS_OK, STATUS_SUCCESS, StatusResponse},
    replication::Operation,
};
use parley_common::{ParleyError, now_secs_f64};

use super::rpc::{HandlerRegistry, PayloadHandler, reply};
use crate::service::{
    client::PeerClient, logical_clock::LogicalClock, replication::Replicator, store::DomainStore,
};

/// Shared state of the domain handlers
#[derive(Clone)]
pub struct DomainContext {
    pub store: Arc<DomainStore>,
    pub replicator: Arc<Replicator>,
    pub client: Arc<PeerClient>,
}

impl DomainContext {
    /// Broadcast a delivery to the subscribers of `topic`
    async fn deliver<T: Serialize>(&self, topic: &str, delivery: &T) {
        let mut value = match serde_json::to_value(delivery) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode delivery for {}: {}", topic, e);
                return;
            }
        };
        if let Value::Object(map) = &mut value {
            map.insert(
                CLOCK_FIELD.to_string(),
                Value::from(self.client.clock().tick()),
            );
        }

        let payload = match serde_json::to_vec(&value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode delivery for {}: {}", topic, e);
                return;
            }
        };
        if let Err(e) = self.client.transport().publish(topic, payload).await {
            warn!("Failed to deliver on {}: {}", topic, e);
        }
    }
}

fn stamp(timestamp: f64) -> f64 {
    if timestamp > 0.0 { timestamp } else { now_secs_f64() }
}

fn status(status: &str) -> Result<Value, ParleyError> {
    reply(&StatusResponse {
        status: status.to_string(),
    })
}

pub struct LoginHandler {
    pub context: DomainContext,
}

#[async_trait]
impl PayloadHandler for LoginHandler {
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
        let mut record: UserRecord = request.data_as()?;
        record.timestamp = stamp(record.timestamp);

        self.context.store.add_user(record.clone())?;
        info!("Login: {}", record.user);
        self.context
            .replicator
            .propagate(&Operation::Login(record))
            .await;
        status(STATUS_SUCCESS)
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Login
    }
}

pub struct UsersHandler {
    pub context: DomainContext,
}

#[async_trait]
impl PayloadHandler for UsersHandler {
    async fn handle(&self, _request: &Message) -> Result<Value, ParleyError> {
        reply(&UsersResponse {
            users: self.context.store.users(),
        })
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Users
    }
}

pub struct ChannelHandler {
    pub context: DomainContext,
}

#[async_trait]
impl PayloadHandler for ChannelHandler {
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
        let mut record: ChannelRecord = request.data_as()?;
        record.timestamp = stamp(record.timestamp);

        self.context.store.add_channel(record.clone())?;
        info!("Channel created: {}", record.channel);
        self.context
            .replicator
            .propagate(&Operation::Channel(record))
            .await;
        status(STATUS_SUCCESS)
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Channel
    }
}

pub struct ChannelsHandler {
    pub context: DomainContext,
}

#[async_trait]
impl PayloadHandler for ChannelsHandler {
    async fn handle(&self, _request: &Message) -> Result<Value, ParleyError> {
        reply(&ChannelsResponse {
            channels: self.context.store.channels(),
        })
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Channels
    }
}

pub struct PublishHandler {
    pub context: DomainContext,
}

#[async_trait]
impl PayloadHandler for PublishHandler {
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
        let mut record: PublicationRecord = request.data_as()?;
        record.timestamp = stamp(record.timestamp);

        self.context.store.add_publication(record.clone())?;
        self.context
            .deliver(&record.channel, &ChannelDelivery::from(&record))
            .await;
        info!("Published on {} by {}", record.channel, record.user);
        self.context
            .replicator
            .propagate(&Operation::Publish(record))
            .await;
        status(STATUS_OK)
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Publish
    }
}

pub struct MessageHandler {
    pub context: DomainContext,
}

#[async_trait]
impl PayloadHandler for MessageHandler {
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
        let mut record: PrivateMessageRecord = request.data_as()?;
        record.timestamp = stamp(record.timestamp);

        self.context.store.add_message(record.clone())?;
        self.context
            .deliver(&record.dst, &UserDelivery::from(&record))
            .await;
        info!("Message: {} -> {}", record.src, record.dst);
        self.context
            .replicator
            .propagate(&Operation::Message(record))
            .await;
        status(STATUS_OK)
    }

    fn can_handle(&self) -> ServiceTag {
        ServiceTag::Message
    }
}

/// Handler registry serving a peer's domain endpoint
pub fn domain_handlers(context: DomainContext, clock: Arc<LogicalClock>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new(clock);
    handlers.register_handler(Arc::new(LoginHandler {
        context: context.clone(),
    }));
    handlers.register_handler(Arc::new(UsersHandler {
        context: context.clone(),
    }));
    handlers.register_handler(Arc::new(ChannelHandler {
        context: context.clone(),
    }));
    handlers.register_handler(Arc::new(ChannelsHandler {
        context: context.clone(),
    }));
    handlers.register_handler(Arc::new(PublishHandler {
        context: context.clone(),
    }));
    handlers.register_handler(Arc::new(MessageHandler { context }));
    handlers
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::service::{memory::MemoryNetwork, replication::ReplicationConfig, transport::PeerTransport};
    use parley_api::PeerIdentity;

    struct Fixture {
        handlers: HandlerRegistry,
        store: Arc<DomainStore>,
        replicator: Arc<Replicator>,
        network: Arc<MemoryNetwork>,
    }

    fn fixture() -> Fixture {
        let network = MemoryNetwork::new();
        let clock = Arc::new(LogicalClock::new());
        let client = Arc::new(PeerClient::new(network.transport(), clock.clone()));
        let store = Arc::new(DomainStore::new());
        let replicator = Arc::new(Replicator::new(
            PeerIdentity::new("s1", "s1:1"),
            ReplicationConfig::default(),
            client.clone(),
            store.clone(),
        ));
        let context = DomainContext {
            store: store.clone(),
            replicator: replicator.clone(),
            client,
        };
        Fixture {
            handlers: domain_handlers(context, clock),
            store,
            replicator,
            network,
        }
    }

    async fn call(fixture: &Fixture, service: &str, data: Value) -> Message {
        let request = Message::with_tag(service, &data, 1).unwrap();
        fixture.handlers.dispatch_message(&request).await
    }

    #[tokio::test]
    async fn test_login_then_duplicate() {
        let f = fixture();
        let reply = call(&f, "login", json!({"user": "ana"})).await;
        assert_eq!(reply.status(), Some(STATUS_SUCCESS));

        let reply = call(&f, "login", json!({"user": "ana"})).await;
        assert!(reply.is_error());
        assert_eq!(reply.data["description"], "user already exists: ana");

        assert_eq!(f.replicator.propagated_count(), 1);
        assert!(f.store.has_user("ana"));
    }

    #[tokio::test]
    async fn test_aliases_reply_with_canonical_service() {
        let f = fixture();
        call(&f, "cadastrarCanal", json!({"canal": "geral"})).await;

        let reply = call(&f, "listarCanal", json!({})).await;
        assert_eq!(reply.service, "channels");
        let channels: ChannelsResponse = reply.data_as().unwrap();
        assert_eq!(channels.channels, vec!["geral".to_string()]);

        let reply = call(&f, "listar", json!({})).await;
        assert_eq!(reply.service, "users");
    }

    #[tokio::test]
    async fn test_publish_delivers_on_channel_topic() {
        let f = fixture();
        let mut subscriber = f
            .network
            .transport()
            .subscribe(&["geral"])
            .await
            .unwrap();

        let reply = call(&f, "publish", json!({"user": "ana", "channel": "geral", "message": "oi"})).await;
        assert!(reply.is_error());

        call(&f, "channel", json!({"channel": "geral"})).await;
        let reply = call(&f, "publish", json!({"user": "ana", "channel": "geral", "message": "oi"})).await;
        assert_eq!(reply.status(), Some(STATUS_OK));

        let delivery = tokio::time::timeout(Duration::from_secs(1), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        let body: Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(body["type"], "channel");
        assert_eq!(body["message"], "oi");
        assert_eq!(f.store.publications().len(), 1);
    }

    #[tokio::test]
    async fn test_each_delivery_is_a_clock_event() {
        let network = MemoryNetwork::new();
        let clock = Arc::new(LogicalClock::new());
        let client = Arc::new(PeerClient::new(network.transport(), clock.clone()));
        let store = Arc::new(DomainStore::new());
        let context = DomainContext {
            store: store.clone(),
            replicator: Arc::new(Replicator::new(
                PeerIdentity::new("s1", "s1:1"),
                ReplicationConfig::default(),
                client.clone(),
                store,
            )),
            client,
        };
        let mut subscriber = network.transport().subscribe(&["geral"]).await.unwrap();
        let before = clock.tick();

        context.deliver("geral", &json!({"message": "a"})).await;
        context.deliver("geral", &json!({"message": "b"})).await;

        let mut clocks = Vec::new();
        for _ in 0..2 {
            let delivery = tokio::time::timeout(Duration::from_secs(1), subscriber.recv())
                .await
                .unwrap()
                .unwrap();
            let body: Value = serde_json::from_slice(&delivery.payload).unwrap();
            clocks.push(body[CLOCK_FIELD].as_u64().unwrap());
        }
        assert!(clocks[0] > before);
        assert!(clocks[1] > clocks[0]);
        assert_eq!(clock.current(), clocks[1]);
    }

    #[tokio::test]
    async fn test_message_requires_known_destination() {
        let f = fixture();
        let reply = call(&f, "message", json!({"src": "ana", "dst": "bia", "message": "oi"})).await;
        assert!(reply.is_error());

        call(&f, "login", json!({"user": "bia"})).await;
        let reply = call(&f, "message", json!({"src": "ana", "dst": "bia", "message": "oi"})).await;
        assert_eq!(reply.status(), Some(STATUS_OK));
        assert_eq!(f.store.messages()[0].dst, "bia");
    }

    #[tokio::test]
    async fn test_missing_field_is_an_error() {
        let f = fixture();
        let reply = call(&f, "login", json!({})).await;
        assert!(reply.is_error());
        assert_eq!(f.replicator.propagated_count(), 0);
    }
}

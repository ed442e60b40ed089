// Request handler infrastructure
// Every request/reply endpoint is served by a HandlerRegistry that decodes the
// envelope, merges the sender's logical clock, routes on the service tag and
// stamps the reply with a fresh tick.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use parley_api::{Message, ServiceTag};
use parley_common::ParleyError;

use crate::service::{logical_clock::LogicalClock, transport::InboundRequest};

pub const SERVICE_NOT_FOUND: &str = "service not found";

/// Handler of one service tag
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    /// Handle a decoded request and return the reply's `data` object
    async fn handle(&self, request: &Message) -> Result<Value, ParleyError>;

    fn can_handle(&self) -> ServiceTag;
}

/// Serialize a typed reply payload
pub fn reply<T: serde::Serialize>(payload: &T) -> Result<Value, ParleyError> {
    serde_json::to_value(payload).map_err(|e| ParleyError::Internal(e.to_string()))
}

fn describe(error: &ParleyError) -> String {
    match error {
        ParleyError::IllegalArgument(message) => message.clone(),
        other => other.to_string(),
    }
}

pub struct HandlerRegistry {
    handlers: HashMap<ServiceTag, Arc<dyn PayloadHandler>>,
    clock: Arc<LogicalClock>,
}

impl HandlerRegistry {
    pub fn new(clock: Arc<LogicalClock>) -> Self {
        Self {
            handlers: HashMap::new(),
            clock,
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn PayloadHandler>) {
        let service = handler.can_handle();
        info!(service = %service, "Registering handler for service '{}'", service);
        self.handlers.insert(service, handler);
    }

    pub fn get_handler(&self, service: ServiceTag) -> Option<Arc<dyn PayloadHandler>> {
        self.handlers.get(&service).cloned()
    }

    pub fn can_handle(&self, service: ServiceTag) -> bool {
        self.handlers.contains_key(&service)
    }

    /// Serve one raw request and return the raw reply
    pub async fn dispatch(&self, payload: &[u8]) -> Vec<u8> {
        let reply = match Message::decode(payload) {
            Ok(request) => self.dispatch_message(&request).await,
            Err(e) => {
                warn!("Malformed request: {}", e);
                Message::error("", &format!("malformed request: {}", e), self.clock.tick())
            }
        };

        reply.encode().unwrap_or_else(|e| {
            warn!("Failed to encode reply: {}", e);
            Message::error(&reply.service, "internal error", self.clock.tick())
                .encode()
                .unwrap_or_default()
        })
    }

    /// Serve one decoded request
    pub async fn dispatch_message(&self, request: &Message) -> Message {
        if let Some(remote) = request.clock() {
            self.clock.observe(remote);
        }

        let Some(handler) = request.tag().and_then(|tag| self.get_handler(tag)) else {
            debug!("No handler for service '{}'", request.service);
            return Message::error(&request.service, SERVICE_NOT_FOUND, self.clock.tick());
        };

        let service = handler.can_handle();
        let result = handler
            .handle(request)
            .await
            .and_then(|data| Message::with_tag(service.as_str(), &data, self.clock.tick()));

        match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!("{} request failed: {}", service, e);
                Message::error(service.as_str(), &describe(&e), self.clock.tick())
            }
        }
    }
}

/// Serve every request arriving on `inbox`, one task per request
pub fn spawn_request_loop(
    registry: Arc<HandlerRegistry>,
    mut inbox: mpsc::Receiver<InboundRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = inbox.recv().await {
            let registry = registry.clone();
            tokio::spawn(async move {
                let reply = registry.dispatch(&request.payload).await;
                request.respond(reply);
            });
        }
        debug!("Request loop finished");
    })
}

#[cfg(test)]
mod tests {
    use parley_api::remote::model::{ClockAdjustRequest, StatusResponse};

    use super::*;

    struct AdjustHandler;

    #[async_trait]
    impl PayloadHandler for AdjustHandler {
        async fn handle(&self, request: &Message) -> Result<Value, ParleyError> {
            let adjust: ClockAdjustRequest = request.data_as()?;
            if adjust.adjust > 1000 {
                return Err(ParleyError::IllegalArgument("too large".to_string()));
            }
            reply(&StatusResponse::ok())
        }

        fn can_handle(&self) -> ServiceTag {
            ServiceTag::ClockAdjust
        }
    }

    fn registry() -> (HandlerRegistry, Arc<LogicalClock>) {
        let clock = Arc::new(LogicalClock::new());
        let mut registry = HandlerRegistry::new(clock.clone());
        registry.register_handler(Arc::new(AdjustHandler));
        (registry, clock)
    }

    fn request(adjust: i64, clock: u64) -> Vec<u8> {
        Message::new(ServiceTag::ClockAdjust, &ClockAdjustRequest { adjust }, clock)
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_observes_and_ticks() {
        let (registry, clock) = registry();
        let reply = Message::decode(&registry.dispatch(&request(5, 20)).await).unwrap();

        assert_eq!(reply.service, "clockAdjust");
        assert_eq!(reply.status(), Some("OK"));
        // observe(20) = 21, reply tick = 22
        assert_eq!(reply.clock(), Some(22));
        assert_eq!(clock.current(), 22);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let (registry, _) = registry();
        let reply = Message::decode(&registry.dispatch(&request(5000, 1)).await).unwrap();
        assert!(reply.is_error());
        assert_eq!(reply.data["description"], "too large");
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let (registry, _) = registry();
        let payload = br#"{"service":"teleport","data":{"clock":3}}"#;
        let reply = Message::decode(&registry.dispatch(payload).await).unwrap();
        assert_eq!(reply.service, "teleport");
        assert_eq!(reply.data["description"], SERVICE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_reply() {
        let (registry, _) = registry();
        let reply = Message::decode(&registry.dispatch(b"\x00\x01garbage").await).unwrap();
        assert_eq!(reply.service, "unknown");
        assert!(reply.is_error());
    }
}

//! Dispatch of decoded client frames to application handlers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::hub::Hub;
use crate::protocol::{Envelope, MessageType};

/// Application handler for one or more envelope types.
///
/// Called on the sending connection's read task, so handlers should not
/// block.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, hub: &Hub, conn: &Arc<Connection>, envelope: Envelope);
}

impl<F> MessageHandler for F
where
    F: Fn(&Hub, &Arc<Connection>, Envelope) + Send + Sync,
{
    fn handle(&self, hub: &Hub, conn: &Arc<Connection>, envelope: Envelope) {
        self(hub, conn, envelope)
    }
}

/// Maps envelope types to handlers.
#[derive(Default)]
pub struct Router {
    routes: HashMap<MessageType, Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `msg_type` to `handler`, replacing any earlier route.
    pub fn route(mut self, msg_type: MessageType, handler: Arc<dyn MessageHandler>) -> Self {
        self.routes.insert(msg_type, handler);
        self
    }

    /// Handler for types with no route of their own.
    pub fn fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn has_route(&self, msg_type: &MessageType) -> bool {
        self.routes.contains_key(msg_type)
    }

    /// Hand `envelope` to its handler. Unrouted types go to the fallback,
    /// or are logged and dropped.
    pub fn dispatch(&self, hub: &Hub, conn: &Arc<Connection>, envelope: Envelope) {
        let handler = self.routes.get(&envelope.msg_type).or(self.fallback.as_ref());
        match handler {
            Some(handler) => handler.handle(hub, conn, envelope),
            None => log::debug!(
                "No handler for message type {} from user {}",
                envelope.msg_type,
                conn.user_id()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use uuid::Uuid;

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn MessageHandler> {
        Arc::new(move |_: &Hub, _: &Arc<Connection>, envelope: Envelope| {
            log.lock().push(format!("{tag}:{}", envelope.msg_type));
        })
    }

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let (conn, _rx) = Connection::new(Uuid::new_v4(), 4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let router = Router::new()
            .route(MessageType::Typing, recording_handler(seen.clone(), "typing"))
            .route(MessageType::DocUpdate, recording_handler(seen.clone(), "doc"));

        router.dispatch(&hub, &conn, Envelope::new(MessageType::Typing, json!({})));
        router.dispatch(&hub, &conn, Envelope::new(MessageType::DocUpdate, json!({})));

        assert_eq!(*seen.lock(), vec!["typing:typing", "doc:doc_update"]);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_unrouted_goes_to_fallback() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let (conn, _rx) = Connection::new(Uuid::new_v4(), 4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let router = Router::new().fallback(recording_handler(seen.clone(), "fallback"));
        router.dispatch(&hub, &conn, Envelope::new(MessageType::Other("call_offer".into()), json!(null)));

        assert_eq!(*seen.lock(), vec!["fallback:call_offer"]);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_unrouted_without_fallback_is_ignored() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let (conn, _rx) = Connection::new(Uuid::new_v4(), 4);

        let router = Router::new();
        assert!(!router.has_route(&MessageType::Message));
        router.dispatch(&hub, &conn, Envelope::new(MessageType::Message, json!({"text": "hi"})));
        hub.shutdown();
    }
}

// Inbound frame routing shared by the streaming and HTTP paths.

use crate::registry::RequestRegistry;
use crate::session::Session;
use portrpc_core::{reconstruct_objects, InboundMessage};
use portrpc_transport::Frame;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Routes inbound frames from either transport to the request registry or
/// the session's event handlers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<RequestRegistry>,
    session: Arc<Session>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RequestRegistry>, session: Arc<Session>) -> Self {
        Self { registry, session }
    }

    pub fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Text(text) => match InboundMessage::parse(&text) {
                Ok(message) => self.dispatch_message(message),
                Err(e) => warn!("Dropping unparseable message: {}", e),
            },
            Frame::Binary(data) => self.registry.on_binary(data),
        }
    }

    pub fn dispatch_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::Response(response) => self.registry.on_response(response),
            InboundMessage::Error { id, error } => self.registry.on_error_response(&id, &error),
            InboundMessage::ChunkHeader(header) => self.registry.on_chunk_header(header),
            InboundMessage::Event { name, body } => self.dispatch_event(&name, body),
            InboundMessage::Unknown(value) => {
                debug!("Ignoring unrecognised message: {}", value)
            }
        }
    }

    fn dispatch_event(&self, name: &str, body: Map<String, JsonValue>) {
        let ctx = self.session.reconstruct_context();
        match reconstruct_objects(&JsonValue::Object(body), &HashMap::new(), &ctx) {
            Ok(mut event) => {
                let payload = event.take_field("payload");
                let handled = self.session.events().dispatch(name, &payload);
                trace!("Event {} handled by {}", name, handled);
            }
            Err(e) => warn!("Failed to reconstruct payload of event {}: {}", name, e),
        }
    }
}

// Per-client session context. Everything a call needs beyond its arguments
// lives here rather than in globals: portable types, named exceptions, event
// handlers, the method-list cache and the capability epoch.

use crate::error::{RemoteError, GENERIC_ERROR, SESSION_EXPIRED_ERROR};
use crate::profile::{ProfileSink, TracingProfileSink};
use dashmap::{DashMap, DashSet};
use portrpc_core::{
    CapabilityEpoch, MethodCache, ReconstructContext, ServerErrorPayload, TypeRegistry, Value,
};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, trace};

const BUILTIN_EXCEPTIONS: &[&str] = &[
    SESSION_EXPIRED_ERROR,
    "anvil.server.TimeoutError",
    "anvil.server.RuntimeUnavailableError",
    GENERIC_ERROR,
    "anvil.server.PermissionDenied",
];

/// Exception names the client surfaces as-is.
#[derive(Debug)]
pub struct ExceptionRegistry {
    names: DashSet<String>,
}

impl Default for ExceptionRegistry {
    fn default() -> Self {
        let names = DashSet::new();
        for name in BUILTIN_EXCEPTIONS {
            names.insert((*name).to_string());
        }
        Self { names }
    }
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Build the error a caller sees for a server error payload.
    pub fn assemble(&self, payload: &ServerErrorPayload) -> RemoteError {
        match payload.type_name.as_deref() {
            Some(name) if self.is_registered(name) => RemoteError {
                type_name: name.to_string(),
                message: payload.message.clone(),
                registered: true,
                original_type: None,
                trace: payload.trace.clone(),
            },
            other => {
                debug!("Unregistered server exception {:?}", other);
                RemoteError {
                    type_name: GENERIC_ERROR.to_string(),
                    message: payload.message.clone(),
                    registered: false,
                    original_type: other.map(str::to_string),
                    trace: payload.trace.clone(),
                }
            }
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handlers for server-pushed events, by event name.
#[derive(Default)]
pub struct EventHandlers {
    handlers: DashMap<String, Vec<EventHandler>>,
}

impl EventHandlers {
    pub fn on_event<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.handlers
            .entry(name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Run every handler for `name`. Returns how many ran.
    pub fn dispatch(&self, name: &str, payload: &Value) -> usize {
        // Handlers may register more handlers, so run them outside the map lock.
        let handlers = match self.handlers.get(name) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("No handler for event {}", name);
                return 0;
            }
        };
        for handler in &handlers {
            handler(payload);
        }
        trace!("Event {} delivered to {} handlers", name, handlers.len());
        handlers.len()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("events", &self.handlers.len())
            .finish()
    }
}

pub struct Session {
    types: TypeRegistry,
    methods: MethodCache,
    epoch: CapabilityEpoch,
    exceptions: ExceptionRegistry,
    events: EventHandlers,
    profile_sink: RwLock<Arc<dyn ProfileSink>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            types: TypeRegistry::new(),
            methods: MethodCache::new(),
            epoch: CapabilityEpoch::new(),
            exceptions: ExceptionRegistry::new(),
            events: EventHandlers::default(),
            profile_sink: RwLock::new(Arc::new(TracingProfileSink)),
        }
    }
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn methods(&self) -> &MethodCache {
        &self.methods
    }

    pub fn epoch(&self) -> &CapabilityEpoch {
        &self.epoch
    }

    pub fn exceptions(&self) -> &ExceptionRegistry {
        &self.exceptions
    }

    pub fn events(&self) -> &EventHandlers {
        &self.events
    }

    pub fn set_profile_sink(&self, sink: Arc<dyn ProfileSink>) {
        *self.profile_sink.write().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    pub fn profile_sink(&self) -> Arc<dyn ProfileSink> {
        self.profile_sink
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reconstruct_context(&self) -> ReconstructContext<'_> {
        ReconstructContext {
            types: &self.types,
            methods: &self.methods,
            epoch: &self.epoch,
        }
    }

    /// Invalidate every capability issued so far and forget the method lists
    /// the server has seen.
    pub fn reset(&self) {
        let epoch = self.epoch.invalidate_all();
        self.methods.clear();
        info!("Session reset, capability epoch now {}", epoch);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("types", &self.types)
            .field("methods", &self.methods)
            .field("epoch", &self.epoch.current())
            .field("exceptions", &self.exceptions)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portrpc_core::{Capability, TraceFrame};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn payload(type_name: Option<&str>) -> ServerErrorPayload {
        ServerErrorPayload::from_json(&json!({
            "type": type_name,
            "message": "boom",
            "trace": [["server_code/a.py", 3]],
        }))
    }

    #[test]
    fn test_registered_exceptions_keep_their_name() {
        let exceptions = ExceptionRegistry::new();
        exceptions.register("app.Conflict");

        let err = exceptions.assemble(&payload(Some("app.Conflict")));
        assert_eq!(err.original_type, None);
        assert_eq!(err.type_name, "app.Conflict");
        assert!(err.registered);
        assert_eq!(
            err.trace,
            vec![TraceFrame {
                file: "server_code/a.py".into(),
                line: Some(3)
            }]
        );

        let builtin = exceptions.assemble(&payload(Some(SESSION_EXPIRED_ERROR)));
        assert!(builtin.is_session_expired());
    }

    #[test]
    fn test_unregistered_exceptions_become_generic() {
        let exceptions = ExceptionRegistry::new();
        for name in [Some("app.Unknown"), None] {
            let err = exceptions.assemble(&payload(name));
            assert_eq!(err.type_name, GENERIC_ERROR);
            assert!(!err.registered);
            assert_eq!(err.message, "boom");
            assert_eq!(err.original_type.as_deref(), name);
        }
    }

    #[test]
    fn test_events_dispatch_by_name() {
        let events = EventHandlers::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        events.on_event("refresh", move |payload| {
            assert_eq!(payload, &Value::Int(7));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(events.dispatch("refresh", &Value::Int(7)), 1);
        assert_eq!(events.dispatch("other", &Value::None), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_invalidates_capabilities_and_method_lists() {
        let session = Session::new();
        let cap = Capability::new(vec![json!("files")], "mac", vec![], session.epoch());
        session
            .methods()
            .remember("tables.Row", vec!["get".into()]);
        assert!(cap.is_valid());

        session.reset();
        assert!(!cap.is_valid());
        assert!(session.methods().is_empty());
    }
}

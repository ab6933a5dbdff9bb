// portrpc client
// Serializes calls, sends them in registration order over the streaming
// connection (or HTTP once fallen back) and turns responses back into values.

use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::live_object::LiveObjectHandle;
use crate::manager::{ConnectionState, OnlineProbe, SendOutcome, TransportManager};
use crate::registry::RequestRegistry;
use crate::session::Session;
use indexmap::IndexMap;
use portrpc_core::{
    resolve_leaves, serialize_fields, CallEnvelope, CallTarget, Key, KnownLiveObjects,
    LiveObjectCall, LiveObjectProxy, OutboundMedia, ResolveContext, SerializationInfo,
    SerializedCall, Value,
};
use portrpc_transport::{
    Connector, Frame, HttpTransport, RequestTransport, WebSocketConnector,
};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Builder for [`Client`]. Unset transports default to a WebSocket
/// connection to `stream_url` and, when `http_url` is set, an HTTP fallback.
pub struct ClientBuilder {
    config: ClientConfig,
    session: Option<Arc<Session>>,
    connector: Option<Arc<dyn Connector>>,
    http: Option<Arc<dyn RequestTransport>>,
    probe: Option<Arc<dyn OnlineProbe>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: None,
            connector: None,
            http: None,
            probe: None,
        }
    }

    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn http_transport(mut self, http: impl RequestTransport + 'static) -> Self {
        self.http = Some(Arc::new(http));
        self
    }

    pub fn online_probe(mut self, probe: impl OnlineProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn build(self) -> Result<Client, ClientError> {
        let config = self.config;
        let session = self.session.unwrap_or_else(Session::new);

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new(config.stream_url.clone())),
        };
        let http: Option<Arc<dyn RequestTransport>> = match (self.http, &config.http_url) {
            (Some(http), _) => Some(http),
            (None, Some(url)) => Some(Arc::new(HttpTransport::new(
                url.clone(),
                config.http_timeout,
            )?)),
            (None, None) => None,
        };

        let registry = RequestRegistry::new(session.clone());
        let dispatcher = Dispatcher::new(registry.clone(), session.clone());
        let manager = TransportManager::new(
            connector,
            http,
            registry.clone(),
            dispatcher,
            config.heartbeat_interval,
            self.probe,
        );
        debug!("Client built for {}", config.stream_url);

        Ok(Client {
            config,
            session,
            registry,
            manager,
        })
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Target<'a> {
    Command(&'a str),
    LiveObject(&'a LiveObjectProxy, &'a str),
}

/// Main client for portrpc calls
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    session: Arc<Session>,
    registry: Arc<RequestRegistry>,
    manager: Arc<TransportManager>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_online(&self) -> bool {
        self.manager.is_online()
    }

    pub fn uses_http(&self) -> bool {
        self.manager.uses_http()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.registry.len()
    }

    /// Open the streaming connection ahead of the first call.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.manager.connect().await
    }

    /// Call a server function by name.
    pub async fn call(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
    ) -> Result<Value, ClientError> {
        if command.trim().is_empty() {
            return Err(ClientError::InvalidArguments(
                "command name must not be empty".into(),
            ));
        }
        self.execute(Target::Command(command), args, kwargs).await
    }

    /// Call a method on a server-resident live object.
    pub async fn call_live_object(
        &self,
        target: &LiveObjectProxy,
        method: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
    ) -> Result<Value, ClientError> {
        if method.trim().is_empty() {
            return Err(ClientError::InvalidArguments(
                "method name must not be empty".into(),
            ));
        }
        self.execute(Target::LiveObject(target, method), args, kwargs)
            .await
    }

    pub fn live_object(&self, proxy: LiveObjectProxy) -> LiveObjectHandle<'_> {
        LiveObjectHandle::new(self, proxy)
    }

    /// Round-trip an echo through the streaming connection.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.manager.heartbeat().await
    }

    /// Invalidate issued capabilities and forget method lists the server has
    /// seen, as after the server session expired.
    pub fn reset_session(&self) {
        self.session.reset();
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }

    async fn execute(
        &self,
        target: Target<'_>,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
    ) -> Result<Value, ClientError> {
        let id = Uuid::new_v4().to_string();
        let types = self.session.types();
        let methods = self.session.methods();

        let mut fields = IndexMap::with_capacity(2);
        fields.insert("args".to_string(), Value::List(args));
        fields.insert(
            "kwargs".to_string(),
            Value::Dict(kwargs.into_iter().map(|(k, v)| (Key::Str(k), v)).collect()),
        );
        let mut info = SerializationInfo::new();
        let SerializedCall {
            fields: mut json_fields,
            vt_global,
            leaves,
        } = serialize_fields(&fields, &mut info, types)?;

        let label = match &target {
            Target::Command(command) => command.to_string(),
            Target::LiveObject(proxy, method) => format!("{}.{}", proxy.backend(), method),
        };
        // The send order is fixed here, before media is read. An error below
        // drops the registration, which releases later calls.
        let mut registration =
            self.registry
                .register(&id, &label, KnownLiveObjects::new(), Vec::new());

        let ctx = ResolveContext::new(&id, types, methods).with_chunk_size(self.config.chunk_size);
        let mut resolved = resolve_leaves(leaves, &ctx).await?;

        let call_target = match target {
            Target::Command(command) => CallTarget::Command(command.to_string()),
            Target::LiveObject(proxy, method) => {
                resolved.known_live_objects.insert(proxy.clone());
                let send_methods =
                    resolved.claim_method_list(methods, proxy.backend(), proxy.methods());
                CallTarget::LiveObject(LiveObjectCall {
                    backend: proxy.backend().to_string(),
                    id: proxy.id().to_string(),
                    permissions: proxy.permissions().to_vec(),
                    mac: proxy.mac().to_string(),
                    methods: send_methods.then(|| proxy.methods().as_ref().clone()),
                    method: method.to_string(),
                })
            }
        };
        registration.set_known(
            std::mem::take(&mut resolved.known_live_objects),
            std::mem::take(&mut resolved.known_capabilities),
        );

        let envelope = CallEnvelope {
            id: id.clone(),
            target: call_target,
            args: match json_fields.remove("args") {
                Some(JsonValue::Array(args)) => args,
                _ => Vec::new(),
            },
            kwargs: match json_fields.remove("kwargs") {
                Some(JsonValue::Object(kwargs)) => kwargs,
                _ => Map::new(),
            },
            objects: resolved.records_json(),
            vt_global,
            reload_env: self.config.reload_env.then_some(true),
        };
        let frames = call_frames(&envelope, &resolved.media);

        registration.drain_predecessors().await;

        let delivered = if self.manager.uses_http() {
            self.manager.send_http(&id, frames).await
        } else {
            match self.manager.send_stream(&id, &frames).await {
                Ok(SendOutcome::Sent) => true,
                Ok(SendOutcome::FallbackRequired) => {
                    info!("Streaming write failed for {}; retrying over HTTP", label);
                    self.manager.enable_http_fallback();
                    self.manager.send_http(&id, frames).await
                }
                Err(e) => {
                    self.registry.reject(&id, e);
                    false
                }
            }
        };
        if delivered {
            resolved.commit_method_lists(methods);
        }

        registration.outcome().await
    }
}

/// The call's JSON envelope followed by each media chunk as a header and a
/// binary frame.
fn call_frames(envelope: &CallEnvelope, media: &[OutboundMedia]) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(1 + media.iter().map(|m| m.chunks.len() * 2).sum::<usize>());
    frames.push(Frame::Text(envelope.to_text()));
    for entry in media {
        for chunk in &entry.chunks {
            frames.push(Frame::Text(chunk.header.to_json().to_string()));
            frames.push(Frame::Binary(chunk.data.clone()));
        }
    }
    frames
}

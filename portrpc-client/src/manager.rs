// Owns the streaming connection: opens it on demand, keeps it alive with
// heartbeats, reads inbound frames into the dispatcher and tears it down when
// the peer goes away. Also performs HTTP exchanges once the client has
// fallen back from streaming.

use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::registry::RequestRegistry;
use async_trait::async_trait;
use portrpc_core::wire::{HEARTBEAT_COMMAND, HEARTBEAT_ID_PREFIX};
use portrpc_core::{CallEnvelope, CallTarget, KnownLiveObjects};
use portrpc_transport::{
    Connection, Connector, Frame, FrameSink, FrameStream, RequestTransport, TransportError,
};
use serde_json::{json, Map};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Failed,
}

/// What happened to a frame batch handed to [`TransportManager::send_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The first write on a fresh connection failed; the batch was not sent
    /// and should go over HTTP instead.
    FallbackRequired,
}

/// Checks whether the server is reachable after a transport failure.
#[async_trait]
pub trait OnlineProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Probes by opening, then closing, a connection through a connector.
pub struct ConnectorProbe {
    connector: Arc<dyn Connector>,
}

impl ConnectorProbe {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl OnlineProbe for ConnectorProbe {
    async fn check(&self) -> bool {
        match self.connector.connect().await {
            Ok(Connection { mut sink, .. }) => {
                let _ = sink.close().await;
                true
            }
            Err(e) => {
                debug!("Online probe failed: {}", e);
                false
            }
        }
    }
}

impl fmt::Debug for ConnectorProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorProbe")
            .field("connector", &self.connector.describe())
            .finish()
    }
}

#[derive(Clone)]
struct ActiveConnection {
    generation: u64,
    sink: Arc<Mutex<Box<dyn FrameSink>>>,
    /// Set after the first successful write.
    written: Arc<AtomicBool>,
    cancel: CancellationToken,
}

pub struct TransportManager {
    me: Weak<TransportManager>,
    connector: Arc<dyn Connector>,
    http: Option<Arc<dyn RequestTransport>>,
    registry: Arc<RequestRegistry>,
    dispatcher: Dispatcher,
    heartbeat_interval: Option<Duration>,
    probe: Option<Arc<dyn OnlineProbe>>,
    state: watch::Sender<ConnectionState>,
    active: Mutex<Option<ActiveConnection>>,
    generation: AtomicU64,
    http_fallback: AtomicBool,
    online: Arc<AtomicBool>,
}

impl TransportManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        http: Option<Arc<dyn RequestTransport>>,
        registry: Arc<RequestRegistry>,
        dispatcher: Dispatcher,
        heartbeat_interval: Option<Duration>,
        probe: Option<Arc<dyn OnlineProbe>>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connector,
            http,
            registry,
            dispatcher,
            heartbeat_interval,
            probe,
            state,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            http_fallback: AtomicBool::new(false),
            online: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Last known reachability of the server.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn uses_http(&self) -> bool {
        self.http_fallback.load(Ordering::SeqCst)
    }

    /// Route this and every later call over HTTP.
    pub fn enable_http_fallback(&self) {
        if !self.http_fallback.swap(true, Ordering::SeqCst) {
            info!("Falling back to HTTP for all further calls");
        }
    }

    /// Open the streaming connection if it is not open already.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<ActiveConnection, ClientError> {
        let mut active = self.active.lock().await;
        if let Some(conn) = active.as_ref() {
            return Ok(conn.clone());
        }

        self.state.send_replace(ConnectionState::Connecting);
        debug!("Connecting to {}", self.connector.describe());
        let Connection { sink, stream } = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.connector.describe(), e);
                self.state.send_replace(ConnectionState::Failed);
                self.spawn_probe();
                return Err(ClientError::Transport(e));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = ActiveConnection {
            generation,
            sink: Arc::new(Mutex::new(sink)),
            written: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        };
        self.spawn_reader(generation, stream, conn.cancel.clone());
        if let Some(period) = self.heartbeat_interval {
            self.spawn_keepalive(period, conn.cancel.clone());
        }

        *active = Some(conn.clone());
        self.online.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Open);
        info!("Connection #{} open to {}", generation, self.connector.describe());
        Ok(conn)
    }

    /// Write a call's frames, in order, to the streaming connection. The
    /// request is bound to the connection so losing it rejects the request.
    pub async fn send_stream(&self, id: &str, frames: &[Frame]) -> Result<SendOutcome, ClientError> {
        let conn = self.connection().await?;
        self.registry.bind_connection(id, conn.generation);

        let mut sink = conn.sink.lock().await;
        for frame in frames {
            if let Err(e) = sink.send(frame.clone()).await {
                drop(sink);
                if !conn.written.load(Ordering::SeqCst) && self.http.is_some() {
                    warn!(
                        "First write on connection #{} failed: {}",
                        conn.generation, e
                    );
                    self.registry.unbind_connection(id);
                    self.discard(conn.generation).await;
                    return Ok(SendOutcome::FallbackRequired);
                }
                self.connection_lost(conn.generation, e.clone()).await;
                return Err(ClientError::Transport(e));
            }
            conn.written.store(true, Ordering::SeqCst);
        }
        trace!("Sent {} frames for {} on #{}", frames.len(), id, conn.generation);
        Ok(SendOutcome::Sent)
    }

    /// Exchange a call's frames over HTTP and dispatch the reply. Failures
    /// reject the request rather than returning an error. Returns whether
    /// the server received the call.
    pub async fn send_http(&self, id: &str, frames: Vec<Frame>) -> bool {
        let Some(http) = self.http.clone() else {
            self.registry.reject(
                id,
                ClientError::Config("no HTTP endpoint configured".into()),
            );
            return false;
        };

        match http.exchange(frames).await {
            Ok(reply) => {
                self.online.store(true, Ordering::SeqCst);
                trace!("HTTP reply for {}: {} frames", id, reply.len());
                for frame in reply {
                    self.dispatcher.dispatch(frame);
                }
                if self.registry.is_outstanding(id) {
                    self.registry.reject(
                        id,
                        ClientError::Protocol(format!("HTTP reply carried no complete response for {}", id)),
                    );
                }
                true
            }
            Err(e) => {
                warn!("HTTP exchange for {} failed: {}", id, e);
                self.registry.reject(id, ClientError::Transport(e));
                self.spawn_probe();
                false
            }
        }
    }

    /// Send an echo through the same ordering and registry as a call.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        let id = format!("{}{}", HEARTBEAT_ID_PREFIX, Uuid::new_v4());
        let envelope = CallEnvelope {
            id: id.clone(),
            target: CallTarget::Command(HEARTBEAT_COMMAND.to_string()),
            args: Vec::new(),
            kwargs: Map::new(),
            objects: Vec::new(),
            vt_global: json!({}),
            reload_env: None,
        };

        let mut registration =
            self.registry
                .register(&id, HEARTBEAT_COMMAND, KnownLiveObjects::new(), Vec::new());
        registration.drain_predecessors().await;
        match self.send_stream(&id, &[Frame::Text(envelope.to_text())]).await {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::FallbackRequired) => {
                self.enable_http_fallback();
                self.registry.reject(&id, ClientError::Abandoned);
                return Ok(());
            }
            Err(e) => {
                self.registry.reject(&id, ClientError::Abandoned);
                return Err(e);
            }
        }
        registration.outcome().await.map(|_| {
            trace!("Heartbeat {} answered", id);
        })
    }

    /// Close the streaming connection, failing requests written to it.
    pub async fn close(&self) {
        let conn = self.active.lock().await.take();
        if let Some(conn) = conn {
            self.state.send_replace(ConnectionState::Closing);
            conn.cancel.cancel();
            if let Err(e) = conn.sink.lock().await.close().await {
                debug!("Error closing connection #{}: {}", conn.generation, e);
            }
            self.registry
                .fail_connection(conn.generation, &TransportError::ConnectionClosed);
            info!("Connection #{} closed", conn.generation);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Drop a connection that never carried a request.
    async fn discard(&self, generation: u64) {
        let conn = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(conn) if conn.generation == generation => active.take(),
                _ => None,
            }
        };
        if let Some(conn) = conn {
            conn.cancel.cancel();
            let _ = conn.sink.lock().await.close().await;
            self.state.send_replace(ConnectionState::Disconnected);
            debug!("Discarded connection #{}", generation);
        }
    }

    async fn connection_lost(&self, generation: u64, reason: TransportError) {
        let was_active = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(conn) if conn.generation == generation => {
                    conn.cancel.cancel();
                    *active = None;
                    true
                }
                _ => false,
            }
        };
        if was_active {
            warn!("Connection #{} lost: {}", generation, reason);
            self.state.send_replace(ConnectionState::Failed);
            self.spawn_probe();
        }
        self.registry.fail_connection(generation, &reason);
    }

    fn spawn_reader(&self, generation: u64, mut stream: Box<dyn FrameStream>, cancel: CancellationToken) {
        let dispatcher = self.dispatcher.clone();
        let manager = self.me.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = stream.next_frame() => match frame {
                        Some(Ok(frame)) => dispatcher.dispatch(frame),
                        Some(Err(e)) => break e,
                        None => break TransportError::ConnectionClosed,
                    },
                }
            };
            if let Some(manager) = manager.upgrade() {
                manager.connection_lost(generation, reason).await;
            }
        });
    }

    fn spawn_keepalive(&self, period: Duration, cancel: CancellationToken) {
        let manager = self.me.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else { break };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = manager.heartbeat() => {
                        if let Err(e) = result {
                            warn!("Heartbeat failed: {}", e);
                        }
                    }
                }
            }
            trace!("Keepalive stopped");
        });
    }

    fn spawn_probe(&self) {
        let Some(probe) = self.probe.clone() else {
            self.online.store(false, Ordering::SeqCst);
            return;
        };
        let online = self.online.clone();
        tokio::spawn(async move {
            let reachable = probe.check().await;
            online.store(reachable, Ordering::SeqCst);
            debug!("Online probe: server {}", if reachable { "reachable" } else { "unreachable" });
        });
    }
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportManager")
            .field("connector", &self.connector.describe())
            .field("state", &self.state())
            .field("http_fallback", &self.uses_http())
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

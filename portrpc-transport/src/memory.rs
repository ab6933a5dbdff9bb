// In-process streaming transport. Each `connect()` creates a fresh channel
// pair and hands the far end to whoever holds the acceptor, which makes it
// the natural test double for a server.

use crate::{Connection, Connector, Frame, FrameSink, FrameStream, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default)]
struct Switches {
    refuse_connections: AtomicBool,
    fail_writes: AtomicBool,
    connections: AtomicUsize,
}

/// Client side of the in-memory transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    switches: Arc<Switches>,
}

/// Server side: yields one peer per accepted connection.
#[derive(Debug)]
pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

pub fn memory_transport() -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            peers: tx,
            switches: Arc::new(Switches::default()),
        },
        MemoryAcceptor { peers: rx },
    )
}

impl MemoryConnector {
    /// Make subsequent connects fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.switches.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make writes on every connection fail, including open ones.
    pub fn fail_writes(&self, fail: bool) {
        self.switches.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connection_count(&self) -> usize {
        self.switches.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        if self.switches.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("memory transport refused".into()));
        }
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            incoming: from_client,
            outgoing: Some(to_client),
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("no acceptor listening".into()))?;
        let count = self.switches.connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Memory connection #{} opened", count);

        Ok(Connection {
            sink: Box::new(MemorySink {
                tx: Some(to_server),
                switches: self.switches.clone(),
            }),
            stream: Box::new(MemoryStream { rx: from_server }),
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

/// Server end of one in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: Option<mpsc::UnboundedSender<Frame>>,
}

impl MemoryPeer {
    /// Next frame from the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outgoing
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the server side; the client sees end of stream.
    pub fn close(&mut self) {
        self.outgoing = None;
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    switches: Arc<Switches>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.switches.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Send("memory transport write failed".into()));
        }
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

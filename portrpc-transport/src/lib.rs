//! Frame transports for the portrpc client.
//!
//! Streaming transports implement [`Connector`]; request/response transports
//! implement [`RequestTransport`].

pub mod memory;
pub mod multipart;
pub mod transport;
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{memory_transport, MemoryAcceptor, MemoryConnector, MemoryPeer};
pub use multipart::{boundary_from_content_type, encode_multipart, parse_multipart};
pub use transport::{Connection, Connector, Frame, FrameSink, FrameStream, RequestTransport, TransportError};
#[cfg(feature = "http")]
pub use http::HttpTransport;
#[cfg(feature = "websocket")]
pub use websocket::{split_websocket, WebSocketConnector};

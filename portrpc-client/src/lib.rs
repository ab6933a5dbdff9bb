//! Async client for portrpc servers.
//!
//! Calls are serialized with `portrpc-core`, written in registration order to
//! a streaming connection, and matched with their responses by id. If the
//! first write on a fresh connection fails, the client switches permanently
//! to HTTP multipart exchanges.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod live_object;
pub mod logging;
pub mod manager;
pub mod profile;
pub mod registry;
pub mod session;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use dispatcher::Dispatcher;
pub use error::{ClientError, RemoteError};
pub use live_object::{LiveObjectHandle, LiveObjectIter};
pub use manager::{ConnectionState, ConnectorProbe, OnlineProbe, SendOutcome, TransportManager};
pub use profile::{ProfileSink, ProfileSpan, TracingProfileSink};
pub use registry::{Registration, RequestRegistry};
pub use session::{EventHandlers, ExceptionRegistry, Session};

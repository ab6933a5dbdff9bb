//! Serialization engine of the portrpc client.
//!
//! A call's arguments are walked into a JSON skeleton plus an ordered list of
//! non-JSON leaves ([`serializer`]), the leaves are turned into wire records
//! and media chunks ([`resolver`]), and inbound envelopes are rebuilt into
//! values with the records spliced back in at their paths ([`deserializer`]).

pub mod capability;
pub mod deserializer;
pub mod error;
pub mod live_object;
pub mod media;
pub mod path;
pub mod portable;
pub mod resolver;
pub mod scratch;
pub mod serializer;
pub mod value;
pub mod wire;

pub use capability::{normalized_scope_key, Capability, CapabilityEpoch};
pub use deserializer::{reconstruct_objects, ReconstructContext, Reconstructed};
pub use error::{MediaError, ReconstructError, ScratchError, SerializationError, WireError};
pub use live_object::{IterPage, KnownLiveObjects, LiveObjectProxy, LiveObjectSpec, MethodCache};
pub use media::{
    split_into_chunks, BlobMedia, LazyMedia, Media, MediaBuffer, MediaRef, OutboundChunk,
    DEFAULT_CHUNK_SIZE,
};
pub use path::{Path, PathSegment, PathTracker};
pub use portable::{PortableType, TypeLoader, TypeRegistry};
pub use resolver::{resolve_leaves, OutboundMedia, ResolveContext, ResolvedObjects};
pub use scratch::{Partition, SerializationInfo, GLOBAL_KEY};
pub use serializer::{serialize_fields, NonJsonLeaf, SerializedCall, SerializedTree, Serializer};
pub use value::{from_json, to_plain_json, Dict, Key, LongInt, PortableObject, Value};
pub use wire::{
    CallEnvelope, CallTarget, ChunkHeader, InboundMessage, LiveObjectCall, NonJsonRecord,
    RecordKind, ResponseEnvelope, ServerErrorPayload, TraceFrame,
};

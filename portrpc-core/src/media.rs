// Binary media: the `Media` trait values are read through, in-memory blobs,
// lazily-fetched server media, and the chunking used to move bytes
// outside the JSON envelope.

use crate::error::MediaError;
use crate::path::Path;
use crate::wire::ChunkHeader;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_CHUNK_SIZE: usize = 65536;

/// Source of binary content. Reading may suspend (e.g. a file picker
/// or a network fetch), so every accessor is async.
#[async_trait]
pub trait Media: Send + Sync + fmt::Debug {
    async fn content_type(&self) -> Result<String, MediaError>;
    async fn bytes(&self) -> Result<Bytes, MediaError>;
    async fn name(&self) -> Result<Option<String>, MediaError>;
}

pub type MediaRef = Arc<dyn Media>;

/// Media held entirely in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobMedia {
    content_type: String,
    bytes: Bytes,
    name: Option<String>,
}

impl BlobMedia {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.content_type
    }

    pub fn file_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_ref(self) -> MediaRef {
        Arc::new(self)
    }
}

#[async_trait]
impl Media for BlobMedia {
    async fn content_type(&self) -> Result<String, MediaError> {
        Ok(self.content_type.clone())
    }

    async fn bytes(&self) -> Result<Bytes, MediaError> {
        Ok(self.bytes.clone())
    }

    async fn name(&self) -> Result<Option<String>, MediaError> {
        Ok(self.name.clone())
    }
}

/// Handle to media that stays on the server until fetched. The spec object
/// is opaque to the client and is passed back verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyMedia {
    spec: Map<String, JsonValue>,
}

impl LazyMedia {
    pub fn new(mut spec: Map<String, JsonValue>) -> Self {
        spec.remove("path");
        spec.remove("type");
        Self { spec }
    }

    pub fn spec(&self) -> &Map<String, JsonValue> {
        &self.spec
    }

    /// The spec as a record body placed at `path`.
    pub fn spec_at(&self, path: &Path) -> Map<String, JsonValue> {
        let mut spec = self.spec.clone();
        spec.insert(
            "path".to_string(),
            serde_json::to_value(path).unwrap_or(JsonValue::Null),
        );
        spec
    }
}

/// One outbound binary frame and the header announcing it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundChunk {
    pub header: ChunkHeader,
    pub data: Bytes,
}

/// Split `bytes` into ordered chunks of at most `chunk_size` bytes. Empty
/// content still produces a single (empty) final chunk so the receiver sees
/// the media complete.
pub fn split_into_chunks(
    request_id: &str,
    media_id: &str,
    bytes: &Bytes,
    chunk_size: usize,
) -> Vec<OutboundChunk> {
    let chunk_size = chunk_size.max(1);
    let count = bytes.len().div_ceil(chunk_size).max(1);

    (0..count)
        .map(|index| {
            let start = (index * chunk_size).min(bytes.len());
            let end = (start + chunk_size).min(bytes.len());
            OutboundChunk {
                header: ChunkHeader::new(request_id, media_id, index as u32, index + 1 == count),
                data: bytes.slice(start..end),
            }
        })
        .collect()
}

/// Collects inbound chunks for one media entry. Chunks are keyed by index
/// so a reordered delivery still assembles correctly.
#[derive(Debug, Clone, Default)]
pub struct MediaBuffer {
    chunks: BTreeMap<u32, Bytes>,
    last_index: Option<u32>,
}

impl MediaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u32, data: Bytes, last: bool) {
        self.chunks.insert(index, data);
        if last {
            self.last_index = Some(index);
        }
    }

    /// Complete once the final chunk and every chunk before it arrived.
    pub fn is_complete(&self) -> bool {
        match self.last_index {
            Some(last) => (0..=last).all(|i| self.chunks.contains_key(&i)),
            None => false,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn assemble(&self) -> Bytes {
        let total = self.chunks.values().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for chunk in self.chunks.values() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

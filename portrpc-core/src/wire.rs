// Wire records and messages.
//
// Outbound: the CALL envelope, chunk headers and the non-JSON records listed
// under `objects`. Inbound: responses, error responses, chunk headers and
// events, classified from their JSON shape.

use crate::error::{ReconstructError, WireError};
use crate::path::Path;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

/// Envelope field carrying the transmitted scratch region.
pub const GLOBAL_FIELD: &str = "vt_global";

/// Heartbeat calls use ids with this prefix and skip completion side effects.
pub const HEARTBEAT_ID_PREFIX: &str = "heartbeat-";

pub const HEARTBEAT_COMMAND: &str = "anvil.private.echo";

/// Announces the binary frame that immediately follows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub request_id: String,
    pub media_id: String,
    pub chunk_index: u32,
    pub last_chunk: bool,
}

impl ChunkHeader {
    pub fn new(request_id: &str, media_id: &str, chunk_index: u32, last_chunk: bool) -> Self {
        Self {
            request_id: request_id.to_string(),
            media_id: media_id.to_string(),
            chunk_index,
            last_chunk,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "type": "CHUNK_HEADER",
            "requestId": self.request_id,
            "mediaId": self.media_id,
            "chunkIndex": self.chunk_index,
            "lastChunk": self.last_chunk,
        })
    }
}

/// Addressing for a method call on a server-resident object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveObjectCall {
    pub backend: String,
    pub id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    Command(String),
    LiveObject(LiveObjectCall),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub id: String,
    pub target: CallTarget,
    pub args: Vec<JsonValue>,
    pub kwargs: Map<String, JsonValue>,
    pub objects: Vec<JsonValue>,
    pub vt_global: JsonValue,
    pub reload_env: Option<bool>,
}

impl CallEnvelope {
    pub fn to_json(&self) -> JsonValue {
        let mut out = Map::new();
        out.insert("type".into(), JsonValue::from("CALL"));
        out.insert("id".into(), JsonValue::from(self.id.clone()));
        match &self.target {
            CallTarget::Command(command) => {
                out.insert("command".into(), JsonValue::from(command.clone()));
            }
            CallTarget::LiveObject(call) => {
                out.insert(
                    "liveObjectCall".into(),
                    serde_json::to_value(call).unwrap_or(JsonValue::Null),
                );
            }
        }
        out.insert("args".into(), JsonValue::Array(self.args.clone()));
        out.insert("kwargs".into(), JsonValue::Object(self.kwargs.clone()));
        out.insert("objects".into(), JsonValue::Array(self.objects.clone()));
        out.insert(GLOBAL_FIELD.into(), self.vt_global.clone());
        if let Some(reload) = self.reload_env {
            out.insert("reload_env".into(), JsonValue::Bool(reload));
        }
        JsonValue::Object(out)
    }

    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }

    /// Parse a CALL message. Used by in-process servers and tests.
    pub fn from_json(value: &JsonValue) -> Result<Self, WireError> {
        let obj = value
            .as_object()
            .ok_or_else(|| WireError::Malformed("call must be an object".into()))?;
        if obj.get("type").and_then(JsonValue::as_str) != Some("CALL") {
            return Err(WireError::Malformed("not a CALL message".into()));
        }
        let id = obj
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WireError::Malformed("call has no id".into()))?
            .to_string();

        let target = if let Some(command) = obj.get("command").and_then(JsonValue::as_str) {
            CallTarget::Command(command.to_string())
        } else if let Some(call) = obj.get("liveObjectCall") {
            CallTarget::LiveObject(serde_json::from_value(call.clone())?)
        } else {
            return Err(WireError::Malformed(format!("call {} has no target", id)));
        };

        Ok(Self {
            id,
            target,
            args: obj
                .get("args")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default(),
            kwargs: obj
                .get("kwargs")
                .and_then(JsonValue::as_object)
                .cloned()
                .unwrap_or_default(),
            objects: obj
                .get("objects")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default(),
            vt_global: obj.get(GLOBAL_FIELD).cloned().unwrap_or(JsonValue::Null),
            reload_env: obj.get("reload_env").and_then(JsonValue::as_bool),
        })
    }

    pub fn is_heartbeat(&self) -> bool {
        self.id.starts_with(HEARTBEAT_ID_PREFIX)
    }
}

/// A small `{data, objects}` payload nested inside a live object record.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedPayload {
    pub data: JsonValue,
    pub objects: Vec<JsonValue>,
}

impl NestedPayload {
    pub fn plain(data: JsonValue) -> Self {
        Self {
            data,
            objects: Vec::new(),
        }
    }

    fn to_json(&self) -> JsonValue {
        json!({"data": self.data, "objects": self.objects})
    }

    fn from_json(tag: &str, value: &JsonValue) -> Result<Self, ReconstructError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ReconstructError::invalid(tag, "nested payload must be an object"))?;
        Ok(Self {
            data: obj.get("data").cloned().unwrap_or(JsonValue::Null),
            objects: obj
                .get("objects")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveObjectRecord {
    pub backend: String,
    pub id: String,
    pub permissions: Vec<String>,
    pub mac: String,
    pub methods: Option<Vec<String>>,
    pub item_cache: Option<NestedPayload>,
    pub iter_items: Option<NestedPayload>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    Primitive(JsonValue),
    DataMedia {
        id: String,
        mime_type: String,
        name: Option<String>,
    },
    LazyMedia(Map<String, JsonValue>),
    LiveObject(LiveObjectRecord),
    Capability {
        scope: Vec<JsonValue>,
        mac: String,
        narrow: Vec<JsonValue>,
    },
    ValueType {
        type_name: String,
    },
    ClassType {
        name: String,
    },
    Date(String),
    DateTime(String),
    Long(String),
    Float(String),
}

const KNOWN_TAGS: &[&str] = &[
    "Primitive",
    "DataMedia",
    "LazyMedia",
    "LiveObject",
    "Capability",
    "ValueType",
    "ClassType",
    "Date",
    "DateTime",
    "Long",
    "Float",
];

impl RecordKind {
    pub fn tag(&self) -> &'static str {
        match self {
            RecordKind::Primitive(_) => "Primitive",
            RecordKind::DataMedia { .. } => "DataMedia",
            RecordKind::LazyMedia(_) => "LazyMedia",
            RecordKind::LiveObject(_) => "LiveObject",
            RecordKind::Capability { .. } => "Capability",
            RecordKind::ValueType { .. } => "ValueType",
            RecordKind::ClassType { .. } => "ClassType",
            RecordKind::Date(_) => "Date",
            RecordKind::DateTime(_) => "DateTime",
            RecordKind::Long(_) => "Long",
            RecordKind::Float(_) => "Float",
        }
    }
}

/// One entry of an envelope's `objects` list.
#[derive(Debug, Clone, PartialEq)]
pub struct NonJsonRecord {
    pub path: Path,
    pub tags: Vec<String>,
    pub kind: RecordKind,
}

impl NonJsonRecord {
    pub fn new(path: Path, kind: RecordKind) -> Self {
        Self {
            path,
            tags: vec![kind.tag().to_string()],
            kind,
        }
    }

    /// The record tag that was acted on.
    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }

    pub fn to_json(&self) -> JsonValue {
        let mut out = match &self.kind {
            RecordKind::LazyMedia(spec) => spec.clone(),
            _ => Map::new(),
        };
        out.insert(
            "path".into(),
            serde_json::to_value(&self.path).unwrap_or(JsonValue::Null),
        );
        out.insert("type".into(), json!(self.tags));

        match &self.kind {
            RecordKind::Primitive(value) => {
                out.insert("value".into(), value.clone());
            }
            RecordKind::DataMedia { id, mime_type, name } => {
                out.insert("id".into(), JsonValue::from(id.clone()));
                out.insert("mime-type".into(), JsonValue::from(mime_type.clone()));
                if let Some(name) = name {
                    out.insert("name".into(), JsonValue::from(name.clone()));
                }
            }
            RecordKind::LazyMedia(_) => {}
            RecordKind::LiveObject(record) => {
                out.insert("backend".into(), JsonValue::from(record.backend.clone()));
                out.insert("id".into(), JsonValue::from(record.id.clone()));
                out.insert("permissions".into(), json!(record.permissions));
                out.insert("mac".into(), JsonValue::from(record.mac.clone()));
                if let Some(methods) = &record.methods {
                    out.insert("methods".into(), json!(methods));
                }
                if let Some(cache) = &record.item_cache {
                    out.insert("itemCache".into(), cache.to_json());
                }
                if let Some(items) = &record.iter_items {
                    out.insert("iterItems".into(), items.to_json());
                }
            }
            RecordKind::Capability { scope, mac, narrow } => {
                out.insert("scope".into(), JsonValue::Array(scope.clone()));
                out.insert("mac".into(), JsonValue::from(mac.clone()));
                out.insert("narrow".into(), JsonValue::Array(narrow.clone()));
            }
            RecordKind::ValueType { type_name } => {
                out.insert("valueType".into(), JsonValue::from(type_name.clone()));
            }
            RecordKind::ClassType { name } => {
                out.insert("name".into(), JsonValue::from(name.clone()));
            }
            RecordKind::Date(value)
            | RecordKind::DateTime(value)
            | RecordKind::Long(value)
            | RecordKind::Float(value) => {
                out.insert("value".into(), JsonValue::from(value.clone()));
            }
        }
        JsonValue::Object(out)
    }

    /// Parse a record. The first tag in `type` that is recognized decides
    /// the kind; a record with no recognized tag names its first tag in the
    /// error.
    pub fn from_json(value: &JsonValue) -> Result<Self, ReconstructError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ReconstructError::Malformed("record must be an object".into()))?;

        let tags: Vec<String> = match obj.get("type") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect(),
            Some(JsonValue::String(tag)) => vec![tag.clone()],
            _ => return Err(ReconstructError::missing("record", "type")),
        };
        let path: Path = match obj.get("path") {
            Some(path) => serde_json::from_value(path.clone())
                .map_err(|e| ReconstructError::invalid("record", format!("bad path: {}", e)))?,
            None => return Err(ReconstructError::missing("record", "path")),
        };

        let Some(tag) = tags.iter().find(|t| KNOWN_TAGS.contains(&t.as_str())) else {
            let first = tags.first().cloned().unwrap_or_default();
            return Err(ReconstructError::UnknownType(first));
        };

        let kind = match tag.as_str() {
            "Primitive" => RecordKind::Primitive(obj.get("value").cloned().unwrap_or_default()),
            "DataMedia" => RecordKind::DataMedia {
                id: str_field(obj, tag, "id")?,
                mime_type: obj
                    .get("mime-type")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                name: obj.get("name").and_then(JsonValue::as_str).map(str::to_string),
            },
            "LazyMedia" => {
                let mut spec = obj.clone();
                spec.remove("path");
                spec.remove("type");
                RecordKind::LazyMedia(spec)
            }
            "LiveObject" => RecordKind::LiveObject(LiveObjectRecord {
                backend: str_field(obj, tag, "backend")?,
                id: id_field(obj, tag)?,
                permissions: obj
                    .get("permissions")
                    .and_then(JsonValue::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|p| p.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                mac: obj
                    .get("mac")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                methods: obj.get("methods").and_then(JsonValue::as_array).map(|items| {
                    items
                        .iter()
                        .filter_map(|m| m.as_str().map(str::to_string))
                        .collect()
                }),
                item_cache: obj
                    .get("itemCache")
                    .filter(|v| !v.is_null())
                    .map(|v| NestedPayload::from_json(tag, v))
                    .transpose()?,
                iter_items: obj
                    .get("iterItems")
                    .filter(|v| !v.is_null())
                    .map(|v| NestedPayload::from_json(tag, v))
                    .transpose()?,
            }),
            "Capability" => RecordKind::Capability {
                scope: array_field(obj, tag, "scope")?,
                mac: str_field(obj, tag, "mac")?,
                narrow: obj
                    .get("narrow")
                    .and_then(JsonValue::as_array)
                    .cloned()
                    .unwrap_or_default(),
            },
            "ValueType" => RecordKind::ValueType {
                type_name: str_field(obj, tag, "valueType")?,
            },
            "ClassType" => RecordKind::ClassType {
                name: str_field(obj, tag, "name")?,
            },
            "Date" => RecordKind::Date(str_field(obj, tag, "value")?),
            "DateTime" => RecordKind::DateTime(str_field(obj, tag, "value")?),
            "Long" => RecordKind::Long(scalar_text(obj, tag)?),
            "Float" => RecordKind::Float(scalar_text(obj, tag)?),
            other => return Err(ReconstructError::UnknownType(other.to_string())),
        };

        Ok(Self { path, tags, kind })
    }
}

fn str_field(obj: &Map<String, JsonValue>, tag: &str, field: &str) -> Result<String, ReconstructError> {
    obj.get(field)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| ReconstructError::missing(tag, field))
}

fn array_field(
    obj: &Map<String, JsonValue>,
    tag: &str,
    field: &str,
) -> Result<Vec<JsonValue>, ReconstructError> {
    obj.get(field)
        .and_then(JsonValue::as_array)
        .cloned()
        .ok_or_else(|| ReconstructError::missing(tag, field))
}

// Live object ids are strings on the wire but some servers send numbers.
fn id_field(obj: &Map<String, JsonValue>, tag: &str) -> Result<String, ReconstructError> {
    match obj.get("id") {
        Some(JsonValue::String(id)) => Ok(id.clone()),
        Some(JsonValue::Number(id)) => Ok(id.to_string()),
        _ => Err(ReconstructError::missing(tag, "id")),
    }
}

fn scalar_text(obj: &Map<String, JsonValue>, tag: &str) -> Result<String, ReconstructError> {
    match obj.get("value") {
        Some(JsonValue::String(text)) => Ok(text.clone()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        _ => Err(ReconstructError::missing(tag, "value")),
    }
}

/// One frame of a server traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub file: String,
    pub line: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerErrorPayload {
    pub type_name: Option<String>,
    pub message: String,
    pub trace: Vec<TraceFrame>,
    pub raw: JsonValue,
}

impl ServerErrorPayload {
    pub fn from_json(value: &JsonValue) -> Self {
        let type_name = value
            .get("type")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let message = match value.get("message") {
            Some(JsonValue::String(message)) => message.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => value.as_str().unwrap_or("Unknown server error").to_string(),
        };
        let trace = value
            .get("trace")
            .and_then(JsonValue::as_array)
            .map(|frames| frames.iter().filter_map(parse_frame).collect())
            .unwrap_or_default();
        Self {
            type_name,
            message,
            trace,
            raw: value.clone(),
        }
    }
}

// Frames arrive as `[file, line]` pairs or `{file, line}` objects.
fn parse_frame(frame: &JsonValue) -> Option<TraceFrame> {
    match frame {
        JsonValue::Array(parts) => Some(TraceFrame {
            file: parts.first()?.as_str()?.to_string(),
            line: parts.get(1).and_then(JsonValue::as_u64),
        }),
        JsonValue::Object(map) => Some(TraceFrame {
            file: map.get("file")?.as_str()?.to_string(),
            line: map.get("line").and_then(JsonValue::as_u64),
        }),
        JsonValue::String(file) => Some(TraceFrame {
            file: file.clone(),
            line: None,
        }),
        _ => None,
    }
}

/// A successful response. Kept as the raw map since reconstruction walks
/// the whole envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    id: String,
    raw: Map<String, JsonValue>,
}

impl ResponseEnvelope {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn objects(&self) -> &[JsonValue] {
        self.raw
            .get("objects")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn cache_updates(&self) -> Option<&JsonValue> {
        self.raw.get("cacheUpdates").filter(|v| !v.is_null())
    }

    pub fn cap_updates(&self) -> Option<&JsonValue> {
        self.raw.get("capUpdates").filter(|v| !v.is_null())
    }

    pub fn profile(&self) -> Option<&JsonValue> {
        self.raw.get("profile").filter(|v| !v.is_null())
    }

    pub fn import_duration(&self) -> Option<f64> {
        self.raw.get("importDuration").and_then(JsonValue::as_f64)
    }

    pub fn as_json(&self) -> JsonValue {
        JsonValue::Object(self.raw.clone())
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(ResponseEnvelope),
    Error {
        id: String,
        error: ServerErrorPayload,
    },
    ChunkHeader(ChunkHeader),
    /// The whole event object; `payload` may carry non-JSON records under
    /// `objects` like a response does.
    Event {
        name: String,
        body: Map<String, JsonValue>,
    },
    Unknown(JsonValue),
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let value: JsonValue = serde_json::from_str(text)?;
        Self::from_json(value)
    }

    pub fn from_json(value: JsonValue) -> Result<Self, WireError> {
        let JsonValue::Object(obj) = value else {
            return Ok(InboundMessage::Unknown(value));
        };

        if obj.get("type").and_then(JsonValue::as_str) == Some("CHUNK_HEADER") {
            let header: ChunkHeader = serde_json::from_value(JsonValue::Object(obj))?;
            return Ok(InboundMessage::ChunkHeader(header));
        }

        if let Some(event) = obj.get("event") {
            let body = event
                .as_object()
                .cloned()
                .ok_or_else(|| WireError::Malformed("event must be an object".into()))?;
            let name = body
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| WireError::Malformed("event has no name".into()))?
                .to_string();
            return Ok(InboundMessage::Event { name, body });
        }

        let id = match obj.get("id") {
            Some(JsonValue::String(id)) => id.clone(),
            _ => return Ok(InboundMessage::Unknown(JsonValue::Object(obj))),
        };

        if let Some(error) = obj.get("error").filter(|e| !e.is_null()) {
            return Ok(InboundMessage::Error {
                error: ServerErrorPayload::from_json(error),
                id,
            });
        }

        if obj.contains_key("response") || obj.contains_key("objects") {
            return Ok(InboundMessage::Response(ResponseEnvelope { id, raw: obj }));
        }

        Ok(InboundMessage::Unknown(JsonValue::Object(obj)))
    }

    /// Call id the message belongs to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            InboundMessage::Response(response) => Some(response.id()),
            InboundMessage::Error { id, .. } => Some(id),
            InboundMessage::ChunkHeader(header) => Some(&header.request_id),
            InboundMessage::Event { .. } | InboundMessage::Unknown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathSegment;

    #[test]
    fn test_chunk_header_wire_form() {
        let header = ChunkHeader::new("call-1", "call-1_0", 2, true);
        let json = header.to_json();
        assert_eq!(json["type"], "CHUNK_HEADER");
        assert_eq!(json["mediaId"], "call-1_0");
        assert_eq!(json["lastChunk"], true);

        match InboundMessage::from_json(json).unwrap() {
            InboundMessage::ChunkHeader(parsed) => assert_eq!(parsed, header),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_envelope_shape() {
        let call = CallEnvelope {
            id: "abc".into(),
            target: CallTarget::Command("app.save".into()),
            args: vec![json!(1)],
            kwargs: Map::new(),
            objects: vec![],
            vt_global: json!({}),
            reload_env: None,
        };
        let json = call.to_json();
        assert_eq!(json["type"], "CALL");
        assert_eq!(json["command"], "app.save");
        assert!(json.get("liveObjectCall").is_none());
        assert!(json.get("reload_env").is_none());
        assert_eq!(CallEnvelope::from_json(&json).unwrap(), call);
    }

    #[test]
    fn test_live_object_call_omits_methods() {
        let call = CallEnvelope {
            id: "abc".into(),
            target: CallTarget::LiveObject(LiveObjectCall {
                backend: "tables.Row".into(),
                id: "7".into(),
                permissions: vec!["r".into()],
                mac: "m".into(),
                methods: None,
                method: "get".into(),
            }),
            args: vec![],
            kwargs: Map::new(),
            objects: vec![],
            vt_global: json!({}),
            reload_env: Some(true),
        };
        let json = call.to_json();
        assert!(json["liveObjectCall"].get("methods").is_none());
        assert_eq!(json["reload_env"], true);
    }

    #[test]
    fn test_first_recognized_tag_wins() {
        let record = NonJsonRecord::from_json(&json!({
            "path": ["response", 0],
            "type": ["FancyMedia", "DataMedia", "Primitive"],
            "id": "c_0",
            "mime-type": "image/png",
        }))
        .unwrap();
        assert_eq!(record.tag(), "DataMedia");
        assert_eq!(
            record.path,
            Path::new(vec![PathSegment::Key("response".into()), PathSegment::Index(0)])
        );
        assert_eq!(record.tags.len(), 3);
    }

    #[test]
    fn test_unknown_tag_names_first() {
        let err = NonJsonRecord::from_json(&json!({"path": ["x"], "type": ["Widget", "Gadget"]}))
            .unwrap_err();
        assert_eq!(err, ReconstructError::UnknownType("Widget".into()));
    }

    #[test]
    fn test_record_round_trip_keeps_lazy_spec() {
        let mut spec = Map::new();
        spec.insert("manager".into(), json!("files"));
        let record = NonJsonRecord::new(
            Path::new(vec![PathSegment::Key("args".into())]),
            RecordKind::LazyMedia(spec),
        );
        let json = record.to_json();
        assert_eq!(json["manager"], "files");
        assert_eq!(NonJsonRecord::from_json(&json).unwrap(), record);
    }

    #[test]
    fn test_classifies_inbound_messages() {
        let response = InboundMessage::parse(r#"{"id":"a","response":1,"objects":[]}"#).unwrap();
        assert!(matches!(response, InboundMessage::Response(_)));
        assert_eq!(response.request_id(), Some("a"));

        let error = InboundMessage::parse(
            r#"{"id":"b","error":{"type":"anvil.server.TimeoutError","message":"late","trace":[["main.py",3]]}}"#,
        )
        .unwrap();
        match error {
            InboundMessage::Error { id, error } => {
                assert_eq!(id, "b");
                assert_eq!(error.type_name.as_deref(), Some("anvil.server.TimeoutError"));
                assert_eq!(error.trace, vec![TraceFrame { file: "main.py".into(), line: Some(3) }]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let event = InboundMessage::parse(r#"{"event":{"name":"tick","payload":2}}"#).unwrap();
        assert!(matches!(event, InboundMessage::Event { ref name, .. } if name == "tick"));

        let other = InboundMessage::parse(r#"{"hello":1}"#).unwrap();
        assert!(matches!(other, InboundMessage::Unknown(_)));
        assert!(InboundMessage::parse("{").is_err());
    }

    #[test]
    fn test_response_accessors() {
        let InboundMessage::Response(response) = InboundMessage::parse(
            r#"{"id":"a","response":null,"objects":[{"path":["response"],"type":["Long"],"value":"1"}],"importDuration":0.5}"#,
        )
        .unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.objects().len(), 1);
        assert_eq!(response.import_duration(), Some(0.5));
        assert!(response.cache_updates().is_none());
    }
}

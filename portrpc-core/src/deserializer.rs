// Rebuilds values from an inbound envelope: the JSON fields become values,
// then every non-JSON record is reconstructed and spliced in at its path.

use crate::capability::{Capability, CapabilityEpoch};
use crate::error::ReconstructError;
use crate::live_object::{IterPage, KnownLiveObjects, LiveObjectProxy, LiveObjectSpec, MethodCache};
use crate::media::{BlobMedia, LazyMedia};
use crate::path::PathSegment;
use crate::portable::TypeRegistry;
use crate::resolver::DATE_FORMAT;
use crate::scratch::SerializationInfo;
use crate::value::{from_json, Key, LongInt, Value};
use crate::wire::{LiveObjectRecord, NestedPayload, NonJsonRecord, RecordKind, GLOBAL_FIELD};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ReconstructContext<'a> {
    pub types: &'a TypeRegistry,
    pub methods: &'a MethodCache,
    pub epoch: &'a CapabilityEpoch,
}

#[derive(Debug)]
pub struct Reconstructed {
    /// Every envelope field except `objects`, as values.
    pub envelope: Value,
    pub known_live_objects: KnownLiveObjects,
    pub known_capabilities: Vec<Capability>,
}

impl Reconstructed {
    /// Remove and return a top-level field, `None` if absent.
    pub fn take_field(&mut self, name: &str) -> Value {
        match &mut self.envelope {
            Value::Dict(fields) => fields
                .shift_remove(&Key::Str(name.to_string()))
                .unwrap_or(Value::None),
            _ => Value::None,
        }
    }
}

/// Reconstruct a response (or event) envelope. `media` holds the assembled
/// bytes of every `DataMedia` entry, keyed by media id.
pub fn reconstruct_objects(
    envelope: &JsonValue,
    media: &HashMap<String, Bytes>,
    ctx: &ReconstructContext<'_>,
) -> Result<Reconstructed, ReconstructError> {
    let fields = envelope
        .as_object()
        .ok_or_else(|| ReconstructError::Malformed("envelope must be an object".into()))?;

    let tree = Value::Dict(
        fields
            .iter()
            .filter(|(name, _)| name.as_str() != "objects")
            .map(|(name, value)| (Key::Str(name.clone()), from_json(value)))
            .collect(),
    );
    let records = fields
        .get("objects")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut pass = Reconstruction::new(tree, true, media, ctx);
    pass.apply_all(records)?;
    Ok(Reconstructed {
        envelope: pass.tree,
        known_live_objects: pass.known_live_objects,
        known_capabilities: pass.known_capabilities,
    })
}

struct Reconstruction<'m, 'c, 'a> {
    tree: Value,
    /// Local mirror of `vt_global`, built on first use by a portable type.
    mirror: Option<SerializationInfo>,
    global_enabled: bool,
    media: &'m HashMap<String, Bytes>,
    ctx: &'c ReconstructContext<'a>,
    known_live_objects: KnownLiveObjects,
    known_capabilities: Vec<Capability>,
}

impl<'m, 'c, 'a> Reconstruction<'m, 'c, 'a> {
    fn new(
        tree: Value,
        global_enabled: bool,
        media: &'m HashMap<String, Bytes>,
        ctx: &'c ReconstructContext<'a>,
    ) -> Self {
        Self {
            tree,
            mirror: None,
            global_enabled,
            media,
            ctx,
            known_live_objects: KnownLiveObjects::new(),
            known_capabilities: Vec::new(),
        }
    }

    fn apply_all(&mut self, records: &[JsonValue]) -> Result<(), ReconstructError> {
        for raw in records {
            let record = NonJsonRecord::from_json(raw)?;
            if record.path.is_empty() {
                warn!("Dropping {} record with an empty path", record.tag());
                continue;
            }
            self.apply(record)?;
        }
        Ok(())
    }

    fn apply(&mut self, record: NonJsonRecord) -> Result<(), ReconstructError> {
        let segments = record.path.segments();
        let in_global = self.global_enabled && record.path.starts_with_key(GLOBAL_FIELD);

        let value = match record.kind {
            RecordKind::ValueType { type_name } => {
                return self.apply_value_type(&record.path, &type_name, in_global)
            }
            RecordKind::ClassType { name } => match self.ctx.types.resolve(&name) {
                Some(portable) => Value::Class(portable.name().to_string()),
                None => return Err(ReconstructError::UnknownPortableType(name)),
            },
            RecordKind::DataMedia { id, mime_type, name } => {
                let bytes = self
                    .media
                    .get(&id)
                    .cloned()
                    .ok_or(ReconstructError::MissingMedia(id))?;
                let mut blob = BlobMedia::new(mime_type, bytes);
                if let Some(name) = name {
                    blob = blob.with_name(name);
                }
                Value::Media(blob.into_ref())
            }
            RecordKind::LazyMedia(spec) => Value::LazyMedia(LazyMedia::new(spec)),
            RecordKind::LiveObject(spec) => Value::LiveObject(self.live_object(spec)?),
            RecordKind::Capability { scope, mac, narrow } => {
                let cap = Capability::new(scope, mac, narrow, self.ctx.epoch);
                self.known_capabilities.push(cap.clone());
                Value::Capability(cap)
            }
            RecordKind::Date(text) => NaiveDate::parse_from_str(&text, DATE_FORMAT)
                .map(Value::Date)
                .map_err(|e| ReconstructError::invalid("Date", format!("{}: {}", text, e)))?,
            RecordKind::DateTime(text) => parse_datetime(&text)?,
            RecordKind::Long(text) => LongInt::parse(&text)
                .map(Value::from_long)
                .ok_or_else(|| ReconstructError::invalid("Long", text))?,
            RecordKind::Float(text) => Value::Float(parse_float(&text)?),
            RecordKind::Primitive(json) => from_json(&json),
        };

        if let Some(existing) = self.tree.lookup(segments) {
            if !existing.is_none() {
                warn!(
                    "Overwriting non-null {} at {} with a {} record",
                    existing.kind(),
                    record.path,
                    value.kind()
                );
            }
        }
        if in_global {
            if let Some(mirror) = self.mirror.as_mut() {
                mirror.assign_global(&segments[1..], value.clone())?;
            }
        }
        self.splice(segments, value)
    }

    fn apply_value_type(
        &mut self,
        path: &crate::path::Path,
        type_name: &str,
        in_global: bool,
    ) -> Result<(), ReconstructError> {
        let portable = self
            .ctx
            .types
            .resolve(type_name)
            .ok_or_else(|| ReconstructError::UnknownPortableType(type_name.to_string()))?;
        let segments = path.segments();

        let tree = &self.tree;
        let mirror = self.mirror.get_or_insert_with(|| {
            debug!("Building vt_global mirror for {}", type_name);
            SerializationInfo::from_global(tree.get(GLOBAL_FIELD).unwrap_or(&Value::None))
        });

        // Inside vt_global the mirror holds the most recent state.
        let found = if in_global {
            mirror
                .global_slot(&segments[1..])
                .or_else(|| tree.lookup(segments))
        } else {
            tree.lookup(segments)
        };
        let data = found.cloned().unwrap_or(Value::None);

        let value = mirror.with_type(portable.name(), |info| portable.construct(data, info))?;
        if in_global {
            mirror.assign_global(&segments[1..], value.clone())?;
        }
        self.splice(segments, value)
    }

    fn live_object(&mut self, record: LiveObjectRecord) -> Result<LiveObjectProxy, ReconstructError> {
        let methods = match record.methods {
            Some(list) => self.ctx.methods.remember(&record.backend, list),
            None => self
                .ctx
                .methods
                .lookup(&record.backend)
                .unwrap_or_else(|| Arc::new(Vec::new())),
        };

        let item_cache = match record.item_cache {
            Some(payload) => match self.nested(payload)? {
                Value::Dict(fields) => Some(
                    fields
                        .into_iter()
                        .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
                        .collect::<IndexMap<_, _>>(),
                ),
                Value::None => None,
                other => {
                    return Err(ReconstructError::invalid(
                        "LiveObject",
                        format!("item cache must be a dict, got {}", other.kind()),
                    ))
                }
            },
            None => None,
        };

        let iter_items = match record.iter_items {
            Some(payload) => {
                let page = self.nested(payload)?;
                let items = match page.get("items") {
                    Some(Value::List(items)) => items.clone(),
                    _ => Vec::new(),
                };
                let next_page = page.get("nextPage").filter(|v| !v.is_none()).cloned();
                Some(IterPage { items, next_page })
            }
            None => None,
        };

        let proxy = LiveObjectProxy::new(LiveObjectSpec {
            backend: record.backend,
            id: record.id,
            permissions: record.permissions,
            mac: record.mac,
            methods,
            item_cache,
            iter_items,
        });
        self.known_live_objects.insert(proxy.clone());
        Ok(proxy)
    }

    /// Reconstruct a `{data, objects}` payload. Record paths inside it are
    /// rooted at the payload, so they start with `data`.
    fn nested(&mut self, payload: NestedPayload) -> Result<Value, ReconstructError> {
        let tree = Value::dict([("data", from_json(&payload.data))]);
        let mut inner = Reconstruction::new(tree, false, self.media, self.ctx);
        inner.apply_all(&payload.objects)?;
        self.known_live_objects.extend(inner.known_live_objects);
        self.known_capabilities.extend(inner.known_capabilities);
        Ok(match inner.tree {
            Value::Dict(mut fields) => fields
                .shift_remove(&Key::Str("data".to_string()))
                .unwrap_or(Value::None),
            _ => Value::None,
        })
    }

    fn splice(&mut self, segments: &[PathSegment], value: Value) -> Result<(), ReconstructError> {
        self.tree
            .assign(segments, value)
            .map(|_| ())
            .ok_or_else(|| ReconstructError::PathNotFound(segments.to_vec().into()))
    }
}

/// Accepts the wire format and its common variants (colon offsets, an ISO
/// `T` separator, missing fraction). No offset yields a naive datetime.
pub fn parse_datetime(text: &str) -> Result<Value, ReconstructError> {
    for format in ["%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Ok(Value::DateTime(dt));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(Value::DateTime(dt));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Value::NaiveDateTime(naive));
        }
    }
    Err(ReconstructError::invalid("DateTime", text))
}

pub fn parse_float(text: &str) -> Result<f64, ReconstructError> {
    match text.to_ascii_lowercase().as_str() {
        "nan" => Ok(f64::NAN),
        "inf" | "infinity" => Ok(f64::INFINITY),
        "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
        other => other
            .parse()
            .map_err(|_| ReconstructError::invalid("Float", text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portable::PortableType;
    use crate::value::PortableObject;
    use chrono::{FixedOffset, TimeZone};
    use serde_json::json;

    struct Fixture {
        types: TypeRegistry,
        methods: MethodCache,
        epoch: CapabilityEpoch,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                types: TypeRegistry::new(),
                methods: MethodCache::new(),
                epoch: CapabilityEpoch::new(),
            }
        }

        fn run(&self, envelope: JsonValue) -> Result<Reconstructed, ReconstructError> {
            self.run_with_media(envelope, HashMap::new())
        }

        fn run_with_media(
            &self,
            envelope: JsonValue,
            media: HashMap<String, Bytes>,
        ) -> Result<Reconstructed, ReconstructError> {
            let ctx = ReconstructContext {
                types: &self.types,
                methods: &self.methods,
                epoch: &self.epoch,
            };
            reconstruct_objects(&envelope, &media, &ctx)
        }
    }

    #[test]
    fn test_scalars_are_spliced() {
        let fixture = Fixture::new();
        let mut out = fixture
            .run(json!({
                "id": "a",
                "response": [null, null, null, {"k": null}],
                "objects": [
                    {"path": ["response", 0], "type": ["Date"], "value": "2024-02-29"},
                    {"path": ["response", 1], "type": ["Long"], "value": "123456789012345678901234567890"},
                    {"path": ["response", 2], "type": ["Float"], "value": "nan"},
                    {"path": ["response", 3, "k"], "type": ["DateTime"], "value": "2024-02-29 10:00:00.250000+0200"},
                ],
            }))
            .unwrap();

        let response = out.take_field("response");
        let items = response.as_list().unwrap();
        assert_eq!(items[0], Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));
        assert!(matches!(items[1], Value::Long(_)));
        assert!(items[2].as_f64().unwrap().is_nan());

        let expected = FixedOffset::east_opt(7200)
            .unwrap()
            .with_ymd_and_hms(2024, 2, 29, 10, 0, 0)
            .unwrap()
            + chrono::Duration::milliseconds(250);
        assert_eq!(items[3].get("k"), Some(&Value::DateTime(expected)));
        assert!(out.envelope.get("objects").is_none());
    }

    #[test]
    fn test_media_and_missing_media() {
        let fixture = Fixture::new();
        let mut media = HashMap::new();
        media.insert("c_0".to_string(), Bytes::from_static(b"abc"));

        let out = fixture
            .run_with_media(
                json!({
                    "id": "c",
                    "response": null,
                    "objects": [{"path": ["response"], "type": ["DataMedia"], "id": "c_0", "mime-type": "text/plain"}],
                }),
                media,
            )
            .unwrap();
        assert!(matches!(out.envelope.get("response"), Some(Value::Media(_))));

        let err = fixture
            .run(json!({
                "id": "c",
                "objects": [{"path": ["response"], "type": ["DataMedia"], "id": "c_1"}],
            }))
            .unwrap_err();
        assert_eq!(err, ReconstructError::MissingMedia("c_1".into()));
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let err = Fixture::new()
            .run(json!({"id": "a", "objects": [{"path": ["response"], "type": ["Widget"]}]}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot return object of type Widget");
    }

    #[test]
    fn test_empty_path_is_dropped() {
        let out = Fixture::new()
            .run(json!({"id": "a", "response": 1, "objects": [{"path": [], "type": ["Long"], "value": "5"}]}))
            .unwrap();
        assert_eq!(out.envelope.get("response"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_unreachable_path_fails() {
        let err = Fixture::new()
            .run(json!({"id": "a", "response": [], "objects": [{"path": ["response", 3], "type": ["Long"], "value": "5"}]}))
            .unwrap_err();
        assert!(matches!(err, ReconstructError::PathNotFound(_)));
    }

    #[test]
    fn test_non_null_target_is_overwritten() {
        let out = Fixture::new()
            .run(json!({"id": "a", "response": "stale", "objects": [{"path": ["response"], "type": ["Long"], "value": "5"}]}))
            .unwrap();
        assert_eq!(out.envelope.get("response"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_value_type_default_construction() {
        let fixture = Fixture::new();
        fixture.types.register(PortableType::new("app.Point"));

        let out = fixture
            .run(json!({
                "id": "a",
                "response": {"x": 1, "when": null},
                "objects": [
                    {"path": ["response", "when"], "type": ["Date"], "value": "2020-01-01"},
                    {"path": ["response"], "type": ["ValueType"], "valueType": "app.Point"},
                ],
            }))
            .unwrap();

        let Some(Value::Portable(point)) = out.envelope.get("response") else {
            panic!("expected a portable object");
        };
        assert_eq!(point.type_name(), "app.Point");
        assert_eq!(point.get_attr("x"), Some(Value::Int(1)));
        assert!(matches!(point.get_attr("when"), Some(Value::Date(_))));
    }

    #[test]
    fn test_unregistered_value_type_fails() {
        let err = Fixture::new()
            .run(json!({
                "id": "a",
                "response": {},
                "objects": [{"path": ["response"], "type": ["ValueType"], "valueType": "app.Gone"}],
            }))
            .unwrap_err();
        assert_eq!(err, ReconstructError::UnknownPortableType("app.Gone".into()));
    }

    #[test]
    fn test_global_identity_is_shared() {
        // Both references to the shared node resolve to one instance: the
        // hook looks the node up in the mirror instead of building a copy.
        let fixture = Fixture::new();
        fixture.types.register(PortableType::new("app.Node"));
        fixture.types.register(PortableType::new("app.Ref").with_deserializer(|data, info| {
            let slot = data.as_str().unwrap_or_default().to_string();
            let shared = info.shared_data(Some("app.Node"))?;
            Ok(shared.get(&slot).cloned().unwrap_or(Value::None))
        }));

        let out = fixture
            .run(json!({
                "id": "a",
                "response": ["n1", "n1"],
                "vt_global": {"app.Node": {"n1": {"label": "shared"}}},
                "objects": [
                    {"path": ["vt_global", "app.Node", "n1"], "type": ["ValueType"], "valueType": "app.Node"},
                    {"path": ["response", 0], "type": ["ValueType"], "valueType": "app.Ref"},
                    {"path": ["response", 1], "type": ["ValueType"], "valueType": "app.Ref"},
                ],
            }))
            .unwrap();

        let items = out.envelope.get("response").unwrap().as_list().unwrap();
        let (Value::Portable(a), Value::Portable(b)) = (&items[0], &items[1]) else {
            panic!("expected portable objects, got {:?}", items);
        };
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.get_attr("label"), Some(Value::str("shared")));
        let global = out.envelope.get("vt_global").unwrap();
        assert!(matches!(global.get("app.Node").and_then(|n| n.get("n1")), Some(Value::Portable(_))));
    }

    #[test]
    fn test_live_object_fills_methods_and_nested_cache() {
        let fixture = Fixture::new();
        let out = fixture
            .run(json!({
                "id": "a",
                "response": [null, null],
                "objects": [
                    {
                        "path": ["response", 0], "type": ["LiveObject"],
                        "backend": "tables.Row", "id": "[1,1]", "permissions": ["r"], "mac": "m",
                        "methods": ["update"],
                        "itemCache": {
                            "data": {"name": "a", "born": null},
                            "objects": [{"path": ["data", "born"], "type": ["Date"], "value": "1990-01-01"}],
                        },
                        "iterItems": {"data": {"items": [1, 2], "nextPage": "cursor"}, "objects": []},
                    },
                    {"path": ["response", 1], "type": ["LiveObject"], "backend": "tables.Row", "id": "[1,2]"},
                ],
            }))
            .unwrap();

        let items = out.envelope.get("response").unwrap().as_list().unwrap();
        let (Value::LiveObject(first), Value::LiveObject(second)) = (&items[0], &items[1]) else {
            panic!("expected live objects");
        };
        assert!(Arc::ptr_eq(first.methods(), second.methods()));
        assert!(second.has_method("update"));
        assert!(matches!(first.cached_item("born"), Some(Value::Date(_))));
        let page = first.iter_items().unwrap();
        assert_eq!(page.items, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(page.next_page, Some(Value::str("cursor")));
        assert_eq!(out.known_live_objects.len(), 2);
    }

    #[test]
    fn test_capability_uses_session_epoch() {
        let fixture = Fixture::new();
        let out = fixture
            .run(json!({
                "id": "a",
                "objects": [{"path": ["response"], "type": ["Capability"], "scope": ["files"], "mac": "m", "narrow": []}],
            }))
            .unwrap();
        let Some(Value::Capability(cap)) = out.envelope.get("response") else {
            panic!("expected a capability");
        };
        assert!(cap.is_valid());
        fixture.epoch.invalidate_all();
        assert!(!cap.is_valid());
        assert_eq!(out.known_capabilities.len(), 1);
    }

    #[test]
    fn test_datetime_variants() {
        assert!(matches!(parse_datetime("2024-01-01 00:00:00+00:00"), Ok(Value::DateTime(_))));
        assert!(matches!(parse_datetime("2024-01-01T00:00:00Z"), Ok(Value::DateTime(_))));
        assert!(matches!(parse_datetime("2024-01-01 00:00:00.5"), Ok(Value::NaiveDateTime(_))));
        assert!(parse_datetime("yesterday").is_err());
        assert_eq!(parse_float("1.5").unwrap(), 1.5);
        assert!(parse_float("lots").is_err());
    }

    #[test]
    fn test_portable_object_survives_reconstruction() {
        let fixture = Fixture::new();
        fixture.types.register(PortableType::new("app.Point"));
        let out = fixture
            .run(json!({
                "id": "a",
                "response": {"x": 2},
                "objects": [{"path": ["response"], "type": ["ValueType"], "valueType": "app.Point"}],
            }))
            .unwrap();
        let twin = PortableObject::new("app.Point");
        twin.set_attr("x", Value::Int(2));
        assert_eq!(out.envelope.get("response"), Some(&Value::Portable(twin)));
    }
}

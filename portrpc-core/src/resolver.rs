// Turns the serializer's leaves into wire records. Media content is read
// here (the only suspension point of an outbound call walk) and split into
// chunks that travel after the call's JSON.

use crate::capability::Capability;
use crate::error::SerializationError;
use crate::live_object::{KnownLiveObjects, MethodCache};
use crate::media::{split_into_chunks, OutboundChunk, DEFAULT_CHUNK_SIZE};
use crate::path::Path;
use crate::portable::TypeRegistry;
use crate::serializer::NonJsonLeaf;
use crate::value::{to_plain_json, Value};
use crate::wire::{LiveObjectRecord, NonJsonRecord, RecordKind};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, Offset, TimeZone};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%z";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug)]
pub struct ResolveContext<'a> {
    pub call_id: &'a str,
    pub types: &'a TypeRegistry,
    pub methods: &'a MethodCache,
    pub chunk_size: usize,
}

impl<'a> ResolveContext<'a> {
    pub fn new(call_id: &'a str, types: &'a TypeRegistry, methods: &'a MethodCache) -> Self {
        Self {
            call_id,
            types,
            methods,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// One media entry's chunks, in send order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMedia {
    pub media_id: String,
    pub chunks: Vec<OutboundChunk>,
}

#[derive(Debug, Default)]
pub struct ResolvedObjects {
    pub records: Vec<NonJsonRecord>,
    pub media: Vec<OutboundMedia>,
    pub known_live_objects: KnownLiveObjects,
    pub known_capabilities: Vec<Capability>,
    /// Method lists carried by this call, committed once the call is sent.
    pub method_lists: Vec<(String, Arc<Vec<String>>)>,
}

impl ResolvedObjects {
    pub fn records_json(&self) -> Vec<JsonValue> {
        self.records.iter().map(NonJsonRecord::to_json).collect()
    }

    /// Whether this call must carry `methods` for `backend`. Only the first
    /// record of a call carries a list the server has not been sent yet.
    pub fn claim_method_list(
        &mut self,
        cache: &MethodCache,
        backend: &str,
        methods: &Arc<Vec<String>>,
    ) -> bool {
        let claimed = self
            .method_lists
            .iter()
            .any(|(known, list)| known == backend && Arc::ptr_eq(list, methods));
        if claimed || !cache.should_send(backend, methods) {
            return false;
        }
        self.method_lists.push((backend.to_string(), methods.clone()));
        true
    }

    /// Record the carried method lists as seen by the server.
    pub fn commit_method_lists(&self, cache: &MethodCache) {
        for (backend, methods) in &self.method_lists {
            cache.commit(backend, methods);
        }
    }
}

/// Classify every leaf, first matching rule wins.
pub async fn resolve_leaves(
    leaves: Vec<NonJsonLeaf>,
    ctx: &ResolveContext<'_>,
) -> Result<ResolvedObjects, SerializationError> {
    let mut out = ResolvedObjects::default();

    for NonJsonLeaf { path, value } in leaves {
        let kind = match &value {
            Value::LazyMedia(lazy) => RecordKind::LazyMedia(lazy.spec().clone()),

            Value::Media(media) => {
                let read_err = |source| SerializationError::Media {
                    path: path.clone(),
                    source,
                };
                let mime_type = media.content_type().await.map_err(read_err)?;
                let bytes = media.bytes().await.map_err(read_err)?;
                let name = media.name().await.map_err(read_err)?;

                let media_id = format!("{}_{}", ctx.call_id, out.media.len());
                let chunks = split_into_chunks(ctx.call_id, &media_id, &bytes, ctx.chunk_size);
                debug!(
                    "Media {} at {}: {} bytes in {} chunks",
                    media_id,
                    path,
                    bytes.len(),
                    chunks.len()
                );
                out.media.push(OutboundMedia {
                    media_id: media_id.clone(),
                    chunks,
                });
                RecordKind::DataMedia {
                    id: media_id,
                    mime_type,
                    name,
                }
            }

            Value::LiveObject(proxy) => {
                let methods = out
                    .claim_method_list(ctx.methods, proxy.backend(), proxy.methods())
                    .then(|| proxy.methods().as_ref().clone());
                out.known_live_objects.insert(proxy.clone());
                RecordKind::LiveObject(LiveObjectRecord {
                    backend: proxy.backend().to_string(),
                    id: proxy.id().to_string(),
                    permissions: proxy.permissions().to_vec(),
                    mac: proxy.mac().to_string(),
                    methods,
                    item_cache: None,
                    iter_items: None,
                })
            }

            Value::Capability(cap) => {
                out.known_capabilities.push(cap.clone());
                RecordKind::Capability {
                    scope: cap.scope().to_vec(),
                    mac: cap.mac().to_string(),
                    narrow: cap.narrowing().to_vec(),
                }
            }

            Value::NaiveDateTime(naive) => RecordKind::DateTime(format_datetime(&stamp_local(naive))),
            Value::DateTime(dt) => RecordKind::DateTime(format_datetime(dt)),
            Value::Date(date) => RecordKind::Date(date.format(DATE_FORMAT).to_string()),

            Value::Long(long) => RecordKind::Long(long.to_string()),
            Value::Int(n) => RecordKind::Long(n.to_string()),
            Value::Float(f) => RecordKind::Float(float_text(*f)),

            Value::Portable(obj) => match ctx.types.resolve(obj.type_name()) {
                Some(portable) => RecordKind::ValueType {
                    type_name: portable.name().to_string(),
                },
                None => return Err(unregistered(path, obj.type_name())),
            },
            Value::Class(name) => match ctx.types.resolve(name) {
                Some(portable) => RecordKind::ClassType {
                    name: portable.name().to_string(),
                },
                None => return Err(unregistered(path, name)),
            },

            other => match to_plain_json(other) {
                Some(json) => RecordKind::Primitive(json),
                None => return Err(SerializationError::unsupported(path, other.kind())),
            },
        };
        out.records.push(NonJsonRecord::new(path, kind));
    }

    Ok(out)
}

fn unregistered(path: Path, type_name: &str) -> SerializationError {
    SerializationError::UnregisteredType {
        path,
        type_name: type_name.to_string(),
    }
}

/// Attach the local UTC offset in effect at that wall-clock time.
pub fn stamp_local(naive: &NaiveDateTime) -> DateTime<FixedOffset> {
    let offset = Local
        .offset_from_local_datetime(naive)
        .earliest()
        .map(|o| o.fix())
        .unwrap_or_else(|| Local::now().offset().fix());
    naive
        .and_local_timezone(offset)
        .earliest()
        .unwrap_or_else(|| DateTime::from_naive_utc_and_offset(*naive - offset, offset))
}

pub fn format_datetime(dt: &DateTime<FixedOffset>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

pub fn float_text(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f == f64::INFINITY {
        "inf".to_string()
    } else if f == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        f.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityEpoch;
    use crate::live_object::{LiveObjectProxy, LiveObjectSpec};
    use crate::media::BlobMedia;
    use crate::portable::PortableType;
    use crate::value::PortableObject;
    use bytes::Bytes;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Arc;

    fn leaf(path: Vec<crate::path::PathSegment>, value: Value) -> NonJsonLeaf {
        NonJsonLeaf {
            path: Path::new(path),
            value,
        }
    }

    #[tokio::test]
    async fn test_media_is_chunked_with_call_scoped_ids() {
        let types = TypeRegistry::new();
        let methods = MethodCache::new();
        let ctx = ResolveContext::new("call-9", &types, &methods).with_chunk_size(4);

        let media = BlobMedia::new("image/png", Bytes::from_static(b"0123456789"))
            .with_name("pic.png")
            .into_ref();
        let out = resolve_leaves(vec![leaf(vec!["y".into()], Value::Media(media))], &ctx)
            .await
            .unwrap();

        assert_eq!(out.media.len(), 1);
        assert_eq!(out.media[0].media_id, "call-9_0");
        assert_eq!(out.media[0].chunks.len(), 3);
        let json = out.records_json();
        assert_eq!(json[0]["type"], json!(["DataMedia"]));
        assert_eq!(json[0]["id"], "call-9_0");
        assert_eq!(json[0]["mime-type"], "image/png");
        assert_eq!(json[0]["name"], "pic.png");
        assert_eq!(json[0]["path"], json!(["y"]));
    }

    #[tokio::test]
    async fn test_scalars_encode_as_text() {
        let types = TypeRegistry::new();
        let methods = MethodCache::new();
        let ctx = ResolveContext::new("c", &types, &methods);

        let offset = FixedOffset::east_opt(3600).unwrap();
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 0, 5)
            .unwrap()
            .and_local_timezone(offset)
            .unwrap();

        let out = resolve_leaves(
            vec![
                leaf(vec![0usize.into()], Value::DateTime(dt)),
                leaf(vec![1usize.into()], Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())),
                leaf(vec![2usize.into()], Value::Float(f64::NEG_INFINITY)),
                leaf(vec![3usize.into()], Value::Int(9_007_199_254_740_993)),
            ],
            &ctx,
        )
        .await
        .unwrap();

        let json = out.records_json();
        assert_eq!(json[0]["value"], "2024-03-01 12:30:00.000005+0100");
        assert_eq!(json[1]["value"], "2024-03-01");
        assert_eq!(json[2]["value"], "-inf");
        assert_eq!(json[3]["type"], json!(["Long"]));
        assert_eq!(json[3]["value"], "9007199254740993");
    }

    #[tokio::test]
    async fn test_method_list_sent_once_per_backend() {
        let types = TypeRegistry::new();
        let methods = MethodCache::new();
        let ctx = ResolveContext::new("c", &types, &methods);

        let mut spec = LiveObjectSpec::new("tables.Row", "1");
        spec.methods = Arc::new(vec!["update".into()]);
        let row = LiveObjectProxy::new(spec);

        let first = resolve_leaves(
            vec![
                leaf(vec!["a".into()], Value::LiveObject(row.clone())),
                leaf(vec!["b".into()], Value::LiveObject(row.clone())),
            ],
            &ctx,
        )
        .await
        .unwrap();
        let json = first.records_json();
        assert_eq!(json[0]["methods"], json!(["update"]));
        assert!(json[1].get("methods").is_none());
        assert_eq!(first.known_live_objects.instances("tables.Row", "1").len(), 2);

        // not committed yet, so the next call still carries the list
        let retry = resolve_leaves(vec![leaf(vec!["a".into()], Value::LiveObject(row.clone()))], &ctx)
            .await
            .unwrap();
        assert_eq!(retry.records_json()[0]["methods"], json!(["update"]));

        first.commit_method_lists(&methods);
        let second = resolve_leaves(vec![leaf(vec!["a".into()], Value::LiveObject(row))], &ctx)
            .await
            .unwrap();
        assert!(second.records_json()[0].get("methods").is_none());
        assert!(second.method_lists.is_empty());
    }

    #[tokio::test]
    async fn test_capabilities_are_tracked() {
        let types = TypeRegistry::new();
        let methods = MethodCache::new();
        let ctx = ResolveContext::new("c", &types, &methods);
        let cap = Capability::new(vec![json!("files")], "mac", vec![json!("a")], &CapabilityEpoch::new());

        let out = resolve_leaves(vec![leaf(vec!["k".into()], Value::Capability(cap.clone()))], &ctx)
            .await
            .unwrap();
        assert_eq!(out.known_capabilities, vec![cap]);
        assert_eq!(out.records_json()[0]["narrow"], json!(["a"]));
    }

    #[tokio::test]
    async fn test_portable_and_class_need_registration() {
        let types = TypeRegistry::new();
        types.register(PortableType::new("app.Point"));
        let methods = MethodCache::new();
        let ctx = ResolveContext::new("c", &types, &methods);

        let out = resolve_leaves(
            vec![
                leaf(vec![], Value::Portable(PortableObject::new("app.Point"))),
                leaf(vec!["cls".into()], Value::Class("app.Point".into())),
            ],
            &ctx,
        )
        .await
        .unwrap();
        let json = out.records_json();
        assert_eq!(json[0]["valueType"], "app.Point");
        assert_eq!(json[1]["name"], "app.Point");

        let err = resolve_leaves(vec![leaf(vec!["z".into()], Value::Class("app.Nope".into()))], &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("app.Nope"));
        assert_eq!(err.path(), Some(&Path::new(vec!["z".into()])));

        let err = resolve_leaves(vec![leaf(vec!["f".into()], Value::Opaque("function".into()))], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SerializationError::Unsupported { .. }));
    }

    #[test]
    fn test_stamp_local_keeps_wall_clock() {
        let naive = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        assert_eq!(stamp_local(&naive).naive_local(), naive);
    }
}

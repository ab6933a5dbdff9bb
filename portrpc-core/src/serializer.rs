// Value walk: split a value graph into a JSON skeleton and the ordered list
// of leaves JSON cannot carry. Each leaf leaves a `null` (or, for portable
// objects, its serialized form) at its position in the skeleton.

use crate::error::SerializationError;
use crate::path::{Path, PathSegment, PathTracker};
use crate::portable::TypeRegistry;
use crate::scratch::SerializationInfo;
use crate::value::{Key, Value, MAX_SAFE_INTEGER};
use crate::wire::GLOBAL_FIELD;
use indexmap::IndexMap;
use serde_json::{Map, Number, Value as JsonValue};
use tracing::trace;

/// Deepest nesting accepted before a walk is abandoned.
pub const MAX_DEPTH: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct NonJsonLeaf {
    pub path: Path,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerializedTree {
    pub json: JsonValue,
    pub leaves: Vec<NonJsonLeaf>,
}

#[derive(Debug)]
pub struct Serializer<'a> {
    types: &'a TypeRegistry,
    path: PathTracker,
    leaves: Vec<NonJsonLeaf>,
}

impl<'a> Serializer<'a> {
    pub fn new(types: &'a TypeRegistry) -> Self {
        Self::with_prefix(types, Vec::new())
    }

    /// Walk values that live below `prefix` in the envelope.
    pub fn with_prefix(types: &'a TypeRegistry, prefix: Vec<PathSegment>) -> Self {
        Self {
            types,
            path: PathTracker::with_prefix(prefix),
            leaves: Vec::new(),
        }
    }

    pub fn serialize(
        mut self,
        value: &Value,
        info: &mut SerializationInfo,
    ) -> Result<SerializedTree, SerializationError> {
        let json = self.walk(value, info, 0)?;
        Ok(SerializedTree {
            json,
            leaves: self.leaves,
        })
    }

    fn walk(
        &mut self,
        value: &Value,
        info: &mut SerializationInfo,
        depth: usize,
    ) -> Result<JsonValue, SerializationError> {
        if depth > MAX_DEPTH {
            return Err(SerializationError::TooDeep {
                path: self.path.current(),
            });
        }

        match value {
            Value::Portable(obj) => {
                let Some(portable) = self.types.resolve(obj.type_name()) else {
                    // the resolver reports the unregistered name with its path
                    return Ok(self.leaf(value));
                };
                let data = info.with_type(portable.name(), |info| portable.serialize(obj, info))?;
                let json = self.walk(&data, info, depth + 1)?;
                self.leaves.push(NonJsonLeaf {
                    path: self.path.current(),
                    value: value.clone(),
                });
                Ok(json)
            }
            Value::None => Ok(JsonValue::Null),
            Value::Bool(b) => Ok(JsonValue::Bool(*b)),
            Value::Int(n) if n.unsigned_abs() <= MAX_SAFE_INTEGER as u64 => {
                Ok(JsonValue::Number((*n).into()))
            }
            Value::Float(f) if f.is_finite() => {
                Ok(Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number))
            }
            Value::Str(s) => Ok(JsonValue::String(s.clone())),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    self.path.push_index(index);
                    let json = self.walk(item, info, depth + 1);
                    self.path.pop();
                    out.push(json?);
                }
                Ok(JsonValue::Array(out))
            }
            Value::Dict(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    let Key::Str(key) = key else {
                        return Err(SerializationError::NonStringKey {
                            path: self.path.current(),
                            key: key.to_string(),
                        });
                    };
                    self.path.push_key(key);
                    let json = self.walk(item, info, depth + 1);
                    self.path.pop();
                    out.insert(key.clone(), json?);
                }
                Ok(JsonValue::Object(out))
            }
            _ => Ok(self.leaf(value)),
        }
    }

    fn leaf(&mut self, value: &Value) -> JsonValue {
        trace!("Non-JSON {} at {}", value.kind(), self.path.current());
        self.leaves.push(NonJsonLeaf {
            path: self.path.current(),
            value: value.clone(),
        });
        JsonValue::Null
    }
}

/// A call's top-level fields plus the transmitted scratch region.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedCall {
    pub fields: Map<String, JsonValue>,
    pub vt_global: JsonValue,
    /// Global-region leaves first, then the fields' leaves in walk order.
    pub leaves: Vec<NonJsonLeaf>,
}

/// Serialize each named field of a call, then the scratchpad's transmitted
/// region under `vt_global`. Transmission is disabled before the region is
/// walked, so hooks running inside it cannot grow it.
pub fn serialize_fields(
    fields: &IndexMap<String, Value>,
    info: &mut SerializationInfo,
    types: &TypeRegistry,
) -> Result<SerializedCall, SerializationError> {
    let mut out = Map::with_capacity(fields.len());
    let mut leaves = Vec::new();
    for (name, value) in fields {
        let tree = Serializer::with_prefix(types, vec![PathSegment::Key(name.clone())])
            .serialize(value, info)?;
        out.insert(name.clone(), tree.json);
        leaves.extend(tree.leaves);
    }

    info.disable_tx();
    let region = info.transmitted_region();
    let global = Serializer::with_prefix(types, vec![PathSegment::Key(GLOBAL_FIELD.to_string())])
        .serialize(&region, info)?;

    let mut all = global.leaves;
    all.extend(leaves);
    Ok(SerializedCall {
        fields: out,
        vt_global: global.json,
        leaves: all,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScratchError;
    use crate::media::BlobMedia;
    use crate::portable::PortableType;
    use crate::value::{LongInt, PortableObject};
    use bytes::Bytes;
    use serde_json::json;

    fn walk(value: &Value) -> Result<SerializedTree, SerializationError> {
        let types = TypeRegistry::new();
        Serializer::new(&types).serialize(value, &mut SerializationInfo::new())
    }

    #[test]
    fn test_plain_json_passes_through() {
        let value = Value::dict([
            ("a", Value::List(vec![Value::Int(1), Value::Float(2.5), Value::None])),
            ("b", Value::str("x")),
        ]);
        let tree = walk(&value).unwrap();
        assert_eq!(tree.json, json!({"a": [1, 2.5, null], "b": "x"}));
        assert!(tree.leaves.is_empty());
    }

    #[test]
    fn test_media_becomes_null_leaf() {
        let media = BlobMedia::new("text/plain", Bytes::from_static(b"hi")).into_ref();
        let value = Value::dict([("x", Value::Int(1)), ("y", Value::Media(media))]);
        let tree = walk(&value).unwrap();

        assert_eq!(tree.json, json!({"x": 1, "y": null}));
        assert_eq!(tree.leaves.len(), 1);
        assert_eq!(tree.leaves[0].path, Path::new(vec!["y".into()]));
    }

    #[test]
    fn test_unsafe_numbers_are_leaves() {
        let value = Value::List(vec![
            Value::Int(MAX_SAFE_INTEGER),
            Value::Int(MAX_SAFE_INTEGER + 1),
            Value::Float(f64::NAN),
            Value::Long(LongInt::parse("123456789012345678901234567890").unwrap()),
        ]);
        let tree = walk(&value).unwrap();
        assert_eq!(tree.json, json!([MAX_SAFE_INTEGER, null, null, null]));
        let indexes: Vec<_> = tree.leaves.iter().map(|l| l.path.to_string()).collect();
        assert_eq!(indexes, vec!["[1]", "[2]", "[3]"]);
    }

    #[test]
    fn test_non_string_key_names_path() {
        let mut inner = crate::value::Dict::new();
        inner.insert(Key::Int(3), Value::None);
        let value = Value::dict([("outer", Value::Dict(inner))]);

        let err = walk(&value).unwrap_err();
        assert!(err.is_type_error());
        assert_eq!(err.path(), Some(&Path::new(vec!["outer".into()])));
    }

    #[test]
    fn test_portable_records_original_after_contents() {
        let types = TypeRegistry::new();
        types.register(PortableType::new("app.Point"));
        let point = PortableObject::new("app.Point");
        point.set_attr("when", Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()));
        point.set_attr("x", Value::Int(1));

        let tree = Serializer::new(&types)
            .serialize(&Value::Portable(point.clone()), &mut SerializationInfo::new())
            .unwrap();

        assert_eq!(tree.json, json!({"when": null, "x": 1}));
        assert_eq!(tree.leaves.len(), 2);
        assert_eq!(tree.leaves[0].path, Path::new(vec!["when".into()]));
        assert_eq!(tree.leaves[1].path, Path::root());
        assert_eq!(tree.leaves[1].value, Value::Portable(point));
    }

    #[test]
    fn test_unregistered_portable_is_left_for_resolver() {
        let tree = walk(&Value::Portable(PortableObject::new("app.Unknown"))).unwrap();
        assert_eq!(tree.json, JsonValue::Null);
        assert_eq!(tree.leaves.len(), 1);
    }

    #[test]
    fn test_global_leaves_are_prepended() {
        let types = TypeRegistry::new();
        types.register(PortableType::new("app.Node").with_serializer(|obj, info| {
            info.insert("seen", Value::Date(chrono::NaiveDate::from_ymd_opt(2020, 5, 5).unwrap()))?;
            Ok(Value::dict([("name", obj.get_attr("name").unwrap_or(Value::None))]))
        }));
        let node = PortableObject::new("app.Node");
        node.set_attr("name", Value::str("n"));

        let mut fields = IndexMap::new();
        fields.insert("args".to_string(), Value::List(vec![Value::Portable(node)]));
        fields.insert("kwargs".to_string(), Value::Dict(Default::default()));

        let mut info = SerializationInfo::new();
        let call = serialize_fields(&fields, &mut info, &types).unwrap();

        assert_eq!(call.fields["args"], json!([{"name": "n"}]));
        assert_eq!(call.vt_global, json!({"app.Node": {"seen": null}}));
        assert_eq!(
            call.leaves[0].path.to_string(),
            "[\"vt_global\"][\"app.Node\"][\"seen\"]"
        );
        assert_eq!(call.leaves[1].path.to_string(), "[\"args\"][0]");
        assert!(!info.is_tx_enabled());
    }

    #[test]
    fn test_hooks_inside_global_region_fail_fast() {
        let types = TypeRegistry::new();
        types.register(PortableType::new("app.Greedy").with_serializer(|_, info| {
            info.shared_data(None)?;
            Ok(Value::None)
        }));

        let mut info = SerializationInfo::new();
        info.shared_data(None)
            .unwrap()
            .insert("obj".into(), Value::Portable(PortableObject::new("app.Greedy")));

        let err = serialize_fields(&IndexMap::new(), &mut info, &types).unwrap_err();
        assert_eq!(err, SerializationError::Scratch(ScratchError::TransmissionDisabled));
    }

    #[test]
    fn test_runaway_nesting_is_reported() {
        let mut value = Value::None;
        for _ in 0..(MAX_DEPTH + 2) {
            value = Value::List(vec![value]);
        }
        assert!(matches!(walk(&value), Err(SerializationError::TooDeep { .. })));
    }
}

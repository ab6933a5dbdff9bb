// Value model of the calling environment.
//
// The core never inspects application objects directly; everything it
// needs is expressed through this enum: primitive kinds, containers, and
// the handful of extension kinds that have their own wire records.

use crate::capability::Capability;
use crate::live_object::LiveObjectProxy;
use crate::media::{LazyMedia, MediaRef};
use crate::path::PathSegment;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde_json::{Number, Value as JsonValue};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Largest integer a JSON number carries without precision loss in the
/// receiving environment (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Mapping key. Only `Str` keys can cross the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Str(String),
    Int(i64),
    Bool(bool),
    None,
}

impl Key {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Str(s) => write!(f, "{:?}", s),
            Key::Int(n) => write!(f, "{}", n),
            Key::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Key::None => write!(f, "None"),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

pub type Dict = IndexMap<Key, Value>;

/// Arbitrary-precision integer kept in canonical decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LongInt(String);

impl LongInt {
    /// Parse a decimal integer with an optional sign. Leading zeros are
    /// stripped so equal magnitudes compare equal.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (negative, digits) = match text.as_bytes().first()? {
            b'-' => (true, &text[1..]),
            b'+' => (false, &text[1..]),
            _ => (false, text),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let trimmed = digits.trim_start_matches('0');
        if trimmed.is_empty() {
            return Some(LongInt("0".to_string()));
        }
        if negative {
            Some(LongInt(format!("-{}", trimmed)))
        } else {
            Some(LongInt(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl From<i64> for LongInt {
    fn from(n: i64) -> Self {
        LongInt(n.to_string())
    }
}

impl fmt::Display for LongInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instance of a registered portable type: a type name plus a bag of named
/// attributes. Shared by `Arc` so identity survives a round trip through the
/// global scratch region.
#[derive(Debug)]
pub struct PortableObject {
    type_name: String,
    attrs: RwLock<IndexMap<String, Value>>,
}

impl PortableObject {
    pub fn new(type_name: impl Into<String>) -> Arc<Self> {
        Self::with_attrs(type_name, IndexMap::new())
    }

    pub fn with_attrs(type_name: impl Into<String>, attrs: IndexMap<String, Value>) -> Arc<Self> {
        Arc::new(Self {
            type_name: type_name.into(),
            attrs: RwLock::new(attrs),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get_attr(&self, name: &str) -> Option<Value> {
        let attrs = self.attrs.read().unwrap_or_else(|e| e.into_inner());
        attrs.get(name).cloned()
    }

    pub fn set_attr(&self, name: impl Into<String>, value: Value) {
        let mut attrs = self.attrs.write().unwrap_or_else(|e| e.into_inner());
        attrs.insert(name.into(), value);
    }

    /// Snapshot of the attribute dictionary.
    pub fn attrs(&self) -> IndexMap<String, Value> {
        self.attrs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Merge `values` into the attribute dictionary.
    pub fn update(&self, values: IndexMap<String, Value>) {
        let mut attrs = self.attrs.write().unwrap_or_else(|e| e.into_inner());
        attrs.extend(values);
    }
}

impl PartialEq for PortableObject {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.attrs() == other.attrs()
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Long(LongInt),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(Dict),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    NaiveDateTime(NaiveDateTime),
    Media(MediaRef),
    LazyMedia(LazyMedia),
    LiveObject(LiveObjectProxy),
    Capability(Capability),
    Portable(Arc<PortableObject>),
    /// A portable class itself, by registered name.
    Class(String),
    /// Something the value model holds that has no wire form (functions,
    /// modules, open files...). Carries a description for error messages.
    Opaque(String),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Build a string-keyed dictionary.
    pub fn dict<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Key::Str(k.into()), v))
                .collect(),
        )
    }

    /// Integer from a decimal string, narrowed to `Int` when it fits.
    pub fn from_long(long: LongInt) -> Self {
        match long.to_i64() {
            Some(n) => Value::Int(n),
            None => Value::Long(long),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a string key in a dictionary value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(map) => map.get(&Key::Str(key.to_string())),
            _ => None,
        }
    }

    /// Short kind name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::Long(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Date(_) => "date",
            Value::DateTime(_) | Value::NaiveDateTime(_) => "datetime",
            Value::Media(_) => "Media",
            Value::LazyMedia(_) => "LazyMedia",
            Value::LiveObject(_) => "LiveObjectProxy",
            Value::Capability(_) => "Capability",
            Value::Portable(_) => "portable object",
            Value::Class(_) => "class",
            Value::Opaque(_) => "object",
        }
    }

    /// Child slot addressed by one path segment.
    pub fn slot(&self, segment: &PathSegment) -> Option<&Value> {
        match (self, segment) {
            (Value::Dict(map), PathSegment::Key(key)) => map.get(&Key::Str(key.clone())),
            (Value::List(items), PathSegment::Index(index)) => items.get(*index),
            _ => None,
        }
    }

    pub fn slot_mut(&mut self, segment: &PathSegment) -> Option<&mut Value> {
        match (self, segment) {
            (Value::Dict(map), PathSegment::Key(key)) => map.get_mut(&Key::Str(key.clone())),
            (Value::List(items), PathSegment::Index(index)) => items.get_mut(*index),
            _ => None,
        }
    }

    /// Follow a whole path.
    pub fn lookup(&self, segments: &[PathSegment]) -> Option<&Value> {
        segments
            .iter()
            .try_fold(self, |current, segment| current.slot(segment))
    }

    /// Assign `value` at `segments`, walking all but the last segment.
    /// Dictionaries accept new keys; lists only accept existing indices.
    /// Returns the previous occupant.
    pub fn assign(&mut self, segments: &[PathSegment], value: Value) -> Option<Value> {
        let (last, parents) = segments.split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.slot_mut(segment)?;
        }
        match (current, last) {
            (Value::Dict(map), PathSegment::Key(key)) => {
                Some(map.insert(Key::Str(key.clone()), value).unwrap_or(Value::None))
            }
            (Value::List(items), PathSegment::Index(index)) => items
                .get_mut(*index)
                .map(|slot| std::mem::replace(slot, value)),
            _ => None,
        }
    }
}

/// Convert plain JSON into values. Integers outside `i64` become `Long`.
pub fn from_json(json: &JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::None,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => number_to_value(n),
        JsonValue::String(s) => Value::Str(s.clone()),
        JsonValue::Array(items) => Value::List(items.iter().map(from_json).collect()),
        JsonValue::Object(map) => Value::Dict(
            map.iter()
                .map(|(k, v)| (Key::Str(k.clone()), from_json(v)))
                .collect(),
        ),
    }
}

fn number_to_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else if let Some(u) = n.as_u64() {
        Value::Long(LongInt(u.to_string()))
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Convert a value made only of JSON-representable kinds back into JSON.
/// Returns `None` as soon as a non-JSON kind is found.
pub fn to_plain_json(value: &Value) -> Option<JsonValue> {
    Some(match value {
        Value::None => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(n) => JsonValue::Number((*n).into()),
        Value::Float(f) => JsonValue::Number(Number::from_f64(*f)?),
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::List(items) => {
            JsonValue::Array(items.iter().map(to_plain_json).collect::<Option<Vec<_>>>()?)
        }
        Value::Dict(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.as_str()?.to_string(), to_plain_json(v)?);
            }
            JsonValue::Object(out)
        }
        _ => return None,
    })
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Int(a), Value::Long(b)) | (Value::Long(b), Value::Int(a)) => {
                b.as_str() == a.to_string()
            }
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b && a.offset() == b.offset(),
            (Value::NaiveDateTime(a), Value::NaiveDateTime(b)) => a == b,
            (Value::Media(a), Value::Media(b)) => Arc::ptr_eq(a, b),
            (Value::LazyMedia(a), Value::LazyMedia(b)) => a == b,
            (Value::LiveObject(a), Value::LiveObject(b)) => a == b,
            (Value::Capability(a), Value::Capability(b)) => a == b,
            (Value::Portable(a), Value::Portable(b)) => Arc::ptr_eq(a, b) || **a == **b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Int(n) => write!(f, "{}", n),
            Value::Long(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Date(d) => write!(f, "date({})", d),
            Value::DateTime(dt) => write!(f, "datetime({})", dt),
            Value::NaiveDateTime(dt) => write!(f, "datetime({})", dt),
            Value::Media(_) => write!(f, "<Media>"),
            Value::LazyMedia(_) => write!(f, "<LazyMedia>"),
            Value::LiveObject(proxy) => {
                write!(f, "<LiveObject {}:{}>", proxy.backend(), proxy.id())
            }
            Value::Capability(cap) => write!(f, "<Capability {:?}>", cap.full_scope()),
            Value::Portable(obj) => write!(f, "<{} object>", obj.type_name()),
            Value::Class(name) => write!(f, "<class {}>", name),
            Value::Opaque(desc) => write!(f, "<{}>", desc),
        }
    }
}

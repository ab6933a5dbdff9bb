// Per-call scratchpad handed to portable-type hooks.
//
// Transmitted data ends up on the wire under `vt_global` and is rebuilt by
// the receiver before any portable value is reconstructed, which is how
// hooks share state (and object identity) across a whole call graph.
// Local data never leaves the process.

use crate::error::{ReconstructError, ScratchError};
use crate::path::{Path, PathSegment};
use crate::value::{Key, Value};
use indexmap::IndexMap;
use tracing::trace;

/// Key used when neither an explicit key nor a current type is available.
pub const GLOBAL_KEY: &str = "GLOBAL";

pub type ScratchMap = IndexMap<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Partition {
    #[default]
    Transmitted,
    Local,
}

#[derive(Debug, Clone)]
pub struct SerializationInfo {
    tx_data: IndexMap<String, ScratchMap>,
    local_data: IndexMap<String, ScratchMap>,
    tx_enabled: bool,
    active: Partition,
    current_type: Option<String>,
}

impl Default for SerializationInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializationInfo {
    pub fn new() -> Self {
        Self {
            tx_data: IndexMap::new(),
            local_data: IndexMap::new(),
            tx_enabled: true,
            active: Partition::Transmitted,
            current_type: None,
        }
    }

    /// Receiving-side mirror seeded from a reconstructed `vt_global` tree of
    /// the shape `{key: {field: value}}`. Entries that are not string-keyed
    /// dictionaries are ignored.
    pub fn from_global(global: &Value) -> Self {
        let mut info = Self::new();
        if let Value::Dict(regions) = global {
            for (key, region) in regions {
                let (Some(key), Value::Dict(fields)) = (key.as_str(), region) else {
                    continue;
                };
                let map: ScratchMap = fields
                    .iter()
                    .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                    .collect();
                info.tx_data.insert(key.to_string(), map);
            }
        }
        trace!("Seeded scratch mirror with {} regions", info.tx_data.len());
        info
    }

    /// Explicit key, else the registered name of the type whose hook is
    /// running, else `GLOBAL`.
    pub fn resolve_key(&self, key: Option<&str>) -> String {
        key.map(str::to_string)
            .or_else(|| self.current_type.clone())
            .unwrap_or_else(|| GLOBAL_KEY.to_string())
    }

    pub fn shared_data(&mut self, key: Option<&str>) -> Result<&mut ScratchMap, ScratchError> {
        if !self.tx_enabled {
            return Err(ScratchError::TransmissionDisabled);
        }
        let key = self.resolve_key(key);
        Ok(self.tx_data.entry(key).or_default())
    }

    pub fn local_data(&mut self, key: Option<&str>) -> &mut ScratchMap {
        let key = self.resolve_key(key);
        self.local_data.entry(key).or_default()
    }

    pub fn partition(&self) -> Partition {
        self.active
    }

    /// Choose which partition the dict-like accessors below operate on.
    pub fn set_partition(&mut self, partition: Partition) {
        self.active = partition;
    }

    pub fn get(&self, field: &str) -> Result<Option<Value>, ScratchError> {
        let key = self.resolve_key(None);
        let region = match self.active {
            Partition::Transmitted => {
                if !self.tx_enabled {
                    return Err(ScratchError::TransmissionDisabled);
                }
                self.tx_data.get(&key)
            }
            Partition::Local => self.local_data.get(&key),
        };
        Ok(region.and_then(|r| r.get(field).cloned()))
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Result<Option<Value>, ScratchError> {
        Ok(self.active_region()?.insert(field.into(), value))
    }

    pub fn remove(&mut self, field: &str) -> Result<Option<Value>, ScratchError> {
        Ok(self.active_region()?.shift_remove(field))
    }

    pub fn contains_key(&self, field: &str) -> Result<bool, ScratchError> {
        Ok(self.get(field)?.is_some())
    }

    pub fn len(&self) -> Result<usize, ScratchError> {
        let key = self.resolve_key(None);
        let region = match self.active {
            Partition::Transmitted => {
                if !self.tx_enabled {
                    return Err(ScratchError::TransmissionDisabled);
                }
                self.tx_data.get(&key)
            }
            Partition::Local => self.local_data.get(&key),
        };
        Ok(region.map_or(0, IndexMap::len))
    }

    pub fn is_empty(&self) -> Result<bool, ScratchError> {
        Ok(self.len()? == 0)
    }

    pub fn is_tx_enabled(&self) -> bool {
        self.tx_enabled
    }

    /// Close the transmitted partition. Used before the partition itself is
    /// serialized so hooks cannot grow it while it is being walked.
    pub fn disable_tx(&mut self) {
        self.tx_enabled = false;
    }

    /// Run `f` with `type_name` as the current type for key resolution.
    pub fn with_type<R>(&mut self, type_name: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = self.current_type.replace(type_name.to_string());
        let result = f(self);
        self.current_type = previous;
        result
    }

    /// The transmitted partition as a `{key: {field: value}}` dictionary.
    pub fn transmitted_region(&self) -> Value {
        Value::Dict(
            self.tx_data
                .iter()
                .map(|(key, fields)| {
                    let fields = fields
                        .iter()
                        .map(|(k, v)| (Key::Str(k.clone()), v.clone()))
                        .collect();
                    (Key::Str(key.clone()), Value::Dict(fields))
                })
                .collect(),
        )
    }

    /// Value at a path relative to `vt_global` (`[key, field, ...]`).
    pub fn global_slot(&self, segments: &[PathSegment]) -> Option<&Value> {
        let (key, rest) = segments.split_first()?;
        let region = self.tx_data.get(key.as_key()?)?;
        let (field, rest) = rest.split_first()?;
        region.get(field.as_key()?)?.lookup(rest)
    }

    /// Assign a value at a path relative to `vt_global`.
    pub fn assign_global(
        &mut self,
        segments: &[PathSegment],
        value: Value,
    ) -> Result<(), ReconstructError> {
        let not_found = || ReconstructError::PathNotFound(Path::new(segments.to_vec()));
        let (key, rest) = segments.split_first().ok_or_else(not_found)?;
        let key = key.as_key().ok_or_else(not_found)?;
        let region = self.tx_data.entry(key.to_string()).or_default();

        let Some((field, rest)) = rest.split_first() else {
            // replacing a whole region
            let Value::Dict(fields) = value else {
                return Err(not_found());
            };
            *region = fields
                .into_iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
                .collect();
            return Ok(());
        };
        let field = field.as_key().ok_or_else(not_found)?;

        if rest.is_empty() {
            region.insert(field.to_string(), value);
            return Ok(());
        }
        region
            .get_mut(field)
            .and_then(|slot| slot.assign(rest, value))
            .map(|_| ())
            .ok_or_else(not_found)
    }

    fn active_region(&mut self) -> Result<&mut ScratchMap, ScratchError> {
        match self.active {
            Partition::Transmitted => self.shared_data(None),
            Partition::Local => Ok(self.local_data(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_resolution_order() {
        let mut info = SerializationInfo::new();
        assert_eq!(info.resolve_key(None), GLOBAL_KEY);
        assert_eq!(info.resolve_key(Some("explicit")), "explicit");

        info.with_type("app.Point", |info| {
            assert_eq!(info.resolve_key(None), "app.Point");
            assert_eq!(info.resolve_key(Some("explicit")), "explicit");
        });
        assert_eq!(info.resolve_key(None), GLOBAL_KEY);
    }

    #[test]
    fn test_partitions_are_separate() {
        let mut info = SerializationInfo::new();
        info.insert("count", Value::Int(1)).unwrap();

        info.set_partition(Partition::Local);
        assert_eq!(info.get("count").unwrap(), None);
        info.insert("count", Value::Int(2)).unwrap();

        info.set_partition(Partition::Transmitted);
        assert_eq!(info.get("count").unwrap(), Some(Value::Int(1)));
        assert_eq!(info.local_data(None).get("count"), Some(&Value::Int(2)));

        let region = info.transmitted_region();
        assert_eq!(
            region.get(GLOBAL_KEY).and_then(|r| r.get("count")),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn test_disabled_transmission_fails_fast() {
        let mut info = SerializationInfo::new();
        info.shared_data(Some("k")).unwrap().insert("a".into(), Value::None);
        info.disable_tx();

        assert_eq!(
            info.shared_data(Some("k")).unwrap_err(),
            ScratchError::TransmissionDisabled
        );
        assert!(info.get("a").is_err());
        assert!(info.insert("b", Value::None).is_err());

        // local data stays usable
        info.set_partition(Partition::Local);
        assert!(info.insert("b", Value::None).is_ok());
        assert_eq!(info.len().unwrap(), 1);
    }

    #[test]
    fn test_mirror_round_trip() {
        let global = Value::dict([(
            "app.Point",
            Value::dict([("cache", Value::List(vec![Value::Int(1), Value::None]))]),
        )]);
        let mut mirror = SerializationInfo::from_global(&global);

        let path = vec![
            PathSegment::Key("app.Point".into()),
            PathSegment::Key("cache".into()),
            PathSegment::Index(1),
        ];
        mirror.assign_global(&path, Value::str("live")).unwrap();
        assert_eq!(mirror.global_slot(&path), Some(&Value::str("live")));

        let missing = vec![PathSegment::Key("app.Point".into()), PathSegment::Index(0)];
        assert!(mirror.assign_global(&missing, Value::None).is_err());
    }
}

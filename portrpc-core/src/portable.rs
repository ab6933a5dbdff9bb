// Portable types: application classes registered for transfer under a
// stable name, with optional serialize / deserialize hooks.

use crate::error::{ReconstructError, SerializationError};
use crate::scratch::SerializationInfo;
use crate::value::{Key, PortableObject, Value};
use dashmap::DashMap;
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub type SerializeHook = Arc<
    dyn Fn(&PortableObject, &mut SerializationInfo) -> Result<Value, SerializationError>
        + Send
        + Sync,
>;

/// Identity-preserving constructor: receives the serialized form (with its
/// own non-JSON leaves already rebuilt) and the scratch mirror.
pub type DeserializeHook =
    Arc<dyn Fn(Value, &mut SerializationInfo) -> Result<Value, ReconstructError> + Send + Sync>;

#[derive(Clone)]
pub struct PortableType {
    name: String,
    serialize: Option<SerializeHook>,
    deserialize: Option<DeserializeHook>,
}

impl PortableType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serialize: None,
            deserialize: None,
        }
    }

    pub fn with_serializer<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PortableObject, &mut SerializationInfo) -> Result<Value, SerializationError>
            + Send
            + Sync
            + 'static,
    {
        self.serialize = Some(Arc::new(hook));
        self
    }

    pub fn with_deserializer<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value, &mut SerializationInfo) -> Result<Value, ReconstructError>
            + Send
            + Sync
            + 'static,
    {
        self.deserialize = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialized form of `obj`: the hook's result, or the attribute
    /// dictionary when there is no hook.
    pub fn serialize(
        &self,
        obj: &PortableObject,
        info: &mut SerializationInfo,
    ) -> Result<Value, SerializationError> {
        match &self.serialize {
            Some(hook) => hook(obj, info),
            None => Ok(Value::Dict(
                obj.attrs()
                    .into_iter()
                    .map(|(k, v)| (Key::Str(k), v))
                    .collect(),
            )),
        }
    }

    /// Rebuild an instance from its serialized form. Without a hook a blank
    /// instance is created and its attributes updated from the dictionary.
    pub fn construct(
        &self,
        data: Value,
        info: &mut SerializationInfo,
    ) -> Result<Value, ReconstructError> {
        if let Some(hook) = &self.deserialize {
            return hook(data, info);
        }
        let obj = PortableObject::new(self.name.clone());
        match data {
            Value::Dict(fields) => {
                let mut attrs = IndexMap::with_capacity(fields.len());
                for (key, value) in fields {
                    let Key::Str(key) = key else {
                        return Err(ReconstructError::invalid(
                            "ValueType",
                            format!("{} attribute names must be strings", self.name),
                        ));
                    };
                    attrs.insert(key, value);
                }
                obj.update(attrs);
            }
            Value::None => {}
            other => {
                return Err(ReconstructError::invalid(
                    "ValueType",
                    format!("{} expects a dict, got {}", self.name, other.kind()),
                ))
            }
        }
        Ok(Value::Portable(obj))
    }
}

impl fmt::Debug for PortableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortableType")
            .field("name", &self.name)
            .field("serialize_hook", &self.serialize.is_some())
            .field("deserialize_hook", &self.deserialize.is_some())
            .finish()
    }
}

/// Resolves portable types that are not registered yet, e.g. by loading
/// the module that defines them.
pub trait TypeLoader: Send + Sync {
    fn load(&self, name: &str) -> Option<PortableType>;
}

/// Name -> portable type table owned by a session.
#[derive(Default)]
pub struct TypeRegistry {
    types: DashMap<String, Arc<PortableType>>,
    loader: RwLock<Option<Arc<dyn TypeLoader>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, portable: PortableType) {
        debug!("Registered portable type {}", portable.name());
        self.types
            .insert(portable.name().to_string(), Arc::new(portable));
    }

    pub fn set_loader(&self, loader: Arc<dyn TypeLoader>) {
        let mut slot = self.loader.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(loader);
    }

    pub fn get(&self, name: &str) -> Option<Arc<PortableType>> {
        self.types.get(name).map(|entry| entry.value().clone())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Registered type, loading it on demand.
    pub fn resolve(&self, name: &str) -> Option<Arc<PortableType>> {
        if let Some(found) = self.get(name) {
            return Some(found);
        }
        let loader = self
            .loader
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;
        let loaded = loader.load(name)?;
        if loaded.name() != name {
            debug!("Loader returned {} when asked for {}", loaded.name(), name);
            return None;
        }
        info!("Loaded portable type {} on demand", name);
        let loaded = Arc::new(loaded);
        self.types.insert(name.to_string(), loaded.clone());
        Some(loaded)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.types.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}

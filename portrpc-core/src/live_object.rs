// Live objects: client-side proxies for server-resident objects.
//
// A proxy is identified by (backend, id). Everything else it carries is
// either an authorization detail (permissions, mac), the backend's method
// list, or cached state the server may push updates for.

use crate::value::{from_json, Value};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// One page of iteration results plus the cursor for the next page.
#[derive(Debug, Clone, PartialEq)]
pub struct IterPage {
    pub items: Vec<Value>,
    pub next_page: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct LiveObjectSpec {
    pub backend: String,
    pub id: String,
    pub permissions: Vec<String>,
    pub mac: String,
    pub methods: Arc<Vec<String>>,
    pub item_cache: Option<IndexMap<String, Value>>,
    pub iter_items: Option<IterPage>,
}

impl LiveObjectSpec {
    pub fn new(backend: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            id: id.into(),
            permissions: Vec::new(),
            mac: String::new(),
            methods: Arc::new(Vec::new()),
            item_cache: None,
            iter_items: None,
        }
    }
}

#[derive(Debug, Default)]
struct LiveObjectCache {
    item_cache: Option<IndexMap<String, Value>>,
    iter_items: Option<IterPage>,
}

#[derive(Debug)]
struct LiveObjectInner {
    backend: String,
    id: String,
    permissions: Vec<String>,
    mac: String,
    methods: Arc<Vec<String>>,
    cache: RwLock<LiveObjectCache>,
}

#[derive(Debug, Clone)]
pub struct LiveObjectProxy {
    inner: Arc<LiveObjectInner>,
}

impl LiveObjectProxy {
    pub fn new(spec: LiveObjectSpec) -> Self {
        Self {
            inner: Arc::new(LiveObjectInner {
                backend: spec.backend,
                id: spec.id,
                permissions: spec.permissions,
                mac: spec.mac,
                methods: spec.methods,
                cache: RwLock::new(LiveObjectCache {
                    item_cache: spec.item_cache,
                    iter_items: spec.iter_items,
                }),
            }),
        }
    }

    pub fn backend(&self) -> &str {
        &self.inner.backend
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn permissions(&self) -> &[String] {
        &self.inner.permissions
    }

    pub fn mac(&self) -> &str {
        &self.inner.mac
    }

    pub fn methods(&self) -> &Arc<Vec<String>> {
        &self.inner.methods
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.iter().any(|m| m == name)
    }

    pub fn item_cache(&self) -> Option<IndexMap<String, Value>> {
        self.read_cache().item_cache.clone()
    }

    pub fn cached_item(&self, key: &str) -> Option<Value> {
        self.read_cache()
            .item_cache
            .as_ref()
            .and_then(|cache| cache.get(key).cloned())
    }

    /// First page of iteration results, if the server sent one along.
    pub fn iter_items(&self) -> Option<IterPage> {
        self.read_cache().iter_items.clone()
    }

    /// Replace the item cache wholesale.
    pub fn apply_cache_update(&self, fields: IndexMap<String, Value>) {
        trace!(
            "Replacing item cache for {}:{} ({} fields)",
            self.inner.backend,
            self.inner.id,
            fields.len()
        );
        let mut cache = self.inner.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.item_cache = Some(fields);
    }

    pub fn clear_item_cache(&self) {
        let mut cache = self.inner.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.item_cache = None;
    }

    /// The addressing fields sent with a call or a record.
    pub fn wire_spec(&self, include_methods: bool) -> Map<String, JsonValue> {
        let mut spec = Map::new();
        spec.insert("backend".into(), JsonValue::from(self.inner.backend.clone()));
        spec.insert("id".into(), JsonValue::from(self.inner.id.clone()));
        spec.insert(
            "permissions".into(),
            JsonValue::from(self.inner.permissions.clone()),
        );
        spec.insert("mac".into(), JsonValue::from(self.inner.mac.clone()));
        if include_methods {
            spec.insert(
                "methods".into(),
                JsonValue::from(self.inner.methods.as_ref().clone()),
            );
        }
        spec
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, LiveObjectCache> {
        self.inner.cache.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl PartialEq for LiveObjectProxy {
    fn eq(&self, other: &Self) -> bool {
        self.inner.backend == other.inner.backend && self.inner.id == other.inner.id
    }
}

impl Eq for LiveObjectProxy {}

impl Hash for LiveObjectProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.backend.hash(state);
        self.inner.id.hash(state);
    }
}

/// Method lists shared per backend. The serializer omits a list the server
/// has already seen; the deserializer fills omitted lists back in.
#[derive(Debug, Default)]
pub struct MethodCache {
    lists: DashMap<String, Arc<Vec<String>>>,
}

impl MethodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `methods` must be sent for `backend`, i.e. the server has not
    /// been sent this exact list yet. Nothing is recorded until [`commit`].
    ///
    /// [`commit`]: MethodCache::commit
    pub fn should_send(&self, backend: &str, methods: &Arc<Vec<String>>) -> bool {
        !self
            .lists
            .get(backend)
            .is_some_and(|known| Arc::ptr_eq(known.value(), methods))
    }

    /// Record that `methods` reached the server for `backend`.
    pub fn commit(&self, backend: &str, methods: &Arc<Vec<String>>) {
        self.lists.insert(backend.to_string(), methods.clone());
    }

    /// Store a list received from the server, returning the shared copy.
    /// An identical list already cached is reused so identity stays stable.
    pub fn remember(&self, backend: &str, methods: Vec<String>) -> Arc<Vec<String>> {
        if let Some(known) = self.lists.get(backend) {
            if known.value().as_ref() == &methods {
                return known.value().clone();
            }
        }
        let shared = Arc::new(methods);
        self.lists.insert(backend.to_string(), shared.clone());
        shared
    }

    pub fn lookup(&self, backend: &str) -> Option<Arc<Vec<String>>> {
        self.lists.get(backend).map(|entry| entry.value().clone())
    }

    pub fn clear(&self) {
        debug!("Clearing {} cached method lists", self.lists.len());
        self.lists.clear();
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

/// Live object instances seen by one call, indexed backend -> id.
#[derive(Debug, Clone, Default)]
pub struct KnownLiveObjects {
    by_backend: HashMap<String, HashMap<String, Vec<LiveObjectProxy>>>,
}

impl KnownLiveObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, proxy: LiveObjectProxy) {
        self.by_backend
            .entry(proxy.backend().to_string())
            .or_default()
            .entry(proxy.id().to_string())
            .or_default()
            .push(proxy);
    }

    pub fn extend(&mut self, other: KnownLiveObjects) {
        for instances in other.by_backend.into_values() {
            for proxy in instances.into_values().flatten() {
                self.insert(proxy);
            }
        }
    }

    pub fn instances(&self, backend: &str, id: &str) -> &[LiveObjectProxy] {
        self.by_backend
            .get(backend)
            .and_then(|ids| ids.get(id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_backend
            .values()
            .flat_map(|ids| ids.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `{backend: {id: {field: value}}}`. Returns how many instances
    /// had their cache replaced.
    pub fn apply_cache_updates(&self, updates: &JsonValue) -> usize {
        let Some(backends) = updates.as_object() else {
            return 0;
        };
        let mut applied = 0;
        for (backend, ids) in backends {
            let Some(ids) = ids.as_object() else { continue };
            for (id, fields) in ids {
                let Some(fields) = fields.as_object() else { continue };
                let cache: IndexMap<String, Value> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), from_json(v)))
                    .collect();
                for proxy in self.instances(backend, id) {
                    proxy.apply_cache_update(cache.clone());
                    applied += 1;
                }
            }
        }
        applied
    }
}

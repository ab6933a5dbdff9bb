// Capability tokens: a server-issued scope plus MAC, narrowable by the
// client. Equality is structural over the full scope so that narrowing an
// empty scope and issuing the narrower scope directly are the same token.

use serde_json::Value as JsonValue;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Session-wide invalidation counter. Capabilities remember the epoch they
/// were issued in and report invalid once it moves on.
#[derive(Debug, Clone, Default)]
pub struct CapabilityEpoch(Arc<AtomicU64>);

impl CapabilityEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Invalidate every capability issued so far. Returns the new epoch.
    pub fn invalidate_all(&self) -> u64 {
        let next = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Capability epoch advanced to {}", next);
        next
    }
}

pub type CapabilityUpdateHandler = Arc<dyn Fn(&JsonValue) + Send + Sync>;

struct CapabilityInner {
    scope: Vec<JsonValue>,
    mac: String,
    narrow: Vec<JsonValue>,
    issued_epoch: u64,
    epoch: CapabilityEpoch,
    update_handler: RwLock<Option<CapabilityUpdateHandler>>,
}

#[derive(Clone)]
pub struct Capability {
    inner: Arc<CapabilityInner>,
}

impl Capability {
    pub fn new(
        scope: Vec<JsonValue>,
        mac: impl Into<String>,
        narrow: Vec<JsonValue>,
        epoch: &CapabilityEpoch,
    ) -> Self {
        Self {
            inner: Arc::new(CapabilityInner {
                scope,
                mac: mac.into(),
                narrow,
                issued_epoch: epoch.current(),
                epoch: epoch.clone(),
                update_handler: RwLock::new(None),
            }),
        }
    }

    pub fn scope(&self) -> &[JsonValue] {
        &self.inner.scope
    }

    pub fn mac(&self) -> &str {
        &self.inner.mac
    }

    /// Client-side narrowing applied on top of the issued scope.
    pub fn narrowing(&self) -> &[JsonValue] {
        &self.inner.narrow
    }

    pub fn full_scope(&self) -> Vec<JsonValue> {
        self.inner
            .scope
            .iter()
            .chain(self.inner.narrow.iter())
            .cloned()
            .collect()
    }

    /// A new capability whose scope is this one's followed by `extra`.
    /// Narrowing only ever appends; the update handler is not inherited.
    pub fn narrow(&self, extra: impl IntoIterator<Item = JsonValue>) -> Capability {
        let mut narrow = self.inner.narrow.clone();
        narrow.extend(extra);
        Capability {
            inner: Arc::new(CapabilityInner {
                scope: self.inner.scope.clone(),
                mac: self.inner.mac.clone(),
                narrow,
                issued_epoch: self.inner.issued_epoch,
                epoch: self.inner.epoch.clone(),
                update_handler: RwLock::new(None),
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.issued_epoch == self.inner.epoch.current()
    }

    pub fn set_update_handler<F>(&self, handler: F)
    where
        F: Fn(&JsonValue) + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .update_handler
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(handler));
    }

    /// Deliver a server-pushed update. Returns whether a handler ran.
    pub fn apply_update(&self, update: &JsonValue) -> bool {
        let handler = self
            .inner
            .update_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => {
                trace!("Applying capability update for {}", self.normalized_key());
                handler(update);
                true
            }
            None => false,
        }
    }

    /// Key used by capability update maps.
    pub fn normalized_key(&self) -> String {
        normalized_scope_key(&self.full_scope())
    }
}

/// Canonical JSON text of a scope: compact, object keys sorted.
pub fn normalized_scope_key(scope: &[JsonValue]) -> String {
    let mut out = String::new();
    out.push('[');
    for (i, item) in scope.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(item, &mut out);
    }
    out.push(']');
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.full_scope() == other.full_scope()
    }
}

impl Eq for Capability {}

impl Hash for Capability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized_key().hash(state);
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("scope", &self.inner.scope)
            .field("narrow", &self.inner.narrow)
            .field("valid", &self.is_valid())
            .finish()
    }
}

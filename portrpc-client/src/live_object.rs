// Client handles for live objects: method calls, item access and paged
// iteration.

use crate::client::Client;
use crate::error::ClientError;
use indexmap::IndexMap;
use portrpc_core::{LiveObjectProxy, Value};
use std::collections::VecDeque;
use tracing::trace;

pub const GET_ITEM_METHOD: &str = "__getitem__";
pub const SET_ITEM_METHOD: &str = "__setitem__";
pub const ITER_PAGE_METHOD: &str = "__iter_page__";

/// A live object bound to the client that makes its calls.
#[derive(Debug, Clone)]
pub struct LiveObjectHandle<'c> {
    client: &'c Client,
    proxy: LiveObjectProxy,
}

impl<'c> LiveObjectHandle<'c> {
    pub fn new(client: &'c Client, proxy: LiveObjectProxy) -> Self {
        Self { client, proxy }
    }

    pub fn proxy(&self) -> &LiveObjectProxy {
        &self.proxy
    }

    /// Call one of the backend's methods. Names outside a non-empty method
    /// list are refused locally.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
    ) -> Result<Value, ClientError> {
        if !self.proxy.methods().is_empty() && !self.proxy.has_method(method) {
            return Err(ClientError::InvalidArguments(format!(
                "{} has no method {}",
                self.proxy.backend(),
                method
            )));
        }
        self.client
            .call_live_object(&self.proxy, method, args, kwargs)
            .await
    }

    /// Item lookup, served from the item cache when the key is cached.
    pub async fn get_item(&self, key: &str) -> Result<Value, ClientError> {
        if let Some(value) = self.proxy.cached_item(key) {
            trace!("Cache hit for {}[{:?}]", self.proxy.backend(), key);
            return Ok(value);
        }
        self.client
            .call_live_object(
                &self.proxy,
                GET_ITEM_METHOD,
                vec![Value::str(key)],
                IndexMap::new(),
            )
            .await
    }

    pub async fn set_item(&self, key: &str, value: Value) -> Result<(), ClientError> {
        self.client
            .call_live_object(
                &self.proxy,
                SET_ITEM_METHOD,
                vec![Value::str(key), value.clone()],
                IndexMap::new(),
            )
            .await?;
        if let Some(mut cache) = self.proxy.item_cache() {
            cache.insert(key.to_string(), value);
            self.proxy.apply_cache_update(cache);
        }
        Ok(())
    }

    /// Iterate the object's items, taking every `step`th item and stopping
    /// after `limit` items.
    pub fn iter(&self, limit: Option<usize>, step: usize) -> LiveObjectIter<'c> {
        LiveObjectIter::new(self.client, self.proxy.clone(), limit, step)
    }
}

/// Page-based iteration over a live object. Pages are fetched through
/// `__iter_page__(cursor)`, which returns `[items, next_cursor]`; a missing
/// cursor ends the iteration.
#[derive(Debug)]
pub struct LiveObjectIter<'c> {
    client: &'c Client,
    proxy: LiveObjectProxy,
    buffer: VecDeque<Value>,
    cursor: Option<Value>,
    fetched: bool,
    limit: Option<usize>,
    step: usize,
    position: usize,
    yielded: usize,
}

impl<'c> LiveObjectIter<'c> {
    fn new(client: &'c Client, proxy: LiveObjectProxy, limit: Option<usize>, step: usize) -> Self {
        let (buffer, cursor, fetched) = match proxy.iter_items() {
            Some(page) => (page.items.into(), page.next_page.filter(|c| !c.is_none()), true),
            None => (VecDeque::new(), None, false),
        };
        Self {
            client,
            proxy,
            buffer,
            cursor,
            fetched,
            limit,
            step: step.max(1),
            position: 0,
            yielded: 0,
        }
    }

    pub async fn next(&mut self) -> Result<Option<Value>, ClientError> {
        loop {
            if self.limit.is_some_and(|limit| self.yielded >= limit) {
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                let keep = self.position % self.step == 0;
                self.position += 1;
                if keep {
                    self.yielded += 1;
                    return Ok(Some(item));
                }
                continue;
            }

            let cursor = if self.fetched {
                match self.cursor.take() {
                    Some(cursor) => cursor,
                    None => return Ok(None),
                }
            } else {
                Value::None
            };
            self.fetch(cursor).await?;
        }
    }

    /// Drain the remaining items.
    pub async fn collect(mut self) -> Result<Vec<Value>, ClientError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    async fn fetch(&mut self, cursor: Value) -> Result<(), ClientError> {
        let page = self
            .client
            .call_live_object(&self.proxy, ITER_PAGE_METHOD, vec![cursor], IndexMap::new())
            .await?;
        self.fetched = true;

        let (items, next) = split_page(page)?;
        trace!(
            "Fetched {} items from {}, more: {}",
            items.len(),
            self.proxy.backend(),
            next.is_some()
        );
        self.buffer.extend(items);
        self.cursor = next;
        Ok(())
    }
}

fn split_page(page: Value) -> Result<(Vec<Value>, Option<Value>), ClientError> {
    let Value::List(mut parts) = page else {
        return Err(ClientError::Protocol(
            "iteration page must be a list of [items, next_page]".into(),
        ));
    };
    if parts.len() != 2 {
        return Err(ClientError::Protocol(format!(
            "iteration page has {} elements, expected 2",
            parts.len()
        )));
    }
    let next = parts.pop().filter(|cursor| !cursor.is_none());
    match parts.pop() {
        Some(Value::List(items)) => Ok((items, next)),
        _ => Err(ClientError::Protocol(
            "iteration page items must be a list".into(),
        )),
    }
}

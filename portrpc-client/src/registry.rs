// Outstanding requests, keyed by call id in registration order.
//
// A request completes once its response has arrived and every media entry
// the response announces has been fully received. Registration order is what
// the send path drains on: each new request waits until every request
// registered before it has settled.

use crate::error::ClientError;
use crate::profile::ProfileSpan;
use crate::session::Session;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use portrpc_core::wire::HEARTBEAT_ID_PREFIX;
use portrpc_core::{
    reconstruct_objects, Capability, ChunkHeader, KnownLiveObjects, MediaBuffer, NonJsonRecord,
    RecordKind, ResponseEnvelope, ServerErrorPayload, Value,
};
use portrpc_transport::TransportError;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

pub type CallResult = Result<Value, ClientError>;

struct PendingRequest {
    label: String,
    result: oneshot::Sender<CallResult>,
    settled: watch::Sender<bool>,
    /// Generation of the streaming connection the request was written to.
    connection: Option<u64>,
    response: Option<ResponseEnvelope>,
    media: HashMap<String, MediaBuffer>,
    known_live_objects: KnownLiveObjects,
    known_capabilities: Vec<Capability>,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Handle returned by [`RequestRegistry::register`]. Dropping it before the
/// outcome arrives abandons the request so later calls are not held up.
pub struct Registration {
    id: String,
    registry: Arc<RequestRegistry>,
    result: Option<oneshot::Receiver<CallResult>>,
    predecessors: Vec<watch::Receiver<bool>>,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait until every request registered earlier has settled.
    pub async fn drain_predecessors(&mut self) {
        let waiting = self.predecessors.len();
        for mut settled in self.predecessors.drain(..) {
            // A dropped sender means the request is gone, which also counts.
            if settled.wait_for(|done| *done).await.is_err() {
                trace!("Predecessor of {} dropped", self.id);
            }
        }
        if waiting > 0 {
            trace!("{} drained {} predecessors", self.id, waiting);
        }
    }

    /// Attach the live objects and capabilities sent with the request, once
    /// they are known.
    pub fn set_known(&self, known_live_objects: KnownLiveObjects, known_capabilities: Vec<Capability>) {
        self.registry
            .set_known(&self.id, known_live_objects, known_capabilities);
    }

    pub async fn outcome(mut self) -> CallResult {
        match self.result.take() {
            Some(result) => result.await.unwrap_or(Err(ClientError::Abandoned)),
            None => Err(ClientError::Abandoned),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.abandon(&self.id);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("predecessors", &self.predecessors.len())
            .finish()
    }
}

pub struct RequestRegistry {
    session: Arc<Session>,
    pending: Mutex<IndexMap<String, PendingRequest>>,
    /// Most recently announced chunk header; the next binary frame belongs to it.
    last_header: Mutex<Option<ChunkHeader>>,
}

impl RequestRegistry {
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            session,
            pending: Mutex::new(IndexMap::new()),
            last_header: Mutex::new(None),
        })
    }

    fn pending(&self) -> MutexGuard<'_, IndexMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request. Live objects and capabilities sent with it are
    /// kept so server-pushed updates in its response can reach them.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
        label: &str,
        known_live_objects: KnownLiveObjects,
        known_capabilities: Vec<Capability>,
    ) -> Registration {
        let (result_tx, result_rx) = oneshot::channel();
        let (settled_tx, _) = watch::channel(false);

        let mut pending = self.pending();
        let predecessors = pending
            .values()
            .map(|request| request.settled.subscribe())
            .collect();
        pending.insert(
            id.to_string(),
            PendingRequest {
                label: label.to_string(),
                result: result_tx,
                settled: settled_tx,
                connection: None,
                response: None,
                media: HashMap::new(),
                known_live_objects,
                known_capabilities,
                started: Instant::now(),
                started_at: Utc::now(),
            },
        );
        debug!("Registered request {} ({}), {} outstanding", id, label, pending.len());

        Registration {
            id: id.to_string(),
            registry: Arc::clone(self),
            result: Some(result_rx),
            predecessors,
        }
    }

    pub fn set_known(
        &self,
        id: &str,
        known_live_objects: KnownLiveObjects,
        known_capabilities: Vec<Capability>,
    ) {
        if let Some(request) = self.pending().get_mut(id) {
            request.known_live_objects.extend(known_live_objects);
            request.known_capabilities.extend(known_capabilities);
        }
    }

    pub fn bind_connection(&self, id: &str, generation: u64) {
        if let Some(request) = self.pending().get_mut(id) {
            request.connection = Some(generation);
        }
    }

    pub fn unbind_connection(&self, id: &str) {
        if let Some(request) = self.pending().get_mut(id) {
            request.connection = None;
        }
    }

    pub fn is_outstanding(&self, id: &str) -> bool {
        self.pending().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn on_response(&self, response: ResponseEnvelope) {
        let id = response.id().to_string();
        {
            let mut pending = self.pending();
            let Some(request) = pending.get_mut(&id) else {
                warn!("Response for unknown request {}", id);
                return;
            };
            request.response = Some(response);
        }
        self.maybe_complete(&id);
    }

    pub fn on_error_response(&self, id: &str, error: &ServerErrorPayload) {
        let remote = self.session.exceptions().assemble(error);
        if remote.is_session_expired() {
            warn!("Session expired; invalidating capabilities");
            self.session.epoch().invalidate_all();
        }
        debug!("Request {} failed on the server: {}", id, remote.type_name);
        self.reject(id, ClientError::Remote(remote));
    }

    pub fn on_chunk_header(&self, header: ChunkHeader) {
        trace!(
            "Chunk header {}#{} for {}",
            header.media_id,
            header.chunk_index,
            header.request_id
        );
        *self.last_header.lock().unwrap_or_else(|e| e.into_inner()) = Some(header);
    }

    /// A binary frame, attributed to the most recently announced header.
    pub fn on_binary(&self, data: Bytes) {
        let header = self
            .last_header
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match header {
            Some(header) => self.on_inbound_chunk(
                &header.request_id,
                &header.media_id,
                header.chunk_index,
                data,
                header.last_chunk,
            ),
            None => warn!("Binary frame of {} bytes without a chunk header", data.len()),
        }
    }

    pub fn on_inbound_chunk(
        &self,
        request_id: &str,
        media_id: &str,
        chunk_index: u32,
        data: Bytes,
        last_chunk: bool,
    ) {
        {
            let mut pending = self.pending();
            let Some(request) = pending.get_mut(request_id) else {
                warn!("Media chunk for unknown request {}", request_id);
                return;
            };
            request
                .media
                .entry(media_id.to_string())
                .or_default()
                .push(chunk_index, data, last_chunk);
        }
        self.maybe_complete(request_id);
    }

    /// Complete `id` if its response and all of its media have arrived.
    pub fn maybe_complete(&self, id: &str) {
        let ready = {
            let mut pending = self.pending();
            let Some(request) = pending.get(id) else { return };
            let Some(response) = request.response.as_ref() else {
                return;
            };
            let missing = expected_media(response)
                .into_iter()
                .filter(|media_id| {
                    !request
                        .media
                        .get(media_id)
                        .is_some_and(MediaBuffer::is_complete)
                })
                .count();
            if missing > 0 {
                trace!("Request {} waiting for {} media entries", id, missing);
                return;
            }
            pending.shift_remove(id)
        };
        if let Some(request) = ready {
            self.complete(id, request);
        }
    }

    fn complete(&self, id: &str, request: PendingRequest) {
        let PendingRequest {
            label,
            result,
            settled,
            response,
            media,
            known_live_objects,
            known_capabilities,
            started,
            started_at,
            ..
        } = request;

        let outcome = match response {
            Some(response) => {
                let blobs = media
                    .into_iter()
                    .map(|(media_id, buffer)| (media_id, buffer.assemble()))
                    .collect();
                let outcome = self.finish(id, &response, &blobs, known_live_objects, known_capabilities);
                if !is_heartbeat(id) {
                    self.record_profile(&label, &response, started, started_at);
                }
                outcome
            }
            None => Err(ClientError::Protocol(format!("request {} completed without a response", id))),
        };

        trace!("Request {} completed in {:?}", id, started.elapsed());
        let _ = result.send(outcome);
        settled.send_replace(true);
    }

    fn finish(
        &self,
        id: &str,
        response: &ResponseEnvelope,
        blobs: &HashMap<String, Bytes>,
        mut known_live_objects: KnownLiveObjects,
        mut known_capabilities: Vec<Capability>,
    ) -> CallResult {
        let ctx = self.session.reconstruct_context();
        let mut reconstructed = reconstruct_objects(&response.as_json(), blobs, &ctx)?;

        // Heartbeats carry no application state.
        if !is_heartbeat(id) {
            known_live_objects.extend(std::mem::take(&mut reconstructed.known_live_objects));
            known_capabilities.append(&mut reconstructed.known_capabilities);

            if let Some(updates) = response.cache_updates() {
                let applied = known_live_objects.apply_cache_updates(updates);
                debug!("Applied {} live object cache updates for {}", applied, id);
            }
            if let Some(updates) = response.cap_updates() {
                let applied = apply_capability_updates(&known_capabilities, updates);
                debug!("Applied {} capability updates for {}", applied, id);
            }
        }

        Ok(reconstructed.take_field("response"))
    }

    fn record_profile(
        &self,
        label: &str,
        response: &ResponseEnvelope,
        started: Instant,
        started_at: DateTime<Utc>,
    ) {
        let mut span = ProfileSpan::new(label, started_at, started.elapsed());
        if let Some(server) = response.profile().and_then(ProfileSpan::from_server) {
            span.children.push(server);
        }
        span.import_duration = response.import_duration();
        self.session.profile_sink().record(span);
    }

    pub fn reject(&self, id: &str, error: ClientError) {
        let Some(request) = self.pending().shift_remove(id) else {
            trace!("Reject for settled request {}: {}", id, error);
            return;
        };
        debug!("Rejecting request {}: {}", id, error);
        let _ = request.result.send(Err(error));
        request.settled.send_replace(true);
    }

    /// Reject every request written to connection `generation`.
    pub fn fail_connection(&self, generation: u64, reason: &TransportError) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, request)| request.connection == Some(generation))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.shift_remove(id)).collect()
        };
        if !failed.is_empty() {
            warn!(
                "Connection #{} lost ({}); failing {} requests",
                generation,
                reason,
                failed.len()
            );
        }
        let count = failed.len();
        for request in failed {
            let _ = request
                .result
                .send(Err(ClientError::Transport(reason.clone())));
            request.settled.send_replace(true);
        }
        count
    }

    fn abandon(&self, id: &str) {
        if let Some(request) = self.pending().shift_remove(id) {
            debug!("Request {} abandoned by its caller", id);
            request.settled.send_replace(true);
        }
    }
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

pub fn is_heartbeat(id: &str) -> bool {
    id.starts_with(HEARTBEAT_ID_PREFIX)
}

/// Media ids announced by the response's `DataMedia` records, including those
/// nested in live object item caches and iterator pages.
fn expected_media(response: &ResponseEnvelope) -> Vec<String> {
    let mut ids = Vec::new();
    collect_media(response.objects(), &mut ids);
    ids
}

fn collect_media(records: &[JsonValue], ids: &mut Vec<String>) {
    for raw in records {
        // Malformed records fail later, during reconstruction.
        let Ok(record) = NonJsonRecord::from_json(raw) else {
            continue;
        };
        match record.kind {
            RecordKind::DataMedia { id, .. } => ids.push(id),
            RecordKind::LiveObject(live) => {
                for payload in [live.item_cache, live.iter_items].into_iter().flatten() {
                    collect_media(&payload.objects, ids);
                }
            }
            _ => {}
        }
    }
}

/// Deliver `{normalizedScope: update}` to the matching capabilities.
fn apply_capability_updates(capabilities: &[Capability], updates: &JsonValue) -> usize {
    let Some(updates) = updates.as_object() else {
        return 0;
    };
    capabilities
        .iter()
        .filter(|cap| {
            updates
                .get(&cap.normalized_key())
                .is_some_and(|update| cap.apply_update(update))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use portrpc_core::{InboundMessage, LiveObjectProxy, LiveObjectSpec};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response(value: JsonValue) -> ResponseEnvelope {
        match InboundMessage::from_json(value).unwrap() {
            InboundMessage::Response(response) => response,
            other => panic!("not a response: {:?}", other),
        }
    }

    fn registry() -> Arc<RequestRegistry> {
        RequestRegistry::new(Session::new())
    }

    #[tokio::test]
    async fn test_response_resolves_request() {
        let registry = registry();
        let registration = registry.register("c1", "app.add", KnownLiveObjects::new(), vec![]);

        registry.on_response(response(json!({"id": "c1", "response": 3, "objects": []})));
        assert!(registry.is_empty());
        assert_eq!(registration.outcome().await.unwrap(), Value::Int(3));
    }

    #[tokio::test]
    async fn test_waits_for_announced_media() {
        let registry = registry();
        let registration = registry.register("c1", "app.file", KnownLiveObjects::new(), vec![]);

        registry.on_response(response(json!({
            "id": "c1",
            "response": null,
            "objects": [{"path": ["response"], "type": ["DataMedia"], "id": "m0", "mime-type": "text/plain"}],
        })));
        assert!(registry.is_outstanding("c1"));

        registry.on_chunk_header(ChunkHeader::new("c1", "m0", 1, true));
        registry.on_binary(Bytes::from_static(b"lo"));
        assert!(registry.is_outstanding("c1"));

        registry.on_chunk_header(ChunkHeader::new("c1", "m0", 0, false));
        registry.on_binary(Bytes::from_static(b"hel"));
        assert!(!registry.is_outstanding("c1"));

        let Value::Media(media) = registration.outcome().await.unwrap() else {
            panic!("expected media");
        };
        assert_eq!(media.bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_waits_for_media_inside_item_cache() {
        let registry = registry();
        let registration = registry.register("c1", "app.row", KnownLiveObjects::new(), vec![]);

        registry.on_response(response(json!({
            "id": "c1",
            "response": null,
            "objects": [{
                "path": ["response"],
                "type": ["LiveObject"],
                "backend": "tables.Row",
                "id": "[1,1]",
                "itemCache": {
                    "data": {"photo": null},
                    "objects": [{"path": ["data", "photo"], "type": ["DataMedia"], "id": "m0", "mime-type": "image/png"}],
                },
            }],
        })));
        assert!(registry.is_outstanding("c1"));

        registry.on_inbound_chunk("c1", "m0", 0, Bytes::from_static(b"png"), true);
        let Value::LiveObject(row) = registration.outcome().await.unwrap() else {
            panic!("expected a live object");
        };
        let Some(Value::Media(photo)) = row.cached_item("photo") else {
            panic!("expected cached media");
        };
        assert_eq!(photo.bytes().await.unwrap(), Bytes::from_static(b"png"));
    }

    #[test]
    fn test_expected_media_follows_first_known_tag() {
        let announced = response(json!({
            "id": "c1",
            "response": null,
            "objects": [
                {"path": ["response", 0], "type": ["LazyMedia", "DataMedia"], "id": "lazy"},
                {"path": ["response", 1], "type": ["app.Custom", "DataMedia"], "id": "m1"},
            ],
        }));
        assert_eq!(expected_media(&announced), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_out_of_range_profile_still_completes() {
        let registry = registry();
        let registration = registry.register("c1", "app.slow", KnownLiveObjects::new(), vec![]);

        registry.on_response(response(json!({
            "id": "c1",
            "response": 1,
            "objects": [],
            "profile": {"description": "call", "start_time": 0.0, "end_time": 1e300},
        })));
        assert_eq!(registration.outcome().await.unwrap(), Value::Int(1));
    }

    #[tokio::test]
    async fn test_known_objects_attached_after_registration() {
        let registry = registry();
        let registration = registry.register("c1", "f", KnownLiveObjects::new(), vec![]);
        let row = LiveObjectProxy::new(LiveObjectSpec::new("tables.Row", "r"));
        let mut known = KnownLiveObjects::new();
        known.insert(row.clone());
        registration.set_known(known, vec![]);

        registry.on_response(response(json!({
            "id": "c1",
            "response": null,
            "objects": [],
            "cacheUpdates": {"tables.Row": {"r": {"name": "Ada"}}},
        })));
        registration.outcome().await.unwrap();
        assert_eq!(row.cached_item("name"), Some(Value::str("Ada")));
    }

    #[tokio::test]
    async fn test_predecessors_settle_in_order() {
        let registry = registry();
        let first = registry.register("a", "a", KnownLiveObjects::new(), vec![]);
        let mut second = registry.register("b", "b", KnownLiveObjects::new(), vec![]);

        let drained = tokio::spawn(async move {
            second.drain_predecessors().await;
            second
        });
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        registry.reject("a", ClientError::Protocol("x".into()));
        let second = drained.await.unwrap();
        assert!(first.outcome().await.is_err());
        assert_eq!(second.id(), "b");
    }

    #[tokio::test]
    async fn test_fail_connection_only_hits_bound_requests() {
        let registry = registry();
        let bound = registry.register("a", "a", KnownLiveObjects::new(), vec![]);
        let _unbound = registry.register("b", "b", KnownLiveObjects::new(), vec![]);
        registry.bind_connection("a", 4);

        assert_eq!(registry.fail_connection(3, &TransportError::ConnectionClosed), 0);
        assert_eq!(registry.fail_connection(4, &TransportError::ConnectionClosed), 1);
        assert!(matches!(
            bound.outcome().await,
            Err(ClientError::Transport(TransportError::ConnectionClosed))
        ));
        assert!(registry.is_outstanding("b"));
    }

    #[tokio::test]
    async fn test_dropped_registration_is_abandoned() {
        let registry = registry();
        let first = registry.register("a", "a", KnownLiveObjects::new(), vec![]);
        let mut second = registry.register("b", "b", KnownLiveObjects::new(), vec![]);
        drop(first);
        second.drain_predecessors().await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_session_expired_bumps_epoch() {
        let session = Session::new();
        let registry = RequestRegistry::new(session.clone());
        let cap = Capability::new(vec![json!("x")], "m", vec![], session.epoch());
        let registration = registry.register("c1", "f", KnownLiveObjects::new(), vec![]);

        registry.on_error_response(
            "c1",
            &ServerErrorPayload::from_json(&json!({
                "type": "anvil.server.SessionExpiredError",
                "message": "expired",
            })),
        );

        let err = registration.outcome().await.unwrap_err();
        assert!(err.remote().is_some_and(|r| r.is_session_expired()));
        assert!(!cap.is_valid());
    }

    #[tokio::test]
    async fn test_updates_reach_known_objects() {
        let registry = registry();
        let epoch = portrpc_core::CapabilityEpoch::new();
        let cap = Capability::new(vec![json!("files"), json!({"b": 1, "a": 2})], "m", vec![], &epoch);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        cap.set_update_handler(move |update| {
            assert_eq!(update, &json!({"expires": 5}));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let row = LiveObjectProxy::new(LiveObjectSpec::new("tables.Row", "[1,1]"));
        let mut known = KnownLiveObjects::new();
        known.insert(row.clone());

        let registration = registry.register("c1", "f", known, vec![cap.clone()]);
        let mut cap_updates = serde_json::Map::new();
        cap_updates.insert(cap.normalized_key(), json!({"expires": 5}));
        registry.on_response(response(json!({
            "id": "c1",
            "response": "ok",
            "objects": [],
            "cacheUpdates": {"tables.Row": {"[1,1]": {"name": "Ada"}}},
            "capUpdates": cap_updates,
        })));

        assert_eq!(registration.outcome().await.unwrap(), Value::str("ok"));
        assert_eq!(row.cached_item("name"), Some(Value::str("Ada")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_heartbeats_skip_updates() {
        let registry = registry();
        let row = LiveObjectProxy::new(LiveObjectSpec::new("tables.Row", "r"));
        let mut known = KnownLiveObjects::new();
        known.insert(row.clone());

        let id = format!("{}1", HEARTBEAT_ID_PREFIX);
        let registration = registry.register(&id, "heartbeat", known, vec![]);
        registry.on_response(response(json!({
            "id": id,
            "response": null,
            "objects": [],
            "cacheUpdates": {"tables.Row": {"r": {"name": "x"}}},
        })));
        registration.outcome().await.unwrap();
        assert_eq!(row.cached_item("name"), None);
    }
}

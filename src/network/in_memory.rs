use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::datastore::entity::{format_timestamp, Acl, Entity, Metadata};
use crate::datastore::query_translator::RemoteQuery;
use crate::error::{from_http_status, unauthenticated, KinveyError, KinveyResult};
use crate::network::{deleted_marker, NetworkRequest, NetworkResponse, NetworkTransport, RequestContext, RequestKind};
use crate::realtime::pubsub::InMemoryPubSubHub;
use crate::realtime::RealtimeRegistration;

type RequestHook = Arc<dyn Fn(&NetworkRequest) + Send + Sync>;

/// Access list of one user's sub-stream, as stored by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAclRecord {
    #[serde(default)]
    pub subscribe: BTreeSet<String>,
    #[serde(default)]
    pub publish: BTreeSet<String>,
    #[serde(default)]
    pub groups: StreamAclGroupsRecord,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAclGroupsRecord {
    #[serde(default)]
    pub subscribe: BTreeSet<String>,
    #[serde(default)]
    pub publish: BTreeSet<String>,
}

#[derive(Default)]
struct BackendCollection {
    entities: BTreeMap<String, (u64, Value)>,
    next_seq: u64,
    tombstones: Vec<(String, String)>,
}

impl BackendCollection {
    fn ordered(&self) -> Vec<Entity> {
        let mut rows: Vec<&(u64, Value)> = self.entities.values().collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter()
            .filter_map(|(_, value)| Entity::from_json(value.clone()).ok())
            .collect()
    }

    fn store(&mut self, id: String, value: Value) {
        match self.entities.get_mut(&id) {
            Some(row) => row.1 = value,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entities.insert(id, (seq, value));
            }
        }
    }
}

struct BackendState {
    clock_ms: i64,
    next_id: u64,
    collections: HashMap<String, BackendCollection>,
    registrations: HashMap<String, RealtimeRegistration>,
    stream_acls: HashMap<(String, String), StreamAclRecord>,
    delta_set_enabled: bool,
    failures: VecDeque<(RequestKind, KinveyError)>,
    request_log: Vec<NetworkRequest>,
    hooks: Vec<RequestHook>,
    latency: Option<Duration>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            clock_ms: 0,
            next_id: 0,
            collections: HashMap::new(),
            registrations: HashMap::new(),
            stream_acls: HashMap::new(),
            delta_set_enabled: true,
            failures: VecDeque::new(),
            request_log: Vec::new(),
            hooks: Vec::new(),
            latency: None,
        }
    }
}

impl BackendState {
    /// Advances the server clock by one millisecond and returns the new time.
    fn tick(&mut self) -> String {
        self.clock_ms += 1;
        let epoch: DateTime<Utc> = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        format_timestamp(epoch + chrono::Duration::milliseconds(self.clock_ms))
    }

    fn collection(&mut self, name: &str) -> &mut BackendCollection {
        self.collections.entry(name.to_owned()).or_default()
    }

    fn write_entity(&mut self, collection: &str, mut entity: Entity, creator: Option<&str>) -> KinveyResult<Value> {
        let now = self.tick();
        let id = match entity.id() {
            Some(id) => id.to_owned(),
            None => {
                self.next_id += 1;
                let id = format!("{:024x}", self.next_id);
                entity.assign_id(id.clone())?;
                id
            }
        };
        let created = self
            .collections
            .get(collection)
            .and_then(|rows| rows.entities.get(&id))
            .and_then(|(_, value)| value.get("_kmd"))
            .and_then(|kmd| kmd.get("ect"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        entity.set_metadata(Metadata {
            lmt: Some(now.clone()),
            ect: Some(created.unwrap_or(now)),
            authtoken: None,
        });
        if entity.acl().is_none() {
            entity.set_acl(creator.map(Acl::with_creator).unwrap_or_default());
        }
        let stored = entity.to_json();
        let rows = self.collection(collection);
        rows.tombstones.retain(|(deleted, _)| deleted != &id);
        rows.store(id, stored.clone());
        Ok(stored)
    }

    fn delete_entity(&mut self, collection: &str, id: &str) -> bool {
        let now = self.tick();
        let rows = self.collection(collection);
        if rows.entities.remove(id).is_some() {
            rows.tombstones.push((id.to_owned(), now));
            true
        } else {
            false
        }
    }
}

/// In-process stand-in for the backend: app data collections with delta sets,
/// realtime registration and stream access control.
///
/// Timestamps come from a deterministic clock that advances one millisecond per
/// request or write. When a pub/sub hub is attached, stream subscriptions add
/// sub-stream channels to the subscriber's channel group.
#[derive(Clone)]
pub struct InMemoryBackend {
    app_key: String,
    inner: Arc<Mutex<BackendState>>,
    hub: Option<InMemoryPubSubHub>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("kid_in_memory")
    }
}

impl InMemoryBackend {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            inner: Arc::new(Mutex::new(BackendState::default())),
            hub: None,
        }
    }

    pub fn with_pubsub(mut self, hub: InMemoryPubSubHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn pubsub(&self) -> Option<&InMemoryPubSubHub> {
        self.hub.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes an entity as another client would and returns the stored JSON.
    pub fn insert(&self, collection: &str, value: Value) -> KinveyResult<Value> {
        let entity = Entity::from_json(value)?;
        self.lock().write_entity(collection, entity, None)
    }

    /// Deletes an entity as another client would.
    pub fn delete(&self, collection: &str, id: &str) -> bool {
        self.lock().delete_entity(collection, id)
    }

    pub fn entity(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|rows| rows.entities.get(id))
            .map(|(_, value)| value.clone())
    }

    pub fn entity_count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map(|rows| rows.entities.len())
            .unwrap_or(0)
    }

    pub fn set_delta_set_enabled(&self, enabled: bool) {
        self.lock().delta_set_enabled = enabled;
    }

    /// Fails the next request of `kind` with `error`.
    pub fn fail_next(&self, kind: RequestKind, error: KinveyError) {
        self.lock().failures.push_back((kind, error));
    }

    /// Runs `hook` before each request is processed.
    pub fn on_request<F>(&self, hook: F)
    where
        F: Fn(&NetworkRequest) + Send + Sync + 'static,
    {
        self.lock().hooks.push(Arc::new(hook));
    }

    /// Delays every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    pub fn requests(&self) -> Vec<RequestKind> {
        self.lock().request_log.iter().map(NetworkRequest::kind).collect()
    }

    pub fn request_count(&self, kind: RequestKind) -> usize {
        self.lock()
            .request_log
            .iter()
            .filter(|request| request.kind() == kind)
            .count()
    }

    pub fn clear_request_log(&self) {
        self.lock().request_log.clear();
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        self.lock().registrations.contains_key(user_id)
    }

    pub fn stream_acl(&self, stream: &str, user_id: &str) -> Option<StreamAclRecord> {
        self.lock()
            .stream_acls
            .get(&(stream.to_owned(), user_id.to_owned()))
            .cloned()
    }

    fn substream_channel(&self, stream: &str, user_id: &str) -> String {
        format!("{}.s-{stream}.u-{user_id}", self.app_key)
    }

    fn handle(&self, request: NetworkRequest, context: &RequestContext) -> KinveyResult<NetworkResponse> {
        let mut state = self.lock();
        if let Some(position) = state
            .failures
            .iter()
            .position(|(kind, _)| *kind == request.kind())
        {
            if let Some((_, error)) = state.failures.remove(position) {
                return Err(error);
            }
        }
        let request_start = state.tick();
        let body = match request {
            NetworkRequest::Find { collection, query } => {
                let rows = state.collection(&collection).ordered();
                let found = query.local_query().apply(rows);
                Value::Array(found.iter().map(Entity::to_json).collect())
            }
            NetworkRequest::Count { collection, query } => {
                let predicate = query.local_query().predicate.clone();
                let count = state
                    .collection(&collection)
                    .ordered()
                    .iter()
                    .filter(|entity| predicate.matches(entity))
                    .count();
                json!({ "count": count })
            }
            NetworkRequest::GetById { collection, id } => state
                .collection(&collection)
                .entities
                .get(&id)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| entity_not_found(&collection, &id))?,
            NetworkRequest::DeltaSet {
                collection,
                query,
                since,
            } => {
                if !state.delta_set_enabled {
                    return Err(from_http_status(
                        400,
                        Some("MissingConfiguration".into()),
                        Some("Delta set is not enabled for this collection".into()),
                    ));
                }
                delta_set(state.collection(&collection), &query, &since)
            }
            NetworkRequest::Save { collection, entity } => {
                let entity = Entity::from_json(entity)?;
                state.write_entity(&collection, entity, context.user_id.as_deref())?
            }
            NetworkRequest::Remove { collection, id } => {
                if !state.delete_entity(&collection, &id) {
                    return Err(entity_not_found(&collection, &id));
                }
                json!({ "count": 1 })
            }
            NetworkRequest::RemoveByQuery { collection, query } => {
                let predicate = query.local_query().predicate.clone();
                let matched: Vec<String> = state
                    .collection(&collection)
                    .ordered()
                    .iter()
                    .filter(|entity| predicate.matches(entity))
                    .filter_map(|entity| entity.id().map(str::to_owned))
                    .collect();
                for id in &matched {
                    state.delete_entity(&collection, id);
                }
                json!({ "count": matched.len() })
            }
            NetworkRequest::RegisterRealtime { user_id, .. } => {
                require_user(context, &user_id)?;
                let registration = RealtimeRegistration {
                    subscribe_key: format!("sub-c-{}", self.app_key),
                    publish_key: format!("pub-c-{}", self.app_key),
                    user_channel_group: user_id.clone(),
                };
                state.registrations.insert(user_id, registration.clone());
                serde_json::to_value(registration)?
            }
            NetworkRequest::UnregisterRealtime { user_id, .. } => {
                require_user(context, &user_id)?;
                state.registrations.remove(&user_id);
                Value::Null
            }
            NetworkRequest::StreamGrantAccess {
                stream,
                user_id,
                acl,
            } => {
                let granted: StreamAclRecord = serde_json::from_value(acl)?;
                let record = state.stream_acls.entry((stream, user_id)).or_default();
                record.subscribe.extend(granted.subscribe);
                record.publish.extend(granted.publish);
                record.groups.subscribe.extend(granted.groups.subscribe);
                record.groups.publish.extend(granted.groups.publish);
                serde_json::to_value(record.clone())?
            }
            NetworkRequest::StreamPublishChannel { stream, user_id } => {
                let publisher = sender(context)?;
                let allowed = state
                    .stream_acls
                    .get(&(stream.clone(), user_id.clone()))
                    .is_some_and(|acl| acl.publish.contains(publisher));
                if !allowed {
                    return Err(insufficient_credentials(&stream, &user_id));
                }
                json!({ "substreamChannelName": self.substream_channel(&stream, &user_id) })
            }
            NetworkRequest::StreamSubscribe {
                stream, user_id, ..
            } => {
                let subscriber = sender(context)?;
                let allowed = state
                    .stream_acls
                    .get(&(stream.clone(), user_id.clone()))
                    .is_some_and(|acl| acl.subscribe.contains(subscriber));
                if !allowed {
                    return Err(insufficient_credentials(&stream, &user_id));
                }
                let group = state
                    .registrations
                    .get(subscriber)
                    .map(|registration| registration.user_channel_group.clone())
                    .ok_or_else(|| {
                        from_http_status(
                            400,
                            Some("UserNotRegistered".into()),
                            Some("The user is not registered for realtime".into()),
                        )
                    })?;
                let channel = self.substream_channel(&stream, &user_id);
                if let Some(hub) = &self.hub {
                    hub.add_channel_to_group(&group, &channel);
                }
                json!({ "substreamChannelName": channel })
            }
            NetworkRequest::StreamUnsubscribe {
                stream, user_id, ..
            } => {
                let subscriber = sender(context)?;
                let channel = self.substream_channel(&stream, &user_id);
                if let (Some(hub), Some(registration)) = (&self.hub, state.registrations.get(subscriber)) {
                    hub.remove_channel_from_group(&registration.user_channel_group, &channel);
                }
                Value::Null
            }
        };
        Ok(NetworkResponse::new(body).with_request_start(request_start))
    }
}

fn delta_set(rows: &BackendCollection, query: &RemoteQuery, since: &str) -> Value {
    let predicate = &query.local_query().predicate;
    let changed: Vec<Value> = rows
        .ordered()
        .into_iter()
        .filter(|entity| {
            entity
                .metadata()
                .and_then(|metadata| metadata.lmt.as_deref())
                .is_some_and(|lmt| lmt > since)
        })
        .filter(|entity| predicate.matches(entity))
        .map(|entity| entity.to_json())
        .collect();
    let deleted: Vec<Value> = rows
        .tombstones
        .iter()
        .filter(|(_, deleted_at)| deleted_at.as_str() > since)
        .map(|(id, _)| deleted_marker(id))
        .collect();
    json!({ "changed": changed, "deleted": deleted })
}

fn sender(context: &RequestContext) -> KinveyResult<&str> {
    context
        .user_id
        .as_deref()
        .ok_or_else(|| unauthenticated("An active user is required").with_status(401))
}

fn require_user(context: &RequestContext, user_id: &str) -> KinveyResult<()> {
    if sender(context)? != user_id {
        return Err(from_http_status(
            403,
            Some("InsufficientCredentials".into()),
            Some(format!("Cannot act on behalf of user '{user_id}'")),
        ));
    }
    Ok(())
}

fn entity_not_found(collection: &str, id: &str) -> KinveyError {
    from_http_status(
        404,
        Some("EntityNotFound".into()),
        Some(format!("No entity '{id}' in collection '{collection}'")),
    )
}

fn insufficient_credentials(stream: &str, user_id: &str) -> KinveyError {
    from_http_status(
        403,
        Some("InsufficientCredentials".into()),
        Some(format!("Not allowed on stream '{stream}' of user '{user_id}'")),
    )
}

#[async_trait]
impl NetworkTransport for InMemoryBackend {
    async fn send(&self, request: NetworkRequest, context: &RequestContext) -> KinveyResult<NetworkResponse> {
        let (hooks, latency) = {
            let mut state = self.lock();
            state.request_log.push(request.clone());
            (state.hooks.clone(), state.latency)
        };
        for hook in &hooks {
            hook(&request);
        }
        match latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
        self.handle(request, context)
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("app_key", &self.app_key)
            .finish()
    }
}

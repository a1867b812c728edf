use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};

use async_lock::{Mutex, MutexGuardArc};
use serde_json::Value;

use crate::client::ClientContext;
use crate::datastore::cache::{MemoryCache, PendingOperation, PendingOperationKind, RemoteApplyOutcome};
use crate::datastore::entity::{is_temporary_id, Entity, ENTITY_ID_KEY};
use crate::datastore::progress::SyncProgress;
use crate::datastore::query_translator::RemoteQuery;
use crate::error::{
    cancelled, internal_error, operation_in_progress, KinveyError, KinveyErrorCode, KinveyResult,
};
use crate::logger::Logger;
use crate::network::{parse_count, parse_delta_set, parse_entities, NetworkRequest};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@kinvey/sync"));

/// Backend reasons after which a delta-set pull is retried as a full pull.
const DELTA_SET_FALLBACK_REASONS: &[&str] = &[
    "MissingConfiguration",
    "ParameterValueOutOfRange",
    "ResultSetSizeExceeded",
];

/// Per-collection state shared by every store of a client: the cache and the
/// pull/push exclusion locks.
pub(crate) struct CollectionContext {
    name: String,
    cache: Arc<MemoryCache>,
    pull_lock: Arc<Mutex<()>>,
    push_lock: Arc<Mutex<()>>,
}

impl CollectionContext {
    pub(crate) fn new(name: impl Into<String>, cache: Arc<MemoryCache>) -> Self {
        Self {
            name: name.into(),
            cache,
            pull_lock: Arc::new(Mutex::new(())),
            push_lock: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    pub(crate) fn begin_pull(&self) -> KinveyResult<MutexGuardArc<()>> {
        self.pull_lock
            .try_lock_arc()
            .ok_or_else(|| operation_in_progress(format!("A pull of '{}' is already running", self.name)))
    }

    pub(crate) fn begin_push(&self) -> KinveyResult<MutexGuardArc<()>> {
        self.push_lock
            .try_lock_arc()
            .ok_or_else(|| operation_in_progress(format!("A push of '{}' is already running", self.name)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullOptions {
    /// Overrides [`ClientOptions::delta_set`](crate::client::ClientOptions::delta_set).
    pub delta_set: Option<bool>,
    /// Overrides [`ClientOptions::default_page_size`](crate::client::ClientOptions::default_page_size).
    pub page_size: Option<usize>,
    /// Count first and fetch in pages; otherwise fetch everything in one request.
    pub auto_pagination: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            delta_set: None,
            page_size: None,
            auto_pagination: true,
        }
    }
}

impl PullOptions {
    pub fn delta_set(mut self, enabled: bool) -> Self {
        self.delta_set = Some(enabled);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullResult {
    pub upserted: usize,
    pub deleted: usize,
    /// Remote changes not applied because the entity has unpushed local changes.
    pub skipped: usize,
    pub pages: usize,
    pub delta_set: bool,
    pub sync_mark: Option<String>,
}

impl PullResult {
    fn absorb(&mut self, outcome: RemoteApplyOutcome) {
        self.upserted += outcome.upserted;
        self.deleted += outcome.deleted;
        self.skipped += outcome.skipped;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Push at most this many operations, oldest first.
    pub max_operations: Option<usize>,
}

/// Outcome of a push. Failed operations stay queued.
#[derive(Clone, Debug, Default)]
pub struct PushResult {
    /// Ids of entities whose operation reached the backend, server ids for created entities.
    pub succeeded: Vec<String>,
    pub errors: BTreeMap<String, KinveyError>,
}

impl PushResult {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SyncResult {
    pub push: PushResult,
    pub pull: PullResult,
}

pub(crate) async fn pull(
    client: &ClientContext,
    collection: &CollectionContext,
    remote: &RemoteQuery,
    options: &PullOptions,
    progress: &SyncProgress,
) -> KinveyResult<PullResult> {
    let use_delta_set =
        options.delta_set.unwrap_or(client.options.delta_set) && !remote.local_query().is_windowed();
    if use_delta_set {
        match collection.cache().sync_mark(&remote.sync_mark_key())? {
            Some(since) => match delta_pull(client, collection, remote, since, progress).await {
                Err(err) if is_delta_set_fallback(&err) => {
                    LOGGER.warn(format!(
                        "delta set pull of '{}' rejected ({err}), falling back to a full pull",
                        collection.name()
                    ));
                }
                outcome => return outcome,
            },
            None => LOGGER.debug(format!(
                "no sync mark for '{}', performing a full pull",
                collection.name()
            )),
        }
    }
    full_pull(client, collection, remote, options, progress).await
}

fn is_delta_set_fallback(err: &KinveyError) -> bool {
    err.status() == Some(400)
        && err
            .reason()
            .is_some_and(|reason| DELTA_SET_FALLBACK_REASONS.contains(&reason))
}

async fn delta_pull(
    client: &ClientContext,
    collection: &CollectionContext,
    remote: &RemoteQuery,
    since: String,
    progress: &SyncProgress,
) -> KinveyResult<PullResult> {
    ensure_not_cancelled(progress, collection, "pull")?;
    let response = client
        .send(NetworkRequest::DeltaSet {
            collection: collection.name().to_owned(),
            query: remote.unwindowed(),
            since,
        })
        .await?;
    progress.add_units(1);
    let request_start = response.request_start;
    let changes = parse_delta_set(response.body)?;

    let cache = collection.cache();
    let mut result = PullResult {
        pages: 1,
        delta_set: true,
        ..Default::default()
    };
    result.absorb(cache.apply_remote_changes(changes.changed, &changes.deleted)?);
    let key = remote.sync_mark_key();
    if let Some(mark) = request_start {
        cache.set_sync_mark(&key, mark)?;
    }
    result.sync_mark = cache.sync_mark(&key)?;
    progress.advance(1);
    Ok(result)
}

async fn full_pull(
    client: &ClientContext,
    collection: &CollectionContext,
    remote: &RemoteQuery,
    options: &PullOptions,
    progress: &SyncProgress,
) -> KinveyResult<PullResult> {
    let cache = collection.cache();
    if remote.local_query().is_windowed() || !options.auto_pagination {
        progress.add_units(1);
        ensure_not_cancelled(progress, collection, "pull")?;
        let response = client
            .send(NetworkRequest::Find {
                collection: collection.name().to_owned(),
                query: remote.clone(),
            })
            .await?;
        let request_start = response.request_start;
        let entities = parse_entities(response.body)?;
        let mut result = PullResult {
            pages: 1,
            ..Default::default()
        };
        if remote.local_query().is_windowed() {
            result.absorb(cache.apply_remote_changes(entities, &[])?);
        } else {
            let seen = entity_ids(&entities);
            result.absorb(cache.apply_remote_changes(entities, &[])?);
            result.deleted += cache.remove_orphans(&remote.local_query().predicate, &seen)?;
            result.sync_mark = commit_sync_mark(cache, remote, request_start)?;
        }
        progress.advance(1);
        return Ok(result);
    }

    let counted = client
        .send(NetworkRequest::Count {
            collection: collection.name().to_owned(),
            query: remote.unwindowed(),
        })
        .await?;
    let total = parse_count(&counted.body)?;
    let page_size = options
        .page_size
        .unwrap_or(client.options.default_page_size)
        .max(1);
    let pages = total.div_ceil(page_size);
    progress.add_units(pages);
    LOGGER.debug(format!(
        "pulling {total} entities of '{}' in {pages} page(s)",
        collection.name()
    ));

    let mut result = PullResult::default();
    let mut seen = HashSet::with_capacity(total);
    for page in 0..pages {
        ensure_not_cancelled(progress, collection, "pull")?;
        let response = client
            .send(NetworkRequest::Find {
                collection: collection.name().to_owned(),
                query: remote.page(page * page_size, page_size),
            })
            .await?;
        let entities = parse_entities(response.body)?;
        seen.extend(entity_ids(&entities));
        result.absorb(cache.apply_remote_changes(entities, &[])?);
        result.pages += 1;
        progress.advance(1);
    }

    result.deleted += cache.remove_orphans(&remote.local_query().predicate, &seen)?;
    result.sync_mark = commit_sync_mark(cache, remote, counted.request_start)?;
    Ok(result)
}

fn entity_ids(entities: &[Entity]) -> HashSet<String> {
    entities
        .iter()
        .filter_map(|entity| entity.id().map(str::to_owned))
        .collect()
}

fn commit_sync_mark(
    cache: &MemoryCache,
    remote: &RemoteQuery,
    request_start: Option<String>,
) -> KinveyResult<Option<String>> {
    let key = remote.sync_mark_key();
    if let Some(mark) = request_start {
        cache.set_sync_mark(&key, mark)?;
    }
    cache.sync_mark(&key)
}

fn ensure_not_cancelled(progress: &SyncProgress, collection: &CollectionContext, operation: &str) -> KinveyResult<()> {
    if progress.is_cancelled() {
        LOGGER.debug(format!("{operation} of '{}' cancelled", collection.name()));
        return Err(cancelled(format!("The {operation} of '{}' was cancelled", collection.name())));
    }
    Ok(())
}

pub(crate) async fn push(
    client: &ClientContext,
    collection: &CollectionContext,
    options: &PushOptions,
    progress: &SyncProgress,
) -> KinveyResult<PushResult> {
    let mut operations = collection.cache().pending_operations()?;
    if let Some(max) = options.max_operations {
        operations.truncate(max);
    }
    progress.add_units(operations.len());

    let mut result = PushResult::default();
    for operation in operations {
        ensure_not_cancelled(progress, collection, "push")?;
        match push_operation(client, collection, &operation).await {
            Ok(id) => result.succeeded.push(id),
            Err(err) => {
                LOGGER.warn(format!(
                    "push of {:?} '{}' in '{}' failed: {err}",
                    operation.kind,
                    operation.entity_id,
                    collection.name()
                ));
                result.errors.insert(operation.entity_id.clone(), err);
            }
        }
        progress.advance(1);
    }
    Ok(result)
}

async fn push_operation(
    client: &ClientContext,
    collection: &CollectionContext,
    operation: &PendingOperation,
) -> KinveyResult<String> {
    let cache = collection.cache();
    match operation.kind {
        PendingOperationKind::Save => {
            let mut payload = operation
                .payload
                .clone()
                .ok_or_else(|| internal_error("Pending save has no payload"))?;
            if is_temporary_id(&operation.entity_id) {
                if let Value::Object(fields) = &mut payload {
                    fields.remove(ENTITY_ID_KEY);
                }
            }
            let response = client
                .send(NetworkRequest::Save {
                    collection: collection.name().to_owned(),
                    entity: payload,
                })
                .await?;
            let saved = Entity::from_json(response.body)?;
            let saved_id = saved
                .id()
                .map(str::to_owned)
                .ok_or_else(|| internal_error("Saved entity returned without an id"))?;
            cache.complete_save(operation, saved)?;
            Ok(saved_id)
        }
        PendingOperationKind::Remove => {
            match client
                .send(NetworkRequest::Remove {
                    collection: collection.name().to_owned(),
                    id: operation.entity_id.clone(),
                })
                .await
            {
                Ok(_) => {}
                Err(err) if err.code == KinveyErrorCode::NotFound => {
                    LOGGER.debug(format!(
                        "'{}' was already removed from '{}'",
                        operation.entity_id,
                        collection.name()
                    ));
                }
                Err(err) => return Err(err),
            }
            cache.complete_pending(operation)?;
            Ok(operation.entity_id.clone())
        }
    }
}

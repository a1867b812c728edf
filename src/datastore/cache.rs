use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, LazyLock, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datastore::entity::{is_temporary_id, Entity, ENTITY_ID_KEY};
use crate::datastore::persistence::{CachePersistence, CacheSnapshot};
use crate::datastore::query_translator::{LocalPredicate, LocalQuery};
use crate::error::{cache_corruption, invalid_argument, KinveyErrorCode, KinveyResult};
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@kinvey/cache"));

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingOperationKind {
    Save,
    Remove,
}

/// A local write that has not reached the backend yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Distinguishes this operation from a later one for the same entity.
    pub request_id: String,
    pub entity_id: String,
    pub kind: PendingOperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn save(entity: &Entity) -> KinveyResult<Self> {
        let entity_id = entity
            .id()
            .ok_or_else(|| invalid_argument("Pending saves require an entity id"))?;
        Ok(Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.to_owned(),
            kind: PendingOperationKind::Save,
            payload: Some(entity.to_json()),
            enqueued_at: Utc::now(),
        })
    }

    pub fn remove(entity_id: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            kind: PendingOperationKind::Remove,
            payload: None,
            enqueued_at: Utc::now(),
        }
    }
}

/// Counts reported by [`MemoryCache::apply_remote_changes`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteApplyOutcome {
    pub upserted: usize,
    pub deleted: usize,
    /// Entities left untouched because they have unpushed local changes.
    pub skipped: usize,
}

struct StoredEntity {
    seq: u64,
    entity: Entity,
}

#[derive(Default)]
struct CacheState {
    entities: HashMap<String, StoredEntity>,
    next_seq: u64,
    pending: Vec<PendingOperation>,
    sync_marks: BTreeMap<String, String>,
    /// Temporary ids removed locally while their save may still be in flight.
    removed_temporaries: HashSet<String>,
    corruption: Option<String>,
}

impl CacheState {
    fn ordered_entities(&self) -> Vec<Entity> {
        let mut stored: Vec<&StoredEntity> = self.entities.values().collect();
        stored.sort_by_key(|stored| stored.seq);
        stored.into_iter().map(|stored| stored.entity.clone()).collect()
    }

    fn upsert(&mut self, entity: Entity) -> KinveyResult<()> {
        let id = entity
            .id()
            .ok_or_else(|| invalid_argument("Cached entities require an id"))?
            .to_owned();
        match self.entities.get_mut(&id) {
            Some(stored) => stored.entity = entity,
            None => {
                let seq = self.take_seq();
                self.entities.insert(id, StoredEntity { seq, entity });
            }
        }
        Ok(())
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn is_dirty(&self, id: &str) -> bool {
        self.pending.iter().any(|op| op.entity_id == id)
    }

    /// At most one operation per entity: a newer one supersedes the older. Removing a
    /// temporary entity only cancels its pending save, and remembers the id in case
    /// that save is already in flight.
    fn enqueue(&mut self, operation: PendingOperation) {
        let before = self.pending.len();
        self.pending.retain(|existing| existing.entity_id != operation.entity_id);
        if operation.kind == PendingOperationKind::Remove && is_temporary_id(&operation.entity_id) {
            if self.pending.len() != before {
                self.removed_temporaries.insert(operation.entity_id);
            }
            return;
        }
        self.pending.push(operation);
    }

    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entities: self
                .ordered_entities()
                .iter()
                .map(Entity::to_json)
                .collect(),
            pending: self.pending.clone(),
            sync_marks: self.sync_marks.clone(),
        }
    }

    fn restore(snapshot: CacheSnapshot) -> KinveyResult<Self> {
        let mut state = CacheState::default();
        for raw in snapshot.entities {
            let entity = Entity::from_json(raw)
                .map_err(|err| cache_corruption(format!("Stored entity is unreadable: {err}")))?;
            if entity.id().is_none() {
                return Err(cache_corruption(format!("Stored entity is missing {ENTITY_ID_KEY}")));
            }
            state.upsert(entity)?;
        }
        state.pending = snapshot.pending;
        state.sync_marks = snapshot.sync_marks;
        Ok(state)
    }
}

/// Per-collection local store: entities, pending operations and sync marks.
///
/// Every mutation happens under one write lock, so readers always observe a state
/// either before or after a whole batch. When a [`CachePersistence`] is attached the
/// new state is written through before the lock is released.
pub struct MemoryCache {
    collection: String,
    state: RwLock<CacheState>,
    persistence: Option<Arc<dyn CachePersistence>>,
}

impl Debug for MemoryCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("collection", &self.collection)
            .finish()
    }
}

impl MemoryCache {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: RwLock::new(CacheState::default()),
            persistence: None,
        }
    }

    /// Restores the collection from `persistence`. Unreadable data leaves the cache
    /// in a corrupted state where every call except [`MemoryCache::clear`] fails.
    pub fn with_persistence(collection: impl Into<String>, persistence: Arc<dyn CachePersistence>) -> Self {
        let collection = collection.into();
        let state = match persistence
            .load(&collection)
            .and_then(|snapshot| snapshot.map(CacheState::restore).transpose())
        {
            Ok(Some(state)) => state,
            Ok(None) => CacheState::default(),
            Err(err) => {
                LOGGER.error(format!("cache for '{collection}' could not be restored: {err}"));
                let reason = match err.code {
                    KinveyErrorCode::CacheCorruption => err.message().to_owned(),
                    _ => err.to_string(),
                };
                CacheState {
                    corruption: Some(reason),
                    ..Default::default()
                }
            }
        };
        Self {
            collection,
            state: RwLock::new(state),
            persistence: Some(persistence),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> KinveyResult<R> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(reason) = &state.corruption {
            return Err(corrupted(&self.collection, reason));
        }
        Ok(f(&state))
    }

    /// Runs `f` under the write lock. `f` must validate its input before touching
    /// the state: an error leaves whatever it already changed in place.
    fn mutate<R>(&self, f: impl FnOnce(&mut CacheState) -> KinveyResult<R>) -> KinveyResult<R> {
        let mut state = self.lock_write();
        if let Some(reason) = &state.corruption {
            return Err(corrupted(&self.collection, reason));
        }
        let result = f(&mut state)?;
        self.write_through(&state);
        Ok(result)
    }

    fn lock_write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_through(&self, state: &CacheState) {
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.save(&self.collection, &state.snapshot()) {
                LOGGER.warn(format!("failed to persist cache for '{}': {err}", self.collection));
            }
        }
    }

    pub fn get(&self, id: &str) -> KinveyResult<Option<Entity>> {
        self.read(|state| state.entities.get(id).map(|stored| stored.entity.clone()))
    }

    /// Inserts or replaces by id; a replaced entity keeps its insertion position.
    pub fn upsert(&self, entity: Entity) -> KinveyResult<()> {
        self.mutate(|state| state.upsert(entity))
    }

    /// Inserts a batch in one step; nothing is stored when any entity lacks an id.
    pub fn upsert_all(&self, entities: Vec<Entity>) -> KinveyResult<()> {
        require_ids(&entities, "Cached entities require an id")?;
        self.mutate(|state| entities.into_iter().try_for_each(|entity| state.upsert(entity)))
    }

    pub fn delete(&self, id: &str) -> KinveyResult<bool> {
        self.mutate(|state| Ok(state.entities.remove(id).is_some()))
    }

    pub fn query(&self, query: &LocalQuery) -> KinveyResult<Vec<Entity>> {
        let entities = self.read(CacheState::ordered_entities)?;
        Ok(query.apply(entities))
    }

    pub fn count(&self, predicate: &LocalPredicate) -> KinveyResult<usize> {
        self.read(|state| {
            state
                .entities
                .values()
                .filter(|stored| predicate.matches(&stored.entity))
                .count()
        })
    }

    /// Drops entities, pending operations and sync marks. Also recovers a corrupted cache.
    pub fn clear(&self) -> KinveyResult<()> {
        let mut state = self.lock_write();
        *state = CacheState::default();
        if let Some(persistence) = &self.persistence {
            persistence.clear(&self.collection)?;
        }
        Ok(())
    }

    pub fn enqueue(&self, operation: PendingOperation) -> KinveyResult<()> {
        self.mutate(|state| {
            state.enqueue(operation);
            Ok(())
        })
    }

    /// Stores a local write and records it for the next push, atomically.
    pub fn stage_save(&self, entity: Entity) -> KinveyResult<()> {
        self.stage_save_all(vec![entity])
    }

    /// Stages a batch of local writes; nothing is staged when any entity lacks an id.
    pub fn stage_save_all(&self, entities: Vec<Entity>) -> KinveyResult<()> {
        let operations = entities
            .iter()
            .map(PendingOperation::save)
            .collect::<KinveyResult<Vec<_>>>()?;
        self.mutate(|state| {
            for (entity, operation) in entities.into_iter().zip(operations) {
                state.upsert(entity)?;
                state.enqueue(operation);
            }
            Ok(())
        })
    }

    /// Removes the entity locally and records the removal for the next push.
    pub fn stage_remove(&self, id: &str) -> KinveyResult<bool> {
        let operation = PendingOperation::remove(id);
        self.mutate(|state| {
            let removed = state.entities.remove(id).is_some();
            state.enqueue(operation);
            Ok(removed)
        })
    }

    /// Stages a removal for every cached entity matching `query`, returning their ids.
    pub fn stage_remove_matching(&self, query: &LocalQuery) -> KinveyResult<Vec<String>> {
        self.mutate(|state| {
            let ids: Vec<String> = query
                .apply(state.ordered_entities())
                .iter()
                .filter_map(|entity| entity.id().map(str::to_owned))
                .collect();
            for id in &ids {
                state.entities.remove(id);
                state.enqueue(PendingOperation::remove(id.clone()));
            }
            Ok(ids)
        })
    }

    /// Deletes entities matching `query`; with `keep_dirty`, entities with pending
    /// operations stay.
    pub fn delete_matching(&self, query: &LocalQuery, keep_dirty: bool) -> KinveyResult<usize> {
        self.mutate(|state| {
            let ids: Vec<String> = query
                .apply(state.ordered_entities())
                .iter()
                .filter_map(|entity| entity.id().map(str::to_owned))
                .filter(|id| !(keep_dirty && state.is_dirty(id)))
                .collect();
            for id in &ids {
                state.entities.remove(id);
            }
            Ok(ids.len())
        })
    }

    /// Pending operations in FIFO order. They stay queued until completed.
    pub fn pending_operations(&self) -> KinveyResult<Vec<PendingOperation>> {
        self.read(|state| state.pending.clone())
    }

    pub fn pending_count(&self) -> KinveyResult<usize> {
        self.read(|state| state.pending.len())
    }

    pub fn has_pending(&self, id: &str) -> KinveyResult<bool> {
        self.read(|state| state.is_dirty(id))
    }

    /// Drops every pending operation along with entities that only exist locally.
    pub fn purge_pending(&self) -> KinveyResult<usize> {
        self.mutate(|state| {
            let purged = state.pending.len();
            state.pending.clear();
            state.removed_temporaries.clear();
            state.entities.retain(|id, _| !is_temporary_id(id));
            Ok(purged)
        })
    }

    /// Removes `operation` from the queue unless a newer one replaced it meanwhile.
    pub fn complete_pending(&self, operation: &PendingOperation) -> KinveyResult<bool> {
        self.mutate(|state| {
            let before = state.pending.len();
            state
                .pending
                .retain(|existing| existing.request_id != operation.request_id);
            Ok(state.pending.len() != before)
        })
    }

    /// Records the backend's copy of a pushed save.
    ///
    /// A temporary entity is replaced by the server-assigned id; a newer local
    /// operation queued while the push was in flight is re-keyed and kept. When the
    /// temporary entity was removed during the push, a removal of the server copy is
    /// queued instead.
    pub fn complete_save(&self, operation: &PendingOperation, saved: Entity) -> KinveyResult<()> {
        let saved_id = saved
            .id()
            .ok_or_else(|| invalid_argument("Saved entity returned without an id"))?
            .to_owned();
        self.mutate(|state| {
            state
                .pending
                .retain(|existing| existing.request_id != operation.request_id);

            if operation.entity_id == saved_id {
                if !state.is_dirty(&saved_id) {
                    state.upsert(saved)?;
                }
                return Ok(());
            }

            let local = state.entities.remove(&operation.entity_id);
            if state.removed_temporaries.remove(&operation.entity_id) {
                state.enqueue(PendingOperation::remove(saved_id));
                return Ok(());
            }
            let newer = state
                .pending
                .iter()
                .position(|existing| existing.entity_id == operation.entity_id);
            let entity = match (newer, local) {
                (Some(index), local) => {
                    let pending = &mut state.pending[index];
                    pending.entity_id = saved_id.clone();
                    if let Some(Value::Object(payload)) = pending.payload.as_mut() {
                        payload.insert(ENTITY_ID_KEY.to_owned(), Value::String(saved_id.clone()));
                    }
                    local.map(|StoredEntity { seq, mut entity }| {
                        entity.rekey(saved_id.clone());
                        if let Some(metadata) = saved.metadata() {
                            entity.set_metadata(metadata.clone());
                        }
                        StoredEntity { seq, entity }
                    })
                }
                (None, Some(StoredEntity { seq, .. })) => Some(StoredEntity { seq, entity: saved }),
                (None, None) => {
                    let seq = match state.entities.get(&saved_id) {
                        Some(stored) => stored.seq,
                        None => state.take_seq(),
                    };
                    Some(StoredEntity { seq, entity: saved })
                }
            };
            if let Some(stored) = entity {
                state.entities.insert(saved_id, stored);
            }
            Ok(())
        })
    }

    /// Applies a batch received from the backend in one step. Entities with pending
    /// operations are neither overwritten nor deleted.
    pub fn apply_remote_changes(&self, upserts: Vec<Entity>, deletes: &[String]) -> KinveyResult<RemoteApplyOutcome> {
        require_ids(&upserts, "Remote entity is missing an id")?;
        self.mutate(|state| {
            let mut outcome = RemoteApplyOutcome::default();
            for entity in upserts {
                if entity.id().is_some_and(|id| state.is_dirty(id)) {
                    outcome.skipped += 1;
                } else {
                    state.upsert(entity)?;
                    outcome.upserted += 1;
                }
            }
            for id in deletes {
                if state.is_dirty(id) {
                    outcome.skipped += 1;
                } else if state.entities.remove(id).is_some() {
                    outcome.deleted += 1;
                }
            }
            Ok(outcome)
        })
    }

    /// Deletes clean entities matching `predicate` that are absent from a complete
    /// remote result.
    pub fn remove_orphans(&self, predicate: &LocalPredicate, remote_ids: &HashSet<String>) -> KinveyResult<usize> {
        self.mutate(|state| {
            let orphans: Vec<String> = state
                .entities
                .iter()
                .filter(|(id, stored)| {
                    !remote_ids.contains(id.as_str())
                        && !is_temporary_id(id)
                        && !state.is_dirty(id)
                        && predicate.matches(&stored.entity)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &orphans {
                state.entities.remove(id);
            }
            Ok(orphans.len())
        })
    }

    pub fn sync_mark(&self, key: &str) -> KinveyResult<Option<String>> {
        self.read(|state| state.sync_marks.get(key).cloned())
    }

    /// Advances the mark for `key`; older marks never replace newer ones.
    pub fn set_sync_mark(&self, key: &str, mark: impl Into<String>) -> KinveyResult<()> {
        let mark = mark.into();
        self.mutate(|state| {
            let current = state.sync_marks.get(key);
            if current.map_or(true, |current| current.as_str() < mark.as_str()) {
                state.sync_marks.insert(key.to_owned(), mark);
            }
            Ok(())
        })
    }
}

fn require_ids(entities: &[Entity], message: &str) -> KinveyResult<()> {
    match entities.iter().any(Entity::is_local_only) {
        true => Err(invalid_argument(message)),
        false => Ok(()),
    }
}

fn corrupted(collection: &str, reason: &str) -> crate::error::KinveyError {
    cache_corruption(format!(
        "Cache for '{collection}' is corrupted ({reason}); clear it to recover"
    ))
}

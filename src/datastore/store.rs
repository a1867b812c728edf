use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};

use crate::client::Client;
use crate::datastore::entity::{generate_temporary_id, Acl, Entity, Persistable};
use crate::datastore::progress::{SyncProgress, SyncRequest};
use crate::datastore::query::Query;
use crate::datastore::query_translator::{translate, LocalQuery, TranslatedQuery};
use crate::datastore::sync::{self, CollectionContext, PullOptions, PullResult, PushOptions, PushResult, SyncResult};
use crate::error::{invalid_argument, KinveyError, KinveyErrorCode, KinveyResult};
use crate::logger::Logger;
use crate::network::{parse_count, parse_entities, NetworkRequest};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@kinvey/datastore"));

/// Where a store reads from and writes to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StoreMode {
    /// Every call goes to the backend; results are copied into the cache.
    Network,
    /// Local cache only.
    Cache,
    /// Local cache, with writes queued for an explicit [`DataStore::push`].
    #[default]
    Sync,
}

/// Outcome of [`DataStore::save_all`], indexed like the input slice.
#[derive(Debug)]
pub struct MultiSaveResult<T> {
    /// The stored copy of each input, `None` where that save failed.
    pub entities: Vec<Option<T>>,
    pub errors: BTreeMap<usize, KinveyError>,
}

impl<T> MultiSaveResult<T> {
    pub fn success_count(&self) -> usize {
        self.entities.iter().filter(|entity| entity.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Typed access to one collection.
///
/// Stores of the same collection created from the same [`Client`] share one cache
/// and one pending-operation queue.
pub struct DataStore<T> {
    client: Client,
    collection: Arc<CollectionContext>,
    mode: StoreMode,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for DataStore<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            collection: Arc::clone(&self.collection),
            mode: self.mode,
            _entity: PhantomData,
        }
    }
}

impl<T: Persistable> DataStore<T> {
    pub fn collection(client: &Client, mode: StoreMode) -> Self {
        Self::with_name(client, T::collection_name(), mode)
    }

    pub fn with_name(client: &Client, name: &str, mode: StoreMode) -> Self {
        Self {
            client: client.clone(),
            collection: client.collection(name),
            mode,
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.collection.name()
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    fn translate(&self, query: &Query) -> KinveyResult<TranslatedQuery> {
        translate(query, T::field_mappings())
    }

    pub async fn find(&self, query: &Query) -> KinveyResult<Vec<T>> {
        self.find_entities(query)
            .await?
            .iter()
            .map(T::from_entity)
            .collect()
    }

    /// Like [`find`](Self::find) without decoding.
    pub async fn find_entities(&self, query: &Query) -> KinveyResult<Vec<Entity>> {
        let translated = self.translate(query)?;
        match self.mode {
            StoreMode::Cache | StoreMode::Sync => self.collection.cache().query(&translated.local),
            StoreMode::Network => {
                let response = self
                    .client
                    .context()
                    .send(NetworkRequest::Find {
                        collection: self.name().to_owned(),
                        query: translated.remote,
                    })
                    .await?;
                let entities = parse_entities(response.body)?;
                self.remember(entities.clone());
                Ok(entities)
            }
        }
    }

    pub async fn find_by_id(&self, id: &str) -> KinveyResult<Option<T>> {
        if id.is_empty() {
            return Err(invalid_argument("An entity id is required"));
        }
        let entity = match self.mode {
            StoreMode::Cache | StoreMode::Sync => self.collection.cache().get(id)?,
            StoreMode::Network => {
                let fetched = self
                    .client
                    .context()
                    .send(NetworkRequest::GetById {
                        collection: self.name().to_owned(),
                        id: id.to_owned(),
                    })
                    .await;
                match fetched {
                    Ok(response) => {
                        let entity = Entity::from_json(response.body)?;
                        self.remember(vec![entity.clone()]);
                        Some(entity)
                    }
                    Err(err) if err.code == KinveyErrorCode::NotFound => None,
                    Err(err) => return Err(err),
                }
            }
        };
        entity.as_ref().map(T::from_entity).transpose()
    }

    /// Number of entities matching the query filter. Sort, limit and skip are ignored.
    pub async fn count(&self, query: &Query) -> KinveyResult<usize> {
        let translated = self.translate(query)?;
        match self.mode {
            StoreMode::Cache | StoreMode::Sync => self.collection.cache().count(&translated.local.predicate),
            StoreMode::Network => {
                let response = self
                    .client
                    .context()
                    .send(NetworkRequest::Count {
                        collection: self.name().to_owned(),
                        query: translated.remote.unwindowed(),
                    })
                    .await?;
                parse_count(&response.body)
            }
        }
    }

    pub async fn save(&self, item: &T) -> KinveyResult<T> {
        let saved = self.save_entity(item.to_entity()?).await?;
        T::from_entity(&saved)
    }

    /// Saves a raw entity. Entities without an id get a temporary one until pushed.
    pub async fn save_entity(&self, mut entity: Entity) -> KinveyResult<Entity> {
        match self.mode {
            StoreMode::Network => {
                let context = self.client.context();
                let request_context = context.session_context().await?;
                fill_creator(&mut entity, request_context.user_id.as_deref());
                let response = context
                    .transport
                    .send(
                        NetworkRequest::Save {
                            collection: self.name().to_owned(),
                            entity: entity.to_json(),
                        },
                        &request_context,
                    )
                    .await?;
                let saved = Entity::from_json(response.body)?;
                self.remember(vec![saved.clone()]);
                Ok(saved)
            }
            StoreMode::Cache | StoreMode::Sync => {
                if entity.id().is_none() {
                    entity.assign_id(generate_temporary_id())?;
                }
                let session = self.client.active_session().await?;
                fill_creator(&mut entity, session.as_ref().map(|session| session.user_id.as_str()));
                let cache = self.collection.cache();
                if self.mode == StoreMode::Sync {
                    cache.stage_save(entity.clone())?;
                } else {
                    cache.upsert(entity.clone())?;
                }
                Ok(entity)
            }
        }
    }

    /// Saves a batch. Local modes store every item in one step; network mode saves
    /// them one by one and reports failures by input index.
    pub async fn save_all(&self, items: &[T]) -> KinveyResult<MultiSaveResult<T>> {
        if items.is_empty() {
            return Err(invalid_argument("save_all requires at least one entity"));
        }
        let entities = items
            .iter()
            .map(T::to_entity)
            .collect::<KinveyResult<Vec<_>>>()?;
        match self.mode {
            StoreMode::Network => {
                self.client.context().session_context().await?;
                let mut result = MultiSaveResult {
                    entities: Vec::with_capacity(entities.len()),
                    errors: BTreeMap::new(),
                };
                for (index, entity) in entities.into_iter().enumerate() {
                    let saved = self.save_entity(entity).await;
                    match saved.and_then(|saved| T::from_entity(&saved)) {
                        Ok(saved) => result.entities.push(Some(saved)),
                        Err(err) => {
                            LOGGER.warn(format!("save {index} of a batch into '{}' failed: {err}", self.name()));
                            result.entities.push(None);
                            result.errors.insert(index, err);
                        }
                    }
                }
                Ok(result)
            }
            StoreMode::Cache | StoreMode::Sync => {
                let session = self.client.active_session().await?;
                let creator = session.as_ref().map(|session| session.user_id.as_str());
                let mut prepared = Vec::with_capacity(entities.len());
                for mut entity in entities {
                    if entity.id().is_none() {
                        entity.assign_id(generate_temporary_id())?;
                    }
                    fill_creator(&mut entity, creator);
                    prepared.push(entity);
                }
                let cache = self.collection.cache();
                if self.mode == StoreMode::Sync {
                    cache.stage_save_all(prepared.clone())?;
                } else {
                    cache.upsert_all(prepared.clone())?;
                }
                Ok(MultiSaveResult {
                    entities: prepared
                        .iter()
                        .map(|entity| T::from_entity(entity).map(Some))
                        .collect::<KinveyResult<_>>()?,
                    errors: BTreeMap::new(),
                })
            }
        }
    }

    /// Removes by id and returns how many entities were removed.
    pub async fn remove(&self, id: &str) -> KinveyResult<usize> {
        if id.is_empty() {
            return Err(invalid_argument("An entity id is required"));
        }
        let cache = self.collection.cache();
        match self.mode {
            StoreMode::Network => {
                let context = self.client.context();
                let request_context = context.session_context().await?;
                let response = context
                    .transport
                    .send(
                        NetworkRequest::Remove {
                            collection: self.name().to_owned(),
                            id: id.to_owned(),
                        },
                        &request_context,
                    )
                    .await?;
                let cached = match cache.has_pending(id) {
                    Ok(true) => Ok(false),
                    Ok(false) => cache.delete(id),
                    Err(err) => Err(err),
                };
                if let Err(err) = cached {
                    LOGGER.warn(format!(
                        "removed '{id}' from '{}' on the backend but not from the cache: {err}",
                        self.name()
                    ));
                }
                parse_count(&response.body)
            }
            StoreMode::Sync => Ok(usize::from(cache.stage_remove(id)?)),
            StoreMode::Cache => Ok(usize::from(cache.delete(id)?)),
        }
    }

    /// Removes every entity matching the query filter and returns how many went.
    /// Sort, limit and skip are ignored.
    ///
    /// In sync mode each matching cached entity gets its own pending removal.
    pub async fn remove_by_query(&self, query: &Query) -> KinveyResult<usize> {
        let translated = self.translate(query)?;
        let local = LocalQuery {
            predicate: translated.local.predicate.clone(),
            ..Default::default()
        };
        let cache = self.collection.cache();
        match self.mode {
            StoreMode::Network => {
                let context = self.client.context();
                let request_context = context.session_context().await?;
                let response = context
                    .transport
                    .send(
                        NetworkRequest::RemoveByQuery {
                            collection: self.name().to_owned(),
                            query: translated.remote.unwindowed(),
                        },
                        &request_context,
                    )
                    .await?;
                if let Err(err) = cache.delete_matching(&local, true) {
                    LOGGER.warn(format!(
                        "removed from '{}' on the backend but not from the cache: {err}",
                        self.name()
                    ));
                }
                parse_count(&response.body)
            }
            StoreMode::Sync => Ok(cache.stage_remove_matching(&local)?.len()),
            StoreMode::Cache => cache.delete_matching(&local, false),
        }
    }

    /// Copies backend results into the cache, leaving locally modified entities alone.
    /// The backend result stands even when the cache cannot take it.
    fn remember(&self, entities: Vec<Entity>) {
        match self.collection.cache().apply_remote_changes(entities, &[]) {
            Ok(outcome) if outcome.skipped > 0 => LOGGER.debug(format!(
                "kept {} locally modified entities of '{}'",
                outcome.skipped,
                self.name()
            )),
            Ok(_) => {}
            Err(err) => LOGGER.warn(format!(
                "backend results for '{}' were not cached: {err}",
                self.name()
            )),
        }
    }

    fn ensure_syncable(&self, operation: &str) -> KinveyResult<()> {
        if self.mode != StoreMode::Sync {
            return Err(invalid_argument(format!(
                "{operation} requires a store in StoreMode::Sync, '{}' is {:?}",
                self.name(),
                self.mode
            )));
        }
        Ok(())
    }

    /// Fetches the entities matching `query` into the cache.
    ///
    /// A second pull of the same collection while one is running is rejected with
    /// `OperationInProgress`.
    pub fn pull(&self, query: &Query, options: PullOptions) -> SyncRequest<PullResult> {
        let progress = SyncProgress::new();
        let prepared = self
            .ensure_syncable("pull")
            .and_then(|_| self.translate(query))
            .and_then(|translated| Ok((translated.remote, self.collection.begin_pull()?)));
        let (remote, guard) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return SyncRequest::spawn(progress, async move { Err(err) }),
        };
        let context = Arc::clone(self.client.context());
        let collection = Arc::clone(&self.collection);
        let task_progress = progress.clone();
        SyncRequest::spawn(progress, async move {
            let _guard = guard;
            sync::pull(&context, &collection, &remote, &options, &task_progress).await
        })
    }

    /// Sends pending operations to the backend, oldest first.
    pub fn push(&self, options: PushOptions) -> SyncRequest<PushResult> {
        let progress = SyncProgress::new();
        let guard = match self
            .ensure_syncable("push")
            .and_then(|_| self.collection.begin_push())
        {
            Ok(guard) => guard,
            Err(err) => return SyncRequest::spawn(progress, async move { Err(err) }),
        };
        let context = Arc::clone(self.client.context());
        let collection = Arc::clone(&self.collection);
        let task_progress = progress.clone();
        SyncRequest::spawn(progress, async move {
            let _guard = guard;
            sync::push(&context, &collection, &options, &task_progress).await
        })
    }

    /// Push followed by pull, sharing one progress and cancellation. A cancelled push
    /// skips the pull.
    pub fn sync(&self, query: &Query, pull: PullOptions, push: PushOptions) -> SyncRequest<SyncResult> {
        let progress = SyncProgress::new();
        let prepared = self
            .ensure_syncable("sync")
            .and_then(|_| self.translate(query))
            .and_then(|translated| {
                let push_guard = self.collection.begin_push()?;
                let pull_guard = self.collection.begin_pull()?;
                Ok((translated.remote, push_guard, pull_guard))
            });
        let (remote, push_guard, pull_guard) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return SyncRequest::spawn(progress, async move { Err(err) }),
        };
        let context = Arc::clone(self.client.context());
        let collection = Arc::clone(&self.collection);
        let task_progress = progress.clone();
        SyncRequest::spawn(progress, async move {
            let pushed = {
                let _guard = push_guard;
                sync::push(&context, &collection, &push, &task_progress).await?
            };
            let _guard = pull_guard;
            let pulled = sync::pull(&context, &collection, &remote, &pull, &task_progress).await?;
            Ok(SyncResult {
                push: pushed,
                pull: pulled,
            })
        })
    }

    /// Drops every pending operation without sending it, along with entities that
    /// never reached the backend.
    pub fn purge(&self) -> KinveyResult<usize> {
        self.collection.cache().purge_pending()
    }

    pub fn pending_sync_count(&self) -> KinveyResult<usize> {
        self.collection.cache().pending_count()
    }

    /// Empties the collection cache; the next pull is a full resync.
    pub fn clear_cache(&self) -> KinveyResult<()> {
        self.collection.cache().clear()
    }
}

fn fill_creator(entity: &mut Entity, user_id: Option<&str>) {
    let Some(user_id) = user_id else {
        return;
    };
    match entity.acl() {
        Some(acl) if acl.creator.is_some() => {}
        Some(acl) => {
            let mut acl = acl.clone();
            acl.creator = Some(user_id.to_owned());
            entity.set_acl(acl);
        }
        None => entity.set_acl(Acl::with_creator(user_id)),
    }
}

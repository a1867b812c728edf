use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kinvey_rs_sdk::client::{ActiveSession, Client, ClientOptions, SessionStore};
use kinvey_rs_sdk::datastore::{
    DataStore, FileCachePersistence, Persistable, Predicate, PullOptions, PushOptions, Query, StoreMode,
    SyncProgress,
};
use kinvey_rs_sdk::error::{from_http_status, KinveyErrorCode};
use kinvey_rs_sdk::network::{InMemoryBackend, RequestKind};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    age: i64,
}

impl Person {
    fn new(id: Option<&str>, name: &str, age: i64) -> Self {
        Self {
            id: id.map(str::to_owned),
            name: name.to_owned(),
            age,
        }
    }
}

impl Persistable for Person {
    fn collection_name() -> &'static str {
        "Person"
    }
}

fn client_with(backend: &InMemoryBackend, persistence: Option<Arc<FileCachePersistence>>) -> Client {
    let mut builder = Client::builder(ClientOptions {
        app_key: "kid_in_memory".into(),
        app_secret: "secret".into(),
        ..Default::default()
    })
    .with_transport(Arc::new(backend.clone()))
    .with_auth_provider(Arc::new(SessionStore::signed_in(ActiveSession::new(
        "user-1", "token-1",
    ))));
    if let Some(persistence) = persistence {
        builder = builder.with_cache_persistence(persistence);
    }
    builder.build().expect("client")
}

fn sync_store() -> (DataStore<Person>, InMemoryBackend) {
    let backend = InMemoryBackend::default();
    let client = client_with(&backend, None);
    (DataStore::collection(&client, StoreMode::Sync), backend)
}

fn seed(backend: &InMemoryBackend, people: &[(&str, &str, i64)]) {
    for (id, name, age) in people {
        backend
            .insert("Person", json!({"_id": id, "name": name, "age": age}))
            .unwrap();
    }
}

#[tokio::test]
async fn push_replaces_temporary_id_with_server_id() {
    let (store, backend) = sync_store();
    let saved = store.save(&Person::new(None, "Ada", 36)).await.unwrap();
    let temporary = saved.id.clone().unwrap();
    assert!(temporary.starts_with("tmp_"));

    let result = store.push(PushOptions::default()).await.unwrap();

    assert_eq!(result.failure_count(), 0);
    let server_id = result.succeeded[0].clone();
    assert!(!server_id.starts_with("tmp_"));
    assert!(backend.entity("Person", &server_id).is_some());
    assert_eq!(store.find_by_id(&temporary).await.unwrap(), None);
    let found = store.find(&Query::new()).await.unwrap();
    assert_eq!(found, vec![Person::new(Some(&server_id), "Ada", 36)]);
    assert_eq!(store.pending_sync_count().unwrap(), 0);
}

#[tokio::test]
async fn push_on_empty_queue_is_a_no_op() {
    let (store, backend) = sync_store();
    let result = store.push(PushOptions::default()).await.unwrap();
    assert_eq!(result.success_count(), 0);
    assert_eq!(result.failure_count(), 0);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn later_save_supersedes_earlier_one() {
    let (store, backend) = sync_store();
    store.save(&Person::new(Some("p1"), "Ada", 1)).await.unwrap();
    store.save(&Person::new(Some("p1"), "Ada", 2)).await.unwrap();
    assert_eq!(store.pending_sync_count().unwrap(), 1);

    store.push(PushOptions::default()).await.unwrap();

    assert_eq!(backend.request_count(RequestKind::Save), 1);
    assert_eq!(backend.entity("Person", "p1").unwrap()["age"], json!(2));
}

#[tokio::test]
async fn failed_operations_stay_queued() {
    let (store, backend) = sync_store();
    store.save(&Person::new(Some("a"), "A", 1)).await.unwrap();
    store.save(&Person::new(Some("b"), "B", 2)).await.unwrap();
    backend.fail_next(RequestKind::Save, from_http_status(500, None, Some("boom".into())));

    let result = store.push(PushOptions::default()).await.unwrap();

    assert_eq!(result.succeeded, vec!["b".to_string()]);
    assert_eq!(result.errors["a"].code, KinveyErrorCode::Network);
    assert_eq!(store.pending_sync_count().unwrap(), 1);

    let retry = store.push(PushOptions::default()).await.unwrap();
    assert_eq!(retry.succeeded, vec!["a".to_string()]);
    assert_eq!(store.pending_sync_count().unwrap(), 0);
}

#[tokio::test]
async fn delta_pull_with_no_changes_applies_nothing() {
    let (store, backend) = sync_store();
    seed(&backend, &[("a", "A", 10), ("b", "B", 20), ("c", "C", 30)]);
    let options = PullOptions::default().delta_set(true);

    let first = store.pull(&Query::new(), options.clone()).await.unwrap();
    assert!(!first.delta_set);
    assert_eq!(first.upserted, 3);

    let second = store.pull(&Query::new(), options.clone()).await.unwrap();
    assert!(second.delta_set);
    assert_eq!((second.upserted, second.deleted), (0, 0));

    seed(&backend, &[("d", "D", 40)]);
    backend.delete("Person", "a");
    let third = store.pull(&Query::new(), options).await.unwrap();
    assert!(third.delta_set);
    assert_eq!((third.upserted, third.deleted), (1, 1));
    assert_eq!(store.count(&Query::new()).await.unwrap(), 3);
}

#[tokio::test]
async fn rejected_delta_set_falls_back_to_full_pull() {
    let (store, backend) = sync_store();
    seed(&backend, &[("a", "A", 10)]);
    let options = PullOptions::default().delta_set(true);
    store.pull(&Query::new(), options.clone()).await.unwrap();

    backend.set_delta_set_enabled(false);
    seed(&backend, &[("b", "B", 20)]);
    let result = store.pull(&Query::new(), options).await.unwrap();

    assert!(!result.delta_set);
    assert_eq!(backend.request_count(RequestKind::DeltaSet), 1);
    assert_eq!(store.count(&Query::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn clear_cache_forces_full_resync() {
    let (store, backend) = sync_store();
    seed(&backend, &[("a", "A", 10), ("b", "B", 20)]);
    let options = PullOptions::default().delta_set(true);
    store.pull(&Query::new(), options.clone()).await.unwrap();

    store.clear_cache().unwrap();
    assert_eq!(store.count(&Query::new()).await.unwrap(), 0);

    let result = store.pull(&Query::new(), options).await.unwrap();
    assert!(!result.delta_set);
    assert_eq!(result.upserted, 2);
    assert_eq!(backend.request_count(RequestKind::DeltaSet), 0);
}

#[tokio::test]
async fn full_pull_removes_entities_deleted_remotely() {
    let (store, backend) = sync_store();
    seed(&backend, &[("a", "A", 10), ("b", "B", 20)]);
    store.pull(&Query::new(), PullOptions::default()).await.unwrap();
    backend.delete("Person", "a");

    let result = store.pull(&Query::new(), PullOptions::default()).await.unwrap();

    assert_eq!(result.deleted, 1);
    assert_eq!(store.find_by_id("a").await.unwrap(), None);
}

#[tokio::test]
async fn cancelled_pull_keeps_committed_pages() {
    let (store, backend) = sync_store();
    seed(
        &backend,
        &[("p0", "A", 1), ("p1", "B", 2), ("p2", "C", 3), ("p3", "D", 4), ("p4", "E", 5)],
    );

    let target: Arc<Mutex<Option<SyncProgress>>> = Arc::default();
    let finds = Arc::new(AtomicUsize::new(0));
    {
        let target = Arc::clone(&target);
        let finds = Arc::clone(&finds);
        backend.on_request(move |request| {
            if request.kind() == RequestKind::Find && finds.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                if let Some(progress) = target.lock().unwrap().as_ref() {
                    progress.cancel();
                }
            }
        });
    }

    let request = store.pull(&Query::new(), PullOptions::default().page_size(2));
    let progress = request.progress().clone();
    *target.lock().unwrap() = Some(progress.clone());
    let err = request.await.unwrap_err();

    assert_eq!(err.code, KinveyErrorCode::Cancelled);
    assert_eq!(store.count(&Query::new()).await.unwrap(), 4);
    let snapshot = progress.current();
    assert_eq!((snapshot.completed_units, snapshot.total_units), (2, 3));

    let resumed = store
        .pull(&Query::new(), PullOptions::default().page_size(2))
        .await
        .unwrap();
    assert_eq!(resumed.pages, 3);
    assert_eq!(store.count(&Query::new()).await.unwrap(), 5);
}

#[tokio::test]
async fn pulled_entities_answer_local_queries() {
    let (store, backend) = sync_store();
    seed(&backend, &[("a", "a", 10), ("b", "b", 20)]);
    store.pull(&Query::new(), PullOptions::default()).await.unwrap();

    let older = store
        .find(&Query::new().filter(Predicate::gt("age", 15)))
        .await
        .unwrap();
    assert_eq!(older, vec![Person::new(Some("b"), "b", 20)]);
    assert_eq!(
        store
            .count(&Query::new().filter(Predicate::gt("age", 5)))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn concurrent_pull_is_rejected() {
    let (store, backend) = sync_store();
    seed(&backend, &[("a", "A", 10)]);
    backend.set_latency(Duration::from_millis(20));

    let first = store.pull(&Query::new(), PullOptions::default());
    let second = store.pull(&Query::new(), PullOptions::default());

    let err = second.await.unwrap_err();
    assert_eq!(err.code, KinveyErrorCode::OperationInProgress);
    assert_eq!(first.await.unwrap().upserted, 1);
}

#[tokio::test]
async fn pull_keeps_locally_modified_entities() {
    let (store, backend) = sync_store();
    seed(&backend, &[("p1", "Ada", 1)]);
    store.pull(&Query::new(), PullOptions::default()).await.unwrap();

    store.save(&Person::new(Some("p1"), "Ada", 5)).await.unwrap();
    seed(&backend, &[("p1", "Ada", 9)]);
    let pulled = store.pull(&Query::new(), PullOptions::default()).await.unwrap();

    assert_eq!(pulled.skipped, 1);
    assert_eq!(store.find_by_id("p1").await.unwrap().unwrap().age, 5);

    let synced = store
        .sync(&Query::new(), PullOptions::default(), PushOptions::default())
        .await
        .unwrap();
    assert_eq!(synced.push.succeeded, vec!["p1".to_string()]);
    assert_eq!(backend.entity("Person", "p1").unwrap()["age"], json!(5));
    assert_eq!(store.find_by_id("p1").await.unwrap().unwrap().age, 5);
}

#[tokio::test]
async fn windowed_pull_fetches_one_page_without_deleting() {
    let (store, backend) = sync_store();
    store.save(&Person::new(Some("local"), "Local", 1)).await.unwrap();
    store.purge().unwrap();
    seed(&backend, &[("a", "A", 10), ("b", "B", 20), ("c", "C", 30)]);

    let query = Query::new().descending("age").limit(2);
    let result = store.pull(&query, PullOptions::default()).await.unwrap();

    assert_eq!((result.upserted, result.deleted), (2, 0));
    assert_eq!(result.sync_mark, None);
    assert!(store.find_by_id("local").await.unwrap().is_some());
    assert!(store.find_by_id("a").await.unwrap().is_none());
}

#[tokio::test]
async fn network_store_reads_and_writes_remotely() {
    let backend = InMemoryBackend::default();
    let client = client_with(&backend, None);
    let network = DataStore::<Person>::collection(&client, StoreMode::Network);
    seed(&backend, &[("a", "A", 10), ("b", "B", 20)]);

    let found = network
        .find(&Query::new().ascending("age"))
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(network.count(&Query::new()).await.unwrap(), 2);
    assert_eq!(network.remove("a").await.unwrap(), 1);
    assert_eq!(backend.entity_count("Person"), 1);

    let cached = DataStore::<Person>::collection(&client, StoreMode::Cache);
    assert_eq!(cached.find(&Query::new()).await.unwrap(), vec![Person::new(Some("b"), "B", 20)]);
}

#[tokio::test]
async fn pending_operations_survive_restart() {
    let directory = tempfile::tempdir().unwrap();
    let backend = InMemoryBackend::default();
    {
        let client = client_with(&backend, Some(Arc::new(FileCachePersistence::new(directory.path()))));
        let store = DataStore::<Person>::collection(&client, StoreMode::Sync);
        store.save(&Person::new(Some("p1"), "Ada", 36)).await.unwrap();
    }

    let client = client_with(&backend, Some(Arc::new(FileCachePersistence::new(directory.path()))));
    let store = DataStore::<Person>::collection(&client, StoreMode::Sync);
    assert_eq!(store.pending_sync_count().unwrap(), 1);
    assert_eq!(store.find_by_id("p1").await.unwrap().unwrap().name, "Ada");

    store.push(PushOptions::default()).await.unwrap();
    assert!(backend.entity("Person", "p1").is_some());
}

#[tokio::test]
async fn corrupted_cache_fails_until_cleared() {
    let directory = tempfile::tempdir().unwrap();
    std::fs::write(directory.path().join("Person.json"), b"{ not json").unwrap();
    let backend = InMemoryBackend::default();
    let client = client_with(&backend, Some(Arc::new(FileCachePersistence::new(directory.path()))));
    let store = DataStore::<Person>::collection(&client, StoreMode::Sync);

    let err = store.find(&Query::new()).await.unwrap_err();
    assert_eq!(err.code, KinveyErrorCode::CacheCorruption);

    store.clear_cache().unwrap();
    assert_eq!(store.count(&Query::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn network_reads_and_writes_survive_a_corrupted_cache() {
    let directory = tempfile::tempdir().unwrap();
    std::fs::write(directory.path().join("Person.json"), b"{ not json").unwrap();
    let backend = InMemoryBackend::default();
    seed(&backend, &[("a", "A", 10)]);
    let client = client_with(&backend, Some(Arc::new(FileCachePersistence::new(directory.path()))));
    let network = DataStore::<Person>::collection(&client, StoreMode::Network);

    let found = network.find(&Query::new()).await.unwrap();
    assert_eq!(found, vec![Person::new(Some("a"), "A", 10)]);
    assert_eq!(network.find_by_id("a").await.unwrap().unwrap().age, 10);

    let saved = network.save(&Person::new(None, "Ada", 36)).await.unwrap();
    assert!(backend.entity("Person", saved.id.as_deref().unwrap()).is_some());
    assert_eq!(network.remove("a").await.unwrap(), 1);
    assert_eq!(backend.entity_count("Person"), 1);
}

#[tokio::test]
async fn network_count_failure_is_not_answered_from_cache() {
    let backend = InMemoryBackend::default();
    seed(&backend, &[("a", "A", 10), ("b", "B", 20)]);
    let client = client_with(&backend, None);
    let network = DataStore::<Person>::collection(&client, StoreMode::Network);
    network.find(&Query::new()).await.unwrap();

    backend.fail_next(RequestKind::Count, from_http_status(503, None, None));
    let err = network.count(&Query::new()).await.unwrap_err();
    assert_eq!(err.code, KinveyErrorCode::Network);
    assert_eq!(backend.request_count(RequestKind::Count), 1);
}

#[tokio::test]
async fn temporary_entity_removed_during_push_is_removed_remotely() {
    let (store, backend) = sync_store();
    let saved = store.save(&Person::new(None, "Ghost", 1)).await.unwrap();
    let temporary = saved.id.unwrap();
    backend.set_latency(Duration::from_millis(60));

    let push = store.push(PushOptions::default());
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert_eq!(store.remove(&temporary).await.unwrap(), 1);
    let pushed = push.await.unwrap();

    let server_id = pushed.succeeded[0].clone();
    assert_eq!(backend.entity_count("Person"), 1);
    assert_eq!(store.find_by_id(&server_id).await.unwrap(), None);
    assert_eq!(store.find_by_id(&temporary).await.unwrap(), None);
    assert_eq!(store.pending_sync_count().unwrap(), 1);

    backend.set_latency(Duration::ZERO);
    let cleanup = store.push(PushOptions::default()).await.unwrap();
    assert_eq!(cleanup.succeeded, vec![server_id]);
    assert_eq!(backend.entity_count("Person"), 0);
    assert_eq!(store.pending_sync_count().unwrap(), 0);
}

#[tokio::test]
async fn sync_cancelled_during_push_skips_pull() {
    let (store, backend) = sync_store();
    store.save(&Person::new(Some("p1"), "Ada", 1)).await.unwrap();
    store.save(&Person::new(Some("p2"), "Bob", 2)).await.unwrap();

    let target: Arc<Mutex<Option<SyncProgress>>> = Arc::default();
    {
        let target = Arc::clone(&target);
        backend.on_request(move |request| {
            if request.kind() == RequestKind::Save {
                if let Some(progress) = target.lock().unwrap().as_ref() {
                    progress.cancel();
                }
            }
        });
    }

    let request = store.sync(&Query::new(), PullOptions::default(), PushOptions::default());
    let progress = request.progress().clone();
    *target.lock().unwrap() = Some(progress.clone());
    let err = request.await.unwrap_err();

    assert_eq!(err.code, KinveyErrorCode::Cancelled);
    assert_eq!(backend.request_count(RequestKind::Save), 1);
    assert_eq!(backend.request_count(RequestKind::Count), 0);
    assert_eq!(backend.request_count(RequestKind::Find), 0);
    assert_eq!(store.pending_sync_count().unwrap(), 1);
    let snapshot = progress.current();
    assert_eq!((snapshot.completed_units, snapshot.total_units), (1, 2));
    assert!(!snapshot.finished);
}

#[tokio::test]
async fn sync_progress_covers_push_and_pull() {
    let (store, backend) = sync_store();
    seed(&backend, &[("a", "A", 10), ("b", "B", 20), ("c", "C", 30)]);
    store.save(&Person::new(Some("p1"), "Ada", 1)).await.unwrap();

    let request = store.sync(
        &Query::new(),
        PullOptions::default().page_size(2),
        PushOptions::default(),
    );
    let progress = request.progress().clone();
    let result = request.await.unwrap();

    assert_eq!(result.push.success_count(), 1);
    assert_eq!(result.pull.pages, 2);
    let snapshot = progress.current();
    assert_eq!((snapshot.completed_units, snapshot.total_units), (3, 3));
    assert!(snapshot.finished);
}

#[tokio::test]
async fn save_all_reports_network_failures_by_index() {
    let backend = InMemoryBackend::default();
    let client = client_with(&backend, None);
    let network = DataStore::<Person>::collection(&client, StoreMode::Network);
    backend.fail_next(RequestKind::Save, from_http_status(500, None, None));

    let people = [
        Person::new(Some("a"), "A", 1),
        Person::new(Some("b"), "B", 2),
        Person::new(None, "C", 3),
    ];
    let result = network.save_all(&people).await.unwrap();

    assert_eq!(result.success_count(), 2);
    assert_eq!(result.errors.keys().copied().collect::<Vec<_>>(), vec![0]);
    assert!(result.entities[0].is_none());
    assert_eq!(result.entities[1], Some(Person::new(Some("b"), "B", 2)));
    assert_eq!(backend.entity_count("Person"), 2);

    let err = network.save_all(&[]).await.unwrap_err();
    assert_eq!(err.code, KinveyErrorCode::InvalidArgument);
}

#[tokio::test]
async fn save_all_in_sync_mode_queues_every_item() {
    let (store, backend) = sync_store();
    let result = store
        .save_all(&[Person::new(None, "A", 1), Person::new(Some("b"), "B", 2)])
        .await
        .unwrap();
    assert!(result.is_complete());
    assert!(result.entities[0].as_ref().unwrap().id.as_deref().unwrap().starts_with("tmp_"));
    assert_eq!(store.pending_sync_count().unwrap(), 2);
    assert!(backend.requests().is_empty());

    store.push(PushOptions::default()).await.unwrap();
    assert_eq!(backend.entity_count("Person"), 2);
}

#[tokio::test]
async fn remove_by_query_queues_one_removal_per_match() {
    let (store, backend) = sync_store();
    seed(&backend, &[("a", "A", 10), ("b", "B", 20), ("c", "C", 30)]);
    store.pull(&Query::new(), PullOptions::default()).await.unwrap();

    let query = Query::new().filter(Predicate::gte("age", 20)).limit(1);
    assert_eq!(store.remove_by_query(&query).await.unwrap(), 2);
    assert_eq!(store.pending_sync_count().unwrap(), 2);
    assert_eq!(store.count(&Query::new()).await.unwrap(), 1);

    let pushed = store.push(PushOptions::default()).await.unwrap();
    assert_eq!(pushed.success_count(), 2);
    assert_eq!(backend.entity_count("Person"), 1);
    assert!(backend.entity("Person", "a").is_some());
}

#[tokio::test]
async fn network_remove_by_query_keeps_dirty_cache_entries() {
    let backend = InMemoryBackend::default();
    seed(&backend, &[("a", "A", 10), ("b", "B", 20), ("c", "C", 30)]);
    let client = client_with(&backend, None);
    let network = DataStore::<Person>::collection(&client, StoreMode::Network);
    let syncing = DataStore::<Person>::collection(&client, StoreMode::Sync);
    network.find(&Query::new()).await.unwrap();
    syncing.save(&Person::new(Some("c"), "C", 31)).await.unwrap();

    let removed = network
        .remove_by_query(&Query::new().filter(Predicate::gt("age", 15)))
        .await
        .unwrap();

    assert_eq!(removed, 2);
    assert_eq!(backend.entity_count("Person"), 1);
    assert_eq!(backend.request_count(RequestKind::RemoveByQuery), 1);
    assert!(syncing.find_by_id("b").await.unwrap().is_none());
    assert_eq!(syncing.find_by_id("c").await.unwrap().unwrap().age, 31);
}

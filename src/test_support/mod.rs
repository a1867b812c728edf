//! Test utilities shared across crate-level unit tests.

use std::sync::{Arc, Mutex};

use httpmock::MockServer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{ActiveSession, Client, ClientOptions, SessionStore};
use crate::datastore::{FieldCodec, FieldMapping, Persistable};
use crate::error::KinveyError;
use crate::network::InMemoryBackend;
use crate::realtime::{InMemoryPubSubHub, PubSubListener, RealtimeStatus};

/// Start a fresh `httpmock::MockServer` instance for use in unit tests.
pub async fn start_mock_server() -> MockServer {
    MockServer::start_async().await
}

pub fn user_session(user_id: &str) -> ActiveSession {
    ActiveSession::new(user_id, format!("token-{user_id}"))
}

/// A client wired to an in-memory backend and pub/sub hub, signed in as one user.
pub struct Harness {
    pub client: Client,
    pub sessions: Arc<SessionStore>,
    pub backend: InMemoryBackend,
    pub hub: InMemoryPubSubHub,
}

pub fn harness(user_id: &str) -> Harness {
    let hub = InMemoryPubSubHub::new();
    let backend = InMemoryBackend::default().with_pubsub(hub.clone());
    let sessions = Arc::new(SessionStore::signed_in(user_session(user_id)));
    let client = Client::builder(ClientOptions {
        app_key: "kid_in_memory".into(),
        app_secret: "secret".into(),
        device_id: Some("device-1".into()),
        ..Default::default()
    })
    .with_transport(Arc::new(backend.clone()))
    .with_auth_provider(sessions.clone())
    .with_pubsub_factory(Arc::new(hub.clone()))
    .build()
    .expect("in-memory client");
    Harness {
        client,
        sessions,
        backend,
        hub,
    }
}

pub fn realtime_client(user_id: &str) -> (Client, InMemoryBackend, InMemoryPubSubHub) {
    let harness = harness(user_id);
    (harness.client, harness.backend, harness.hub)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub age: i64,
}

impl Person {
    pub fn new(name: &str, age: i64) -> Self {
        Self {
            id: None,
            name: name.to_owned(),
            age,
        }
    }

    pub fn with_id(id: &str, name: &str, age: i64) -> Self {
        Self {
            id: Some(id.to_owned()),
            ..Self::new(name, age)
        }
    }
}

impl Persistable for Person {
    fn collection_name() -> &'static str {
        "Person"
    }

    fn field_mappings() -> &'static [FieldMapping] {
        const MAPPINGS: &[FieldMapping] = &[
            FieldMapping::new("name", "name", FieldCodec::String),
            FieldMapping::new("age", "age", FieldCodec::Integer),
        ];
        MAPPINGS
    }
}

/// Listener that records everything it is handed.
#[derive(Default)]
pub struct Recorder {
    messages: Mutex<Vec<(String, Value)>>,
    statuses: Mutex<Vec<RealtimeStatus>>,
    errors: Mutex<Vec<KinveyError>>,
}

impl Recorder {
    pub fn messages(&self) -> Vec<Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn statuses(&self) -> Vec<RealtimeStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<KinveyError> {
        self.errors.lock().unwrap().clone()
    }
}

impl PubSubListener for Recorder {
    fn on_message(&self, channel: &str, message: &Value) {
        self.messages
            .lock()
            .unwrap()
            .push((channel.to_owned(), message.clone()));
    }

    fn on_status(&self, status: RealtimeStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn on_error(&self, _channels: &[String], error: &KinveyError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

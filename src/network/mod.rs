//! Requests the SDK sends to the backend and the transports that carry them.
//!
//! [`NetworkTransport`] is the seam between the data store / realtime code and the
//! wire: [`HttpTransport`] talks to the REST API, [`InMemoryBackend`] emulates it
//! in process for tests and offline demos.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::datastore::entity::{Entity, ENTITY_ID_KEY};
use crate::datastore::query_translator::RemoteQuery;
use crate::error::{internal_error, KinveyResult};

pub mod http;
pub mod in_memory;

pub use http::{HttpTransport, HttpTransportBuilder};
pub use in_memory::InMemoryBackend;

/// Header carrying the server time at which a request started processing.
pub const REQUEST_START_HEADER: &str = "X-Kinvey-Request-Start";

/// Per-request credentials and limits.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub auth_token: Option<String>,
    pub request_timeout: Option<Duration>,
}

/// One backend call.
#[derive(Clone, Debug, PartialEq)]
pub enum NetworkRequest {
    Find {
        collection: String,
        query: RemoteQuery,
    },
    Count {
        collection: String,
        query: RemoteQuery,
    },
    GetById {
        collection: String,
        id: String,
    },
    DeltaSet {
        collection: String,
        query: RemoteQuery,
        since: String,
    },
    /// Create when `entity` has no `_id`, update otherwise.
    Save {
        collection: String,
        entity: Value,
    },
    Remove {
        collection: String,
        id: String,
    },
    /// Deletes every entity matching the filter; sort and window are ignored.
    RemoveByQuery {
        collection: String,
        query: RemoteQuery,
    },
    RegisterRealtime {
        user_id: String,
        device_id: String,
    },
    UnregisterRealtime {
        user_id: String,
        device_id: String,
    },
    StreamGrantAccess {
        stream: String,
        user_id: String,
        acl: Value,
    },
    StreamPublishChannel {
        stream: String,
        user_id: String,
    },
    StreamSubscribe {
        stream: String,
        user_id: String,
        device_id: String,
    },
    StreamUnsubscribe {
        stream: String,
        user_id: String,
        device_id: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Find,
    Count,
    GetById,
    DeltaSet,
    Save,
    Remove,
    RemoveByQuery,
    RegisterRealtime,
    UnregisterRealtime,
    StreamGrantAccess,
    StreamPublishChannel,
    StreamSubscribe,
    StreamUnsubscribe,
}

impl NetworkRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            NetworkRequest::Find { .. } => RequestKind::Find,
            NetworkRequest::Count { .. } => RequestKind::Count,
            NetworkRequest::GetById { .. } => RequestKind::GetById,
            NetworkRequest::DeltaSet { .. } => RequestKind::DeltaSet,
            NetworkRequest::Save { .. } => RequestKind::Save,
            NetworkRequest::Remove { .. } => RequestKind::Remove,
            NetworkRequest::RemoveByQuery { .. } => RequestKind::RemoveByQuery,
            NetworkRequest::RegisterRealtime { .. } => RequestKind::RegisterRealtime,
            NetworkRequest::UnregisterRealtime { .. } => RequestKind::UnregisterRealtime,
            NetworkRequest::StreamGrantAccess { .. } => RequestKind::StreamGrantAccess,
            NetworkRequest::StreamPublishChannel { .. } => RequestKind::StreamPublishChannel,
            NetworkRequest::StreamSubscribe { .. } => RequestKind::StreamSubscribe,
            NetworkRequest::StreamUnsubscribe { .. } => RequestKind::StreamUnsubscribe,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkResponse {
    pub body: Value,
    /// Value of [`REQUEST_START_HEADER`], when the backend sent it.
    pub request_start: Option<String>,
}

impl NetworkResponse {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            request_start: None,
        }
    }

    pub fn with_request_start(mut self, request_start: impl Into<String>) -> Self {
        self.request_start = Some(request_start.into());
        self
    }
}

#[async_trait]
pub trait NetworkTransport: Send + Sync {
    async fn send(&self, request: NetworkRequest, context: &RequestContext) -> KinveyResult<NetworkResponse>;
}

pub(crate) fn parse_entities(body: Value) -> KinveyResult<Vec<Entity>> {
    match body {
        Value::Array(items) => items.into_iter().map(Entity::from_json).collect(),
        other => Err(internal_error(format!("Expected an array of entities, got {other}"))),
    }
}

pub(crate) fn parse_count(body: &Value) -> KinveyResult<usize> {
    body.get("count")
        .and_then(Value::as_u64)
        .map(|count| count as usize)
        .ok_or_else(|| internal_error(format!("Expected a count response, got {body}")))
}

/// Body of a `_deltaset` response.
#[derive(Debug, Default)]
pub(crate) struct DeltaSetChanges {
    pub changed: Vec<Entity>,
    pub deleted: Vec<String>,
}

#[derive(Deserialize)]
struct DeltaSetBody {
    #[serde(default)]
    changed: Vec<Value>,
    #[serde(default)]
    deleted: Vec<DeletedEntity>,
}

#[derive(Deserialize)]
struct DeletedEntity {
    #[serde(rename = "_id")]
    id: String,
}

pub(crate) fn parse_delta_set(body: Value) -> KinveyResult<DeltaSetChanges> {
    let parsed: DeltaSetBody = serde_json::from_value(body)
        .map_err(|err| internal_error(format!("Malformed delta set response: {err}")))?;
    Ok(DeltaSetChanges {
        changed: parsed
            .changed
            .into_iter()
            .map(Entity::from_json)
            .collect::<KinveyResult<_>>()?,
        deleted: parsed.deleted.into_iter().map(|deleted| deleted.id).collect(),
    })
}

pub(crate) fn deleted_marker(id: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(ENTITY_ID_KEY.to_owned(), Value::String(id.to_owned()));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_set_body_is_parsed() {
        let changes = parse_delta_set(json!({
            "changed": [{"_id": "a", "age": 11}],
            "deleted": [{"_id": "b"}]
        }))
        .unwrap();
        assert_eq!(changes.changed[0].id(), Some("a"));
        assert_eq!(changes.deleted, vec!["b".to_string()]);
        assert_eq!(deleted_marker("b"), json!({"_id": "b"}));
    }

    #[test]
    fn count_requires_number() {
        assert_eq!(parse_count(&json!({"count": 3})).unwrap(), 3);
        assert!(parse_count(&json!({"total": 3})).is_err());
    }
}

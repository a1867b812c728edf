use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{
    from_http_status, internal_error, invalid_argument, network_error, KinveyError, KinveyResult,
};
use crate::network::{NetworkRequest, NetworkResponse, NetworkTransport, RequestContext, REQUEST_START_HEADER};

pub const DEFAULT_BASE_URL: &str = "https://baas.kinvey.com";
const KINVEY_API_VERSION: &str = "4";
const API_VERSION_HEADER: &str = "X-Kinvey-API-Version";

/// Environment variable overriding the backend base URL.
pub const BASE_URL_ENV: &str = "KINVEY_BASE_URL";

/// REST transport over `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    app_key: String,
    app_secret: String,
    request_timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct HttpTransportBuilder {
    app_key: String,
    app_secret: String,
    client: Option<Client>,
    base_url: Option<String>,
    request_timeout: Option<Duration>,
}

impl HttpTransportBuilder {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            client: None,
            base_url: std::env::var(BASE_URL_ENV).ok(),
            request_timeout: None,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> KinveyResult<HttpTransport> {
        if self.app_key.is_empty() {
            return Err(invalid_argument("An app key is required"));
        }
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .build()
                .map_err(|err| internal_error(err.to_string()))?,
        };
        let raw = self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let base_url = Url::parse(raw)
            .map_err(|err| invalid_argument(format!("Invalid base URL '{raw}': {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid_argument(format!("Invalid base URL '{raw}'")));
        }
        Ok(HttpTransport {
            client,
            base_url,
            app_key: self.app_key,
            app_secret: self.app_secret,
            request_timeout: self.request_timeout,
        })
    }
}

impl HttpTransport {
    pub fn builder(app_key: impl Into<String>, app_secret: impl Into<String>) -> HttpTransportBuilder {
        HttpTransportBuilder::new(app_key, app_secret)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> KinveyResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| internal_error("Base URL cannot take path segments"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn endpoint(&self, request: &NetworkRequest) -> KinveyResult<(Method, Url, Option<Value>)> {
        let app_key = self.app_key.as_str();
        let endpoint = match request {
            NetworkRequest::Find { collection, query } => {
                let mut url = self.url(&["appdata", app_key, collection.as_str(), ""])?;
                append_query(&mut url, query.query_pairs());
                (Method::GET, url, None)
            }
            NetworkRequest::Count { collection, query } => {
                let mut url = self.url(&["appdata", app_key, collection.as_str(), "_count"])?;
                append_query(&mut url, query.unwindowed().query_pairs());
                (Method::GET, url, None)
            }
            NetworkRequest::GetById { collection, id } => {
                (Method::GET, self.url(&["appdata", app_key, collection.as_str(), id.as_str()])?, None)
            }
            NetworkRequest::DeltaSet {
                collection,
                query,
                since,
            } => {
                let mut url = self.url(&["appdata", app_key, collection.as_str(), "_deltaset"])?;
                let mut pairs = vec![("since", since.clone())];
                pairs.extend(query.unwindowed().query_pairs());
                append_query(&mut url, pairs);
                (Method::GET, url, None)
            }
            NetworkRequest::Save { collection, entity } => match entity.get("_id").and_then(Value::as_str) {
                Some(id) => (
                    Method::PUT,
                    self.url(&["appdata", app_key, collection.as_str(), id])?,
                    Some(entity.clone()),
                ),
                None => (
                    Method::POST,
                    self.url(&["appdata", app_key, collection.as_str(), ""])?,
                    Some(entity.clone()),
                ),
            },
            NetworkRequest::Remove { collection, id } => {
                (Method::DELETE, self.url(&["appdata", app_key, collection.as_str(), id.as_str()])?, None)
            }
            NetworkRequest::RemoveByQuery { collection, query } => {
                let mut url = self.url(&["appdata", app_key, collection.as_str(), ""])?;
                append_query(&mut url, query.unwindowed().query_pairs());
                (Method::DELETE, url, None)
            }
            NetworkRequest::RegisterRealtime { user_id, device_id } => (
                Method::POST,
                self.url(&["user", app_key, user_id.as_str(), "register-realtime"])?,
                Some(serde_json::json!({ "deviceId": device_id })),
            ),
            NetworkRequest::UnregisterRealtime { user_id, device_id } => (
                Method::POST,
                self.url(&["user", app_key, user_id.as_str(), "unregister-realtime"])?,
                Some(serde_json::json!({ "deviceId": device_id })),
            ),
            NetworkRequest::StreamGrantAccess { stream, user_id, acl } => (
                Method::PUT,
                self.url(&["stream", app_key, stream.as_str(), user_id.as_str()])?,
                Some(acl.clone()),
            ),
            NetworkRequest::StreamPublishChannel { stream, user_id } => (
                Method::POST,
                self.url(&["stream", app_key, stream.as_str(), user_id.as_str(), "publish"])?,
                Some(Value::Object(Default::default())),
            ),
            NetworkRequest::StreamSubscribe {
                stream,
                user_id,
                device_id,
            } => (
                Method::POST,
                self.url(&["stream", app_key, stream.as_str(), user_id.as_str(), "subscribe"])?,
                Some(serde_json::json!({ "deviceId": device_id })),
            ),
            NetworkRequest::StreamUnsubscribe {
                stream,
                user_id,
                device_id,
            } => (
                Method::POST,
                self.url(&["stream", app_key, stream.as_str(), user_id.as_str(), "unsubscribe"])?,
                Some(serde_json::json!({ "deviceId": device_id })),
            ),
        };
        Ok(endpoint)
    }

    fn authorization(&self, context: &RequestContext) -> String {
        match context.auth_token.as_deref() {
            Some(token) => format!("Kinvey {token}"),
            None => {
                let credentials = STANDARD.encode(format!("{}:{}", self.app_key, self.app_secret));
                format!("Basic {credentials}")
            }
        }
    }
}

fn append_query(url: &mut Url, pairs: Vec<(&'static str, String)>) {
    if pairs.is_empty() {
        return;
    }
    let mut serializer = url.query_pairs_mut();
    for (name, value) in pairs {
        serializer.append_pair(name, &value);
    }
}

#[async_trait]
impl NetworkTransport for HttpTransport {
    async fn send(&self, request: NetworkRequest, context: &RequestContext) -> KinveyResult<NetworkResponse> {
        let (method, url, body) = self.endpoint(&request)?;
        let mut builder = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, self.authorization(context))
            .header(API_VERSION_HEADER, KINVEY_API_VERSION);
        if let Some(timeout) = context.request_timeout.or(self.request_timeout) {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| network_error(format!("Request failed: {err}")))?;
        let status = response.status();
        let request_start = response
            .headers()
            .get(REQUEST_START_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let text = response
            .text()
            .await
            .map_err(|err| network_error(format!("Failed to read response: {err}")))?;

        if !status.is_success() {
            return Err(map_http_error(status.as_u16(), &text));
        }
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|err| internal_error(format!("Malformed response body: {err}")))?
        };
        Ok(NetworkResponse {
            body,
            request_start,
        })
    }
}

#[derive(Debug, Deserialize)]
struct KinveyErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

pub(crate) fn map_http_error(status: u16, body: &str) -> KinveyError {
    let parsed = serde_json::from_str::<KinveyErrorBody>(body).ok();
    let (reason, description) = match parsed {
        Some(parsed) => (parsed.error, parsed.description),
        None => (None, None),
    };
    from_http_status(status, reason, description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::entity::FieldMapping;
    use crate::datastore::query::{Predicate, Query};
    use crate::datastore::query_translator::translate;
    use crate::error::KinveyErrorCode;
    use crate::test_support::start_mock_server;
    use httpmock::prelude::*;
    use serde_json::json;

    fn transport(server: &MockServer) -> HttpTransport {
        HttpTransport::builder("kid_app", "secret")
            .with_base_url(server.base_url())
            .build()
            .expect("transport")
    }

    fn user_context() -> RequestContext {
        RequestContext {
            user_id: Some("user-1".into()),
            auth_token: Some("token-1".into()),
            request_timeout: None,
        }
    }

    #[tokio::test]
    async fn find_sends_query_parameters_and_session_auth() {
        let server = start_mock_server().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/appdata/kid_app/Person/")
                    .query_param("query", r#"{"age":{"$gt":15}}"#)
                    .query_param("sort", r#"{"name":1}"#)
                    .query_param("limit", "5")
                    .header("Authorization", "Kinvey token-1")
                    .header("X-Kinvey-API-Version", "4");
                then.status(200)
                    .header(REQUEST_START_HEADER, "2024-01-01T00:00:00.000Z")
                    .json_body(json!([{ "_id": "a", "name": "Ann", "age": 20 }]));
            })
            .await;

        let query = Query::new()
            .filter(Predicate::gt("age", 15))
            .ascending("name")
            .limit(5);
        let translated = translate(&query, &[] as &[FieldMapping]).unwrap();
        let response = transport(&server)
            .send(
                NetworkRequest::Find {
                    collection: "Person".into(),
                    query: translated.remote,
                },
                &user_context(),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.body[0]["_id"], json!("a"));
        assert_eq!(response.request_start.as_deref(), Some("2024-01-01T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn save_creates_or_updates_depending_on_id() {
        let server = start_mock_server().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/appdata/kid_app/Person/")
                    .json_body(json!({ "name": "Ann" }));
                then.status(201).json_body(json!({ "_id": "new-id", "name": "Ann" }));
            })
            .await;
        let update = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/appdata/kid_app/Person/new-id")
                    .json_body(json!({ "_id": "new-id", "name": "Ann B" }));
                then.status(200).json_body(json!({ "_id": "new-id", "name": "Ann B" }));
            })
            .await;

        let transport = transport(&server);
        let created = transport
            .send(
                NetworkRequest::Save {
                    collection: "Person".into(),
                    entity: json!({ "name": "Ann" }),
                },
                &user_context(),
            )
            .await
            .unwrap();
        assert_eq!(created.body["_id"], json!("new-id"));
        transport
            .send(
                NetworkRequest::Save {
                    collection: "Person".into(),
                    entity: json!({ "_id": "new-id", "name": "Ann B" }),
                },
                &user_context(),
            )
            .await
            .unwrap();
        create.assert_async().await;
        update.assert_async().await;
    }

    #[tokio::test]
    async fn app_credentials_use_basic_auth() {
        let server = start_mock_server().await;
        let expected = format!("Basic {}", STANDARD.encode("kid_app:secret"));
        let mock = server
            .mock_async(move |when, then| {
                when.method(GET)
                    .path("/appdata/kid_app/Person/_count")
                    .header("Authorization", expected.as_str());
                then.status(200).json_body(json!({ "count": 2 }));
            })
            .await;

        let response = transport(&server)
            .send(
                NetworkRequest::Count {
                    collection: "Person".into(),
                    query: Default::default(),
                },
                &RequestContext::default(),
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(response.body, json!({ "count": 2 }));
    }

    #[tokio::test]
    async fn remove_by_query_sends_filter_as_delete() {
        let server = start_mock_server().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/appdata/kid_app/Person/")
                    .query_param("query", r#"{"age":{"$lt":18}}"#);
                then.status(200).json_body(json!({ "count": 3 }));
            })
            .await;

        let query = Query::new().filter(Predicate::lt("age", 18)).limit(1);
        let translated = translate(&query, &[] as &[FieldMapping]).unwrap();
        let response = transport(&server)
            .send(
                NetworkRequest::RemoveByQuery {
                    collection: "Person".into(),
                    query: translated.remote.unwindowed(),
                },
                &user_context(),
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(crate::network::parse_count(&response.body).unwrap(), 3);
    }

    #[tokio::test]
    async fn error_body_maps_to_code_and_reason() {
        let server = start_mock_server().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/appdata/kid_app/Person/_deltaset");
                then.status(400).json_body(json!({
                    "error": "ParameterValueOutOfRange",
                    "description": "The since parameter is too old",
                    "debug": ""
                }));
            })
            .await;

        let err = transport(&server)
            .send(
                NetworkRequest::DeltaSet {
                    collection: "Person".into(),
                    query: Default::default(),
                    since: "2020-01-01T00:00:00.000Z".into(),
                },
                &user_context(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, KinveyErrorCode::InvalidArgument);
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.reason(), Some("ParameterValueOutOfRange"));
    }

    #[tokio::test]
    async fn stream_publish_resolves_channel() {
        let server = start_mock_server().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/stream/kid_app/chat/user-2/publish");
                then.status(200)
                    .json_body(json!({ "substreamChannelName": "chat.u-user-2" }));
            })
            .await;
        let response = transport(&server)
            .send(
                NetworkRequest::StreamPublishChannel {
                    stream: "chat".into(),
                    user_id: "user-2".into(),
                },
                &user_context(),
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(response.body["substreamChannelName"], json!("chat.u-user-2"));
    }

    #[test]
    fn builder_rejects_invalid_base_url() {
        let err = HttpTransport::builder("kid_app", "secret")
            .with_base_url("not a url")
            .build()
            .unwrap_err();
        assert_eq!(err.code, KinveyErrorCode::InvalidArgument);
    }
}

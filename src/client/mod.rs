//! Client context shared by data stores, the realtime router and live streams.
//!
//! A [`Client`] bundles the app configuration with the three external seams:
//! the [`NetworkTransport`], the [`AuthProvider`] and an optional
//! [`PubSubClientFactory`]. It is cheap to clone and is passed explicitly to every
//! store and stream; there is no process-wide active client.
//!
//! ```no_run
//! use std::sync::Arc;
//! use kinvey_rs_sdk::client::{ActiveSession, Client, ClientOptions, SessionStore};
//!
//! # fn demo() -> kinvey_rs_sdk::error::KinveyResult<()> {
//! let sessions = Arc::new(SessionStore::signed_in(ActiveSession::new("user-1", "token")));
//! let client = Client::builder(ClientOptions {
//!     app_key: "kid_app".into(),
//!     app_secret: "secret".into(),
//!     ..Default::default()
//! })
//! .with_auth_provider(sessions)
//! .build()?;
//! # let _ = client;
//! # Ok(())
//! # }
//! ```

mod auth;

pub use auth::{ActiveSession, AuthProvider, SessionStore};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use crate::datastore::persistence::CachePersistence;
use crate::datastore::sync::CollectionContext;
use crate::datastore::MemoryCache;
use crate::error::{invalid_argument, not_registered, unauthenticated, KinveyResult};
use crate::logger::Logger;
use crate::network::http::{DEFAULT_BASE_URL, HttpTransport};
use crate::network::{NetworkRequest, NetworkResponse, NetworkTransport, RequestContext};
use crate::realtime::{PubSubClientFactory, RealtimeRegistration, RealtimeRouter};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@kinvey/client"));

/// Largest result set the backend returns for one request.
pub const DEFAULT_PAGE_SIZE: usize = 10_000;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientOptions {
    pub app_key: String,
    pub app_secret: String,
    pub base_url: String,
    pub default_page_size: usize,
    /// Whether pulls use delta sets unless a call says otherwise.
    pub delta_set: bool,
    pub request_timeout: Option<Duration>,
    pub device_id: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_secret: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_page_size: DEFAULT_PAGE_SIZE,
            delta_set: false,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            device_id: None,
        }
    }
}

/// Everything a network-facing component needs, shared behind an `Arc`.
pub(crate) struct ClientContext {
    pub(crate) options: ClientOptions,
    pub(crate) device_id: String,
    pub(crate) transport: Arc<dyn NetworkTransport>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) pubsub: Option<Arc<dyn PubSubClientFactory>>,
}

impl ClientContext {
    pub(crate) async fn request_context(&self) -> KinveyResult<RequestContext> {
        let session = self.auth.active_session().await?;
        Ok(RequestContext {
            user_id: session.as_ref().map(|session| session.user_id.clone()),
            auth_token: session.map(|session| session.auth_token),
            request_timeout: self.options.request_timeout,
        })
    }

    /// Like [`request_context`](Self::request_context) but fails without a signed-in user.
    pub(crate) async fn session_context(&self) -> KinveyResult<RequestContext> {
        let context = self.request_context().await?;
        if context.user_id.is_none() {
            return Err(unauthenticated("This operation requires an active user session"));
        }
        Ok(context)
    }

    pub(crate) async fn send(&self, request: NetworkRequest) -> KinveyResult<NetworkResponse> {
        let context = self.request_context().await?;
        self.transport.send(request, &context).await
    }
}

struct ClientInner {
    context: Arc<ClientContext>,
    persistence: Option<Arc<dyn CachePersistence>>,
    collections: Mutex<HashMap<String, Arc<CollectionContext>>>,
    realtime: Mutex<Option<Arc<RealtimeRouter>>>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("app_key", &self.inner.context.options.app_key)
            .field("device_id", &self.inner.context.device_id)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Client {
    pub fn builder(options: ClientOptions) -> ClientBuilder {
        ClientBuilder::new(options)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.context.options
    }

    pub fn device_id(&self) -> &str {
        &self.inner.context.device_id
    }

    pub async fn active_session(&self) -> KinveyResult<Option<ActiveSession>> {
        self.inner.context.auth.active_session().await
    }

    pub(crate) fn context(&self) -> &Arc<ClientContext> {
        &self.inner.context
    }

    /// Shared state of one collection: its cache plus pull/push exclusion.
    pub(crate) fn collection(&self, name: &str) -> Arc<CollectionContext> {
        let mut collections = lock(&self.inner.collections);
        if let Some(existing) = collections.get(name) {
            return Arc::clone(existing);
        }
        let cache = match &self.inner.persistence {
            Some(persistence) => MemoryCache::with_persistence(name, Arc::clone(persistence)),
            None => MemoryCache::new(name),
        };
        let collection = Arc::new(CollectionContext::new(name, Arc::new(cache)));
        collections.insert(name.to_owned(), Arc::clone(&collection));
        collection
    }

    /// Realtime router of the active user. A router left over from a previous
    /// user is torn down and replaced.
    pub async fn realtime(&self) -> KinveyResult<Arc<RealtimeRouter>> {
        let session = self
            .active_session()
            .await?
            .ok_or_else(|| unauthenticated("Realtime requires an active user session"))?;
        let mut slot = lock(&self.inner.realtime);
        match slot.as_ref() {
            Some(router) if router.user_id() == session.user_id => return Ok(Arc::clone(router)),
            Some(stale) => {
                LOGGER.debug(format!(
                    "active user changed from '{}' to '{}', dropping realtime registration",
                    stale.user_id(),
                    session.user_id
                ));
                stale.teardown();
            }
            None => {}
        }
        let router = Arc::new(RealtimeRouter::new(session.user_id, Arc::clone(&self.inner.context)));
        *slot = Some(Arc::clone(&router));
        Ok(router)
    }

    pub async fn register_realtime(&self) -> KinveyResult<RealtimeRegistration> {
        self.realtime().await?.register().await
    }

    pub async fn unregister_realtime(&self) -> KinveyResult<()> {
        self.registered_router()?.unregister().await
    }

    /// The current router if it holds a live registration.
    pub(crate) fn registered_router(&self) -> KinveyResult<Arc<RealtimeRouter>> {
        lock(&self.inner.realtime)
            .as_ref()
            .filter(|router| router.is_registered())
            .cloned()
            .ok_or_else(|| not_registered("The active user is not registered for realtime"))
    }

    /// Drops the realtime registration synchronously, then signs out.
    pub fn logout(&self) {
        if let Some(router) = lock(&self.inner.realtime).take() {
            router.teardown();
        }
        self.inner.context.auth.sign_out();
    }
}

pub struct ClientBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn NetworkTransport>>,
    auth: Option<Arc<dyn AuthProvider>>,
    pubsub: Option<Arc<dyn PubSubClientFactory>>,
    persistence: Option<Arc<dyn CachePersistence>>,
}

impl ClientBuilder {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            transport: None,
            auth: None,
            pubsub: None,
            persistence: None,
        }
    }

    /// Replaces the default HTTP transport.
    pub fn with_transport(mut self, transport: Arc<dyn NetworkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_auth_provider(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Required for realtime; without it registration fails.
    pub fn with_pubsub_factory(mut self, factory: Arc<dyn PubSubClientFactory>) -> Self {
        self.pubsub = Some(factory);
        self
    }

    pub fn with_cache_persistence(mut self, persistence: Arc<dyn CachePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> KinveyResult<Client> {
        let options = self.options;
        if options.app_key.is_empty() {
            return Err(invalid_argument("ClientOptions.app_key must not be empty"));
        }
        if options.default_page_size == 0 {
            return Err(invalid_argument("ClientOptions.default_page_size must be positive"));
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let mut builder = HttpTransport::builder(&options.app_key, &options.app_secret);
                if options.base_url != DEFAULT_BASE_URL {
                    builder = builder.with_base_url(&options.base_url);
                }
                if let Some(timeout) = options.request_timeout {
                    builder = builder.with_request_timeout(timeout);
                }
                Arc::new(builder.build()?) as Arc<dyn NetworkTransport>
            }
        };
        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(SessionStore::new()) as Arc<dyn AuthProvider>);
        let device_id = options
            .device_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Client {
            inner: Arc::new(ClientInner {
                context: Arc::new(ClientContext {
                    options,
                    device_id,
                    transport,
                    auth,
                    pubsub: self.pubsub,
                }),
                persistence: self.persistence,
                collections: Mutex::new(HashMap::new()),
                realtime: Mutex::new(None),
            }),
        })
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

use serde_json::Value;

use crate::client::ClientContext;
use crate::error::{internal_error, not_registered, unauthenticated, KinveyError, KinveyResult};
use crate::logger::Logger;
use crate::network::{NetworkRequest, NetworkResponse, RequestContext};
use crate::platform::runtime;
use crate::realtime::pubsub::{PubSubClient, PubSubClientFactory, PubSubListener};
use crate::realtime::{RealtimeRegistration, RealtimeStatus};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@kinvey/realtime"));

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RealtimeState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Unregistering,
}

struct ChannelListener {
    id: u64,
    listener: Arc<dyn PubSubListener>,
}

#[derive(Default)]
struct ChannelTable {
    listeners: Mutex<HashMap<String, Vec<ChannelListener>>>,
    next_id: AtomicU64,
}

impl ChannelTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ChannelListener>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, channel: &str, listener: Arc<dyn PubSubListener>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock()
            .entry(channel.to_owned())
            .or_default()
            .push(ChannelListener { id, listener });
        id
    }

    /// Removes one listener; true when it was the last one on `channel`.
    fn remove(&self, channel: &str, id: u64) -> bool {
        let mut listeners = self.lock();
        let Some(entries) = listeners.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let emptied = entries.is_empty();
        if emptied {
            listeners.remove(channel);
        }
        emptied && before > 0
    }

    fn remove_channel(&self, channel: &str) {
        self.lock().remove(channel);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn for_channel(&self, channel: &str) -> Vec<Arc<dyn PubSubListener>> {
        self.lock()
            .get(channel)
            .map(|entries| entries.iter().map(|entry| Arc::clone(&entry.listener)).collect())
            .unwrap_or_default()
    }

    fn all(&self) -> Vec<Arc<dyn PubSubListener>> {
        self.lock()
            .values()
            .flatten()
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }

    fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

/// Single listener handed to the pub/sub client; routes by channel name.
struct Dispatcher {
    channels: Arc<ChannelTable>,
}

impl PubSubListener for Dispatcher {
    fn on_message(&self, channel: &str, message: &Value) {
        for listener in self.channels.for_channel(channel) {
            listener.on_message(channel, message);
        }
    }

    fn on_status(&self, status: RealtimeStatus) {
        LOGGER.debug(format!("pub/sub status changed to {status:?}"));
        for listener in self.channels.all() {
            listener.on_status(status);
        }
    }

    fn on_error(&self, channels: &[String], error: &KinveyError) {
        LOGGER.warn(format!("pub/sub error on {channels:?}: {error}"));
        let listeners = if channels.is_empty() {
            self.channels.all()
        } else {
            channels
                .iter()
                .flat_map(|channel| self.channels.for_channel(channel))
                .collect()
        };
        for listener in listeners {
            listener.on_error(channels, error);
        }
    }
}

#[derive(Default)]
struct RouterState {
    state: RealtimeState,
    registration: Option<RealtimeRegistration>,
    client: Option<Arc<dyn PubSubClient>>,
    request_context: Option<RequestContext>,
}

/// Realtime registration of one user: exactly one pub/sub client subscribed to the
/// user's channel group, dispatching messages to per-channel listeners.
///
/// Obtained from [`Client::realtime`](crate::client::Client::realtime). State
/// transitions are serialized, so concurrent `register` calls share one
/// registration.
pub struct RealtimeRouter {
    user_id: String,
    context: Arc<ClientContext>,
    state: Mutex<RouterState>,
    transitions: async_lock::Mutex<()>,
    /// Bumped by every teardown; a registration started in an older generation is
    /// rolled back when it completes.
    generation: AtomicU64,
    channels: Arc<ChannelTable>,
}

impl RealtimeRouter {
    pub(crate) fn new(user_id: impl Into<String>, context: Arc<ClientContext>) -> Self {
        Self {
            user_id: user_id.into(),
            context,
            state: Mutex::new(RouterState::default()),
            transitions: async_lock::Mutex::new(()),
            generation: AtomicU64::new(0),
            channels: Arc::new(ChannelTable::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> RealtimeState {
        self.lock().state
    }

    pub fn is_registered(&self) -> bool {
        self.state() == RealtimeState::Registered
    }

    pub fn registration(&self) -> Option<RealtimeRegistration> {
        self.lock().registration.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.channels.len()
    }

    /// Registers the user with the backend and subscribes to its channel group.
    /// Calling it again while registered returns the existing registration.
    ///
    /// A [`teardown`](Self::teardown) that lands while this is in flight wins: the
    /// new registration is rolled back and `NotRegistered` is returned.
    pub async fn register(&self) -> KinveyResult<RealtimeRegistration> {
        let _transition = self.transitions.lock().await;
        let generation = {
            let mut state = self.lock();
            if let (RealtimeState::Registered, Some(registration)) = (state.state, &state.registration) {
                return Ok(registration.clone());
            }
            state.state = RealtimeState::Registering;
            self.generation.load(Ordering::SeqCst)
        };

        let established = self.establish().await;
        let mut state = self.lock();
        let torn_down = self.generation.load(Ordering::SeqCst) != generation;
        match established {
            Ok((registration, client, request_context)) if !torn_down => {
                state.state = RealtimeState::Registered;
                state.registration = Some(registration.clone());
                state.client = Some(client);
                state.request_context = Some(request_context);
                LOGGER.debug(format!("user '{}' registered for realtime", self.user_id));
                Ok(registration)
            }
            Ok((_, client, request_context)) => {
                drop(state);
                LOGGER.debug(format!(
                    "realtime registration of '{}' finished after teardown, rolling back",
                    self.user_id
                ));
                client.unsubscribe_all();
                self.spawn_unregister(request_context);
                Err(not_registered(format!(
                    "Realtime registration of '{}' was torn down while registering",
                    self.user_id
                )))
            }
            Err(err) => {
                if !torn_down {
                    state.state = RealtimeState::Unregistered;
                }
                Err(err)
            }
        }
    }

    async fn establish(&self) -> KinveyResult<(RealtimeRegistration, Arc<dyn PubSubClient>, RequestContext)> {
        let factory = self
            .context
            .pubsub
            .clone()
            .ok_or_else(|| internal_error("No pub/sub client factory is configured"))?;
        let request_context = self.request_context().await?;
        let response = self
            .context
            .transport
            .send(
                NetworkRequest::RegisterRealtime {
                    user_id: self.user_id.clone(),
                    device_id: self.context.device_id.clone(),
                },
                &request_context,
            )
            .await?;
        match self.connect(factory.as_ref(), response.body).await {
            Ok((registration, client)) => Ok((registration, client, request_context)),
            Err(err) => {
                LOGGER.warn(format!(
                    "realtime setup of '{}' failed after the backend registered it: {err}",
                    self.user_id
                ));
                self.spawn_unregister(request_context);
                Err(err)
            }
        }
    }

    async fn connect(
        &self,
        factory: &dyn PubSubClientFactory,
        body: Value,
    ) -> KinveyResult<(RealtimeRegistration, Arc<dyn PubSubClient>)> {
        let registration: RealtimeRegistration = serde_json::from_value(body)
            .map_err(|err| internal_error(format!("Malformed realtime registration: {err}")))?;
        let client = factory.create_client(&self.user_id, &registration)?;
        let dispatcher = Arc::new(Dispatcher {
            channels: Arc::clone(&self.channels),
        });
        if let Err(err) = client
            .subscribe(&registration.user_channel_group, dispatcher)
            .await
        {
            client.unsubscribe_all();
            return Err(err);
        }
        Ok((registration, client))
    }

    /// Unregisters from the backend, then unsubscribes. If the backend call fails the
    /// router stays registered.
    pub async fn unregister(&self) -> KinveyResult<()> {
        let _transition = self.transitions.lock().await;
        {
            let mut state = self.lock();
            if state.state != RealtimeState::Registered {
                return Err(not_registered("The active user is not registered for realtime"));
            }
            state.state = RealtimeState::Unregistering;
        }

        let notified = match self.request_context().await {
            Ok(request_context) => {
                self.context
                    .transport
                    .send(
                        NetworkRequest::UnregisterRealtime {
                            user_id: self.user_id.clone(),
                            device_id: self.context.device_id.clone(),
                        },
                        &request_context,
                    )
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = notified {
            LOGGER.warn(format!("realtime unregister failed, staying registered: {err}"));
            self.lock().state = RealtimeState::Registered;
            return Err(err);
        }

        let client = {
            let mut state = self.lock();
            let client = state.client.take();
            *state = RouterState::default();
            client
        };
        if let Some(client) = client {
            client.unsubscribe_all();
        }
        self.channels.clear();
        Ok(())
    }

    /// Drops the registration immediately, as on logout. The backend is notified in
    /// the background on a best-effort basis.
    pub fn teardown(&self) {
        let previous = {
            let mut state = self.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut *state)
        };
        if let Some(client) = previous.client {
            client.unsubscribe_all();
        }
        self.channels.clear();
        if previous.state != RealtimeState::Registered {
            return;
        }
        if let Some(request_context) = previous.request_context {
            self.spawn_unregister(request_context);
        }
    }

    /// Best-effort backend unregister that nobody waits for.
    fn spawn_unregister(&self, request_context: RequestContext) {
        let transport = Arc::clone(&self.context.transport);
        let request = NetworkRequest::UnregisterRealtime {
            user_id: self.user_id.clone(),
            device_id: self.context.device_id.clone(),
        };
        let user_id = self.user_id.clone();
        drop(runtime::spawn(async move {
            if let Err(err) = transport.send(request, &request_context).await {
                LOGGER.debug(format!("background unregister of '{user_id}' failed: {err}"));
            }
        }));
    }

    /// Routes messages published on `channel` to `listener` until the returned
    /// handle is dropped or cancelled.
    pub fn subscribe_channel(
        &self,
        channel: &str,
        listener: Arc<dyn PubSubListener>,
    ) -> KinveyResult<ChannelSubscription> {
        if !self.is_registered() {
            return Err(not_registered("Register for realtime before subscribing"));
        }
        let id = self.channels.add(channel, listener);
        Ok(ChannelSubscription {
            channels: Arc::downgrade(&self.channels),
            channel: channel.to_owned(),
            id: Some(id),
        })
    }

    pub(crate) fn remove_channel(&self, channel: &str) {
        self.channels.remove_channel(channel);
    }

    pub async fn publish(&self, channel: &str, message: Value) -> KinveyResult<()> {
        let client = {
            let state = self.lock();
            match (&state.state, &state.client) {
                (RealtimeState::Registered, Some(client)) => Arc::clone(client),
                _ => return Err(not_registered("Register for realtime before publishing")),
            }
        };
        client.publish(channel, message).await
    }

    /// Sends `request` with the credentials of this router's user.
    pub(crate) async fn send_as_user(&self, request: NetworkRequest) -> KinveyResult<NetworkResponse> {
        let request_context = self.request_context().await?;
        self.context.transport.send(request, &request_context).await
    }

    /// Request credentials of the active session, which must belong to this router's user.
    pub(crate) async fn request_context(&self) -> KinveyResult<RequestContext> {
        let request_context = self.context.request_context().await?;
        if request_context.user_id.as_deref() != Some(self.user_id.as_str()) {
            return Err(unauthenticated(format!(
                "User '{}' is no longer the active user",
                self.user_id
            )));
        }
        Ok(request_context)
    }
}

/// Handle of a channel listener; dropping it stops delivery to that listener.
pub struct ChannelSubscription {
    channels: Weak<ChannelTable>,
    channel: String,
    id: Option<u64>,
}

impl ChannelSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn cancel(mut self) {
        self.release();
    }

    /// Detaches the listener; true when it was the last one on its channel.
    pub(crate) fn release(&mut self) -> bool {
        match (self.id.take(), self.channels.upgrade()) {
            (Some(id), Some(channels)) => channels.remove(&self.channel, id),
            _ => false,
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{from_http_status, KinveyErrorCode};
    use crate::network::RequestKind;
    use crate::test_support::{harness, realtime_client, user_session, Recorder};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_registration_creates_one_client() {
        let (client, backend, hub) = realtime_client("user-1");
        let router = client.realtime().await.unwrap();

        let (first, second) = futures::join!(router.register(), router.register());
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(hub.clients_created(), 1);
        assert_eq!(backend.request_count(RequestKind::RegisterRealtime), 1);
        assert_eq!(router.state(), RealtimeState::Registered);
    }

    #[tokio::test]
    async fn messages_fan_out_by_channel() {
        let (client, _backend, hub) = realtime_client("user-1");
        let router = client.realtime().await.unwrap();
        let registration = router.register().await.unwrap();
        hub.add_channel_to_group(&registration.user_channel_group, "a");
        hub.add_channel_to_group(&registration.user_channel_group, "b");

        let on_a = Arc::new(Recorder::default());
        let on_b = Arc::new(Recorder::default());
        let _a = router.subscribe_channel("a", on_a.clone()).unwrap();
        let b = router.subscribe_channel("b", on_b.clone()).unwrap();

        hub.publish("a", &json!(1));
        hub.publish("b", &json!(2));
        b.cancel();
        hub.publish("b", &json!(3));
        hub.broadcast_status(RealtimeStatus::Reconnected);

        assert_eq!(on_a.messages(), vec![json!(1)]);
        assert_eq!(on_b.messages(), vec![json!(2)]);
        assert_eq!(on_a.statuses(), vec![RealtimeStatus::Reconnected]);
        assert!(on_b.statuses().is_empty());
    }

    #[tokio::test]
    async fn release_reports_last_listener() {
        let (client, _backend, _hub) = realtime_client("user-1");
        let router = client.realtime().await.unwrap();
        router.register().await.unwrap();
        let mut first = router.subscribe_channel("a", Arc::new(Recorder::default())).unwrap();
        let mut second = router.subscribe_channel("a", Arc::new(Recorder::default())).unwrap();

        assert!(!first.release());
        assert!(!first.release());
        assert!(second.release());
        assert_eq!(router.listener_count(), 0);

        let mut removed = router.subscribe_channel("b", Arc::new(Recorder::default())).unwrap();
        router.remove_channel("b");
        assert!(!removed.release());
    }

    #[tokio::test]
    async fn errors_go_to_named_channels_or_everyone() {
        let (client, _backend, hub) = realtime_client("user-1");
        let router = client.realtime().await.unwrap();
        router.register().await.unwrap();
        let on_a = Arc::new(Recorder::default());
        let on_b = Arc::new(Recorder::default());
        let _a = router.subscribe_channel("a", on_a.clone()).unwrap();
        let _b = router.subscribe_channel("b", on_b.clone()).unwrap();

        hub.broadcast_error(&["a".to_string()], &from_http_status(403, None, None));
        hub.broadcast_error(&[], &from_http_status(500, None, None));

        assert_eq!(on_a.errors().len(), 2);
        assert_eq!(on_b.errors().len(), 1);
        assert_eq!(on_b.errors()[0].status(), Some(500));
    }

    #[tokio::test]
    async fn failed_unregister_keeps_registration() {
        let (client, backend, hub) = realtime_client("user-1");
        let router = client.realtime().await.unwrap();
        router.register().await.unwrap();

        backend.fail_next(RequestKind::UnregisterRealtime, from_http_status(503, None, None));
        let err = router.unregister().await.unwrap_err();
        assert_eq!(err.code, KinveyErrorCode::Network);
        assert!(router.is_registered());
        assert_eq!(hub.active_subscriptions(), 1);

        router.unregister().await.unwrap();
        assert_eq!(router.state(), RealtimeState::Unregistered);
        assert_eq!(hub.active_subscriptions(), 0);
        assert!(!backend.is_registered("user-1"));
    }

    #[tokio::test]
    async fn unregister_without_registration_fails() {
        let (client, _backend, _hub) = realtime_client("user-1");
        let router = client.realtime().await.unwrap();
        let err = router.unregister().await.unwrap_err();
        assert_eq!(err.code, KinveyErrorCode::NotRegistered);
        assert!(router.subscribe_channel("a", Arc::new(Recorder::default())).is_err());
    }

    #[tokio::test]
    async fn registration_requires_matching_session() {
        let harness = harness("user-1");
        let router = harness.client.realtime().await.unwrap();
        harness.sessions.set_session(user_session("user-2"));
        let err = router.register().await.unwrap_err();
        assert_eq!(err.code, KinveyErrorCode::Unauthenticated);
        assert_eq!(router.state(), RealtimeState::Unregistered);
        assert_eq!(harness.hub.clients_created(), 0);
    }

    #[tokio::test]
    async fn logout_during_registration_rolls_it_back() {
        let harness = harness("user-1");
        harness.backend.set_latency(Duration::from_millis(50));
        let router = harness.client.realtime().await.unwrap();
        let registering = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.register().await })
        };

        tokio::time::sleep(Duration::from_millis(15)).await;
        harness.client.logout();
        let err = registering.await.unwrap().unwrap_err();

        assert_eq!(err.code, KinveyErrorCode::NotRegistered);
        assert_eq!(router.state(), RealtimeState::Unregistered);
        assert_eq!(harness.hub.active_subscriptions(), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(harness.backend.request_count(RequestKind::UnregisterRealtime), 1);
        assert!(!harness.backend.is_registered("user-1"));
    }

    #[tokio::test]
    async fn failed_subscribe_unregisters_from_backend() {
        let (client, backend, hub) = realtime_client("user-1");
        let router = client.realtime().await.unwrap();
        hub.fail_next_subscribe();

        let err = router.register().await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(router.state(), RealtimeState::Unregistered);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!backend.is_registered("user-1"));
        assert_eq!(hub.active_subscriptions(), 0);

        router.register().await.unwrap();
        assert!(backend.is_registered("user-1"));
        assert_eq!(hub.active_subscriptions(), 1);
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{from_http_status, permission_denied, KinveyError, KinveyResult};
use crate::realtime::{RealtimeRegistration, RealtimeStatus};

/// Receives everything a pub/sub client observes on its channel group.
pub trait PubSubListener: Send + Sync {
    fn on_message(&self, channel: &str, message: &Value);

    fn on_status(&self, _status: RealtimeStatus) {}

    fn on_error(&self, _channels: &[String], _error: &KinveyError) {}
}

/// Connection to the pub/sub service used for realtime delivery.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Subscribes to every channel of `channel_group`.
    async fn subscribe(&self, channel_group: &str, listener: Arc<dyn PubSubListener>) -> KinveyResult<()>;

    async fn publish(&self, channel: &str, message: Value) -> KinveyResult<()>;

    fn unsubscribe_all(&self);
}

/// Builds the pub/sub client of a registered user.
pub trait PubSubClientFactory: Send + Sync {
    fn create_client(
        &self,
        user_id: &str,
        registration: &RealtimeRegistration,
    ) -> KinveyResult<Arc<dyn PubSubClient>>;
}

struct HubSubscription {
    client_id: u64,
    group: String,
    listener: Arc<dyn PubSubListener>,
}

#[derive(Default)]
struct HubState {
    groups: HashMap<String, BTreeSet<String>>,
    subscriptions: Vec<HubSubscription>,
    next_client_id: u64,
    clients_created: usize,
    publish_denials: HashMap<String, usize>,
    subscribe_failures: usize,
}

/// Process-local pub/sub service: channel groups, subscribers and message fan-out.
///
/// Messages are delivered synchronously on the publishing task, in publish order.
#[derive(Clone, Default)]
pub struct InMemoryPubSubHub {
    inner: Arc<Mutex<HubState>>,
}

impl InMemoryPubSubHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_channel_to_group(&self, group: &str, channel: &str) {
        self.lock()
            .groups
            .entry(group.to_owned())
            .or_default()
            .insert(channel.to_owned());
    }

    pub fn remove_channel_from_group(&self, group: &str, channel: &str) {
        if let Some(channels) = self.lock().groups.get_mut(group) {
            channels.remove(channel);
        }
    }

    pub fn channels_in_group(&self, group: &str) -> Vec<String> {
        self.lock()
            .groups
            .get(group)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivers `message` to subscribers whose group contains `channel` and returns
    /// how many listeners received it.
    pub fn publish(&self, channel: &str, message: &Value) -> usize {
        let listeners: Vec<Arc<dyn PubSubListener>> = {
            let state = self.lock();
            state
                .subscriptions
                .iter()
                .filter(|subscription| {
                    state
                        .groups
                        .get(&subscription.group)
                        .is_some_and(|channels| channels.contains(channel))
                })
                .map(|subscription| Arc::clone(&subscription.listener))
                .collect()
        };
        for listener in &listeners {
            listener.on_message(channel, message);
        }
        listeners.len()
    }

    pub fn broadcast_status(&self, status: RealtimeStatus) {
        for listener in self.listeners() {
            listener.on_status(status);
        }
    }

    pub fn broadcast_error(&self, channels: &[String], error: &KinveyError) {
        for listener in self.listeners() {
            listener.on_error(channels, error);
        }
    }

    /// Rejects the next `times` publishes to `channel` with a permission error.
    pub fn deny_publish(&self, channel: &str, times: usize) {
        self.lock().publish_denials.insert(channel.to_owned(), times);
    }

    /// Makes the next subscribe call of any client fail.
    pub fn fail_next_subscribe(&self) {
        self.lock().subscribe_failures += 1;
    }

    pub fn clients_created(&self) -> usize {
        self.lock().clients_created
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    fn listeners(&self) -> Vec<Arc<dyn PubSubListener>> {
        self.lock()
            .subscriptions
            .iter()
            .map(|subscription| Arc::clone(&subscription.listener))
            .collect()
    }

    fn take_denial(&self, channel: &str) -> bool {
        let mut state = self.lock();
        match state.publish_denials.get_mut(channel) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl PubSubClientFactory for InMemoryPubSubHub {
    fn create_client(
        &self,
        _user_id: &str,
        _registration: &RealtimeRegistration,
    ) -> KinveyResult<Arc<dyn PubSubClient>> {
        let id = {
            let mut state = self.lock();
            state.clients_created += 1;
            state.next_client_id += 1;
            state.next_client_id
        };
        Ok(Arc::new(InMemoryPubSubClient {
            hub: self.clone(),
            id,
        }))
    }
}

pub struct InMemoryPubSubClient {
    hub: InMemoryPubSubHub,
    id: u64,
}

#[async_trait]
impl PubSubClient for InMemoryPubSubClient {
    async fn subscribe(&self, channel_group: &str, listener: Arc<dyn PubSubListener>) -> KinveyResult<()> {
        let mut state = self.hub.lock();
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(from_http_status(
                503,
                None,
                Some(format!("Subscribing to '{channel_group}' failed")),
            ));
        }
        state.subscriptions.push(HubSubscription {
            client_id: self.id,
            group: channel_group.to_owned(),
            listener,
        });
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Value) -> KinveyResult<()> {
        if self.hub.take_denial(channel) {
            return Err(permission_denied(format!("Publishing to '{channel}' is forbidden")).with_status(403));
        }
        self.hub.publish(channel, &message);
        Ok(())
    }

    fn unsubscribe_all(&self) {
        self.hub
            .lock()
            .subscriptions
            .retain(|subscription| subscription.client_id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, Value)>>,
    }

    impl PubSubListener for Recorder {
        fn on_message(&self, channel: &str, message: &Value) {
            self.messages
                .lock()
                .unwrap()
                .push((channel.to_owned(), message.clone()));
        }
    }

    fn registration() -> RealtimeRegistration {
        RealtimeRegistration {
            subscribe_key: "sub".into(),
            publish_key: "pub".into(),
            user_channel_group: "user-1.ucg".into(),
        }
    }

    #[tokio::test]
    async fn messages_reach_group_members_only() {
        let hub = InMemoryPubSubHub::new();
        let client = hub.create_client("user-1", &registration()).unwrap();
        let recorder = Arc::new(Recorder::default());
        client.subscribe("user-1.ucg", recorder.clone()).await.unwrap();

        hub.add_channel_to_group("user-1.ucg", "kid.c-Person");
        client.publish("kid.c-Person", json!({"n": 1})).await.unwrap();
        client.publish("kid.c-Other", json!({"n": 2})).await.unwrap();

        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "kid.c-Person");
    }

    #[tokio::test]
    async fn denial_is_consumed() {
        let hub = InMemoryPubSubHub::new();
        let client = hub.create_client("user-1", &registration()).unwrap();
        hub.deny_publish("chat.u-user-2", 1);
        assert!(client.publish("chat.u-user-2", json!(1)).await.is_err());
        assert!(client.publish("chat.u-user-2", json!(1)).await.is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_all_only_affects_one_client() {
        let hub = InMemoryPubSubHub::new();
        let first = hub.create_client("user-1", &registration()).unwrap();
        let second = hub.create_client("user-2", &registration()).unwrap();
        first.subscribe("g", Arc::new(Recorder::default())).await.unwrap();
        second.subscribe("g", Arc::new(Recorder::default())).await.unwrap();
        first.unsubscribe_all();
        assert_eq!(hub.active_subscriptions(), 1);
        assert_eq!(hub.clients_created(), 2);
    }
}

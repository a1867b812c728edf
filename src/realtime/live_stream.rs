use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::Client;
use crate::error::{internal_error, invalid_argument, KinveyError, KinveyErrorCode, KinveyResult};
use crate::logger::Logger;
use crate::network::NetworkRequest;
use crate::platform::runtime;
use crate::realtime::pubsub::PubSubListener;
use crate::realtime::router::{ChannelSubscription, RealtimeRouter};
use crate::realtime::RealtimeStatus;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@kinvey/live-stream"));

const CHANNEL_NAME_KEY: &str = "substreamChannelName";

/// Who may follow or publish to one user's sub-stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStreamAcl {
    #[serde(rename = "subscribe", default)]
    pub subscribers: Vec<String>,
    #[serde(rename = "publish", default)]
    pub publishers: Vec<String>,
    #[serde(default)]
    pub groups: LiveStreamAclGroups,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStreamAclGroups {
    #[serde(rename = "subscribe", default)]
    pub subscribers: Vec<String>,
    #[serde(rename = "publish", default)]
    pub publishers: Vec<String>,
}

impl LiveStreamAcl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber(mut self, user_id: impl Into<String>) -> Self {
        self.subscribers.push(user_id.into());
        self
    }

    pub fn publisher(mut self, user_id: impl Into<String>) -> Self {
        self.publishers.push(user_id.into());
        self
    }

    pub fn subscriber_group(mut self, group_id: impl Into<String>) -> Self {
        self.groups.subscribers.push(group_id.into());
        self
    }

    pub fn publisher_group(mut self, group_id: impl Into<String>) -> Self {
        self.groups.publishers.push(group_id.into());
        self
    }
}

type Channels = Arc<Mutex<HashMap<String, String>>>;

fn lock_channels(channels: &Channels) -> MutexGuard<'_, HashMap<String, String>> {
    channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A named stream of `T` messages split into one sub-stream per user.
///
/// Sending to a user requires publish access on that user's sub-stream; following
/// requires subscribe access. Both require the active user to be registered for
/// realtime.
pub struct LiveStream<T> {
    name: String,
    client: Client,
    publish_channels: Channels,
    followed_channels: Channels,
    _message: PhantomData<fn() -> T>,
}

impl<T> Clone for LiveStream<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            client: self.client.clone(),
            publish_channels: Arc::clone(&self.publish_channels),
            followed_channels: Arc::clone(&self.followed_channels),
            _message: PhantomData,
        }
    }
}

impl<T> LiveStream<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(client: &Client, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: client.clone(),
            publish_channels: Arc::default(),
            followed_channels: Arc::default(),
            _message: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grants the users in `acl` access to `user_id`'s sub-stream. Grants merge with
    /// existing ones.
    pub async fn grant_stream_access(&self, user_id: &str, acl: &LiveStreamAcl) -> KinveyResult<()> {
        ensure_user_id(user_id)?;
        let context = self.client.context();
        let request_context = context.request_context().await?;
        context
            .transport
            .send(
                NetworkRequest::StreamGrantAccess {
                    stream: self.name.clone(),
                    user_id: user_id.to_owned(),
                    acl: serde_json::to_value(acl)?,
                },
                &request_context,
            )
            .await?;
        self.forget_publish_channel(user_id);
        Ok(())
    }

    /// Publishes `message` to `user_id`'s sub-stream.
    pub async fn send(&self, user_id: &str, message: &T) -> KinveyResult<()> {
        ensure_user_id(user_id)?;
        let router = self.client.registered_router()?;
        let payload = serde_json::to_value(message)?;
        let channel = self.publish_channel(&router, user_id).await?;
        match router.publish(&channel, payload.clone()).await {
            Err(err) if err.code == KinveyErrorCode::PermissionDenied => {
                LOGGER.debug(format!(
                    "publish to '{channel}' was rejected, requesting a fresh channel: {err}"
                ));
                self.forget_publish_channel(user_id);
                let channel = self.publish_channel(&router, user_id).await?;
                router.publish(&channel, payload).await
            }
            other => other,
        }
    }

    /// Publishes `message` to the active user's own sub-stream.
    pub async fn post(&self, message: &T) -> KinveyResult<()> {
        let router = self.client.registered_router()?;
        self.send(router.user_id(), message).await
    }

    /// Starts delivering messages published to `user_id`'s sub-stream.
    ///
    /// Messages that do not decode as `T` are logged and dropped.
    pub async fn follow<N, S, E>(
        &self,
        user_id: &str,
        on_next: N,
        on_status: S,
        on_error: E,
    ) -> KinveyResult<LiveStreamSubscription>
    where
        N: Fn(T) + Send + Sync + 'static,
        S: Fn(RealtimeStatus) + Send + Sync + 'static,
        E: Fn(&KinveyError) + Send + Sync + 'static,
    {
        ensure_user_id(user_id)?;
        let router = self.client.registered_router()?;
        let response = router
            .send_as_user(NetworkRequest::StreamSubscribe {
                stream: self.name.clone(),
                user_id: user_id.to_owned(),
                device_id: self.client.device_id().to_owned(),
            })
            .await?;
        let channel = channel_name(&response.body)?;
        let listener = Arc::new(StreamListener::<T> {
            on_next: Box::new(on_next),
            on_status: Box::new(on_status),
            on_error: Box::new(on_error),
        });
        let subscription = router.subscribe_channel(&channel, listener)?;
        lock_channels(&self.followed_channels).insert(user_id.to_owned(), channel);
        Ok(LiveStreamSubscription {
            user_id: user_id.to_owned(),
            inner: subscription,
            router: Arc::downgrade(&router),
            stream: self.name.clone(),
            device_id: self.client.device_id().to_owned(),
            followed_channels: Arc::clone(&self.followed_channels),
        })
    }

    pub async fn listen<N, S, E>(&self, on_next: N, on_status: S, on_error: E) -> KinveyResult<LiveStreamSubscription>
    where
        N: Fn(T) + Send + Sync + 'static,
        S: Fn(RealtimeStatus) + Send + Sync + 'static,
        E: Fn(&KinveyError) + Send + Sync + 'static,
    {
        let router = self.client.registered_router()?;
        self.follow(router.user_id(), on_next, on_status, on_error).await
    }

    /// Stops following `user_id` and drops every listener of that sub-stream.
    pub async fn unfollow(&self, user_id: &str) -> KinveyResult<()> {
        ensure_user_id(user_id)?;
        let router = self.client.registered_router()?;
        router
            .send_as_user(NetworkRequest::StreamUnsubscribe {
                stream: self.name.clone(),
                user_id: user_id.to_owned(),
                device_id: self.client.device_id().to_owned(),
            })
            .await?;
        if let Some(channel) = lock_channels(&self.followed_channels).remove(user_id) {
            router.remove_channel(&channel);
        }
        Ok(())
    }

    pub async fn stop_listening(&self) -> KinveyResult<()> {
        let router = self.client.registered_router()?;
        self.unfollow(router.user_id()).await
    }

    async fn publish_channel(&self, router: &RealtimeRouter, user_id: &str) -> KinveyResult<String> {
        if let Some(channel) = lock_channels(&self.publish_channels).get(user_id) {
            return Ok(channel.clone());
        }
        let response = router
            .send_as_user(NetworkRequest::StreamPublishChannel {
                stream: self.name.clone(),
                user_id: user_id.to_owned(),
            })
            .await?;
        let channel = channel_name(&response.body)?;
        lock_channels(&self.publish_channels).insert(user_id.to_owned(), channel.clone());
        Ok(channel)
    }

    fn forget_publish_channel(&self, user_id: &str) {
        lock_channels(&self.publish_channels).remove(user_id);
    }
}

fn ensure_user_id(user_id: &str) -> KinveyResult<()> {
    if user_id.is_empty() {
        return Err(invalid_argument("A user id is required"));
    }
    Ok(())
}

fn channel_name(body: &Value) -> KinveyResult<String> {
    body.get(CHANNEL_NAME_KEY)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| internal_error(format!("Response is missing '{CHANNEL_NAME_KEY}'")))
}

struct StreamListener<T> {
    on_next: Box<dyn Fn(T) + Send + Sync>,
    on_status: Box<dyn Fn(RealtimeStatus) + Send + Sync>,
    on_error: Box<dyn Fn(&KinveyError) + Send + Sync>,
}

impl<T> PubSubListener for StreamListener<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn on_message(&self, channel: &str, message: &Value) {
        match T::deserialize(message) {
            Ok(decoded) => (self.on_next)(decoded),
            Err(err) => LOGGER.warn(format!("dropping undecodable message on '{channel}': {err}")),
        }
    }

    fn on_status(&self, status: RealtimeStatus) {
        (self.on_status)(status);
    }

    fn on_error(&self, _channels: &[String], error: &KinveyError) {
        (self.on_error)(error);
    }
}

/// Handle returned by [`LiveStream::follow`]; dropping it stops local delivery.
///
/// When the last handle of a sub-stream goes, the backend subscription is dropped
/// too, in the background.
pub struct LiveStreamSubscription {
    user_id: String,
    inner: ChannelSubscription,
    router: Weak<RealtimeRouter>,
    stream: String,
    device_id: String,
    followed_channels: Channels,
}

impl std::fmt::Debug for LiveStreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStreamSubscription")
            .field("user_id", &self.user_id)
            .field("stream", &self.stream)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl LiveStreamSubscription {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn channel(&self) -> &str {
        self.inner.channel()
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for LiveStreamSubscription {
    fn drop(&mut self) {
        if !self.inner.release() {
            return;
        }
        {
            let mut followed = lock_channels(&self.followed_channels);
            if followed.get(&self.user_id).map(String::as_str) == Some(self.inner.channel()) {
                followed.remove(&self.user_id);
            }
        }
        let Some(router) = self.router.upgrade() else {
            return;
        };
        let request = NetworkRequest::StreamUnsubscribe {
            stream: self.stream.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
        };
        let channel = self.inner.channel().to_owned();
        drop(runtime::spawn(async move {
            if let Err(err) = router.send_as_user(request).await {
                LOGGER.debug(format!("background unsubscribe from '{channel}' failed: {err}"));
            }
        }));
    }
}

//! Realtime delivery: one pub/sub registration per active user, fanned out to
//! channel listeners, plus user-to-user [`LiveStream`]s built on top of it.
//!
//! ```no_run
//! use kinvey_rs_sdk::client::Client;
//! use kinvey_rs_sdk::realtime::{LiveStream, LiveStreamAcl};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Chat {
//!     text: String,
//! }
//!
//! # async fn demo(client: Client) -> kinvey_rs_sdk::error::KinveyResult<()> {
//! client.register_realtime().await?;
//! let stream: LiveStream<Chat> = LiveStream::new(&client, "chat");
//! stream
//!     .grant_stream_access("user-1", &LiveStreamAcl::new().subscriber("user-1").publisher("user-2"))
//!     .await?;
//! let _subscription = stream
//!     .listen(|chat: Chat| println!("{}", chat.text), |_| {}, |_| {})
//!     .await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod live_stream;
pub mod pubsub;
pub mod router;

pub use live_stream::{LiveStream, LiveStreamAcl, LiveStreamAclGroups, LiveStreamSubscription};
pub use pubsub::{InMemoryPubSubHub, PubSubClient, PubSubClientFactory, PubSubListener};
pub use router::{ChannelSubscription, RealtimeRouter, RealtimeState};

/// Connection status reported by the pub/sub layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RealtimeStatus {
    Connected,
    Disconnected,
    Reconnected,
    UnexpectedDisconnect,
}

/// Credentials returned by the backend when a user registers for realtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeRegistration {
    pub subscribe_key: String,
    pub publish_key: String,
    pub user_channel_group: String,
}

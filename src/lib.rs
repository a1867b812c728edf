//! Offline-first data store and realtime router for the Kinvey backend.
//!
//! - [`datastore`]: typed collections over a local cache with pending-operation
//!   queues, delta-set pulls and cancellable, progress-reporting sync.
//! - [`realtime`]: per-user pub/sub registration, channel routing and
//!   [`LiveStream`](realtime::LiveStream)s.
//! - [`client`]: the explicit context both of them are built from.
//! - [`network`]: the transport seam, with a reqwest-based HTTP transport and an
//!   in-memory backend for tests and offline development.
//!
//! Every fallible call returns [`KinveyResult`](error::KinveyResult).

pub mod client;
pub mod datastore;
pub mod error;
pub mod logger;
pub mod network;
pub mod platform;
pub mod realtime;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{Client, ClientBuilder, ClientOptions};
pub use datastore::{DataStore, Query, StoreMode};
pub use error::{KinveyError, KinveyErrorCode, KinveyResult};

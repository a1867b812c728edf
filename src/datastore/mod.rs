//! Offline-first collections.
//!
//! A [`DataStore`] reads and writes one collection through a per-collection
//! [`MemoryCache`]. In [`StoreMode::Sync`] writes are queued as pending operations
//! and reach the backend on [`DataStore::push`]; [`DataStore::pull`] brings the
//! cache up to date, using delta sets when a sync mark exists.
//!
//! ```no_run
//! use kinvey_rs_sdk::client::Client;
//! use kinvey_rs_sdk::datastore::{DataStore, Persistable, Predicate, PullOptions, PushOptions, Query, StoreMode};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Book {
//!     #[serde(default, skip_serializing_if = "Option::is_none")]
//!     id: Option<String>,
//!     title: String,
//!     pages: u32,
//! }
//!
//! impl Persistable for Book {
//!     fn collection_name() -> &'static str {
//!         "Book"
//!     }
//! }
//!
//! # async fn demo(client: Client) -> kinvey_rs_sdk::error::KinveyResult<()> {
//! let books = DataStore::<Book>::collection(&client, StoreMode::Sync);
//! books.save(&Book { id: None, title: "Dune".into(), pages: 412 }).await?;
//! books.push(PushOptions::default()).await?;
//! books.pull(&Query::new(), PullOptions::default().delta_set(true)).await?;
//! let long = books.find(&Query::new().filter(Predicate::gt("pages", 300))).await?;
//! # let _ = long;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod entity;
pub mod persistence;
pub mod progress;
pub mod query;
pub mod query_translator;
pub mod store;
pub(crate) mod sync;

pub use cache::{MemoryCache, PendingOperation, PendingOperationKind, RemoteApplyOutcome};
pub use entity::{Acl, AclGroups, Entity, FieldCodec, FieldMapping, Metadata, Persistable};
pub use persistence::{CachePersistence, CacheSnapshot, FileCachePersistence};
pub use progress::{SyncProgress, SyncProgressUpdate, SyncRequest};
pub use query::{ComparisonOperator, Predicate, Query, SortDescriptor, SortDirection};
pub use query_translator::{translate, LocalPredicate, LocalQuery, RemoteQuery, TranslatedQuery};
pub use store::{DataStore, MultiSaveResult, StoreMode};
pub use sync::{PullOptions, PullResult, PushOptions, PushResult, SyncResult};

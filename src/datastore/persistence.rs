use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datastore::cache::PendingOperation;
use crate::error::{cache_corruption, internal_error, KinveyResult};

/// Durable image of one collection's cache.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Entity JSON in cache insertion order.
    pub entities: Vec<Value>,
    #[serde(default)]
    pub pending: Vec<PendingOperation>,
    #[serde(default)]
    pub sync_marks: BTreeMap<String, String>,
}

/// Storage backing a collection cache.
///
/// `load` returns `Ok(None)` when nothing was stored yet and a
/// `kinvey/cache-corruption` error when stored data cannot be read back.
pub trait CachePersistence: Send + Sync {
    fn load(&self, collection: &str) -> KinveyResult<Option<CacheSnapshot>>;
    fn save(&self, collection: &str, snapshot: &CacheSnapshot) -> KinveyResult<()>;
    fn clear(&self, collection: &str) -> KinveyResult<()>;
}

/// Keeps one JSON file per collection under a directory.
pub struct FileCachePersistence {
    directory: PathBuf,
}

impl Debug for FileCachePersistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCachePersistence")
            .field("directory", &self.directory)
            .finish()
    }
}

impl FileCachePersistence {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        let file = utf8_percent_encode(collection, NON_ALPHANUMERIC).to_string();
        self.directory.join(format!("{file}.json"))
    }
}

impl CachePersistence for FileCachePersistence {
    fn load(&self, collection: &str) -> KinveyResult<Option<CacheSnapshot>> {
        let path = self.path_for(collection);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(cache_corruption(format!(
                    "Failed to read cache file {}: {err}",
                    path.display()
                )))
            }
        };
        serde_json::from_slice(&raw).map(Some).map_err(|err| {
            cache_corruption(format!(
                "Cache file {} is not a valid snapshot: {err}",
                path.display()
            ))
        })
    }

    fn save(&self, collection: &str, snapshot: &CacheSnapshot) -> KinveyResult<()> {
        fs::create_dir_all(&self.directory).map_err(|err| {
            internal_error(format!(
                "Failed to create cache directory {}: {err}",
                self.directory.display()
            ))
        })?;
        let path = self.path_for(collection);
        let staging = path.with_extension("json.tmp");
        let encoded = serde_json::to_vec(snapshot)
            .map_err(|err| internal_error(format!("Failed to encode cache snapshot: {err}")))?;
        fs::write(&staging, encoded)
            .and_then(|_| fs::rename(&staging, &path))
            .map_err(|err| {
                internal_error(format!("Failed to write cache file {}: {err}", path.display()))
            })
    }

    fn clear(&self, collection: &str) -> KinveyResult<()> {
        match fs::remove_file(self.path_for(collection)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(internal_error(format!("Failed to remove cache file: {err}"))),
        }
    }
}

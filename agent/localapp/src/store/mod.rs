//! Shared key/value state visible to every editor-window process.
//!
//! The store offers plain reads, writes and prefix enumeration. There is no
//! compare-and-swap and no change notification; everything built on top of it
//! polls.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

mod fs;
mod memory;

pub use fs::FsStateStore;
pub use memory::MemoryStateStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store io error on `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state store encoding error on `{key}`: {source}")]
    Encoding {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value persistence shared across processes.
///
/// `set(key, None)` deletes the key and is idempotent.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn set(&self, key: &str, value: Option<Value>) -> StoreResult<()>;

    /// All keys starting with `prefix`, in no particular order.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Reclaim space left behind by writes that never completed. Returns how
    /// many leftovers were removed.
    async fn purge_leftovers(&self) -> StoreResult<usize> {
        Ok(0)
    }
}

/// Read and decode a typed record.
///
/// A value that no longer decodes is reported as absent: records written by
/// an incompatible version are treated like records that were never written.
pub async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> StoreResult<Option<T>> {
    let Some(value) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            tracing::warn!(key, error = %err, "ignoring undecodable state record");
            Ok(None)
        }
    }
}

/// Encode and write a typed record.
pub async fn save<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    record: &T,
) -> StoreResult<()> {
    let value = serde_json::to_value(record).map_err(|source| StoreError::Encoding {
        key: key.to_string(),
        source,
    })?;
    store.set(key, Some(value)).await
}

pub async fn remove(store: &dyn StateStore, key: &str) -> StoreResult<()> {
    store.set(key, None).await
}

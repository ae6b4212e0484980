use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;

use super::{StateStore, StoreError, StoreResult};

const TEMP_PREFIX: char = '.';
const TEMP_SUFFIX: &str = ".tmp";

/// Age after which a temporary file can no longer belong to a write in flight.
const ABANDONED_AFTER: Duration = Duration::from_secs(60);

/// Directory-backed store: one JSON file per key.
///
/// Writes go to a temporary sibling and are renamed into place, so readers in
/// other processes see either the old or the new value, never a torn one.
/// Temporaries orphaned by an interrupted writer are removed by
/// [`StateStore::purge_leftovers`].
#[derive(Debug, Clone)]
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::Io {
                key: root.display().to_string(),
                source,
            })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Encoding {
                key: key.to_string(),
                source,
            })
    }

    async fn set(&self, key: &str, value: Option<Value>) -> StoreResult<()> {
        let path = self.path_for(key);
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };

        let Some(value) = value else {
            return match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(io_err(err)),
            };
        };

        let bytes = serde_json::to_vec(&value).map_err(|source| StoreError::Encoding {
            key: key.to_string(),
            source,
        })?;
        let temp = self.root.join(format!(
            "{TEMP_PREFIX}{}.{}{TEMP_SUFFIX}",
            encode_key(key),
            uuid::Uuid::new_v4().simple()
        ));
        let written = match tokio::fs::write(&temp, &bytes).await {
            Ok(()) => tokio::fs::rename(&temp, &path).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_err(err));
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let io_err = |source| StoreError::Io {
            key: prefix.to_string(),
            source,
        };
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if let Some(key) = decode_key(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn purge_leftovers(&self) -> StoreResult<usize> {
        let io_err = |source| StoreError::Io {
            key: self.root.display().to_string(),
            source,
        };
        let now = SystemTime::now();
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)) {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|meta| meta.modified()) else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() < ABANDONED_AFTER {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(io_err(err)),
            }
        }
        Ok(removed)
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]`, which keeps names
/// portable (host ids carry `:` and keys carry `/`) and leaves `.` free to
/// mark temporary files.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

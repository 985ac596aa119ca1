//! Key → JSON document store with atomic writes and content checksums.
//!
//! Keys are `/`-separated relative paths (`state/ctx_a-1f3c9a2e`). The file
//! backend maps each key to `{root}/{key}.json` and wraps the document in a
//! checksum envelope:
//!
//! ```json
//! { "sha256": "<hex digest of the document bytes>", "document": { ... } }
//! ```
//!
//! Writes go to a temp file first and are renamed into place so readers
//! never observe a partial document.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid document key '{0}'")]
    InvalidKey(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error for '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("checksum mismatch for '{key}' (expected {expected}, found {actual})")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn put(&self, key: &str, document: &Value) -> Result<(), StoreError>;
}

pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub async fn put_typed<T: Serialize>(
    store: &dyn DocumentStore,
    key: &str,
    document: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(document).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })?;
    store.put(key, &value).await
}

/// Reject keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(StoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

/// Filesystem-safe key segment for a context id.
///
/// The readable part is lossy, so a short digest of the raw id keeps
/// `a.b` and `a_b` apart.
pub fn context_key(context_id: &str) -> String {
    let readable: String = context_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    let digest = hex::encode(Sha256::digest(context_id.as_bytes()));
    format!("{}-{}", readable, &digest[..8])
}

pub fn checksum(document: &Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(document)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// ─────────────────────────────────────────────────────────────────────────────
// File backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct Envelope {
    sha256: String,
    document: Value,
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{}.json", key)))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        let envelope: Envelope =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Serialization {
                key: key.to_string(),
                source,
            })?;
        let actual = checksum(&envelope.document).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        if actual != envelope.sha256 {
            return Err(StoreError::ChecksumMismatch {
                key: key.to_string(),
                expected: envelope.sha256,
                actual,
            });
        }
        Ok(Some(envelope.document))
    }

    async fn put(&self, key: &str, document: &Value) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }

        let sha256 = checksum(document).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        let envelope = Envelope {
            sha256,
            document: document.clone(),
        };
        let json =
            serde_json::to_vec_pretty(&envelope).map_err(|source| StoreError::Serialization {
                key: key.to_string(),
                source,
            })?;

        // Atomic write via temp file + rename.
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.{}.tmp", std::process::id(), seq));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&path, e));
        }
        debug!("document_store: wrote {} ({} bytes)", path.display(), json.len());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys under `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.docs
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        validate_key(key)?;
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, document: &Value) -> Result<(), StoreError> {
        validate_key(key)?;
        self.docs
            .write()
            .await
            .insert(key.to_string(), document.clone());
        Ok(())
    }
}

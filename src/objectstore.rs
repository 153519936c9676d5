//! Thin object-storage abstraction shared by C1 (config), C4 (cache) and
//! C10 (audit). Grounded on the `AuditStore` trait-plus-fake shape in the
//! teacher's `security/audit.rs`: a narrow async trait with a real S3
//! implementation and an in-memory fake used by every other module's
//! tests, so none of them need a live bucket to be exercised.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object store transient error: {0}")]
    Transient(String),
    #[error("object store permanent error: {0}")]
    Permanent(String),
}

impl ObjectStoreError {
    pub fn retryable(&self) -> bool {
        matches!(self, ObjectStoreError::Transient(_))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns `Ok(None)` when the key does not exist; this is not an
    /// error, callers treat absence as a cache/config miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;

    /// Overwrite (or create) an object. Used for cache write-through and
    /// config publishing; [`crate::audit::S3AuditStore`] preserves
    /// append-only semantics by constructing a collision-free key per
    /// record rather than by a separate store-level primitive.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError>;

    /// List keys under a prefix, fully materialized (spec §4.3's
    /// "not streams" contract applies equally here).
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

/// S3-backed implementation. Used for the config bucket, the cache
/// namespace, and (via the dedicated [`crate::audit::S3AuditStore`]
/// wrapper) the audit bucket.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| ObjectStoreError::Transient(e.to_string()))?
                    .into_bytes();
                Ok(Some(bytes.to_vec()))
            }
            Err(err) => {
                let svc_err = err.into_service_error();
                if svc_err.is_no_such_key() {
                    Ok(None)
                } else {
                    let code = svc_err.meta().code().unwrap_or_default();
                    let msg = svc_err.to_string();
                    if matches!(code, "SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable") {
                        Err(ObjectStoreError::Transient(msg))
                    } else {
                        Err(ObjectStoreError::Permanent(msg))
                    }
                }
            }
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation.clone() {
                req = req.continuation_token(token);
            }
            let output = req.send().await.map_err(|e| ObjectStoreError::Transient(e.to_string()))?;
            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            if output.is_truncated().unwrap_or(false) {
                continuation = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

/// In-memory fake for unit tests across C1/C4/C10.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.objects.write().await.insert(key.into(), bytes);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_roundtrips() {
        let store = InMemoryObjectStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
        store.put("a/b.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.get("a/b.json").await.unwrap(), Some(b"{}".to_vec()));
        let keys = store.list("a/").await.unwrap();
        assert_eq!(keys, vec!["a/b.json".to_string()]);
    }
}

//! C10 — Audit log writer (spec §4.10).
//!
//! Follows the `AuditEvent`/`AuditStore` shape in the teacher's
//! `security/audit.rs` (a trait with an in-memory fake, a `version` field
//! for schema evolution), specialized down to spec §3's exact
//! `AuditRecord` field set and backed by an S3 put-only store instead of
//! the teacher's in-memory/queryable one: spec §4.10 requires append-only
//! object-storage partitioning and explicitly forbids updates or deletes,
//! so there is no `query`/`get_by_id`/hash-chaining here — just `put`.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::objectstore::ObjectStore;

pub const CURRENT_AUDIT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryType {
    Account,
    Group,
    SyncAdd,
    SyncRemove,
    ManualDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Grant,
    Revoke,
    Detect,
}

/// Append-only record, spec §3 field-for-field. `version` plus
/// `#[serde(default)]` on every optional field gives forward/backward
/// schema tolerance (spec §4.10 "Schema evolution").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub audit_entry_type: AuditEntryType,
    pub operation_type: OperationType,
    pub request_id: String,
    #[serde(default)]
    pub role_name: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    pub requester_email: String,
    #[serde(default)]
    pub approver_email: Option<String>,
    pub sso_user_email: String,
    pub reason: String,
    #[serde(default)]
    pub permission_duration_hours: Option<u32>,
    #[serde(default)]
    pub matched_attributes: Option<HashMap<String, String>>,
    #[serde(default)]
    pub secondary_domain_was_used: bool,
    /// Present on `{operation_type=grant, state=Failed}` rows (spec
    /// §4.5 "On failure: audit {operation_type=grant, state=Failed}").
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit store transient error: {0}")]
    Transient(String),
    #[error("audit store permanent error: {0}")]
    Permanent(String),
}

impl From<crate::objectstore::ObjectStoreError> for AuditError {
    fn from(e: crate::objectstore::ObjectStoreError) -> Self {
        if e.retryable() {
            AuditError::Transient(e.to_string())
        } else {
            AuditError::Permanent(e.to_string())
        }
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one record. Implementations must never update or delete an
    /// existing object under the audit prefix (spec §4.10 invariant,
    /// property 10 "audit append-only").
    async fn put(&self, record: AuditRecord) -> Result<(), AuditError>;

    #[cfg(test)]
    async fn all(&self) -> Vec<AuditRecord>;
}

/// Object naming: `{prefix}/{YYYY}/{MM}/{DD}/{request_id}-{nonce}.json`
/// (spec §6), with the nonce a millisecond timestamp plus a random suffix
/// so concurrent writers never collide without a database (spec §9 "no
/// central request DB").
fn object_key(prefix: &str, record: &AuditRecord) -> String {
    let nonce_rand: u32 = rand::thread_rng().gen();
    format!(
        "{prefix}/{:04}/{:02}/{:02}/{}-{}-{:08x}.json",
        record.timestamp.year(),
        record.timestamp.month(),
        record.timestamp.day(),
        record.request_id,
        record.timestamp.timestamp_millis(),
        nonce_rand,
    )
}

pub struct S3AuditStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl S3AuditStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into() }
    }
}

#[async_trait]
impl AuditStore for S3AuditStore {
    async fn put(&self, record: AuditRecord) -> Result<(), AuditError> {
        let key = object_key(&self.prefix, &record);
        let bytes = serde_json::to_vec(&record).map_err(|e| AuditError::Permanent(e.to_string()))?;
        self.store.put(&key, bytes).await?;
        Ok(())
    }

    #[cfg(test)]
    async fn all(&self) -> Vec<AuditRecord> {
        let keys = self.store.list(&self.prefix).await.unwrap_or_default();
        let mut records = Vec::new();
        for key in keys {
            if let Ok(Some(bytes)) = self.store.get(&key).await {
                if let Ok(record) = serde_json::from_slice(&bytes) {
                    records.push(record);
                }
            }
        }
        records
    }
}

/// In-memory fake for unit tests.
#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn put(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records.write().await.push(record);
        Ok(())
    }

    #[cfg(test)]
    async fn all(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuditRecord {
        AuditRecord {
            version: CURRENT_AUDIT_VERSION,
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Account,
            operation_type: OperationType::Grant,
            request_id: "req-1".to_string(),
            role_name: Some("ReadOnly".to_string()),
            group_name: None,
            account_id: Some("111".to_string()),
            group_id: None,
            requester_email: "a@x".to_string(),
            approver_email: None,
            sso_user_email: "a@x".to_string(),
            reason: "debugging".to_string(),
            permission_duration_hours: Some(1),
            matched_attributes: None,
            secondary_domain_was_used: false,
            failed: false,
        }
    }

    #[tokio::test]
    async fn put_appends_and_never_overwrites() {
        let store = InMemoryAuditStore::new();
        store.put(sample()).await.unwrap();
        store.put(sample()).await.unwrap();
        assert_eq!(store.all().await.len(), 2);
    }

    #[tokio::test]
    async fn s3_object_keys_are_partitioned_and_unique() {
        let object_store = crate::objectstore::InMemoryObjectStore::new();
        let audit = S3AuditStore::new(Arc::new(object_store), "audit");
        audit.put(sample()).await.unwrap();
        audit.put(sample()).await.unwrap();
        let all = audit.all().await;
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn tolerates_unknown_and_absent_optional_fields() {
        let json = r#"{
            "version": 1,
            "timestamp": "2026-01-01T00:00:00Z",
            "audit_entry_type": "sync_add",
            "operation_type": "detect",
            "request_id": "req-2",
            "requester_email": "a@x",
            "sso_user_email": "a@x",
            "reason": "attribute sync",
            "some_future_field": "ignored"
        }"#;
        let record: AuditRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.audit_entry_type, AuditEntryType::SyncAdd);
        assert!(record.matched_attributes.is_none());
    }
}

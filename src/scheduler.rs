//! C6 — Revocation scheduler (spec §4.6).
//!
//! Generalizes the teacher's in-process `TaskScheduler`
//! (`tasks/scheduler.rs`: `cron`-driven, repeating, `Vec<ScheduledTask>`
//! held in memory) to a one-shot, externally-durable primitive backed by
//! Amazon EventBridge Scheduler (`aws-sdk-scheduler`), because spec §4.6
//! requires the job to survive process restarts — something an in-memory
//! `Vec` cannot provide. The retry/backoff shape of the teacher's
//! `execute_task` (`2^n`-second backoff) is what [`crate::directory::poll_until_terminal`]
//! generalizes for C5; C6 itself performs no polling, only create/describe/
//! delete of a durable job.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::Mac;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler transient error: {0}")]
    Transient(String),
    #[error("scheduler permanent error: {0}")]
    Permanent(String),
}

impl SchedulerError {
    pub fn retryable(&self) -> bool {
        matches!(self, SchedulerError::Transient(_))
    }
}

/// The JSON payload carried by a one-shot revocation job (spec §4.6,
/// §6 object storage section references the same assignment identity +
/// audit context shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationPayload {
    pub principal_id: String,
    pub account_id: Option<String>,
    pub permission_set_arn: Option<String>,
    pub group_id: Option<String>,
    pub membership_id: Option<String>,
    pub request_id: String,
    pub requester_email: String,
}

#[derive(Debug, Clone)]
pub struct ScheduleMeta {
    pub name: String,
    pub fire_time: DateTime<Utc>,
    pub payload: RevocationPayload,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Create a one-shot job. Treated as idempotent: an "already exists"
    /// response from the backing service is success, not an error (spec
    /// §5 "attempts to create a duplicate are treated as success").
    async fn create_one_shot(&self, name: &str, fire_time: DateTime<Utc>, payload: RevocationPayload) -> Result<(), SchedulerError>;
    async fn describe(&self, name: &str) -> Result<Option<ScheduleMeta>, SchedulerError>;
    async fn delete(&self, name: &str) -> Result<(), SchedulerError>;
    /// Fully materialized list of every live schedule (spec §4.8 reconciler
    /// input "enumerate every live ScheduledRevocation").
    async fn list_all(&self) -> Result<Vec<ScheduleMeta>, SchedulerError>;
}

/// Deterministic name derivation (spec §3, §9): `hash(assignment_identity
/// || request_id)` truncated to EventBridge Scheduler's 64-character name
/// limit.
pub fn deterministic_schedule_name(assignment_identity: &str, request_id: &str) -> String {
    type HmacSha256 = hmac::Hmac<sha2::Sha256>;
    let mut mac = HmacSha256::new_from_slice(b"sso-elevator-schedule-name").expect("static key length is valid");
    mac.update(assignment_identity.as_bytes());
    mac.update(b"|");
    mac.update(request_id.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    format!("ssoelev-{}", &digest[..digest.len().min(55)])
}

/// Concrete binding over Amazon EventBridge Scheduler. `target_arn` points
/// at the `revoke-worker` entry point (a Lambda or container task,
/// deployment-specific and therefore supplied by the caller, not this
/// module).
pub struct AwsScheduler {
    client: aws_sdk_scheduler::Client,
    group_name: String,
    target_arn: String,
    target_role_arn: String,
}

impl AwsScheduler {
    pub fn new(client: aws_sdk_scheduler::Client, group_name: impl Into<String>, target_arn: impl Into<String>, target_role_arn: impl Into<String>) -> Self {
        Self { client, group_name: group_name.into(), target_arn: target_arn.into(), target_role_arn: target_role_arn.into() }
    }
}

fn classify(err: impl std::fmt::Display) -> SchedulerError {
    let msg = err.to_string();
    if msg.contains("Throttling") || msg.contains("ServiceQuotaExceeded") {
        SchedulerError::Transient(msg)
    } else {
        SchedulerError::Permanent(msg)
    }
}

#[async_trait]
impl Scheduler for AwsScheduler {
    async fn create_one_shot(&self, name: &str, fire_time: DateTime<Utc>, payload: RevocationPayload) -> Result<(), SchedulerError> {
        let expr = format!("at({})", fire_time.format("%Y-%m-%dT%H:%M:%S"));
        let input = serde_json::to_string(&payload).map_err(|e| SchedulerError::Permanent(e.to_string()))?;
        let target = aws_sdk_scheduler::types::Target::builder()
            .arn(&self.target_arn)
            .role_arn(&self.target_role_arn)
            .input(input)
            .build()
            .map_err(classify)?;

        let result = self
            .client
            .create_schedule()
            .name(name)
            .group_name(&self.group_name)
            .schedule_expression(expr)
            .flexible_time_window(
                aws_sdk_scheduler::types::FlexibleTimeWindow::builder()
                    .mode(aws_sdk_scheduler::types::FlexibleTimeWindowMode::Off)
                    .build()
                    .map_err(classify)?,
            )
            .target(target)
            .action_after_completion(aws_sdk_scheduler::types::ActionAfterCompletion::Delete)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("ConflictException") => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn describe(&self, name: &str) -> Result<Option<ScheduleMeta>, SchedulerError> {
        match self.client.get_schedule().name(name).group_name(&self.group_name).send().await {
            Ok(output) => {
                let fire_time = output
                    .schedule_expression()
                    .and_then(parse_at_expression)
                    .unwrap_or_else(Utc::now);
                let payload = output
                    .target()
                    .and_then(|t| t.input())
                    .and_then(|i| serde_json::from_str(i).ok())
                    .ok_or_else(|| SchedulerError::Permanent(format!("schedule {name} missing payload")))?;
                Ok(Some(ScheduleMeta { name: name.to_string(), fire_time, payload }))
            }
            Err(e) if e.to_string().contains("ResourceNotFoundException") => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), SchedulerError> {
        match self.client.delete_schedule().name(name).group_name(&self.group_name).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("ResourceNotFoundException") => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_all(&self) -> Result<Vec<ScheduleMeta>, SchedulerError> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self.client.list_schedules().group_name(&self.group_name);
            if let Some(t) = next_token.clone() {
                req = req.next_token(t);
            }
            let output = req.send().await.map_err(classify)?;
            for s in output.schedules() {
                if let Some(name) = s.name() {
                    names.push(name.to_string());
                }
            }
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        let mut schedules = Vec::with_capacity(names.len());
        for name in names {
            if let Some(meta) = self.describe(&name).await? {
                schedules.push(meta);
            }
        }
        Ok(schedules)
    }
}

fn parse_at_expression(expr: &str) -> Option<DateTime<Utc>> {
    let inner = expr.strip_prefix("at(")?.strip_suffix(')')?;
    let naive = chrono::NaiveDateTime::parse_from_str(inner, "%Y-%m-%dT%H:%M:%S").ok()?;
    Some(naive.and_utc())
}

/// In-memory fake for C5/C8 tests.
#[derive(Clone, Default)]
pub struct InMemoryScheduler {
    schedules: Arc<RwLock<HashMap<String, ScheduleMeta>>>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn create_one_shot(&self, name: &str, fire_time: DateTime<Utc>, payload: RevocationPayload) -> Result<(), SchedulerError> {
        let mut schedules = self.schedules.write().await;
        schedules
            .entry(name.to_string())
            .or_insert_with(|| ScheduleMeta { name: name.to_string(), fire_time, payload });
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<Option<ScheduleMeta>, SchedulerError> {
        Ok(self.schedules.read().await.get(name).cloned())
    }

    async fn delete(&self, name: &str) -> Result<(), SchedulerError> {
        self.schedules.write().await.remove(name);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<ScheduleMeta>, SchedulerError> {
        Ok(self.schedules.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_name_is_stable_and_bounded() {
        let a = deterministic_schedule_name("p1|111|ps-arn", "req-1");
        let b = deterministic_schedule_name("p1|111|ps-arn", "req-1");
        let c = deterministic_schedule_name("p1|111|ps-arn", "req-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.len() <= 64);
    }

    #[tokio::test]
    async fn duplicate_create_is_idempotent() {
        let scheduler = InMemoryScheduler::new();
        let payload = RevocationPayload {
            principal_id: "p1".into(),
            account_id: Some("111".into()),
            permission_set_arn: Some("arn:aws:sso:::ps/abc".into()),
            group_id: None,
            membership_id: None,
            request_id: "req-1".into(),
            requester_email: "a@x".into(),
        };
        let fire_time = Utc::now();
        scheduler.create_one_shot("job-1", fire_time, payload.clone()).await.unwrap();
        scheduler.create_one_shot("job-1", fire_time, payload).await.unwrap();
        assert_eq!(scheduler.list_all().await.unwrap().len(), 1);
    }
}

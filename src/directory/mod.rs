//! C3 — Directory/SSO adapter (spec §4.3).
//!
//! A typed façade over three AWS SDKs (`aws-sdk-ssoadmin`,
//! `aws-sdk-identitystore`, `aws-sdk-organizations`), generalizing the
//! teacher's `directory/client.rs` `ZitadelClient` shape (config struct +
//! cached client + one typed async method per REST operation) from an
//! identity-provider REST client to three AWS control-plane clients bound
//! together behind one trait.

mod aws_impl;
mod in_memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use aws_impl::AwsDirectory;
pub use in_memory::InMemoryDirectory;

#[derive(Debug, thiserror::Error, Clone)]
pub enum DirectoryError {
    #[error("directory transient error: {0}")]
    Transient(String),
    #[error("directory permanent error: {0}")]
    Permanent(String),
    #[error("user not found for email: {0}")]
    UserNotFound(String),
    #[error("operation polling exhausted its backoff budget")]
    PollExhausted,
}

impl DirectoryError {
    pub fn retryable(&self) -> bool {
        matches!(self, DirectoryError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub arn: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub principal_id: String,
    pub user_name: String,
    pub email: String,
    /// Free-form attributes used by C9's attribute mapping rules (spec §4.9).
    pub attributes: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryGroup {
    pub group_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub membership_id: String,
    pub group_id: String,
    pub principal_id: String,
}

/// `(principal_id, account_id, permission_set_arn)` (spec §3 "Assignment").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentIdentity {
    pub principal_id: String,
    pub account_id: String,
    pub permission_set_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed(String),
}

/// Resolution result for the email-lookup contract in spec §4.3.
#[derive(Debug, Clone)]
pub struct ResolvedPrincipal {
    pub user: DirectoryUser,
    pub secondary_domain_was_used: bool,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>, DirectoryError>;
    async fn list_permission_sets(&self) -> Result<Vec<PermissionSet>, DirectoryError>;
    async fn describe_permission_set(&self, arn: &str) -> Result<PermissionSet, DirectoryError>;
    async fn resolve_permission_set_arn(&self, name: &str) -> Result<Option<String>, DirectoryError>;

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError>;
    async fn describe_user_by_email(&self, email: &str) -> Result<Option<DirectoryUser>, DirectoryError>;
    async fn describe_user_by_id(&self, principal_id: &str) -> Result<Option<DirectoryUser>, DirectoryError>;

    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>, DirectoryError>;
    async fn describe_group(&self, group_id: &str) -> Result<Option<DirectoryGroup>, DirectoryError>;
    async fn list_group_memberships(&self, group_id: &str) -> Result<Vec<GroupMembership>, DirectoryError>;

    /// Every user-level account-assignment on `account_id` (spec §4.8
    /// reconciler input). Group-level assignments are filtered out by the
    /// caller per the "user-level" scope rule, not by this call.
    async fn list_account_assignments(&self, account_id: &str, permission_set_arn: &str) -> Result<Vec<AssignmentIdentity>, DirectoryError>;

    /// Returns a request id used to poll [`Directory::describe_assignment_creation`].
    async fn create_account_assignment(&self, identity: &AssignmentIdentity) -> Result<String, DirectoryError>;
    async fn describe_assignment_creation(&self, request_id: &str) -> Result<OperationStatus, DirectoryError>;

    /// `Ok(None)` means nothing was present to delete (spec §4.5, §9:
    /// "not found" on deletion is success) and callers must not poll or
    /// treat it as a real deletion. `Ok(Some(request_id))` means a deletion
    /// actually started and `request_id` polls to a terminal state via
    /// [`Directory::describe_assignment_deletion`].
    async fn delete_account_assignment(&self, identity: &AssignmentIdentity) -> Result<Option<String>, DirectoryError>;
    async fn describe_assignment_deletion(&self, request_id: &str) -> Result<OperationStatus, DirectoryError>;

    async fn create_group_membership(&self, group_id: &str, principal_id: &str) -> Result<String, DirectoryError>;
    /// Returns whether a membership was actually removed; `false` means it
    /// was already absent (spec §4.5, §9 idempotency).
    async fn delete_group_membership(&self, membership_id: &str) -> Result<bool, DirectoryError>;
}

/// Email resolution helper (spec §4.3): search by `UserName = email`, then
/// retry against each `secondary_fallback_email_domains` entry in turn.
#[tracing::instrument(skip(directory))]
pub async fn resolve_principal_by_email(
    directory: &dyn Directory,
    primary_email: &str,
    fallback_domains: &[String],
) -> Result<ResolvedPrincipal, DirectoryError> {
    if let Some(user) = directory.describe_user_by_email(primary_email).await? {
        return Ok(ResolvedPrincipal { user, secondary_domain_was_used: false });
    }

    let Some((local, _)) = primary_email.split_once('@') else {
        return Err(DirectoryError::UserNotFound(primary_email.to_string()));
    };

    for domain in fallback_domains {
        let candidate = format!("{local}@{domain}");
        if let Some(user) = directory.describe_user_by_email(&candidate).await? {
            tracing::warn!(primary_email, fallback = %candidate, "resolved requester via secondary fallback domain");
            return Ok(ResolvedPrincipal { user, secondary_domain_was_used: true });
        }
    }

    Err(DirectoryError::UserNotFound(primary_email.to_string()))
}

/// Bounded exponential-backoff poller awaiting a terminal
/// [`OperationStatus`] (spec §4.3 "polling helper", §4.5, §5 "overall
/// budget; on exhaustion ... returns a retriable error"). Generalized so
/// both the assignment-creation and membership paths in C5 share it.
pub async fn poll_until_terminal<F, Fut>(
    mut check: F,
    initial_delay: Duration,
    max_delay: Duration,
    overall_budget: Duration,
) -> Result<(), DirectoryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<OperationStatus, DirectoryError>>,
{
    let deadline = tokio::time::Instant::now() + overall_budget;
    let mut delay = initial_delay;
    loop {
        match check().await? {
            OperationStatus::Succeeded => return Ok(()),
            OperationStatus::Failed(reason) => return Err(DirectoryError::Permanent(reason)),
            OperationStatus::InProgress => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(DirectoryError::PollExhausted);
                }
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn resolves_via_secondary_domain_and_flags_it() {
        let mut dir = InMemoryDirectory::new();
        dir.seed_user(DirectoryUser {
            principal_id: "p1".into(),
            user_name: "alice@corp.example".into(),
            email: "alice@corp.example".into(),
            attributes: Default::default(),
        });
        let resolved = resolve_principal_by_email(&dir, "alice@personal.example", &["corp.example".to_string()])
            .await
            .unwrap();
        assert!(resolved.secondary_domain_was_used);
        assert_eq!(resolved.user.principal_id, "p1");
    }

    #[tokio::test]
    async fn poll_until_terminal_succeeds_eventually() {
        let calls = AtomicU32::new(0);
        let result = poll_until_terminal(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Ok(OperationStatus::InProgress)
                    } else {
                        Ok(OperationStatus::Succeeded)
                    }
                }
            },
            Duration::from_millis(1),
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_ok());
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn poll_until_terminal_exhausts_budget() {
        let result = poll_until_terminal(
            || async { Ok(OperationStatus::InProgress) },
            Duration::from_millis(1),
            Duration::from_millis(2),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(DirectoryError::PollExhausted)));
    }
}

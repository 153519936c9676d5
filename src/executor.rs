//! C5 — Grant/Revoke executor (spec §4.5).
//!
//! Composes C3 (directory), C6 (scheduler), C10 (audit) and C11
//! (notification) into the grant and revoke sequences. The ordering
//! guarantees in spec §5 ("grant precedes schedule-creation precedes
//! audit-grant; revoke precedes schedule-delete precedes audit-revoke")
//! are encoded directly as the statement order in these functions, not as
//! a separately-modeled invariant.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::audit::{AuditEntryType, AuditError, AuditRecord, AuditStore, OperationType, CURRENT_AUDIT_VERSION};
use crate::directory::{self, AssignmentIdentity, Directory, DirectoryError, OperationStatus};
use crate::notify::{compose, notify_requester_best_effort, ChatClient};
use crate::scheduler::{deterministic_schedule_name, RevocationPayload, Scheduler, SchedulerError};

const POLL_INITIAL_DELAY: Duration = Duration::from_secs(2);
const POLL_MAX_DELAY: Duration = Duration::from_secs(30);
const POLL_BUDGET: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl ExecutorError {
    pub fn retryable(&self) -> bool {
        match self {
            ExecutorError::Directory(e) => e.retryable(),
            ExecutorError::Scheduler(e) => e.retryable(),
            ExecutorError::Audit(_) => true,
        }
    }
}

pub struct GrantAccountInput<'a> {
    pub principal_id: &'a str,
    pub account_id: &'a str,
    pub permission_set_arn: &'a str,
    pub permission_set_name: &'a str,
    pub request_id: &'a str,
    pub requester_email: &'a str,
    pub approver_email: Option<&'a str>,
    pub sso_user_email: &'a str,
    pub reason: &'a str,
    pub duration_hours: u32,
    pub secondary_domain_was_used: bool,
    /// Spec §4.11: DM the requester in addition to the main-channel post
    /// when the deployment is configured to do so.
    pub send_dm_if_user_not_in_channel: bool,
}

/// Grant (account) — spec §4.5 steps 1-4.
pub async fn grant_account(
    directory: &dyn Directory,
    scheduler: &dyn Scheduler,
    audit: &dyn AuditStore,
    chat: &dyn ChatClient,
    input: GrantAccountInput<'_>,
) -> Result<(), ExecutorError> {
    let identity = AssignmentIdentity {
        principal_id: input.principal_id.to_string(),
        account_id: input.account_id.to_string(),
        permission_set_arn: input.permission_set_arn.to_string(),
    };
    let assignment_identity_key = format!("{}|{}|{}", identity.principal_id, identity.account_id, identity.permission_set_arn);
    let schedule_name = deterministic_schedule_name(&assignment_identity_key, input.request_id);

    // Duplicate grant attempts detect the existing schedule and refuse to
    // create a second (spec §4.5 "Idempotency").
    if scheduler.describe(&schedule_name).await?.is_some() {
        tracing::info!(schedule_name, "grant already has a live schedule, treating as satisfied");
        return Ok(());
    }

    let creation_request_id = match directory.create_account_assignment(&identity).await {
        Ok(id) => id,
        Err(e) => {
            audit_grant_failure(audit, &input, AuditEntryType::Account).await;
            return Err(e.into());
        }
    };

    let poll_result = directory::poll_until_terminal(
        || async { directory.describe_assignment_creation(&creation_request_id).await },
        POLL_INITIAL_DELAY,
        POLL_MAX_DELAY,
        POLL_BUDGET,
    )
    .await;

    if let Err(e) = poll_result {
        audit_grant_failure(audit, &input, AuditEntryType::Account).await;
        notify_requester_best_effort(
            chat,
            input.send_dm_if_user_not_in_channel,
            input.requester_email,
            compose::grant_result(input.request_id, false, input.secondary_domain_was_used),
        )
        .await;
        return Err(e.into());
    }

    audit
        .put(AuditRecord {
            version: CURRENT_AUDIT_VERSION,
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Account,
            operation_type: OperationType::Grant,
            request_id: input.request_id.to_string(),
            role_name: Some(input.permission_set_name.to_string()),
            group_name: None,
            account_id: Some(input.account_id.to_string()),
            group_id: None,
            requester_email: input.requester_email.to_string(),
            approver_email: input.approver_email.map(str::to_string),
            sso_user_email: input.sso_user_email.to_string(),
            reason: input.reason.to_string(),
            permission_duration_hours: Some(input.duration_hours),
            matched_attributes: None,
            secondary_domain_was_used: input.secondary_domain_was_used,
            failed: false,
        })
        .await?;

    let fire_time = Utc::now() + chrono::Duration::hours(input.duration_hours as i64);
    let payload = RevocationPayload {
        principal_id: identity.principal_id.clone(),
        account_id: Some(identity.account_id.clone()),
        permission_set_arn: Some(identity.permission_set_arn.clone()),
        group_id: None,
        membership_id: None,
        request_id: input.request_id.to_string(),
        requester_email: input.requester_email.to_string(),
    };
    scheduler.create_one_shot(&schedule_name, fire_time, payload).await?;

    notify_requester_best_effort(
        chat,
        input.send_dm_if_user_not_in_channel,
        input.requester_email,
        compose::scheduled_revocation(input.request_id, fire_time),
    )
    .await;
    notify_requester_best_effort(
        chat,
        input.send_dm_if_user_not_in_channel,
        input.requester_email,
        compose::grant_result(input.request_id, true, input.secondary_domain_was_used),
    )
    .await;
    Ok(())
}

pub struct GrantGroupInput<'a> {
    pub principal_id: &'a str,
    pub group_id: &'a str,
    pub group_name: &'a str,
    pub request_id: &'a str,
    pub requester_email: &'a str,
    pub approver_email: Option<&'a str>,
    pub sso_user_email: &'a str,
    pub reason: &'a str,
    pub duration_hours: u32,
    pub secondary_domain_was_used: bool,
    /// Spec §4.11: DM the requester in addition to the main-channel post
    /// when the deployment is configured to do so.
    pub send_dm_if_user_not_in_channel: bool,
}

/// Grant (group) — spec §4.5 "create-group-membership, then as above".
pub async fn grant_group(
    directory: &dyn Directory,
    scheduler: &dyn Scheduler,
    audit: &dyn AuditStore,
    chat: &dyn ChatClient,
    input: GrantGroupInput<'_>,
) -> Result<(), ExecutorError> {
    let assignment_identity_key = format!("{}|{}", input.principal_id, input.group_id);
    let schedule_name = deterministic_schedule_name(&assignment_identity_key, input.request_id);

    if scheduler.describe(&schedule_name).await?.is_some() {
        tracing::info!(schedule_name, "grant already has a live schedule, treating as satisfied");
        return Ok(());
    }

    let membership_id = match directory.create_group_membership(input.group_id, input.principal_id).await {
        Ok(id) => id,
        Err(e) => {
            audit_group_grant_failure(audit, &input).await;
            return Err(e.into());
        }
    };

    audit
        .put(AuditRecord {
            version: CURRENT_AUDIT_VERSION,
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Group,
            operation_type: OperationType::Grant,
            request_id: input.request_id.to_string(),
            role_name: None,
            group_name: Some(input.group_name.to_string()),
            account_id: None,
            group_id: Some(input.group_id.to_string()),
            requester_email: input.requester_email.to_string(),
            approver_email: input.approver_email.map(str::to_string),
            sso_user_email: input.sso_user_email.to_string(),
            reason: input.reason.to_string(),
            permission_duration_hours: Some(input.duration_hours),
            matched_attributes: None,
            secondary_domain_was_used: input.secondary_domain_was_used,
            failed: false,
        })
        .await?;

    let fire_time = Utc::now() + chrono::Duration::hours(input.duration_hours as i64);
    let payload = RevocationPayload {
        principal_id: input.principal_id.to_string(),
        account_id: None,
        permission_set_arn: None,
        group_id: Some(input.group_id.to_string()),
        membership_id: Some(membership_id),
        request_id: input.request_id.to_string(),
        requester_email: input.requester_email.to_string(),
    };
    scheduler.create_one_shot(&schedule_name, fire_time, payload).await?;

    notify_requester_best_effort(
        chat,
        input.send_dm_if_user_not_in_channel,
        input.requester_email,
        compose::scheduled_revocation(input.request_id, fire_time),
    )
    .await;
    notify_requester_best_effort(
        chat,
        input.send_dm_if_user_not_in_channel,
        input.requester_email,
        compose::grant_result(input.request_id, true, input.secondary_domain_was_used),
    )
    .await;
    Ok(())
}

async fn audit_grant_failure(audit: &dyn AuditStore, input: &GrantAccountInput<'_>, entry_type: AuditEntryType) {
    let record = AuditRecord {
        version: CURRENT_AUDIT_VERSION,
        timestamp: Utc::now(),
        audit_entry_type: entry_type,
        operation_type: OperationType::Grant,
        request_id: input.request_id.to_string(),
        role_name: Some(input.permission_set_name.to_string()),
        group_name: None,
        account_id: Some(input.account_id.to_string()),
        group_id: None,
        requester_email: input.requester_email.to_string(),
        approver_email: input.approver_email.map(str::to_string),
        sso_user_email: input.sso_user_email.to_string(),
        reason: input.reason.to_string(),
        permission_duration_hours: Some(input.duration_hours),
        matched_attributes: None,
        secondary_domain_was_used: input.secondary_domain_was_used,
        failed: true,
    };
    // Audit write failures on the failure path are themselves logged and
    // swallowed: the reconciler remains the backstop (spec §7).
    if let Err(e) = audit.put(record).await {
        tracing::error!(error = %e, request_id = input.request_id, "failed to write grant-failure audit record");
    }
}

async fn audit_group_grant_failure(audit: &dyn AuditStore, input: &GrantGroupInput<'_>) {
    let record = AuditRecord {
        version: CURRENT_AUDIT_VERSION,
        timestamp: Utc::now(),
        audit_entry_type: AuditEntryType::Group,
        operation_type: OperationType::Grant,
        request_id: input.request_id.to_string(),
        role_name: None,
        group_name: Some(input.group_name.to_string()),
        account_id: None,
        group_id: Some(input.group_id.to_string()),
        requester_email: input.requester_email.to_string(),
        approver_email: input.approver_email.map(str::to_string),
        sso_user_email: input.sso_user_email.to_string(),
        reason: input.reason.to_string(),
        permission_duration_hours: Some(input.duration_hours),
        matched_attributes: None,
        secondary_domain_was_used: input.secondary_domain_was_used,
        failed: true,
    };
    if let Err(e) = audit.put(record).await {
        tracing::error!(error = %e, request_id = input.request_id, "failed to write grant-failure audit record");
    }
}

/// Revoke (account form). Idempotent: "not found" on deletion is success
/// (spec §4.5, §9), enforced inside [`Directory::delete_account_assignment`].
/// Testable property 5 ("idempotent revoke"): a second revoke of an
/// already-absent assignment writes no additional audit record, so the
/// schedule delete, audit write and notification only happen when
/// something was actually removed.
#[allow(clippy::too_many_arguments)]
pub async fn revoke_account(
    directory: &dyn Directory,
    scheduler: &dyn Scheduler,
    audit: &dyn AuditStore,
    chat: &dyn ChatClient,
    identity: &AssignmentIdentity,
    request_id: &str,
    requester_email: &str,
    reason: &str,
    send_dm_if_user_not_in_channel: bool,
) -> Result<(), ExecutorError> {
    let Some(deletion_request_id) = directory.delete_account_assignment(identity).await? else {
        tracing::info!(request_id, "revoke_account: assignment already absent, nothing to do");
        return Ok(());
    };
    directory::poll_until_terminal(
        || async { directory.describe_assignment_deletion(&deletion_request_id).await },
        POLL_INITIAL_DELAY,
        POLL_MAX_DELAY,
        POLL_BUDGET,
    )
    .await?;

    let assignment_identity_key = format!("{}|{}|{}", identity.principal_id, identity.account_id, identity.permission_set_arn);
    let schedule_name = deterministic_schedule_name(&assignment_identity_key, request_id);
    // Best-effort: the schedule deletes itself after firing anyway (spec
    // §3 ScheduledRevocation lifecycle); this just covers the
    // reconciler-initiated and manual-revocation paths.
    if let Err(e) = scheduler.delete(&schedule_name).await {
        tracing::warn!(error = %e, schedule_name, "best-effort schedule delete failed");
    }

    audit
        .put(AuditRecord {
            version: CURRENT_AUDIT_VERSION,
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Account,
            operation_type: OperationType::Revoke,
            request_id: request_id.to_string(),
            role_name: None,
            group_name: None,
            account_id: Some(identity.account_id.clone()),
            group_id: None,
            requester_email: requester_email.to_string(),
            approver_email: None,
            sso_user_email: requester_email.to_string(),
            reason: reason.to_string(),
            permission_duration_hours: None,
            matched_attributes: None,
            secondary_domain_was_used: false,
            failed: false,
        })
        .await?;

    notify_requester_best_effort(chat, send_dm_if_user_not_in_channel, requester_email, compose::manual_revocation(request_id)).await;
    Ok(())
}

/// Revoke (group form).
#[allow(clippy::too_many_arguments)]
pub async fn revoke_group(
    directory: &dyn Directory,
    scheduler: &dyn Scheduler,
    audit: &dyn AuditStore,
    chat: &dyn ChatClient,
    membership_id: &str,
    principal_id: &str,
    group_id: &str,
    request_id: &str,
    requester_email: &str,
    reason: &str,
    send_dm_if_user_not_in_channel: bool,
) -> Result<(), ExecutorError> {
    let removed = directory.delete_group_membership(membership_id).await?;
    if !removed {
        tracing::info!(request_id, "revoke_group: membership already absent, nothing to do");
        return Ok(());
    }

    let assignment_identity_key = format!("{principal_id}|{group_id}");
    let schedule_name = deterministic_schedule_name(&assignment_identity_key, request_id);
    if let Err(e) = scheduler.delete(&schedule_name).await {
        tracing::warn!(error = %e, schedule_name, "best-effort schedule delete failed");
    }

    audit
        .put(AuditRecord {
            version: CURRENT_AUDIT_VERSION,
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Group,
            operation_type: OperationType::Revoke,
            request_id: request_id.to_string(),
            role_name: None,
            group_name: None,
            account_id: None,
            group_id: Some(group_id.to_string()),
            requester_email: requester_email.to_string(),
            approver_email: None,
            sso_user_email: requester_email.to_string(),
            reason: reason.to_string(),
            permission_duration_hours: None,
            matched_attributes: None,
            secondary_domain_was_used: false,
            failed: false,
        })
        .await?;

    notify_requester_best_effort(chat, send_dm_if_user_not_in_channel, requester_email, compose::manual_revocation(request_id)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::notify::RecordingChatClient;
    use crate::scheduler::InMemoryScheduler;

    #[tokio::test]
    async fn grant_account_creates_assignment_and_schedule() {
        let directory = InMemoryDirectory::new();
        let scheduler = InMemoryScheduler::new();
        let audit = crate::audit::InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();

        grant_account(
            &directory,
            &scheduler,
            &audit,
            &chat,
            GrantAccountInput {
                principal_id: "p1",
                account_id: "111",
                permission_set_arn: "arn:aws:sso:::ps/abc",
                permission_set_name: "ReadOnly",
                request_id: "req-1",
                requester_email: "a@x",
                approver_email: None,
                sso_user_email: "a@x",
                reason: "debug",
                duration_hours: 1,
                secondary_domain_was_used: false,
                send_dm_if_user_not_in_channel: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(directory.list_account_assignments("111", "arn:aws:sso:::ps/abc").await.unwrap().len(), 1);
        assert_eq!(scheduler.list_all().await.unwrap().len(), 1);
        assert_eq!(audit.all().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_grant_does_not_create_second_schedule() {
        let directory = InMemoryDirectory::new();
        let scheduler = InMemoryScheduler::new();
        let audit = crate::audit::InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();

        let input = || GrantAccountInput {
            principal_id: "p1",
            account_id: "111",
            permission_set_arn: "arn:aws:sso:::ps/abc",
            permission_set_name: "ReadOnly",
            request_id: "req-1",
            requester_email: "a@x",
            approver_email: None,
            sso_user_email: "a@x",
            reason: "debug",
            duration_hours: 1,
            secondary_domain_was_used: false,
            send_dm_if_user_not_in_channel: false,
        };

        grant_account(&directory, &scheduler, &audit, &chat, input()).await.unwrap();
        grant_account(&directory, &scheduler, &audit, &chat, input()).await.unwrap();
        assert_eq!(scheduler.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revoke_on_already_absent_assignment_is_idempotent() {
        let mut directory = InMemoryDirectory::new();
        let scheduler = InMemoryScheduler::new();
        let audit = crate::audit::InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let identity = AssignmentIdentity {
            principal_id: "p1".into(),
            account_id: "111".into(),
            permission_set_arn: "arn:aws:sso:::ps/abc".into(),
        };
        directory.seed_assignment(identity.clone());

        revoke_account(&directory, &scheduler, &audit, &chat, &identity, "req-1", "a@x", "manual", false).await.unwrap();
        revoke_account(&directory, &scheduler, &audit, &chat, &identity, "req-1", "a@x", "manual", false).await.unwrap();
        assert_eq!(audit.all().await.len(), 1);
    }

    #[tokio::test]
    async fn revoke_account_writes_no_audit_record_when_never_granted() {
        let directory = InMemoryDirectory::new();
        let scheduler = InMemoryScheduler::new();
        let audit = crate::audit::InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let identity = AssignmentIdentity {
            principal_id: "p1".into(),
            account_id: "111".into(),
            permission_set_arn: "arn:aws:sso:::ps/abc".into(),
        };

        revoke_account(&directory, &scheduler, &audit, &chat, &identity, "req-1", "a@x", "manual", false).await.unwrap();
        assert_eq!(audit.all().await.len(), 0);
        assert_eq!(chat.sent.read().await.len(), 0);
    }

    #[tokio::test]
    async fn revoke_group_on_already_absent_membership_is_idempotent() {
        let directory = InMemoryDirectory::new();
        let scheduler = InMemoryScheduler::new();
        let audit = crate::audit::InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();

        revoke_group(&directory, &scheduler, &audit, &chat, "membership-1", "p1", "g1", "req-1", "a@x", "manual", false)
            .await
            .unwrap();
        assert_eq!(audit.all().await.len(), 0);
        assert_eq!(chat.sent.read().await.len(), 0);
    }
}

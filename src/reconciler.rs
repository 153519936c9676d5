//! C8 — Reconciler (spec §4.8).
//!
//! Warn-sweep and revoke-sweep are the same algorithm (spec §4.8 "common to
//! both") parameterized by [`ReconcileMode`], the way the teacher's
//! `TaskScheduler` runs one `execute_task` body for every `ScheduledTask`
//! regardless of cadence. This module never touches group-level
//! assignments (spec §4.8 "Scope"): it only enumerates the account/
//! permission-set pairs a [`Statement`] actually governs, via
//! [`crate::policy`]'s resolver contract.

use std::collections::HashSet;

use crate::audit::{AuditEntryType, AuditError, AuditRecord, AuditStore, OperationType, CURRENT_AUDIT_VERSION};
use crate::config::{Configuration, ResourceSet};
use crate::directory::{AssignmentIdentity, Directory, DirectoryError};
use crate::executor::{self, ExecutorError};
use crate::notify::{compose, notify_best_effort, ChatClient};
use crate::scheduler::{Scheduler, SchedulerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Warn,
    Revoke,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

#[derive(Debug, Default)]
pub struct ReconcileRun {
    pub orphaned: Vec<AssignmentIdentity>,
    pub revoked: Vec<AssignmentIdentity>,
    pub errors: Vec<String>,
}

/// Every `(account_id, permission_set_arn)` pair governed by at least one
/// account-level statement (spec §4.8 "Accounts not referenced by any
/// statement ... are still swept only if some statement covers them via
/// ANY; otherwise skipped"). Wildcards expand against the live universes
/// handed in by the caller, exactly as C2's resolver does.
fn governed_account_permission_set_pairs(
    cfg: &Configuration,
    known_accounts: &HashSet<String>,
    known_permission_set_arns: &std::collections::HashMap<String, String>,
) -> HashSet<(String, String)> {
    let mut pairs = HashSet::new();
    for stmt in &cfg.statements {
        let accounts: Vec<&String> = match &stmt.resources {
            ResourceSet::Any => known_accounts.iter().collect(),
            ResourceSet::Explicit(set) => set.iter().filter(|a| known_accounts.contains(*a)).collect(),
        };
        let permission_sets: Vec<&String> = match &stmt.permission_sets {
            ResourceSet::Any => known_permission_set_arns.keys().collect(),
            ResourceSet::Explicit(set) => set.iter().filter(|p| known_permission_set_arns.contains_key(*p)).collect(),
        };
        for account_id in &accounts {
            for ps_name in &permission_sets {
                if let Some(arn) = known_permission_set_arns.get(*ps_name) {
                    pairs.insert(((*account_id).clone(), arn.clone()));
                }
            }
        }
    }
    pairs
}

/// Run one sweep (spec §4.8 algorithm steps 1-3, then warn or revoke).
/// `principal_is_user` filters step 1's enumeration down to user-level
/// assignments only (spec §4.8 "Scope"); group principals in the directory
/// are excluded by the caller supplying this predicate, since the
/// `Directory` trait's assignment listing does not itself distinguish
/// principal kinds.
pub async fn sweep(
    directory: &dyn Directory,
    scheduler: &dyn Scheduler,
    audit: &dyn AuditStore,
    chat: &dyn ChatClient,
    cfg: &Configuration,
    known_accounts: &HashSet<String>,
    known_permission_set_arns: &std::collections::HashMap<String, String>,
    principal_is_user: impl Fn(&str) -> bool,
    mode: ReconcileMode,
) -> Result<ReconcileRun, ReconcileError> {
    let pairs = governed_account_permission_set_pairs(cfg, known_accounts, known_permission_set_arns);

    let mut user_level_assignments = Vec::new();
    for (account_id, permission_set_arn) in &pairs {
        let assignments = directory.list_account_assignments(account_id, permission_set_arn).await?;
        user_level_assignments.extend(assignments.into_iter().filter(|a| principal_is_user(&a.principal_id)));
    }

    let live_schedules = scheduler.list_all().await?;
    let governed: HashSet<(String, Option<String>, Option<String>)> = live_schedules
        .iter()
        .map(|s| (s.payload.principal_id.clone(), s.payload.account_id.clone(), s.payload.permission_set_arn.clone()))
        .collect();

    let mut run = ReconcileRun::default();
    for assignment in user_level_assignments {
        let key = (
            assignment.principal_id.clone(),
            Some(assignment.account_id.clone()),
            Some(assignment.permission_set_arn.clone()),
        );
        if governed.contains(&key) {
            continue;
        }
        run.orphaned.push(assignment);
    }

    match mode {
        ReconcileMode::Warn => {
            if !run.orphaned.is_empty() {
                let sample: Vec<String> = run
                    .orphaned
                    .iter()
                    .take(10)
                    .map(|a| format!("{}@{}/{}", a.principal_id, a.account_id, a.permission_set_arn))
                    .collect();
                notify_best_effort(chat, compose::reconciler_warning(run.orphaned.len(), &sample)).await;
            }
        }
        ReconcileMode::Revoke => {
            for assignment in run.orphaned.clone() {
                let result = executor::revoke_account(
                    directory,
                    scheduler,
                    audit,
                    chat,
                    &assignment,
                    "reconciler",
                    "reconciler",
                    "reconciler",
                    false,
                )
                .await;
                match result {
                    Ok(()) => run.revoked.push(assignment),
                    Err(e) => {
                        tracing::error!(error = %e, principal_id = %assignment.principal_id, account_id = %assignment.account_id, "reconciler failed to revoke orphaned assignment");
                        run.errors.push(format!("{}/{}: {e}", assignment.account_id, assignment.permission_set_arn));
                    }
                }
            }
        }
    }

    Ok(run)
}

/// Extra audit row specific to reconciler-initiated revokes (spec §4.8
/// "audit {operation_type:revoke, reason:'reconciler'}"), written in
/// addition to the revoke row [`executor::revoke_account`] already writes,
/// since that function's `reason` parameter already carries the string
/// "reconciler" — kept here only as a thin helper for a caller that wants a
/// dedicated detection-only record (e.g. before a revoke is attempted).
pub async fn audit_detected(audit: &dyn AuditStore, assignment: &AssignmentIdentity) -> Result<(), AuditError> {
    audit
        .put(AuditRecord {
            version: CURRENT_AUDIT_VERSION,
            timestamp: chrono::Utc::now(),
            audit_entry_type: AuditEntryType::Account,
            operation_type: OperationType::Detect,
            request_id: "reconciler".to_string(),
            role_name: None,
            group_name: None,
            account_id: Some(assignment.account_id.clone()),
            group_id: None,
            requester_email: "reconciler".to_string(),
            approver_email: None,
            sso_user_email: assignment.principal_id.clone(),
            reason: "orphaned assignment detected by reconciler".to_string(),
            permission_duration_hours: None,
            matched_attributes: None,
            secondary_domain_was_used: false,
            failed: false,
        })
        .await
}

impl From<ExecutorError> for ReconcileError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Directory(d) => ReconcileError::Directory(d),
            ExecutorError::Scheduler(s) => ReconcileError::Scheduler(s),
            ExecutorError::Audit(a) => ReconcileError::Audit(a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::config::{Statement, Tri};
    use crate::directory::InMemoryDirectory;
    use crate::notify::RecordingChatClient;
    use crate::scheduler::{InMemoryScheduler, RevocationPayload};
    use std::collections::HashMap as Map;

    fn cfg_covering(account: &str, ps_name: &str) -> Configuration {
        Configuration {
            statements: vec![Statement {
                resources: ResourceSet::Explicit([account.to_string()].into()),
                permission_sets: ResourceSet::Explicit([ps_name.to_string()].into()),
                approvers: Default::default(),
                allow_self_approval: Tri::Undecided,
                approval_not_required: Tri::Undecided,
            }],
            group_statements: vec![],
        }
    }

    fn user_principals(users: &'static [&'static str]) -> impl Fn(&str) -> bool {
        move |p: &str| users.contains(&p)
    }

    #[tokio::test]
    async fn s5_revoke_sweep_deletes_orphan_and_is_idempotent_on_rerun() {
        let mut directory = InMemoryDirectory::new();
        directory.seed_assignment(AssignmentIdentity {
            principal_id: "p1".into(),
            account_id: "111".into(),
            permission_set_arn: "arn:aws:sso:::ps/abc".into(),
        });
        let scheduler = InMemoryScheduler::new();
        let audit = InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let cfg = cfg_covering("111", "ReadOnly");
        let accounts: HashSet<String> = ["111".to_string()].into();
        let ps_arns: Map<String, String> = [("ReadOnly".to_string(), "arn:aws:sso:::ps/abc".to_string())].into();

        let run = sweep(
            &directory,
            &scheduler,
            &audit,
            &chat,
            &cfg,
            &accounts,
            &ps_arns,
            user_principals(&["p1"]),
            ReconcileMode::Revoke,
        )
        .await
        .unwrap();
        assert_eq!(run.orphaned.len(), 1);
        assert_eq!(run.revoked.len(), 1);
        assert_eq!(directory.list_account_assignments("111", "arn:aws:sso:::ps/abc").await.unwrap().len(), 0);

        let second = sweep(
            &directory,
            &scheduler,
            &audit,
            &chat,
            &cfg,
            &accounts,
            &ps_arns,
            user_principals(&["p1"]),
            ReconcileMode::Revoke,
        )
        .await
        .unwrap();
        assert!(second.orphaned.is_empty());
    }

    #[tokio::test]
    async fn reconciler_never_revokes_a_governed_assignment() {
        let mut directory = InMemoryDirectory::new();
        let identity = AssignmentIdentity {
            principal_id: "p1".into(),
            account_id: "111".into(),
            permission_set_arn: "arn:aws:sso:::ps/abc".into(),
        };
        directory.seed_assignment(identity.clone());
        let scheduler = InMemoryScheduler::new();
        scheduler
            .create_one_shot(
                "job-1",
                chrono::Utc::now() + chrono::Duration::hours(1),
                RevocationPayload {
                    principal_id: identity.principal_id.clone(),
                    account_id: Some(identity.account_id.clone()),
                    permission_set_arn: Some(identity.permission_set_arn.clone()),
                    group_id: None,
                    membership_id: None,
                    request_id: "req-1".into(),
                    requester_email: "a@x".into(),
                },
            )
            .await
            .unwrap();
        let audit = InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let cfg = cfg_covering("111", "ReadOnly");
        let accounts: HashSet<String> = ["111".to_string()].into();
        let ps_arns: Map<String, String> = [("ReadOnly".to_string(), "arn:aws:sso:::ps/abc".to_string())].into();

        let run = sweep(
            &directory,
            &scheduler,
            &audit,
            &chat,
            &cfg,
            &accounts,
            &ps_arns,
            user_principals(&["p1"]),
            ReconcileMode::Revoke,
        )
        .await
        .unwrap();
        assert!(run.orphaned.is_empty());
        assert_eq!(directory.list_account_assignments("111", "arn:aws:sso:::ps/abc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn warn_sweep_does_not_mutate() {
        let mut directory = InMemoryDirectory::new();
        directory.seed_assignment(AssignmentIdentity {
            principal_id: "p1".into(),
            account_id: "111".into(),
            permission_set_arn: "arn:aws:sso:::ps/abc".into(),
        });
        let scheduler = InMemoryScheduler::new();
        let audit = InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let cfg = cfg_covering("111", "ReadOnly");
        let accounts: HashSet<String> = ["111".to_string()].into();
        let ps_arns: Map<String, String> = [("ReadOnly".to_string(), "arn:aws:sso:::ps/abc".to_string())].into();

        let run = sweep(
            &directory,
            &scheduler,
            &audit,
            &chat,
            &cfg,
            &accounts,
            &ps_arns,
            user_principals(&["p1"]),
            ReconcileMode::Warn,
        )
        .await
        .unwrap();
        assert_eq!(run.orphaned.len(), 1);
        assert_eq!(directory.list_account_assignments("111", "arn:aws:sso:::ps/abc").await.unwrap().len(), 1);
        assert_eq!(chat.sent.read().await.len(), 1);
    }

    #[tokio::test]
    async fn accounts_not_covered_by_any_statement_are_not_swept() {
        let mut directory = InMemoryDirectory::new();
        directory.seed_assignment(AssignmentIdentity {
            principal_id: "p1".into(),
            account_id: "999".into(),
            permission_set_arn: "arn:aws:sso:::ps/other".into(),
        });
        let scheduler = InMemoryScheduler::new();
        let audit = InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let cfg = cfg_covering("111", "ReadOnly");
        let accounts: HashSet<String> = ["111".to_string(), "999".to_string()].into();
        let ps_arns: Map<String, String> = [("ReadOnly".to_string(), "arn:aws:sso:::ps/abc".to_string())].into();

        let run = sweep(
            &directory,
            &scheduler,
            &audit,
            &chat,
            &cfg,
            &accounts,
            &ps_arns,
            user_principals(&["p1"]),
            ReconcileMode::Warn,
        )
        .await
        .unwrap();
        assert!(run.orphaned.is_empty());
    }
}

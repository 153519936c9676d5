//! C9 — Attribute syncer (spec §4.9).
//!
//! `AttributeMappingRule::matches` is the one pure, directly-testable piece
//! (scenario S6); the rest of this module composes C3 (directory), C10
//! (audit) and C11 (notify) the same way [`crate::reconciler`] does, with
//! the containment invariant (spec §4.9, property 8) enforced structurally:
//! the algorithm only ever iterates `managed_groups`, never the directory's
//! full group list.

use std::collections::{HashMap, HashSet};

use crate::audit::{AuditEntryType, AuditError, AuditRecord, AuditStore, OperationType, CURRENT_AUDIT_VERSION};
use crate::directory::{Directory, DirectoryError, DirectoryUser};
use crate::notify::{compose, notify_best_effort, ChatClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    Warn,
    Remove,
}

/// Ordered set of (attribute_name, expected_value) pairs, AND'ed together
/// (spec §3 "AttributeMappingRule"). `group_ref` is the statement-authored
/// group *name*; it is resolved to an id once per run by the caller.
#[derive(Debug, Clone)]
pub struct AttributeMappingRule {
    pub group_ref: String,
    pub conditions: Vec<(String, String)>,
}

impl AttributeMappingRule {
    /// Exact case-sensitive string equality, AND over all conditions.
    /// A user missing an attribute the rule checks never matches (spec
    /// §4.9 "Rule semantics": "missing user attributes never match").
    pub fn matches(&self, user: &DirectoryUser) -> bool {
        self.conditions
            .iter()
            .all(|(attr, expected)| user.attributes.get(attr).is_some_and(|v| v == expected))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Add { principal_id: String, group_id: String, matched_attributes: HashMap<String, String> },
    Remove { principal_id: String, group_id: String },
    Warn { principal_id: String, group_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

#[derive(Debug, Default)]
pub struct SyncRun {
    pub added: usize,
    pub removed: usize,
    pub warned: usize,
    pub errors: Vec<String>,
}

/// Resolved inputs to [`sync`], as loaded from the attribute-sync document
/// by [`crate::config::parse_sync_config`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub managed_groups: Vec<(String, String)>,
    pub rules: Vec<AttributeMappingRule>,
    pub policy: SyncPolicy,
}

fn matched_attributes_for(rule: &AttributeMappingRule) -> HashMap<String, String> {
    rule.conditions.iter().cloned().collect()
}

/// Compute `desired(user) = { group_id : some rule for group_id matches
/// user }` for every user, restricted to `managed_groups` (spec §4.9 step
/// 2). Returns the per-(user, group) matched-attributes map alongside the
/// plain desired-membership set so callers can populate `sync_add`'s
/// `matched_attributes` field without re-evaluating rules.
fn compute_desired<'a>(
    users: &'a [DirectoryUser],
    rules_by_group: &HashMap<String, Vec<&AttributeMappingRule>>,
) -> HashMap<(&'a str, String), HashMap<String, String>> {
    let mut desired = HashMap::new();
    for user in users {
        for (group_id, rules) in rules_by_group {
            if let Some(rule) = rules.iter().find(|r| r.matches(user)) {
                desired.insert((user.principal_id.as_str(), group_id.clone()), matched_attributes_for(rule));
            }
        }
    }
    desired
}

/// Run one attribute-sync pass over `managed_groups` (spec §4.9 algorithm).
/// `managed_groups` is `(group_id, group_name)` pairs already resolved by
/// the caller (spec §4.9 step 1, "cached"); `rules` reference groups by
/// `group_ref` name, matched against `managed_groups` here.
pub async fn sync(
    directory: &dyn Directory,
    audit: &dyn AuditStore,
    chat: &dyn ChatClient,
    managed_groups: &[(String, String)],
    rules: &[AttributeMappingRule],
    policy: SyncPolicy,
) -> Result<SyncRun, SyncError> {
    let group_id_by_name: HashMap<&str, &str> = managed_groups.iter().map(|(id, name)| (name.as_str(), id.as_str())).collect();

    let mut rules_by_group: HashMap<String, Vec<&AttributeMappingRule>> = HashMap::new();
    for rule in rules {
        if let Some(group_id) = group_id_by_name.get(rule.group_ref.as_str()) {
            rules_by_group.entry(group_id.to_string()).or_default().push(rule);
        } else {
            tracing::warn!(group_ref = %rule.group_ref, "attribute rule references a group outside managed_groups, skipping");
        }
    }

    let users = directory.list_users().await?;
    let desired = compute_desired(&users, &rules_by_group);

    let mut run = SyncRun::default();
    for (group_id, _group_name) in managed_groups {
        let current = match directory.list_group_memberships(group_id).await {
            Ok(m) => m,
            Err(e) => {
                run.errors.push(format!("{group_id}: list_group_memberships failed: {e}"));
                continue;
            }
        };
        let current_principals: HashSet<&str> = current.iter().map(|m| m.principal_id.as_str()).collect();

        let should_add: Vec<&DirectoryUser> = users
            .iter()
            .filter(|u| desired.contains_key(&(u.principal_id.as_str(), group_id.clone())) && !current_principals.contains(u.principal_id.as_str()))
            .collect();

        let manual: Vec<&str> = current
            .iter()
            .map(|m| m.principal_id.as_str())
            .filter(|p| !desired.contains_key(&(*p, group_id.clone())))
            .collect();

        for user in should_add {
            let matched = desired.get(&(user.principal_id.as_str(), group_id.clone())).cloned().unwrap_or_default();
            match directory.create_group_membership(group_id, &user.principal_id).await {
                Ok(_) => {
                    if let Err(e) = audit_sync(audit, AuditEntryType::SyncAdd, group_id, &user.principal_id, Some(matched.clone())).await {
                        tracing::error!(error = %e, group_id, principal_id = %user.principal_id, "failed to write sync_add audit record");
                    }
                    notify_best_effort(chat, compose::sync_summary(1, 0, 0, &[])).await;
                    run.added += 1;
                }
                Err(e) => run.errors.push(format!("{group_id}/{}: add failed: {e}", user.principal_id)),
            }
        }

        for principal_id in manual {
            match policy {
                SyncPolicy::Warn => {
                    if let Err(e) = audit_sync(audit, AuditEntryType::ManualDetected, group_id, principal_id, None).await {
                        tracing::error!(error = %e, group_id, principal_id, "failed to write manual_detected audit record");
                    }
                    run.warned += 1;
                }
                SyncPolicy::Remove => {
                    let membership_id = current.iter().find(|m| m.principal_id == principal_id).map(|m| m.membership_id.clone());
                    if let Some(membership_id) = membership_id {
                        match directory.delete_group_membership(&membership_id).await {
                            Ok(_) => {
                                if let Err(e) = audit_sync(audit, AuditEntryType::SyncRemove, group_id, principal_id, None).await {
                                    tracing::error!(error = %e, group_id, principal_id, "failed to write sync_remove audit record");
                                }
                                run.removed += 1;
                            }
                            Err(e) => run.errors.push(format!("{group_id}/{principal_id}: remove failed: {e}")),
                        }
                    }
                }
            }
        }
    }

    notify_best_effort(
        chat,
        compose::sync_summary(run.added, run.removed, run.warned, &run.errors.iter().take(5).cloned().collect::<Vec<_>>()),
    )
    .await;

    Ok(run)
}

async fn audit_sync(
    audit: &dyn AuditStore,
    entry_type: AuditEntryType,
    group_id: &str,
    principal_id: &str,
    matched_attributes: Option<HashMap<String, String>>,
) -> Result<(), AuditError> {
    let operation_type = match entry_type {
        AuditEntryType::SyncAdd => OperationType::Grant,
        AuditEntryType::SyncRemove => OperationType::Revoke,
        _ => OperationType::Detect,
    };
    audit
        .put(AuditRecord {
            version: CURRENT_AUDIT_VERSION,
            timestamp: chrono::Utc::now(),
            audit_entry_type: entry_type,
            operation_type,
            request_id: "attribute-sync".to_string(),
            role_name: None,
            group_name: None,
            account_id: None,
            group_id: Some(group_id.to_string()),
            requester_email: "attribute-sync".to_string(),
            approver_email: None,
            sso_user_email: principal_id.to_string(),
            reason: "attribute mapping rule evaluation".to_string(),
            permission_duration_hours: None,
            matched_attributes,
            secondary_domain_was_used: false,
            failed: false,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::directory::{DirectoryGroup, GroupMembership, InMemoryDirectory};
    use crate::notify::RecordingChatClient;

    fn user(id: &str, dept: &str) -> DirectoryUser {
        DirectoryUser {
            principal_id: id.to_string(),
            user_name: format!("{id}@x"),
            email: format!("{id}@x"),
            attributes: [("department".to_string(), dept.to_string())].into(),
        }
    }

    #[test]
    fn rule_matches_exact_and_ands_conditions() {
        let rule = AttributeMappingRule {
            group_ref: "G1".into(),
            conditions: vec![("department".to_string(), "Eng".to_string())],
        };
        assert!(rule.matches(&user("u1", "Eng")));
        assert!(!rule.matches(&user("u1", "Sales")));

        let multi = AttributeMappingRule {
            group_ref: "G1".into(),
            conditions: vec![("department".to_string(), "Eng".to_string()), ("region".to_string(), "EU".to_string())],
        };
        let mut u = user("u1", "Eng");
        assert!(!multi.matches(&u)); // missing "region" attribute never matches
        u.attributes.insert("region".to_string(), "EU".to_string());
        assert!(multi.matches(&u));
    }

    #[tokio::test]
    async fn s6_containment_and_manual_detection_with_warn_policy() {
        let mut directory = InMemoryDirectory::new();
        directory.seed_group(DirectoryGroup { group_id: "g1".into(), display_name: "G1".into() });
        directory.seed_group(DirectoryGroup { group_id: "g2".into(), display_name: "G2".into() });
        directory.seed_user(user("u1", "Eng"));
        directory.seed_user(user("u2", "Sales"));
        directory.seed_user(user("u3", "Eng"));
        directory.seed_membership(GroupMembership { membership_id: "m1".into(), group_id: "g1".into(), principal_id: "u2".into() });
        directory.seed_membership(GroupMembership { membership_id: "m2".into(), group_id: "g2".into(), principal_id: "u3".into() });

        let audit = InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let managed_groups = vec![("g1".to_string(), "G1".to_string())];
        let rules = vec![AttributeMappingRule { group_ref: "G1".into(), conditions: vec![("department".to_string(), "Eng".to_string())] }];

        let run = sync(&directory, &audit, &chat, &managed_groups, &rules, SyncPolicy::Warn).await.unwrap();
        assert_eq!(run.added, 1); // add(u1, G1)
        assert_eq!(run.warned, 1); // warn(u2, G1): manual, dept doesn't match
        assert_eq!(run.removed, 0);

        // G2 (unmanaged) untouched: u3's membership in g2 still present.
        assert_eq!(directory.list_group_memberships("g2").await.unwrap().len(), 1);
        assert!(directory.list_group_memberships("g1").await.unwrap().iter().any(|m| m.principal_id == "u1"));
    }

    #[tokio::test]
    async fn second_run_after_success_is_idempotent() {
        let mut directory = InMemoryDirectory::new();
        directory.seed_group(DirectoryGroup { group_id: "g1".into(), display_name: "G1".into() });
        directory.seed_user(user("u1", "Eng"));

        let audit = InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let managed_groups = vec![("g1".to_string(), "G1".to_string())];
        let rules = vec![AttributeMappingRule { group_ref: "G1".into(), conditions: vec![("department".to_string(), "Eng".to_string())] }];

        let first = sync(&directory, &audit, &chat, &managed_groups, &rules, SyncPolicy::Remove).await.unwrap();
        assert_eq!(first.added, 1);
        let second = sync(&directory, &audit, &chat, &managed_groups, &rules, SyncPolicy::Remove).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(second.warned, 0);
    }

    #[tokio::test]
    async fn remove_policy_removes_manual_assignment() {
        let mut directory = InMemoryDirectory::new();
        directory.seed_group(DirectoryGroup { group_id: "g1".into(), display_name: "G1".into() });
        directory.seed_user(user("u2", "Sales"));
        directory.seed_membership(GroupMembership { membership_id: "m1".into(), group_id: "g1".into(), principal_id: "u2".into() });

        let audit = InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let managed_groups = vec![("g1".to_string(), "G1".to_string())];
        let rules = vec![AttributeMappingRule { group_ref: "G1".into(), conditions: vec![("department".to_string(), "Eng".to_string())] }];

        let run = sync(&directory, &audit, &chat, &managed_groups, &rules, SyncPolicy::Remove).await.unwrap();
        assert_eq!(run.removed, 1);
        assert!(directory.list_group_memberships("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_in_managed_set_with_no_rule_still_sweeps_manual_assignments() {
        let mut directory = InMemoryDirectory::new();
        directory.seed_group(DirectoryGroup { group_id: "g1".into(), display_name: "G1".into() });
        directory.seed_user(user("u1", "Eng"));
        directory.seed_membership(GroupMembership { membership_id: "m1".into(), group_id: "g1".into(), principal_id: "u1".into() });

        let audit = InMemoryAuditStore::new();
        let chat = RecordingChatClient::new();
        let managed_groups = vec![("g1".to_string(), "G1".to_string())];
        let rules: Vec<AttributeMappingRule> = vec![]; // no rule targets G1 at all

        let run = sync(&directory, &audit, &chat, &managed_groups, &rules, SyncPolicy::Warn).await.unwrap();
        assert_eq!(run.warned, 1);
        assert_eq!(run.added, 0);
    }
}

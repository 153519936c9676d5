//! C2 — Policy evaluator (spec §4.2).
//!
//! Deliberately the only module in this crate with no ambient stack beyond
//! its error type: `evaluate` never performs I/O, never suspends, and is a
//! pure function of its three inputs, per spec §4.2 and testable property
//! 1 ("decision purity").

use std::collections::HashSet;

use crate::config::{Configuration, GroupStatement, ResourceSet, Statement, Tri};
use crate::request::{AccessRequest, ResourceKind};

/// Read-only capability supplying the universes `ANY` expands against.
/// Implemented over the resilient cache (C4) in production; a fixed set in
/// tests. Resolving this is the caller's job — `evaluate` treats it as
/// already-materialized data, never fetches anything itself.
pub trait WildcardResolver {
    fn known_accounts(&self) -> &HashSet<String>;
    fn known_permission_sets(&self) -> &HashSet<String>;
}

pub struct FixedResolver {
    pub accounts: HashSet<String>,
    pub permission_sets: HashSet<String>,
}

impl WildcardResolver for FixedResolver {
    fn known_accounts(&self) -> &HashSet<String> {
        &self.accounts
    }

    fn known_permission_sets(&self) -> &HashSet<String> {
        &self.permission_sets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Auto,
    NeedsApproval,
    Deny,
}

/// Pure output of `evaluate` (spec §3 "Decision").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub permit: Permit,
    pub approvers: HashSet<String>,
    pub allow_self_approval: bool,
    pub approval_not_required: bool,
    /// Non-retryable reason attached to `Deny` when the configuration
    /// itself was unusable (spec §4.2 "Configuration unresolvable").
    pub deny_reason: Option<String>,
}

impl Decision {
    fn permit(approvers: HashSet<String>, allow_self_approval: bool, approval_not_required: bool) -> Self {
        Self { permit: Permit::Auto, approvers, allow_self_approval, approval_not_required, deny_reason: None }
    }

    fn needs_approval(approvers: HashSet<String>, allow_self_approval: bool, approval_not_required: bool) -> Self {
        Self {
            permit: Permit::NeedsApproval,
            approvers,
            allow_self_approval,
            approval_not_required,
            deny_reason: None,
        }
    }

    fn deny() -> Self {
        Self {
            permit: Permit::Deny,
            approvers: HashSet::new(),
            allow_self_approval: false,
            approval_not_required: false,
            deny_reason: None,
        }
    }

    /// Non-retryable deny for an unresolvable configuration (spec §4.2).
    pub fn deny_unresolvable(reason: impl Into<String>) -> Self {
        let mut d = Self::deny();
        d.deny_reason = Some(reason.into());
        d
    }

    /// Property 2 / edge case: a single-approver set that is exactly the
    /// requester's own email, combined with `allow_self_approval=false`,
    /// is legal but cannot ever be satisfied (spec §4.2 edge cases, S4).
    pub fn is_unsatisfiable(&self, requester_email: &str) -> bool {
        self.permit == Permit::NeedsApproval
            && !self.allow_self_approval
            && self.approvers.len() == 1
            && self.approvers.contains(requester_email)
    }
}

fn matching_statements<'a>(
    req: &AccessRequest,
    cfg: &'a Configuration,
    resolver: &dyn WildcardResolver,
) -> Vec<&'a Statement> {
    cfg.statements
        .iter()
        .filter(|s| {
            s.resources.matches(&req.resource, resolver.known_accounts())
                && req
                    .permission_set_name
                    .as_deref()
                    .map(|ps| s.permission_sets.matches(ps, resolver.known_permission_sets()))
                    .unwrap_or(false)
        })
        .collect()
}

fn matching_group_statements<'a>(req: &AccessRequest, cfg: &'a Configuration) -> Vec<&'a GroupStatement> {
    cfg.group_statements
        .iter()
        .filter(|s| s.resources.contains(&req.resource))
        .collect()
}

/// `evaluate(req, cfg, resolver) -> Decision` (spec §4.2).
pub fn evaluate(req: &AccessRequest, cfg: &Configuration, resolver: &dyn WildcardResolver) -> Decision {
    match req.resource_kind {
        ResourceKind::Account => evaluate_account(req, cfg, resolver),
        ResourceKind::Group => evaluate_group(req, cfg),
    }
}

fn evaluate_account(req: &AccessRequest, cfg: &Configuration, resolver: &dyn WildcardResolver) -> Decision {
    let matched = matching_statements(req, cfg, resolver);
    if matched.is_empty() {
        return Decision::deny();
    }

    let mut approvers = HashSet::new();
    let mut allow_self_approval = Tri::Undecided;
    let mut approval_not_required = Tri::Undecided;
    for s in &matched {
        approvers.extend(s.approvers.iter().cloned());
        allow_self_approval = Tri::fold(allow_self_approval, s.allow_self_approval);
        approval_not_required = Tri::fold(approval_not_required, s.approval_not_required);
    }

    decide(req, approvers, allow_self_approval, approval_not_required)
}

fn evaluate_group(req: &AccessRequest, cfg: &Configuration) -> Decision {
    let matched = matching_group_statements(req, cfg);
    if matched.is_empty() {
        return Decision::deny();
    }

    let mut approvers = HashSet::new();
    let mut allow_self_approval = Tri::Undecided;
    let mut approval_not_required = Tri::Undecided;
    for s in &matched {
        approvers.extend(s.approvers.iter().cloned());
        allow_self_approval = Tri::fold(allow_self_approval, s.allow_self_approval);
        approval_not_required = Tri::fold(approval_not_required, s.approval_not_required);
    }

    decide(req, approvers, allow_self_approval, approval_not_required)
}

/// Decision rules in order (spec §4.2). Rule 1 ("approval_not_required
/// explicitly false still falls through to other criteria") is folded into
/// this ordering: an aggregate of `False`/`Undecided` simply skips straight
/// to rule 2/3/4 below.
fn decide(req: &AccessRequest, approvers: HashSet<String>, allow_self_approval: Tri, approval_not_required: Tri) -> Decision {
    if approval_not_required.is_true() {
        return Decision::permit(approvers, allow_self_approval.is_true(), true);
    }
    if allow_self_approval.is_true() && approvers.contains(&req.requester_email) {
        return Decision::permit(approvers, true, false);
    }
    if !approvers.is_empty() {
        return Decision::needs_approval(approvers, allow_self_approval.is_true(), false);
    }
    Decision::deny()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ResourceKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn req(requester: &str, resource: &str, permission_set: Option<&str>) -> AccessRequest {
        AccessRequest {
            request_id: Uuid::new_v4().to_string(),
            requester_email: requester.to_string(),
            resource: resource.to_string(),
            resource_kind: ResourceKind::Account,
            permission_set_name: permission_set.map(str::to_string),
            reason: "test".to_string(),
            duration_hours: 1,
            created_at: Utc::now(),
            state: crate::request::RequestState::Pending,
            approver_email: None,
            chat_thread_ref: "thread-1".to_string(),
        }
    }

    fn resolver(accounts: &[&str], permission_sets: &[&str]) -> FixedResolver {
        FixedResolver {
            accounts: accounts.iter().map(|s| s.to_string()).collect(),
            permission_sets: permission_sets.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn s1_auto_approve_via_approval_not_required() {
        let cfg = Configuration {
            statements: vec![Statement {
                resources: ResourceSet::Any,
                permission_sets: ResourceSet::Explicit(["ReadOnly".to_string()].into()),
                approvers: HashSet::new(),
                allow_self_approval: Tri::Undecided,
                approval_not_required: Tri::True,
            }],
            group_statements: vec![],
        };
        let resolver = resolver(&["111111111111"], &["ReadOnly"]);
        let r = req("a@x", "111111111111", Some("ReadOnly"));
        let d = evaluate(&r, &cfg, &resolver);
        assert_eq!(d.permit, Permit::Auto);
        assert!(d.approvers.is_empty());
    }

    #[test]
    fn s2_self_approval_permitted() {
        let cfg = Configuration {
            statements: vec![Statement {
                resources: ResourceSet::Explicit(["111111111111".to_string()].into()),
                permission_sets: ResourceSet::Explicit(["Billing".to_string()].into()),
                approvers: ["a@x".to_string()].into(),
                allow_self_approval: Tri::True,
                approval_not_required: Tri::Undecided,
            }],
            group_statements: vec![],
        };
        let resolver = resolver(&[], &[]);
        let r = req("a@x", "111111111111", Some("Billing"));
        let d = evaluate(&r, &cfg, &resolver);
        assert_eq!(d.permit, Permit::Auto);
        assert_eq!(d.approvers, ["a@x".to_string()].into());
    }

    #[test]
    fn s3_aggregate_approvers() {
        let cfg = Configuration {
            statements: vec![
                Statement {
                    resources: ResourceSet::Any,
                    permission_sets: ResourceSet::Any,
                    approvers: ["cto@x".to_string()].into(),
                    allow_self_approval: Tri::True,
                    approval_not_required: Tri::Undecided,
                },
                Statement {
                    resources: ResourceSet::Explicit(["222".to_string()].into()),
                    permission_sets: ResourceSet::Explicit(["Admin".to_string()].into()),
                    approvers: ["mgr@x".to_string()].into(),
                    allow_self_approval: Tri::Undecided,
                    approval_not_required: Tri::Undecided,
                },
            ],
            group_statements: vec![],
        };
        let resolver = resolver(&["222"], &["Admin"]);
        let r = req("dev@x", "222", Some("Admin"));
        let d = evaluate(&r, &cfg, &resolver);
        assert_eq!(d.permit, Permit::NeedsApproval);
        assert_eq!(d.approvers, ["cto@x".to_string(), "mgr@x".to_string()].into());
    }

    #[test]
    fn s4_explicit_deny_wins_and_is_unsatisfiable() {
        let cfg = Configuration {
            statements: vec![
                Statement {
                    resources: ResourceSet::Any,
                    permission_sets: ResourceSet::Any,
                    approvers: ["cto@x".to_string()].into(),
                    allow_self_approval: Tri::True,
                    approval_not_required: Tri::Undecided,
                },
                Statement {
                    resources: ResourceSet::Explicit(["333".to_string()].into()),
                    permission_sets: ResourceSet::Explicit(["Admin".to_string()].into()),
                    approvers: HashSet::new(),
                    allow_self_approval: Tri::False,
                    approval_not_required: Tri::Undecided,
                },
            ],
            group_statements: vec![],
        };
        let resolver = resolver(&["333"], &["Admin"]);
        let r = req("cto@x", "333", Some("Admin"));
        let d = evaluate(&r, &cfg, &resolver);
        assert_eq!(d.permit, Permit::NeedsApproval);
        assert_eq!(d.approvers, ["cto@x".to_string()].into());
        assert!(!d.allow_self_approval);
        assert!(d.is_unsatisfiable("cto@x"));
    }

    #[test]
    fn wildcard_monotonicity() {
        let base = Statement {
            resources: ResourceSet::Explicit(["111".to_string()].into()),
            permission_sets: ResourceSet::Explicit(["RO".to_string()].into()),
            approvers: ["a@x".to_string()].into(),
            allow_self_approval: Tri::Undecided,
            approval_not_required: Tri::Undecided,
        };
        let widened = Statement { resources: ResourceSet::Any, ..base.clone() };
        let other = Statement {
            resources: ResourceSet::Explicit(["222".to_string()].into()),
            permission_sets: ResourceSet::Explicit(["RO".to_string()].into()),
            approvers: ["b@x".to_string()].into(),
            allow_self_approval: Tri::Undecided,
            approval_not_required: Tri::Undecided,
        };

        let cfg_concrete = Configuration { statements: vec![base, other.clone()], group_statements: vec![] };
        let cfg_any = Configuration { statements: vec![widened, other], group_statements: vec![] };
        let resolver = resolver(&["111", "222"], &["RO"]);

        let r = req("x@x", "222", Some("RO"));
        let d_concrete = evaluate(&r, &cfg_concrete, &resolver);
        let d_any = evaluate(&r, &cfg_any, &resolver);
        assert!(d_concrete.approvers.is_subset(&d_any.approvers));
    }

    #[test]
    fn no_matching_statement_denies() {
        let cfg = Configuration { statements: vec![], group_statements: vec![] };
        let resolver = resolver(&[], &[]);
        let r = req("a@x", "999", Some("RO"));
        assert_eq!(evaluate(&r, &cfg, &resolver).permit, Permit::Deny);
    }
}

//! C7 — Request state machine (spec §4.7).
//!
//! The state enum follows the lifecycle-enum-with-`to_str`/`from_str` shape
//! used by the pack's `temp_role_elevation.rs` (`ElevationStatus`), a
//! directly analogous temporary-role-elevation domain model, narrowed down
//! to spec §3's exact state set. Persistence is deliberately *not* this
//! module's job (spec §4.7 "no separate request database"): `AccessRequest`
//! is a plain value type that callers round-trip through the chat thread
//! and the audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Account,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    Denied,
    Expired,
    Granted,
    Revoked,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Approved => "approved",
            RequestState::Denied => "denied",
            RequestState::Expired => "expired",
            RequestState::Granted => "granted",
            RequestState::Revoked => "revoked",
            RequestState::Failed => "failed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => RequestState::Pending,
            "approved" => RequestState::Approved,
            "denied" => RequestState::Denied,
            "expired" => RequestState::Expired,
            "granted" => RequestState::Granted,
            "revoked" => RequestState::Revoked,
            "failed" => RequestState::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("duration {requested}h exceeds max_permissions_duration_hours {max}h")]
    DurationExceedsMax { requested: u32, max: u32 },
    #[error("permission_set_name must be present for account requests and absent for group requests")]
    InconsistentResourceKind,
    #[error("decision is unsatisfiable: the only approver is the requester and self-approval is disallowed")]
    Unsatisfiable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    pub request_id: String,
    pub requester_email: String,
    pub resource: String,
    pub resource_kind: ResourceKind,
    pub permission_set_name: Option<String>,
    pub reason: String,
    pub duration_hours: u32,
    pub created_at: DateTime<Utc>,
    pub state: RequestState,
    pub approver_email: Option<String>,
    pub chat_thread_ref: String,
}

impl AccessRequest {
    /// Construct a new request in `Pending` state, enforcing the spec §3
    /// invariants: `duration <= max_duration`, and `permission_set_name`
    /// present iff `resource_kind = account`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: String,
        requester_email: String,
        resource: String,
        resource_kind: ResourceKind,
        permission_set_name: Option<String>,
        reason: String,
        duration_hours: u32,
        max_duration_hours: u32,
        chat_thread_ref: String,
    ) -> Result<Self, RequestError> {
        if duration_hours > max_duration_hours {
            return Err(RequestError::DurationExceedsMax { requested: duration_hours, max: max_duration_hours });
        }
        let kind_ok = match resource_kind {
            ResourceKind::Account => permission_set_name.is_some(),
            ResourceKind::Group => permission_set_name.is_none(),
        };
        if !kind_ok {
            return Err(RequestError::InconsistentResourceKind);
        }
        Ok(Self {
            request_id,
            requester_email,
            resource,
            resource_kind,
            permission_set_name,
            reason,
            duration_hours,
            created_at: Utc::now(),
            state: RequestState::Pending,
            approver_email: None,
            chat_thread_ref,
        })
    }

    /// Whether a `Pending` request should transition to `Expired`, computed
    /// by wall-clock against `created_at` (spec §9 Open Questions
    /// resolution) rather than any process-lifetime timer.
    pub fn is_expired(&self, now: DateTime<Utc>, request_expiration_hours: u32) -> bool {
        self.state == RequestState::Pending
            && now >= self.created_at + chrono::Duration::hours(request_expiration_hours as i64)
    }

    /// `approve(approver)`: Pending -> Approved. No-op (returns `false`)
    /// from any other state, per spec §4.7 "any other event is a no-op".
    pub fn approve(&mut self, approver_email: String) -> bool {
        if self.state != RequestState::Pending {
            return false;
        }
        self.state = RequestState::Approved;
        self.approver_email = Some(approver_email);
        true
    }

    /// `deny(approver)`: Pending -> Denied.
    pub fn deny(&mut self, approver_email: String) -> bool {
        if self.state != RequestState::Pending {
            return false;
        }
        self.state = RequestState::Denied;
        self.approver_email = Some(approver_email);
        true
    }

    /// `expire`: Pending -> Expired.
    pub fn expire(&mut self) -> bool {
        if self.state != RequestState::Pending {
            return false;
        }
        self.state = RequestState::Expired;
        true
    }

    /// Auto-approval transition taken immediately on submit when C2 returns
    /// `permit=auto` (spec §4.7 "submit (implicit)").
    pub fn auto_approve(&mut self) -> bool {
        if self.state != RequestState::Pending {
            return false;
        }
        self.state = RequestState::Approved;
        true
    }

    /// Approved -> Granted (on successful C5 grant) or Approved -> Failed.
    pub fn mark_granted(&mut self) -> bool {
        if self.state != RequestState::Approved {
            return false;
        }
        self.state = RequestState::Granted;
        true
    }

    pub fn mark_failed(&mut self) -> bool {
        if self.state != RequestState::Approved {
            return false;
        }
        self.state = RequestState::Failed;
        true
    }

    /// `revoke_fire`: Granted -> Revoked.
    pub fn mark_revoked(&mut self) -> bool {
        if self.state != RequestState::Granted {
            return false;
        }
        self.state = RequestState::Revoked;
        true
    }
}

/// Renotification cadence while a request is `Pending` (spec §4.7). Pure:
/// C7 only decides *when*; emission is C11's job.
pub fn next_renotify_at(
    created_at: DateTime<Utc>,
    initial_wait_minutes: u32,
    backoff_multiplier: f64,
    attempt: u32,
) -> DateTime<Utc> {
    let minutes = initial_wait_minutes as f64 * backoff_multiplier.powi(attempt as i32);
    created_at + chrono::Duration::milliseconds((minutes * 60_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: ResourceKind, ps: Option<&str>) -> Result<AccessRequest, RequestError> {
        AccessRequest::new(
            "req-1".to_string(),
            "a@x".to_string(),
            "111".to_string(),
            kind,
            ps.map(str::to_string),
            "reason".to_string(),
            4,
            24,
            "thread-1".to_string(),
        )
    }

    #[test]
    fn rejects_duration_over_max() {
        let r = AccessRequest::new(
            "r".into(),
            "a@x".into(),
            "111".into(),
            ResourceKind::Account,
            Some("RO".into()),
            "x".into(),
            48,
            24,
            "t".into(),
        );
        assert!(matches!(r, Err(RequestError::DurationExceedsMax { .. })));
    }

    #[test]
    fn account_requires_permission_set() {
        assert!(sample(ResourceKind::Account, None).is_err());
        assert!(sample(ResourceKind::Account, Some("RO")).is_ok());
    }

    #[test]
    fn group_forbids_permission_set() {
        assert!(sample(ResourceKind::Group, Some("RO")).is_err());
        assert!(sample(ResourceKind::Group, None).is_ok());
    }

    #[test]
    fn transitions_are_idempotent_no_ops_off_path() {
        let mut req = sample(ResourceKind::Account, Some("RO")).unwrap();
        assert!(req.approve("b@x".into()));
        assert_eq!(req.state, RequestState::Approved);
        // Approving again from Approved is a no-op.
        assert!(!req.approve("c@x".into()));
        assert!(!req.deny("c@x".into()));
        assert!(req.mark_granted());
        assert_eq!(req.state, RequestState::Granted);
        assert!(req.mark_revoked());
        assert_eq!(req.state, RequestState::Revoked);
        assert!(!req.mark_revoked());
    }

    #[test]
    fn expires_by_wall_clock_not_process_lifetime() {
        let mut req = sample(ResourceKind::Account, Some("RO")).unwrap();
        req.created_at = Utc::now() - chrono::Duration::hours(25);
        assert!(req.is_expired(Utc::now(), 24));
        assert!(req.expire());
        assert_eq!(req.state, RequestState::Expired);
    }

    #[test]
    fn renotify_backs_off() {
        let t0 = Utc::now();
        let first = next_renotify_at(t0, 30, 2.0, 0);
        let second = next_renotify_at(t0, 30, 2.0, 1);
        assert!(second - first >= chrono::Duration::minutes(29));
    }
}

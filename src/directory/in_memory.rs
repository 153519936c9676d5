use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    Account, AssignmentIdentity, Directory, DirectoryError, DirectoryGroup, DirectoryUser,
    GroupMembership, OperationStatus, PermissionSet,
};

/// In-memory fake used by unit tests across C3/C5/C8/C9, mirroring the
/// `AuditStore`/`InMemoryAuditStore` pattern in the teacher's
/// `security/audit.rs`: same trait, a `RwLock`-guarded in-process store
/// instead of a live SSO control plane.
#[derive(Default)]
pub struct InMemoryDirectory {
    accounts: RwLock<Vec<Account>>,
    permission_sets: RwLock<Vec<PermissionSet>>,
    users: RwLock<Vec<DirectoryUser>>,
    groups: RwLock<Vec<DirectoryGroup>>,
    memberships: RwLock<Vec<GroupMembership>>,
    assignments: RwLock<Vec<AssignmentIdentity>>,
    next_id: AtomicU64,
    /// Operation requests immediately succeed unless seeded here to be
    /// `InProgress` for N polls or to fail, so polling-budget tests are
    /// deterministic.
    pending_ops: RwLock<HashMap<String, u32>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn seed_account(&mut self, account: Account) {
        self.accounts.get_mut().push(account);
    }

    pub fn seed_permission_set(&mut self, ps: PermissionSet) {
        self.permission_sets.get_mut().push(ps);
    }

    pub fn seed_user(&mut self, user: DirectoryUser) {
        self.users.get_mut().push(user);
    }

    pub fn seed_group(&mut self, group: DirectoryGroup) {
        self.groups.get_mut().push(group);
    }

    pub fn seed_membership(&mut self, membership: GroupMembership) {
        self.memberships.get_mut().push(membership);
    }

    pub fn seed_assignment(&mut self, assignment: AssignmentIdentity) {
        self.assignments.get_mut().push(assignment);
    }

    fn next_op_id(&self) -> String {
        format!("op-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn list_accounts(&self) -> Result<Vec<Account>, DirectoryError> {
        Ok(self.accounts.read().await.clone())
    }

    async fn list_permission_sets(&self) -> Result<Vec<PermissionSet>, DirectoryError> {
        Ok(self.permission_sets.read().await.clone())
    }

    async fn describe_permission_set(&self, arn: &str) -> Result<PermissionSet, DirectoryError> {
        self.permission_sets
            .read()
            .await
            .iter()
            .find(|p| p.arn == arn)
            .cloned()
            .ok_or_else(|| DirectoryError::Permanent(format!("unknown permission set: {arn}")))
    }

    async fn resolve_permission_set_arn(&self, name: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.permission_sets.read().await.iter().find(|p| p.name == name).map(|p| p.arn.clone()))
    }

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        Ok(self.users.read().await.clone())
    }

    async fn describe_user_by_email(&self, email: &str) -> Result<Option<DirectoryUser>, DirectoryError> {
        Ok(self.users.read().await.iter().find(|u| u.user_name == email).cloned())
    }

    async fn describe_user_by_id(&self, principal_id: &str) -> Result<Option<DirectoryUser>, DirectoryError> {
        Ok(self.users.read().await.iter().find(|u| u.principal_id == principal_id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>, DirectoryError> {
        Ok(self.groups.read().await.clone())
    }

    async fn describe_group(&self, group_id: &str) -> Result<Option<DirectoryGroup>, DirectoryError> {
        Ok(self.groups.read().await.iter().find(|g| g.group_id == group_id).cloned())
    }

    async fn list_group_memberships(&self, group_id: &str) -> Result<Vec<GroupMembership>, DirectoryError> {
        Ok(self.memberships.read().await.iter().filter(|m| m.group_id == group_id).cloned().collect())
    }

    async fn list_account_assignments(&self, account_id: &str, permission_set_arn: &str) -> Result<Vec<AssignmentIdentity>, DirectoryError> {
        Ok(self
            .assignments
            .read()
            .await
            .iter()
            .filter(|a| a.account_id == account_id && a.permission_set_arn == permission_set_arn)
            .cloned()
            .collect())
    }

    async fn create_account_assignment(&self, identity: &AssignmentIdentity) -> Result<String, DirectoryError> {
        let mut assignments = self.assignments.write().await;
        if !assignments.contains(identity) {
            assignments.push(identity.clone());
        }
        Ok(self.next_op_id())
    }

    async fn describe_assignment_creation(&self, _request_id: &str) -> Result<OperationStatus, DirectoryError> {
        Ok(OperationStatus::Succeeded)
    }

    async fn delete_account_assignment(&self, identity: &AssignmentIdentity) -> Result<Option<String>, DirectoryError> {
        let mut assignments = self.assignments.write().await;
        let before = assignments.len();
        assignments.retain(|a| a != identity);
        if assignments.len() == before {
            return Ok(None);
        }
        Ok(Some(self.next_op_id()))
    }

    async fn describe_assignment_deletion(&self, _request_id: &str) -> Result<OperationStatus, DirectoryError> {
        Ok(OperationStatus::Succeeded)
    }

    async fn create_group_membership(&self, group_id: &str, principal_id: &str) -> Result<String, DirectoryError> {
        let id = self.next_op_id();
        self.memberships.write().await.push(GroupMembership {
            membership_id: id.clone(),
            group_id: group_id.to_string(),
            principal_id: principal_id.to_string(),
        });
        Ok(id)
    }

    async fn delete_group_membership(&self, membership_id: &str) -> Result<bool, DirectoryError> {
        let mut memberships = self.memberships.write().await;
        let before = memberships.len();
        memberships.retain(|m| m.membership_id != membership_id);
        Ok(memberships.len() != before)
    }
}

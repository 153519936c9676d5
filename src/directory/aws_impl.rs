use async_trait::async_trait;

use super::{
    Account, AssignmentIdentity, Directory, DirectoryError, DirectoryGroup, DirectoryUser,
    GroupMembership, OperationStatus, PermissionSet,
};

/// Concrete binding over `aws-sdk-ssoadmin`, `aws-sdk-identitystore` and
/// `aws-sdk-organizations`, wired through `aws-config`'s
/// `behavior-version-latest` loader the way the teacher wires
/// `aws-sdk-s3` in its `drive` feature (`shared/state.rs`).
pub struct AwsDirectory {
    sso_admin: aws_sdk_ssoadmin::Client,
    identity_store: aws_sdk_identitystore::Client,
    organizations: aws_sdk_organizations::Client,
    instance_arn: String,
    identity_store_id: String,
}

impl AwsDirectory {
    pub fn new(
        sso_admin: aws_sdk_ssoadmin::Client,
        identity_store: aws_sdk_identitystore::Client,
        organizations: aws_sdk_organizations::Client,
        instance_arn: impl Into<String>,
        identity_store_id: impl Into<String>,
    ) -> Self {
        Self {
            sso_admin,
            identity_store,
            organizations,
            instance_arn: instance_arn.into(),
            identity_store_id: identity_store_id.into(),
        }
    }

    pub async fn from_env(instance_arn: String, identity_store_id: String, region: String) -> Self {
        let region_provider = aws_config::Region::new(region);
        let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        Self::new(
            aws_sdk_ssoadmin::Client::new(&shared_config),
            aws_sdk_identitystore::Client::new(&shared_config),
            aws_sdk_organizations::Client::new(&shared_config),
            instance_arn,
            identity_store_id,
        )
    }
}

fn classify(err: impl std::fmt::Display) -> DirectoryError {
    let msg = err.to_string();
    if msg.contains("Throttling") || msg.contains("TooManyRequests") || msg.contains("ServiceUnavailable") {
        DirectoryError::Transient(msg)
    } else {
        DirectoryError::Permanent(msg)
    }
}

#[async_trait]
impl Directory for AwsDirectory {
    async fn list_accounts(&self) -> Result<Vec<Account>, DirectoryError> {
        let mut accounts = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self.organizations.list_accounts();
            if let Some(t) = next_token.clone() {
                req = req.next_token(t);
            }
            let output = req.send().await.map_err(classify)?;
            for acct in output.accounts() {
                if let (Some(id), Some(name)) = (acct.id(), acct.name()) {
                    accounts.push(Account { id: id.to_string(), name: name.to_string() });
                }
            }
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(accounts)
    }

    async fn list_permission_sets(&self) -> Result<Vec<PermissionSet>, DirectoryError> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self.sso_admin.list_permission_sets().instance_arn(&self.instance_arn);
            if let Some(t) = next_token.clone() {
                req = req.next_token(t);
            }
            let output = req.send().await.map_err(classify)?;
            arns.extend(output.permission_sets().iter().map(str::to_string));
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        let mut sets = Vec::with_capacity(arns.len());
        for arn in arns {
            sets.push(self.describe_permission_set(&arn).await?);
        }
        Ok(sets)
    }

    async fn describe_permission_set(&self, arn: &str) -> Result<PermissionSet, DirectoryError> {
        let output = self
            .sso_admin
            .describe_permission_set()
            .instance_arn(&self.instance_arn)
            .permission_set_arn(arn)
            .send()
            .await
            .map_err(classify)?;
        let name = output
            .permission_set()
            .and_then(|p| p.name())
            .ok_or_else(|| DirectoryError::Permanent(format!("permission set {arn} missing name")))?;
        Ok(PermissionSet { arn: arn.to_string(), name: name.to_string() })
    }

    async fn resolve_permission_set_arn(&self, name: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.list_permission_sets().await?.into_iter().find(|p| p.name == name).map(|p| p.arn))
    }

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        let mut users = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self.identity_store.list_users().identity_store_id(&self.identity_store_id);
            if let Some(t) = next_token.clone() {
                req = req.next_token(t);
            }
            let output = req.send().await.map_err(classify)?;
            for u in output.users() {
                users.push(user_from_sdk(u));
            }
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(users)
    }

    async fn describe_user_by_email(&self, email: &str) -> Result<Option<DirectoryUser>, DirectoryError> {
        let filter = aws_sdk_identitystore::types::Filter::builder()
            .attribute_path("UserName")
            .attribute_value(email)
            .build()
            .map_err(classify)?;
        let output = self
            .identity_store
            .list_users()
            .identity_store_id(&self.identity_store_id)
            .filters(filter)
            .send()
            .await
            .map_err(classify)?;
        Ok(output.users().first().map(user_from_sdk))
    }

    async fn describe_user_by_id(&self, principal_id: &str) -> Result<Option<DirectoryUser>, DirectoryError> {
        match self
            .identity_store
            .describe_user()
            .identity_store_id(&self.identity_store_id)
            .user_id(principal_id)
            .send()
            .await
        {
            Ok(output) => Ok(Some(DirectoryUser {
                principal_id: principal_id.to_string(),
                user_name: output.user_name().unwrap_or_default().to_string(),
                email: output
                    .emails()
                    .first()
                    .and_then(|e| e.value())
                    .unwrap_or_default()
                    .to_string(),
                attributes: Default::default(),
            })),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("ResourceNotFound") {
                    Ok(None)
                } else {
                    Err(classify(msg))
                }
            }
        }
    }

    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>, DirectoryError> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self.identity_store.list_groups().identity_store_id(&self.identity_store_id);
            if let Some(t) = next_token.clone() {
                req = req.next_token(t);
            }
            let output = req.send().await.map_err(classify)?;
            for g in output.groups() {
                if let Some(id) = g.group_id() {
                    groups.push(DirectoryGroup {
                        group_id: id.to_string(),
                        display_name: g.display_name().unwrap_or_default().to_string(),
                    });
                }
            }
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(groups)
    }

    async fn describe_group(&self, group_id: &str) -> Result<Option<DirectoryGroup>, DirectoryError> {
        match self
            .identity_store
            .describe_group()
            .identity_store_id(&self.identity_store_id)
            .group_id(group_id)
            .send()
            .await
        {
            Ok(output) => Ok(Some(DirectoryGroup {
                group_id: group_id.to_string(),
                display_name: output.display_name().unwrap_or_default().to_string(),
            })),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("ResourceNotFound") {
                    Ok(None)
                } else {
                    Err(classify(msg))
                }
            }
        }
    }

    async fn list_group_memberships(&self, group_id: &str) -> Result<Vec<GroupMembership>, DirectoryError> {
        let mut memberships = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self
                .identity_store
                .list_group_memberships()
                .identity_store_id(&self.identity_store_id)
                .group_id(group_id);
            if let Some(t) = next_token.clone() {
                req = req.next_token(t);
            }
            let output = req.send().await.map_err(classify)?;
            for m in output.group_memberships() {
                if let (Some(mid), Some(member)) = (m.membership_id(), m.member_id()) {
                    let principal_id = member.as_user_id().cloned().unwrap_or_default();
                    memberships.push(GroupMembership {
                        membership_id: mid.to_string(),
                        group_id: group_id.to_string(),
                        principal_id,
                    });
                }
            }
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(memberships)
    }

    async fn list_account_assignments(&self, account_id: &str, permission_set_arn: &str) -> Result<Vec<AssignmentIdentity>, DirectoryError> {
        let mut assignments = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self
                .sso_admin
                .list_account_assignments()
                .instance_arn(&self.instance_arn)
                .account_id(account_id)
                .permission_set_arn(permission_set_arn);
            if let Some(t) = next_token.clone() {
                req = req.next_token(t);
            }
            let output = req.send().await.map_err(classify)?;
            for a in output.account_assignments() {
                if matches!(a.principal_type(), Some(aws_sdk_ssoadmin::types::PrincipalType::User)) {
                    if let Some(principal_id) = a.principal_id() {
                        assignments.push(AssignmentIdentity {
                            principal_id: principal_id.to_string(),
                            account_id: account_id.to_string(),
                            permission_set_arn: permission_set_arn.to_string(),
                        });
                    }
                }
            }
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(assignments)
    }

    async fn create_account_assignment(&self, identity: &AssignmentIdentity) -> Result<String, DirectoryError> {
        let output = self
            .sso_admin
            .create_account_assignment()
            .instance_arn(&self.instance_arn)
            .target_id(&identity.account_id)
            .target_type(aws_sdk_ssoadmin::types::TargetType::AwsAccount)
            .permission_set_arn(&identity.permission_set_arn)
            .principal_id(&identity.principal_id)
            .principal_type(aws_sdk_ssoadmin::types::PrincipalType::User)
            .send()
            .await
            .map_err(classify)?;
        output
            .account_assignment_creation_status()
            .and_then(|s| s.request_id())
            .map(str::to_string)
            .ok_or_else(|| DirectoryError::Permanent("create_account_assignment: no request id".to_string()))
    }

    async fn describe_assignment_creation(&self, request_id: &str) -> Result<OperationStatus, DirectoryError> {
        let output = self
            .sso_admin
            .describe_account_assignment_creation_status()
            .instance_arn(&self.instance_arn)
            .account_assignment_creation_request_id(request_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(status_from_sdk(output.account_assignment_creation_status().and_then(|s| s.status())))
    }

    async fn delete_account_assignment(&self, identity: &AssignmentIdentity) -> Result<Option<String>, DirectoryError> {
        let result = self
            .sso_admin
            .delete_account_assignment()
            .instance_arn(&self.instance_arn)
            .target_id(&identity.account_id)
            .target_type(aws_sdk_ssoadmin::types::TargetType::AwsAccount)
            .permission_set_arn(&identity.permission_set_arn)
            .principal_id(&identity.principal_id)
            .principal_type(aws_sdk_ssoadmin::types::PrincipalType::User)
            .send()
            .await;
        match result {
            Ok(output) => output
                .account_assignment_deletion_status()
                .and_then(|s| s.request_id())
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| DirectoryError::Permanent("delete_account_assignment: no request id".to_string())),
            // Idempotency: "not found" on deletion is success (spec §4.5,
            // §9) and is reported as "nothing to delete" so the executor
            // can skip the audit write and notification.
            Err(e) if e.to_string().contains("ResourceNotFound") => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    async fn describe_assignment_deletion(&self, request_id: &str) -> Result<OperationStatus, DirectoryError> {
        let output = self
            .sso_admin
            .describe_account_assignment_deletion_status()
            .instance_arn(&self.instance_arn)
            .account_assignment_deletion_request_id(request_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(status_from_sdk(output.account_assignment_deletion_status().and_then(|s| s.status())))
    }

    async fn create_group_membership(&self, group_id: &str, principal_id: &str) -> Result<String, DirectoryError> {
        let member_id = aws_sdk_identitystore::types::MemberId::UserId(principal_id.to_string());
        match self
            .identity_store
            .create_group_membership()
            .identity_store_id(&self.identity_store_id)
            .group_id(group_id)
            .member_id(member_id)
            .send()
            .await
        {
            Ok(output) => output
                .membership_id()
                .map(str::to_string)
                .ok_or_else(|| DirectoryError::Permanent("create_group_membership: no membership id".to_string())),
            Err(e) if e.to_string().contains("ConflictException") => {
                // Idempotency: already-exists on create is success (spec §9).
                self.list_group_memberships(group_id)
                    .await?
                    .into_iter()
                    .find(|m| m.principal_id == principal_id)
                    .map(|m| m.membership_id)
                    .ok_or_else(|| DirectoryError::Permanent("membership conflict but not found on re-list".to_string()))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete_group_membership(&self, membership_id: &str) -> Result<bool, DirectoryError> {
        match self
            .identity_store
            .delete_group_membership()
            .membership_id(membership_id)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            // Idempotency: "not found" on deletion is success (spec §4.5,
            // §9), reported as "nothing removed".
            Err(e) if e.to_string().contains("ResourceNotFound") => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }
}

fn user_from_sdk(u: &aws_sdk_identitystore::types::User) -> DirectoryUser {
    DirectoryUser {
        principal_id: u.user_id().unwrap_or_default().to_string(),
        user_name: u.user_name().unwrap_or_default().to_string(),
        email: u.emails().first().and_then(|e| e.value()).unwrap_or_default().to_string(),
        attributes: Default::default(),
    }
}

fn status_from_sdk(status: Option<&aws_sdk_ssoadmin::types::StatusValues>) -> OperationStatus {
    use aws_sdk_ssoadmin::types::StatusValues;
    match status {
        Some(StatusValues::Succeeded) => OperationStatus::Succeeded,
        Some(StatusValues::Failed) => OperationStatus::Failed("assignment operation failed".to_string()),
        Some(StatusValues::InProgress) | None => OperationStatus::InProgress,
        Some(other) => OperationStatus::Failed(format!("unknown status: {other:?}")),
    }
}

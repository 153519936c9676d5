//! C1 — Config loader & validator (spec §4.1).
//!
//! Two distinct configuration surfaces are deliberately kept apart, per
//! [AMBIENT-CONFIG]: `EngineConfig` is the immutable, environment-sourced
//! set of runtime knobs read exactly once at process start (figment
//! layering a TOML default under `SSOELEV_`-prefixed env vars, the way the
//! teacher already carries `figment` in its dependency table); `Configuration`
//! is the hot-reloadable statement document fetched through the object
//! store on every `intake` invocation.

use std::collections::HashSet;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::objectstore::{ObjectStore, ObjectStoreError};

/// Three-valued flag used by [`Statement`]/[`GroupStatement`] attributes
/// that combine by "any true unless an explicit false appears" (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tri {
    True,
    False,
    #[default]
    Undecided,
}

impl Tri {
    /// Combine a running aggregate with one more matching statement's
    /// value. An explicit `False` anywhere wins; otherwise any `True`
    /// wins; otherwise the aggregate stays `Undecided`.
    pub fn fold(acc: Tri, next: Tri) -> Tri {
        match (acc, next) {
            (Tri::False, _) | (_, Tri::False) => Tri::False,
            (Tri::True, _) | (_, Tri::True) => Tri::True,
            (Tri::Undecided, Tri::Undecided) => Tri::Undecided,
        }
    }

    pub fn is_true(self) -> bool {
        matches!(self, Tri::True)
    }
}

/// A resource/permission-set match set: either every valid value in the
/// environment (`ANY`, spelled `"*"` in the JSON document) or an explicit
/// set of identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSet {
    Any,
    Explicit(HashSet<String>),
}

impl ResourceSet {
    /// `resolver_universe` is the full set of valid values to expand `Any`
    /// against (e.g. every known account id). Only used for membership
    /// tests; callers never materialize the expansion.
    pub fn matches(&self, value: &str, resolver_universe: &HashSet<String>) -> bool {
        match self {
            ResourceSet::Any => resolver_universe.contains(value),
            ResourceSet::Explicit(set) => set.contains(value),
        }
    }
}

/// Account-level statement (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub resources: ResourceSet,
    pub permission_sets: ResourceSet,
    pub approvers: HashSet<String>,
    pub allow_self_approval: Tri,
    pub approval_not_required: Tri,
}

/// Group-level statement. `resources` is always explicit; groups have no
/// wildcard per spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatement {
    pub resources: HashSet<String>,
    pub approvers: HashSet<String>,
    pub allow_self_approval: Tri,
    pub approval_not_required: Tri,
}

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub statements: Vec<Statement>,
    pub group_statements: Vec<GroupStatement>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed configuration document: {0}")]
    Malformed(String),
    #[error("unresolvable {kind} reference: {value}")]
    UnresolvedReference { kind: &'static str, value: String },
    #[error("both the object-store config and the legacy env config are set; pick one")]
    ConflictingSources,
    #[error("object store error while loading configuration: {0}")]
    Store(#[from] ObjectStoreError),
}

/// A read-only capability the loader consults to validate group references
/// at load time (spec §4.1's "every group id referenced ... is
/// resolvable"). Implemented by the directory adapter in production and by
/// a fixed set in tests.
pub trait KnownGroups {
    fn is_known_group(&self, group_id: &str) -> bool;
}

/// Production `KnownGroups`: a snapshot fetched once from the directory
/// before validating the statement document, per [AMBIENT-CONFIG] (C1
/// config loading never itself performs directory I/O lazily inline; the
/// caller materializes this set up front).
pub struct KnownGroupSet(pub HashSet<String>);

impl KnownGroups for KnownGroupSet {
    fn is_known_group(&self, group_id: &str) -> bool {
        self.0.contains(group_id)
    }
}

/// Flexible string-or-list deserialization used throughout the raw JSON
/// document, per spec §4.1: "Resource, PermissionSet, Approvers may each be
/// a single string or a list."
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s],
            StringOrList::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStatement {
    #[serde(default, rename = "Resource")]
    resource: Option<StringOrList>,
    #[serde(default, rename = "PermissionSet")]
    permission_set: Option<StringOrList>,
    #[serde(default, rename = "Approvers")]
    approvers: Option<StringOrList>,
    #[serde(default, rename = "AllowSelfApproval")]
    allow_self_approval: Option<bool>,
    #[serde(default, rename = "ApprovalIsNotRequired")]
    approval_not_required: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawGroupStatement {
    #[serde(default, rename = "Resource")]
    resource: Option<StringOrList>,
    #[serde(default, rename = "Approvers")]
    approvers: Option<StringOrList>,
    #[serde(default, rename = "AllowSelfApproval")]
    allow_self_approval: Option<bool>,
    #[serde(default, rename = "ApprovalIsNotRequired")]
    approval_not_required: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    statements: Vec<RawStatement>,
    #[serde(default)]
    group_statements: Vec<RawGroupStatement>,
}

fn tri_from_opt(v: Option<bool>) -> Tri {
    match v {
        Some(true) => Tri::True,
        Some(false) => Tri::False,
        None => Tri::Undecided,
    }
}

fn resource_set_from_raw(raw: Option<StringOrList>) -> ResourceSet {
    let values = raw.map(StringOrList::into_vec).unwrap_or_default();
    if values.iter().any(|v| v == "*") {
        ResourceSet::Any
    } else {
        ResourceSet::Explicit(values.into_iter().collect())
    }
}

fn is_syntactically_valid_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

/// Parse and validate a raw JSON document into a [`Configuration`].
/// Unresolvable group references are dropped with a `tracing::warn!`, never
/// a hard abort (spec §4.1). Malformed documents (bad JSON, non-boolean
/// flags, non-email approvers) are a hard `ConfigError::Malformed`.
pub fn parse_and_validate(
    raw_json: &[u8],
    known_groups: &dyn KnownGroups,
) -> Result<Configuration, ConfigError> {
    let doc: RawDocument =
        serde_json::from_slice(raw_json).map_err(|e| ConfigError::Malformed(e.to_string()))?;

    let mut statements = Vec::with_capacity(doc.statements.len());
    for raw in doc.statements {
        let approvers: HashSet<String> = raw
            .approvers
            .map(StringOrList::into_vec)
            .unwrap_or_default()
            .into_iter()
            .collect();
        for email in &approvers {
            if !is_syntactically_valid_email(email) {
                return Err(ConfigError::Malformed(format!("invalid approver email: {email}")));
            }
        }
        statements.push(Statement {
            resources: resource_set_from_raw(raw.resource),
            permission_sets: resource_set_from_raw(raw.permission_set),
            approvers,
            allow_self_approval: tri_from_opt(raw.allow_self_approval),
            approval_not_required: tri_from_opt(raw.approval_not_required),
        });
    }

    let mut group_statements = Vec::with_capacity(doc.group_statements.len());
    for raw in doc.group_statements {
        let approvers: HashSet<String> = raw
            .approvers
            .map(StringOrList::into_vec)
            .unwrap_or_default()
            .into_iter()
            .collect();
        for email in &approvers {
            if !is_syntactically_valid_email(email) {
                return Err(ConfigError::Malformed(format!("invalid approver email: {email}")));
            }
        }
        let requested: Vec<String> = raw.resource.map(StringOrList::into_vec).unwrap_or_default();
        let mut resources = HashSet::new();
        for group_id in requested {
            if known_groups.is_known_group(&group_id) {
                resources.insert(group_id);
            } else {
                tracing::warn!(group_id = %group_id, "skipping group statement: unresolvable group reference");
            }
        }
        if resources.is_empty() {
            continue;
        }
        group_statements.push(GroupStatement {
            resources,
            approvers,
            allow_self_approval: tri_from_opt(raw.allow_self_approval),
            approval_not_required: tri_from_opt(raw.approval_not_required),
        });
    }

    Ok(Configuration { statements, group_statements })
}

/// Fetch and parse the statement document from the well-known object-store
/// key `config/approval-config.json` (spec §6).
pub async fn load_from_object_store(
    store: &dyn ObjectStore,
    key: &str,
    known_groups: &dyn KnownGroups,
) -> Result<Configuration, ConfigError> {
    let bytes = store
        .get(key)
        .await?
        .ok_or_else(|| ConfigError::Malformed(format!("config object not found: {key}")))?;
    parse_and_validate(&bytes, known_groups)
}

/// The deprecated `STATEMENTS`/`GROUP_STATEMENTS` environment-variable
/// loading path (spec §9 Open Questions), implemented but disabled by
/// default. Returns `Ok(None)` when not opted in via
/// `SSOELEV_ENABLE_LEGACY_ENV_CONFIG=true`.
pub fn legacy_env_source(known_groups: &dyn KnownGroups) -> Result<Option<Configuration>, ConfigError> {
    let enabled = std::env::var("SSOELEV_ENABLE_LEGACY_ENV_CONFIG")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !enabled {
        return Ok(None);
    }
    let statements = std::env::var("STATEMENTS").unwrap_or_default();
    let group_statements = std::env::var("GROUP_STATEMENTS").unwrap_or_default();
    let combined = format!(
        "{{\"statements\":{},\"group_statements\":{}}}",
        if statements.is_empty() { "[]" } else { &statements },
        if group_statements.is_empty() { "[]" } else { &group_statements },
    );
    Ok(Some(parse_and_validate(combined.as_bytes(), known_groups)?))
}

/// Load the configuration, enforcing the "pick one, don't mix" rule: if the
/// legacy env path is enabled *and* the object-store document is also
/// reachable, this is a hard configuration error rather than a silent
/// precedence choice.
pub async fn load(
    store: &dyn ObjectStore,
    key: &str,
    known_groups: &dyn KnownGroups,
) -> Result<Configuration, ConfigError> {
    let legacy = legacy_env_source(known_groups)?;
    let object_store_present = store.get(key).await?.is_some();

    match (legacy, object_store_present) {
        (Some(_), true) => Err(ConfigError::ConflictingSources),
        (Some(cfg), false) => Ok(cfg),
        (None, _) => load_from_object_store(store, key, known_groups).await,
    }
}

#[derive(Debug, Deserialize)]
struct RawSyncRule {
    group: String,
    #[serde(default)]
    conditions: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawSyncPolicy {
    Warn,
    Remove,
}

#[derive(Debug, Deserialize)]
struct RawSyncDocument {
    #[serde(default)]
    managed_groups: Vec<String>,
    #[serde(default)]
    rules: Vec<RawSyncRule>,
    policy: RawSyncPolicy,
}

/// Parse the attribute-sync document (spec §4.9 "Inputs: `managed_groups`
/// ..., `rules` ..., `policy`"). `group_name_to_id` resolves the
/// human-authored group names the document carries to directory ids, the
/// same way group statements resolve references in [`parse_and_validate`];
/// unresolvable names are dropped with a `tracing::warn!` rather than
/// failing the whole document.
pub fn parse_sync_config(
    raw_json: &[u8],
    group_name_to_id: &std::collections::HashMap<String, String>,
) -> Result<crate::syncer::SyncConfig, ConfigError> {
    let doc: RawSyncDocument =
        serde_json::from_slice(raw_json).map_err(|e| ConfigError::Malformed(e.to_string()))?;

    let mut managed_groups = Vec::new();
    for name in doc.managed_groups {
        match group_name_to_id.get(&name) {
            Some(id) => managed_groups.push((id.clone(), name)),
            None => tracing::warn!(group_name = %name, "skipping managed group: unresolvable group reference"),
        }
    }

    let mut rules = Vec::with_capacity(doc.rules.len());
    for raw in doc.rules {
        rules.push(crate::syncer::AttributeMappingRule {
            group_ref: raw.group,
            conditions: raw.conditions.into_iter().collect(),
        });
    }

    let policy = match doc.policy {
        RawSyncPolicy::Warn => crate::syncer::SyncPolicy::Warn,
        RawSyncPolicy::Remove => crate::syncer::SyncPolicy::Remove,
    };

    Ok(crate::syncer::SyncConfig { managed_groups, rules, policy })
}

/// Fetch and parse the attribute-sync document from the well-known
/// object-store key `config/attribute-sync-config.json`.
pub async fn load_sync_config_from_object_store(
    store: &dyn ObjectStore,
    key: &str,
    group_name_to_id: &std::collections::HashMap<String, String>,
) -> Result<crate::syncer::SyncConfig, ConfigError> {
    let bytes = store
        .get(key)
        .await?
        .ok_or_else(|| ConfigError::Malformed(format!("config object not found: {key}")))?;
    parse_sync_config(&bytes, group_name_to_id)
}

/// Immutable environment knobs, loaded once at process start (spec §6 +
/// [AMBIENT-CONFIG]). `forbid re-reading of environment at runtime` (spec
/// §9) is enforced simply by never exposing a reload function: callers hold
/// an owned value for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_permissions_duration_hours: u32,
    pub request_expiration_hours: u32,
    pub approver_renotification_initial_wait_minutes: u32,
    pub approver_renotification_backoff_multiplier: f64,
    #[serde(default)]
    pub secondary_fallback_email_domains: Vec<String>,
    #[serde(default)]
    pub send_dm_if_user_not_in_channel: bool,
    #[serde(default)]
    pub post_update_on_revoke: bool,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    pub schedule_group_name: String,
    pub audit_prefix: String,
    pub config_bucket: String,
    pub audit_bucket: String,
    pub aws_region: String,
    pub sso_instance_arn: String,
    pub identity_store_id: String,
    #[serde(default)]
    pub chat_webhook_url: String,
    #[serde(default)]
    pub chat_signing_secret: String,
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_requests_per_second: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    /// Standard cron expression describing the cadence the deployment's own
    /// scheduler is expected to invoke the `reconciler` binary at. Not
    /// consumed here to drive scheduling (spec §4.8 leaves the cadence to
    /// the deployment); validated at startup so a typo surfaces immediately
    /// rather than silently never firing.
    #[serde(default)]
    pub reconciler_cron_expr: Option<String>,
}

fn default_rate_limit_rps() -> u32 {
    5
}

fn default_rate_limit_burst() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_permissions_duration_hours: 24,
            request_expiration_hours: 24,
            approver_renotification_initial_wait_minutes: 30,
            approver_renotification_backoff_multiplier: 2.0,
            secondary_fallback_email_domains: Vec::new(),
            send_dm_if_user_not_in_channel: false,
            post_update_on_revoke: false,
            cache_enabled: true,
            schedule_group_name: "sso-elevator".to_string(),
            audit_prefix: "audit".to_string(),
            config_bucket: String::new(),
            audit_bucket: String::new(),
            aws_region: "us-east-1".to_string(),
            sso_instance_arn: String::new(),
            identity_store_id: String::new(),
            chat_webhook_url: String::new(),
            chat_signing_secret: String::new(),
            rate_limit_enabled: true,
            rate_limit_requests_per_second: default_rate_limit_rps(),
            rate_limit_burst: default_rate_limit_burst(),
            reconciler_cron_expr: None,
        }
    }
}

impl EngineConfig {
    /// Layer a `config.toml` default (if present) under
    /// `SSOELEV_`-prefixed environment variables, the way the teacher's
    /// `figment` dependency is meant to be used.
    pub fn load() -> Result<Self, figment::Error> {
        let _ = dotenvy::dotenv();
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("SSOELEV_"))
            .extract()
    }

    /// Parse `reconciler_cron_expr` (if set) and return the next time it
    /// would fire, the same fail-fast validation the teacher's
    /// `TaskScheduler::schedule_task` does with `cron::Schedule::from_str`
    /// before accepting a cadence.
    pub fn next_reconciler_run(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>, String> {
        let Some(expr) = &self.reconciler_cron_expr else {
            return Ok(None);
        };
        let schedule: cron::Schedule = expr.parse().map_err(|e| format!("invalid reconciler_cron_expr {expr:?}: {e}"))?;
        Ok(schedule.upcoming(chrono::Utc).take(1).next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGroups(HashSet<String>);
    impl KnownGroups for FixedGroups {
        fn is_known_group(&self, group_id: &str) -> bool {
            self.0.contains(group_id)
        }
    }

    #[test]
    fn tri_fold_explicit_false_dominates() {
        assert_eq!(Tri::fold(Tri::True, Tri::False), Tri::False);
        assert_eq!(Tri::fold(Tri::False, Tri::True), Tri::False);
        assert_eq!(Tri::fold(Tri::Undecided, Tri::True), Tri::True);
        assert_eq!(Tri::fold(Tri::Undecided, Tri::Undecided), Tri::Undecided);
    }

    #[test]
    fn parses_wildcard_and_string_or_list() {
        let known = FixedGroups(HashSet::new());
        let json = br#"{
            "statements": [
                {"Resource": "*", "PermissionSet": "ReadOnly", "ApprovalIsNotRequired": true},
                {"Resource": ["111", "222"], "PermissionSet": "Admin", "Approvers": "a@x.com"}
            ],
            "group_statements": []
        }"#;
        let cfg = parse_and_validate(json, &known).unwrap();
        assert_eq!(cfg.statements.len(), 2);
        assert_eq!(cfg.statements[0].resources, ResourceSet::Any);
        assert_eq!(cfg.statements[0].approval_not_required, Tri::True);
        match &cfg.statements[1].resources {
            ResourceSet::Explicit(set) => assert!(set.contains("111") && set.contains("222")),
            _ => panic!("expected explicit set"),
        }
    }

    #[test]
    fn rejects_malformed_document() {
        let known = FixedGroups(HashSet::new());
        let json = br#"{"statements": [{"Resource": "*", "Approvers": "not-an-email"}]}"#;
        assert!(parse_and_validate(json, &known).is_err());
    }

    #[test]
    fn skips_unresolvable_group_reference() {
        let mut known = HashSet::new();
        known.insert("g-real".to_string());
        let known = FixedGroups(known);
        let json = br#"{"statements": [], "group_statements": [
            {"Resource": ["g-real", "g-ghost"], "Approvers": "a@x.com"}
        ]}"#;
        let cfg = parse_and_validate(json, &known).unwrap();
        assert_eq!(cfg.group_statements.len(), 1);
        assert_eq!(cfg.group_statements[0].resources.len(), 1);
        assert!(cfg.group_statements[0].resources.contains("g-real"));
    }

    #[test]
    fn no_configured_cron_is_not_an_error() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.next_reconciler_run().unwrap(), None);
    }

    #[test]
    fn valid_cron_yields_a_future_run_time() {
        let mut cfg = EngineConfig::default();
        cfg.reconciler_cron_expr = Some("0 0 0 * * *".to_string());
        assert!(cfg.next_reconciler_run().unwrap().is_some());
    }

    #[test]
    fn malformed_cron_is_rejected_at_load_time() {
        let mut cfg = EngineConfig::default();
        cfg.reconciler_cron_expr = Some("not a cron expression".to_string());
        assert!(cfg.next_reconciler_run().is_err());
    }
}

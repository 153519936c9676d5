//! Shared process wiring for the `intake` binary (spec §6 inbound chat
//! front-end). Follows the teacher's `shared::state::AppState` shape: one
//! struct holding every adapter behind `Arc`, a hand-rolled `Clone` (axum's
//! `State` extractor requires it), and a `Debug` impl that never prints
//! secrets.
//!
//! The other three process entry points (`revoke-worker`, `reconciler`,
//! `syncer`) are one-shot batch invocations (spec §5 "Multi-process by
//! deployment: independent invocations") and build their adapters directly
//! in `main()` instead of sharing this struct, since they have no HTTP
//! router to thread state through.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::audit::{AuditStore, S3AuditStore};
use crate::config::{Configuration, EngineConfig};
use crate::directory::{AwsDirectory, Directory};
use crate::notify::{ChatClient, ReqwestChatClient};
use crate::objectstore::{ObjectStore, S3ObjectStore};
use crate::request::AccessRequest;
use crate::scheduler::{AwsScheduler, Scheduler};

pub struct EngineState {
    pub engine_config: EngineConfig,
    pub directory: Arc<dyn Directory>,
    pub config_store: Arc<dyn ObjectStore>,
    pub audit: Arc<dyn AuditStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub chat: Arc<dyn ChatClient>,
    /// Hot-reloadable statement document (spec §4.1), re-fetched on a
    /// cadence the caller controls; never re-read implicitly mid-request.
    pub configuration: Arc<RwLock<Configuration>>,
    /// In-flight requests, keyed by `request_id` (spec §4.7 "in-flight
    /// state may live in memory"; authoritative state is the chat thread +
    /// audit log, this is a process-local cache of it).
    pub pending_requests: Arc<RwLock<HashMap<String, AccessRequest>>>,
}

impl Clone for EngineState {
    fn clone(&self) -> Self {
        Self {
            engine_config: self.engine_config.clone(),
            directory: Arc::clone(&self.directory),
            config_store: Arc::clone(&self.config_store),
            audit: Arc::clone(&self.audit),
            scheduler: Arc::clone(&self.scheduler),
            chat: Arc::clone(&self.chat),
            configuration: Arc::clone(&self.configuration),
            pending_requests: Arc::clone(&self.pending_requests),
        }
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("aws_region", &self.engine_config.aws_region)
            .field("cache_enabled", &self.engine_config.cache_enabled)
            .finish_non_exhaustive()
    }
}

impl EngineState {
    pub async fn bootstrap(engine_config: EngineConfig) -> anyhow::Result<Self> {
        let directory = AwsDirectory::from_env(
            engine_config.sso_instance_arn.clone(),
            engine_config.identity_store_id.clone(),
            engine_config.aws_region.clone(),
        )
        .await;
        let directory: Arc<dyn Directory> = Arc::new(directory);

        let shared_aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(engine_config.aws_region.clone()))
            .load()
            .await;

        let config_store: Arc<dyn ObjectStore> =
            Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&shared_aws_config), engine_config.config_bucket.clone()));
        let audit_store: Arc<dyn ObjectStore> =
            Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&shared_aws_config), engine_config.audit_bucket.clone()));
        let audit: Arc<dyn AuditStore> = Arc::new(S3AuditStore::new(audit_store, engine_config.audit_prefix.clone()));

        let scheduler_client = aws_sdk_scheduler::Client::new(&shared_aws_config);
        let scheduler: Arc<dyn Scheduler> = Arc::new(AwsScheduler::new(
            scheduler_client,
            engine_config.schedule_group_name.clone(),
            format!("arn:aws:lambda:{}:revoke-worker", engine_config.aws_region),
            format!("arn:aws:iam::scheduler/{}", engine_config.schedule_group_name),
        ));

        let chat: Arc<dyn ChatClient> = Arc::new(
            ReqwestChatClient::new(engine_config.chat_webhook_url.clone(), None)
                .with_signing_secret(engine_config.chat_signing_secret.clone()),
        );

        let known_group_ids: std::collections::HashSet<String> =
            directory.list_groups().await?.into_iter().map(|g| g.group_id).collect();
        let known_groups = crate::config::KnownGroupSet(known_group_ids);
        let configuration = crate::config::load(config_store.as_ref(), "config/approval-config.json", &known_groups).await?;

        Ok(Self {
            engine_config,
            directory,
            config_store,
            audit,
            scheduler,
            chat,
            configuration: Arc::new(RwLock::new(configuration)),
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

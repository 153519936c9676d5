//! `syncer` — batch entry point for spec §4.9. Reads the attribute-sync
//! document from the config object store (sibling to C1's statement
//! document) and runs one pass of [`sso_elevator::syncer::sync`].

use std::collections::HashMap;

use sso_elevator::config::{self, EngineConfig};
use sso_elevator::state::EngineState;
use sso_elevator::syncer;
use sso_elevator::telemetry::ProcessStatus;

const SYNC_CONFIG_KEY: &str = "config/attribute-sync-config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sso_elevator::telemetry::init("syncer");
    let engine_config = EngineConfig::load()?;
    let state = EngineState::bootstrap(engine_config).await?;

    let group_name_to_id: HashMap<String, String> =
        state.directory.list_groups().await?.into_iter().map(|g| (g.display_name, g.group_id)).collect();

    let sync_config = config::load_sync_config_from_object_store(state.config_store.as_ref(), SYNC_CONFIG_KEY, &group_name_to_id).await?;

    let result = syncer::sync(
        state.directory.as_ref(),
        state.audit.as_ref(),
        state.chat.as_ref(),
        &sync_config.managed_groups,
        &sync_config.rules,
        sync_config.policy,
    )
    .await;

    let mut errors = Vec::new();
    match &result {
        Ok(run) => {
            tracing::info!(added = run.added, removed = run.removed, warned = run.warned, "sync complete");
            errors.extend(run.errors.iter().cloned());
        }
        Err(e) => {
            tracing::error!(error = %e, "sync failed");
            errors.push(e.to_string());
        }
    }

    let status = ProcessStatus::from_errors(errors);
    status.log_and_print("syncer");
    if !status.ok {
        std::process::exit(1);
    }
    Ok(())
}

//! `reconciler` — batch entry point for spec §4.8's two cadences. Mode is
//! selected by `SSOELEV_RECONCILE_MODE` (`warn` or `revoke`, default
//! `warn`), matching the teacher's pattern of a single binary whose
//! behavior is switched by an environment knob rather than two near-
//! identical binaries.

use std::collections::{HashMap, HashSet};

use sso_elevator::config::EngineConfig;
use sso_elevator::reconciler::{self, ReconcileMode};
use sso_elevator::state::EngineState;
use sso_elevator::telemetry::ProcessStatus;

fn mode_from_env() -> ReconcileMode {
    match std::env::var("SSOELEV_RECONCILE_MODE").map(|v| v.to_ascii_lowercase()) {
        Ok(v) if v == "revoke" => ReconcileMode::Revoke,
        _ => ReconcileMode::Warn,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sso_elevator::telemetry::init("reconciler");
    let engine_config = EngineConfig::load()?;
    match engine_config.next_reconciler_run() {
        Ok(Some(next)) => tracing::info!(%next, "configured reconciler cadence"),
        Ok(None) => {}
        Err(e) => return Err(anyhow::anyhow!(e)),
    }
    let state = EngineState::bootstrap(engine_config).await?;
    let mode = mode_from_env();

    let known_accounts: HashSet<String> = state.directory.list_accounts().await?.into_iter().map(|a| a.id).collect();
    let known_permission_set_arns: HashMap<String, String> =
        state.directory.list_permission_sets().await?.into_iter().map(|p| (p.name, p.arn)).collect();
    let user_principal_ids: HashSet<String> = state.directory.list_users().await?.into_iter().map(|u| u.principal_id).collect();

    let cfg = state.configuration.read().await;
    let run = reconciler::sweep(
        state.directory.as_ref(),
        state.scheduler.as_ref(),
        state.audit.as_ref(),
        state.chat.as_ref(),
        &cfg,
        &known_accounts,
        &known_permission_set_arns,
        |principal_id| user_principal_ids.contains(principal_id),
        mode,
    )
    .await;
    drop(cfg);

    let mut errors = Vec::new();
    match &run {
        Ok(run) => {
            tracing::info!(mode = ?mode, orphaned = run.orphaned.len(), revoked = run.revoked.len(), "sweep complete");
            errors.extend(run.errors.iter().cloned());
        }
        Err(e) => {
            tracing::error!(error = %e, "sweep failed");
            errors.push(e.to_string());
        }
    }

    let status = ProcessStatus::from_errors(errors);
    status.log_and_print("reconciler");
    if !status.ok {
        std::process::exit(1);
    }
    Ok(())
}

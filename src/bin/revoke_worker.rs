//! `revoke-worker` — the scheduler's one-shot target (spec §4.6 "a Lambda
//! or container task, deployment-specific"). Amazon EventBridge Scheduler
//! invokes this process once per fired [`sso_elevator::scheduler::RevocationPayload`],
//! delivered as a single JSON document on stdin (the container-task binding
//! of the target; a Lambda binding would instead deserialize the event
//! body, which is the same payload shape).

use std::io::Read;

use sso_elevator::config::EngineConfig;
use sso_elevator::directory::AssignmentIdentity;
use sso_elevator::executor;
use sso_elevator::scheduler::RevocationPayload;
use sso_elevator::state::EngineState;
use sso_elevator::telemetry::ProcessStatus;

fn read_payload() -> anyhow::Result<RevocationPayload> {
    if let Ok(raw) = std::env::var("SSOELEV_REVOCATION_PAYLOAD") {
        return Ok(serde_json::from_str(&raw)?);
    }
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(serde_json::from_str(&buf)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sso_elevator::telemetry::init("revoke-worker");
    let engine_config = EngineConfig::load()?;
    let state = EngineState::bootstrap(engine_config).await?;

    let payload = read_payload()?;
    let mut errors = Vec::new();

    let result = match (&payload.account_id, &payload.permission_set_arn, &payload.group_id, &payload.membership_id) {
        (Some(account_id), Some(permission_set_arn), _, _) => {
            let identity = AssignmentIdentity {
                principal_id: payload.principal_id.clone(),
                account_id: account_id.clone(),
                permission_set_arn: permission_set_arn.clone(),
            };
            executor::revoke_account(
                state.directory.as_ref(),
                state.scheduler.as_ref(),
                state.audit.as_ref(),
                state.chat.as_ref(),
                &identity,
                &payload.request_id,
                &payload.requester_email,
                "scheduled revocation fired",
                state.engine_config.send_dm_if_user_not_in_channel,
            )
            .await
            .map_err(anyhow::Error::from)
        }
        (_, _, Some(group_id), Some(membership_id)) => executor::revoke_group(
            state.directory.as_ref(),
            state.scheduler.as_ref(),
            state.audit.as_ref(),
            state.chat.as_ref(),
            membership_id,
            &payload.principal_id,
            group_id,
            &payload.request_id,
            &payload.requester_email,
            "scheduled revocation fired",
            state.engine_config.send_dm_if_user_not_in_channel,
        )
        .await
        .map_err(anyhow::Error::from),
        _ => Err(anyhow::anyhow!("revocation payload carries neither an account-assignment nor a group-membership identity")),
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, request_id = %payload.request_id, "revoke-worker failed");
        errors.push(e.to_string());
    }

    let status = ProcessStatus::from_errors(errors);
    status.log_and_print("revoke-worker");
    if !status.ok {
        std::process::exit(1);
    }
    Ok(())
}

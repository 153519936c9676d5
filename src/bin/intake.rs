//! `intake` — the HTTP entry point for spec §6's two inbound chat commands
//! ("request account access", "request group access") and their button
//! callbacks. Axum `Router<EngineState>` wiring follows the teacher's
//! `web::drive::routes()` shape (`Router::new().route(...)` over a cloneable
//! state struct); signature verification (spec §6 "All inbound events are
//! signed; signature verification is mandatory before any state
//! transition") is enforced before any handler touches `EngineState`.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sso_elevator::config::EngineConfig;
use sso_elevator::directory;
use sso_elevator::executor::{self, GrantAccountInput, GrantGroupInput};
use sso_elevator::notify::{compose, notify_best_effort, notify_requester_best_effort};
use sso_elevator::policy::{self, WildcardResolver};
use sso_elevator::ratelimit::{self, RateLimitState};
use sso_elevator::request::{AccessRequest, ResourceKind};
use sso_elevator::state::EngineState;
use sso_elevator::webhook;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct SubmitForm {
    requester_email: String,
    resource: String,
    resource_kind: ResourceKind,
    #[serde(default)]
    permission_set_name: Option<String>,
    reason: String,
    duration_hours: u32,
    chat_thread_ref: String,
}

#[derive(Debug, Deserialize)]
struct ButtonCallback {
    request_id: String,
    decision: Decision,
    approver_email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Decision {
    Approve,
    Deny,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    request_id: String,
    state: &'static str,
    message: Option<String>,
}

struct DirectoryResolver {
    accounts: std::collections::HashSet<String>,
    permission_sets: std::collections::HashSet<String>,
}

impl WildcardResolver for DirectoryResolver {
    fn known_accounts(&self) -> &std::collections::HashSet<String> {
        &self.accounts
    }

    fn known_permission_sets(&self) -> &std::collections::HashSet<String> {
        &self.permission_sets
    }
}

async fn verify_request(state: &EngineState, headers: &HeaderMap, body: &[u8]) -> Result<(), (StatusCode, String)> {
    let signature = headers
        .get(webhook::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or((StatusCode::UNAUTHORIZED, "missing signature header".to_string()))?;
    let timestamp = headers
        .get("X-SSO-Elevator-Timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or((StatusCode::UNAUTHORIZED, "missing or malformed timestamp header".to_string()))?;
    webhook::verify_signature(&state.engine_config.chat_signing_secret, signature, timestamp, body, chrono::Utc::now().timestamp())
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))
}

async fn submit(
    State(state): State<EngineState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    verify_request(&state, &headers, &body).await?;
    let form: SubmitForm = serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let resolved = directory::resolve_principal_by_email(
        state.directory.as_ref(),
        &form.requester_email,
        &state.engine_config.secondary_fallback_email_domains,
    )
    .await
    .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    let request_id = Uuid::new_v4().to_string();
    let request = AccessRequest::new(
        request_id.clone(),
        form.requester_email.clone(),
        form.resource.clone(),
        form.resource_kind,
        form.permission_set_name.clone(),
        form.reason.clone(),
        form.duration_hours,
        state.engine_config.max_permissions_duration_hours,
        form.chat_thread_ref.clone(),
    )
    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let cfg = state.configuration.read().await;
    let accounts: std::collections::HashSet<String> = state
        .directory
        .list_accounts()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let permission_sets: std::collections::HashSet<String> = state
        .directory
        .list_permission_sets()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?
        .into_iter()
        .map(|p| p.name)
        .collect();
    let resolver = DirectoryResolver { accounts, permission_sets };

    let decision = policy::evaluate(&request, &cfg, &resolver);
    drop(cfg);

    let mut request = request;
    let mut message = None;

    match decision.permit {
        policy::Permit::Deny => {
            request.deny("system".to_string());
            message = decision.deny_reason.clone().or_else(|| Some("no approver is configured for this resource".to_string()));
        }
        policy::Permit::Auto => {
            request.auto_approve();
            match grant_for_request(&state, &request, &resolved.user.principal_id, resolved.secondary_domain_was_used, None).await {
                Ok(()) => {
                    request.mark_granted();
                }
                Err(e) => {
                    request.mark_failed();
                    tracing::error!(error = %e, request_id = %request.request_id, "auto-approved grant failed");
                    message = Some(format!("grant failed: {e}"));
                }
            }
        }
        policy::Permit::NeedsApproval => {
            if decision.is_unsatisfiable(&request.requester_email) {
                message = Some("the only eligible approver is the requester and self-approval is disallowed; this request cannot be satisfied".to_string());
                request.deny("system".to_string());
            } else {
                notify_best_effort(
                    state.chat.as_ref(),
                    compose::new_request(
                        &request.request_id,
                        &request.requester_email,
                        &request.resource,
                        &decision.approvers.iter().cloned().collect::<Vec<_>>(),
                        resolved.secondary_domain_was_used,
                    ),
                )
                .await;
            }
        }
    }

    let state_str = request.state.as_str();
    state.pending_requests.write().await.insert(request.request_id.clone(), request);

    Ok(Json(SubmitResponse { request_id, state: state_str, message }))
}

async fn callback(State(state): State<EngineState>, headers: HeaderMap, body: axum::body::Bytes) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    verify_request(&state, &headers, &body).await?;
    let cb: ButtonCallback = serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let mut pending = state.pending_requests.write().await;
    let Some(request) = pending.get_mut(&cb.request_id) else {
        return Err((StatusCode::NOT_FOUND, format!("unknown request_id: {}", cb.request_id)));
    };

    let transitioned = match cb.decision {
        Decision::Approve => request.approve(cb.approver_email.clone()),
        Decision::Deny => request.deny(cb.approver_email.clone()),
    };

    if !transitioned {
        let state_str = request.state.as_str();
        return Ok(Json(SubmitResponse { request_id: cb.request_id, state: state_str, message: Some("no-op: request already left Pending".to_string()) }));
    }

    let requester_email = request.requester_email.clone();
    notify_requester_best_effort(
        state.chat.as_ref(),
        state.engine_config.send_dm_if_user_not_in_channel,
        &requester_email,
        compose::decided(&cb.request_id, matches!(cb.decision, Decision::Approve), &cb.approver_email),
    )
    .await;

    if !matches!(cb.decision, Decision::Approve) {
        let state_str = request.state.as_str();
        return Ok(Json(SubmitResponse { request_id: cb.request_id, state: state_str, message: None }));
    }

    let request_snapshot = request.clone();
    drop(pending);

    let resolved = directory::resolve_principal_by_email(
        state.directory.as_ref(),
        &request_snapshot.requester_email,
        &state.engine_config.secondary_fallback_email_domains,
    )
    .await
    .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    let result = grant_for_request(
        &state,
        &request_snapshot,
        &resolved.user.principal_id,
        resolved.secondary_domain_was_used,
        Some(cb.approver_email.as_str()),
    )
    .await;

    let mut pending = state.pending_requests.write().await;
    let state_str = match pending.get_mut(&cb.request_id) {
        Some(request) => {
            match &result {
                Ok(()) => {
                    request.mark_granted();
                }
                Err(e) => {
                    request.mark_failed();
                    tracing::error!(error = %e, request_id = %cb.request_id, "grant failed after approval");
                }
            }
            request.state.as_str()
        }
        None => "unknown",
    };

    Ok(Json(SubmitResponse { request_id: cb.request_id, state: state_str, message: None }))
}

async fn grant_for_request(
    state: &EngineState,
    request: &AccessRequest,
    principal_id: &str,
    secondary_domain_was_used: bool,
    approver_email: Option<&str>,
) -> anyhow::Result<()> {
    match request.resource_kind {
        ResourceKind::Account => {
            let permission_set_name = request
                .permission_set_name
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("account request missing permission_set_name"))?;
            let permission_set_arn = state
                .directory
                .resolve_permission_set_arn(permission_set_name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("unknown permission set: {permission_set_name}"))?;
            executor::grant_account(
                state.directory.as_ref(),
                state.scheduler.as_ref(),
                state.audit.as_ref(),
                state.chat.as_ref(),
                GrantAccountInput {
                    principal_id,
                    account_id: &request.resource,
                    permission_set_arn: &permission_set_arn,
                    permission_set_name,
                    request_id: &request.request_id,
                    requester_email: &request.requester_email,
                    approver_email,
                    sso_user_email: &request.requester_email,
                    reason: &request.reason,
                    duration_hours: request.duration_hours,
                    secondary_domain_was_used,
                    send_dm_if_user_not_in_channel: state.engine_config.send_dm_if_user_not_in_channel,
                },
            )
            .await?;
        }
        ResourceKind::Group => {
            let group = state
                .directory
                .describe_group(&request.resource)
                .await?
                .ok_or_else(|| anyhow::anyhow!("unknown group: {}", request.resource))?;
            executor::grant_group(
                state.directory.as_ref(),
                state.scheduler.as_ref(),
                state.audit.as_ref(),
                state.chat.as_ref(),
                GrantGroupInput {
                    principal_id,
                    group_id: &group.group_id,
                    group_name: &group.display_name,
                    request_id: &request.request_id,
                    requester_email: &request.requester_email,
                    approver_email,
                    sso_user_email: &request.requester_email,
                    reason: &request.reason,
                    duration_hours: request.duration_hours,
                    secondary_domain_was_used,
                    send_dm_if_user_not_in_channel: state.engine_config.send_dm_if_user_not_in_channel,
                },
            )
            .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sso_elevator::telemetry::init("intake");
    let engine_config = EngineConfig::load()?;
    let state = EngineState::bootstrap(engine_config).await?;

    let rate_limit_state = RateLimitState::new(
        state.engine_config.rate_limit_enabled,
        state.engine_config.rate_limit_requests_per_second,
        state.engine_config.rate_limit_burst,
    );

    let app = Router::new()
        .route("/webhook/request", post(submit))
        .route("/webhook/callback", post(callback))
        .layer(middleware::from_fn_with_state(rate_limit_state, ratelimit::rate_limit_middleware))
        .with_state(state);

    let addr: std::net::SocketAddr = std::env::var("SSOELEV_BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;
    tracing::info!(%addr, "intake listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;
    Ok(())
}

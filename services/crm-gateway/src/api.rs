//! Public HTTP surface
//!
//! - `GET  /oauth/authorize?subdomain=&plan=` redirects to the provider
//! - `GET  /oauth/callback?code=&state=` finishes an install, returns the key once
//! - `GET  /v1/tenant` shows the caller's tenant configuration without secrets
//! - `POST /v1/operations/{name}` invokes a catalog operation with JSON params
//!
//! `/v1` routes authenticate with the `x-api-key` header.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tenant_access::TenantContext;
use tenant_store::PlanTier;
use tracing::warn;

use crate::app::AppState;
use crate::error::ApiError;
use crate::metrics;

#[derive(Deserialize)]
pub struct AuthorizeQuery {
    subdomain: String,
    #[serde(default)]
    plan: Option<String>,
}

/// GET /oauth/authorize: start an install and redirect to the provider.
pub async fn authorize(
    State(state): State<AppState>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, ApiError> {
    let plan_tier = match query.plan.as_deref() {
        None | Some("") => PlanTier::Free,
        Some(plan) => plan
            .parse::<PlanTier>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
    };
    let redirect = state.install.begin(&query.subdomain, plan_tier).await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, redirect.url)]).into_response())
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// GET /oauth/callback: exchange the code and persist the installation.
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    if let Some(error) = query.error.as_deref() {
        // The nonce is left to expire.
        warn!(error, "provider returned an authorization error");
        return Err(tenant_access::Error::OAuthRejected("authorization denied".into()).into());
    }

    let completed = state
        .install
        .complete(query.code.as_deref(), query.state.as_deref())
        .await
        .inspect_err(|e| warn!(reason = e.reason(), "oauth callback failed"))?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "tenant_id": completed.key.tenant_id,
            "installation_id": completed.installation_id,
            "key_id": completed.key.key_id,
            "key_prefix": completed.key.key_prefix,
            "api_key": completed.key.api_key.expose(),
        })),
    )
        .into_response())
}

/// Resolve the caller from `x-api-key`, counting rejections by reason.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<TenantContext, ApiError> {
    let raw = headers
        .get(crm_auth::API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    state.resolver.authenticate(raw).await.map_err(|e| {
        metrics::record_auth_failure(e.reason());
        e.into()
    })
}

/// GET /v1/tenant: the caller's tenant view. No keys, tokens or envelopes.
pub async fn tenant_view(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let config = state.store.find_tenant_config(&ctx.tenant_id).await?;
    let tenant = &config.tenant;

    let installation = config.installation.as_ref().map(|i| {
        json!({
            "id": i.id,
            "location_id": i.location_id,
            "company_id": i.company_id,
            "scopes": i.scopes,
            "status": i.status,
            "expires_at": i.expires_at,
            "installed_at": i.installed_at,
            "last_refreshed_at": i.last_refreshed_at,
        })
    });

    Ok(Json(json!({
        "tenant_id": tenant.id,
        "subdomain": tenant.subdomain,
        "auth_method": tenant.auth_method,
        "location_id": tenant.location_id,
        "plan_tier": tenant.plan_tier,
        "permissions": ctx.permissions,
        "usage_limit": tenant.usage_limit,
        "current_usage": tenant.current_usage,
        "status": tenant.status,
        "installation": installation,
        "created_at": tenant.created_at,
    }))
    .into_response())
}

/// POST /v1/operations/{name}: authenticate, dispatch, meter.
pub async fn invoke_operation(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = run_operation(&state, &name, &headers, &body).await;
    let response = match result {
        Ok(value) => (StatusCode::OK, Json(json!({ "result": value }))).into_response(),
        Err(e) => e.into_response(),
    };
    // Caller-chosen names would make the label unbounded.
    let label = if state.dispatcher.catalog().get(&name).is_some() {
        name.as_str()
    } else {
        "unknown"
    };
    metrics::record_request(label, response.status().as_u16());
    response
}

async fn run_operation(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Value, ApiError> {
    let ctx = authenticate(state, headers).await?;
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(body)
            .map_err(|e| operations::Error::InvalidParams(format!("body is not valid JSON: {e}")))?
    };
    Ok(state.dispatcher.dispatch(&ctx, name, params).await?)
}

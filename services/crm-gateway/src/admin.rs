//! Admin API for tenant management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) that is never exposed
//! publicly.
//!
//! Endpoints:
//! - POST   /admin/tenants            register an api_key tenant, returns its key once
//! - POST   /admin/tenants/{id}/keys  issue an additional key
//! - DELETE /admin/keys/{id}          revoke a key
//! - DELETE /admin/tenants/{id}/oauth remove a tenant's OAuth installation

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use common::Secret;
use serde::Deserialize;
use serde_json::json;
use tenant_access::{IssuedTenantKey, NewTenant};
use tenant_store::PlanTier;

use crate::app::AdminState;
use crate::error::ApiError;

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/tenants", post(register_tenant))
        .route("/admin/tenants/{id}/keys", post(issue_key))
        .route("/admin/tenants/{id}/oauth", delete(remove_oauth))
        .route("/admin/keys/{id}", delete(revoke_key))
        .with_state(state)
}

#[derive(Deserialize)]
struct RegisterRequest {
    subdomain: String,
    #[serde(default = "default_plan")]
    plan_tier: PlanTier,
    #[serde(default)]
    location_id: Option<String>,
    upstream_api_key: String,
}

fn default_plan() -> PlanTier {
    PlanTier::Free
}

fn issued_body(issued: &IssuedTenantKey) -> Response {
    (
        StatusCode::CREATED,
        Json(json!({
            "tenant_id": issued.tenant_id,
            "key_id": issued.key_id,
            "key_prefix": issued.key_prefix,
            "api_key": issued.api_key.expose(),
        })),
    )
        .into_response()
}

/// POST /admin/tenants
async fn register_tenant(
    State(state): State<AdminState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let issued = state
        .registrar
        .register(NewTenant {
            subdomain: body.subdomain,
            plan_tier: body.plan_tier,
            location_id: body.location_id.filter(|l| !l.is_empty()),
            upstream_api_key: Secret::new(body.upstream_api_key),
        })
        .await?;
    Ok(issued_body(&issued))
}

/// POST /admin/tenants/{id}/keys
async fn issue_key(
    State(state): State<AdminState>,
    Path(tenant_id): Path<String>,
) -> Result<Response, ApiError> {
    let issued = state.registrar.issue_key(&tenant_id).await?;
    Ok(issued_body(&issued))
}

/// DELETE /admin/keys/{id}
async fn revoke_key(
    State(state): State<AdminState>,
    Path(key_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registrar.revoke_key(&key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /admin/tenants/{id}/oauth
async fn remove_oauth(
    State(state): State<AdminState>,
    Path(tenant_id): Path<String>,
) -> Result<Response, ApiError> {
    let installation_id = state.install.uninstall(&tenant_id).await?;
    Ok(Json(json!({ "tenant_id": tenant_id, "installation_id": installation_id })).into_response())
}

#[cfg(test)]
mod tests {
    use crate::testutil::{harness, json_request, keyed_request, register, send};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    fn delete(uri: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn register_returns_key_once_and_rejects_duplicates() {
        let h = harness(100).await;
        let (_, _, key) = register(&h, "acme", "pro").await;
        assert!(key.starts_with(crm_auth::KEY_PREFIX));

        let (response, body) = send(
            h.admin(),
            json_request(
                "POST",
                "/admin/tenants",
                json!({ "subdomain": "acme", "upstream_api_key": "other" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn register_validates_input() {
        let h = harness(100).await;
        let (response, body) = send(
            h.admin(),
            json_request(
                "POST",
                "/admin/tenants",
                json!({ "subdomain": "Not Valid", "upstream_api_key": "k" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (response, _) = send(
            h.admin(),
            json_request(
                "POST",
                "/admin/tenants",
                json!({ "subdomain": "acme", "plan_tier": "gold", "upstream_api_key": "k" }),
            ),
        )
        .await;
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn issue_and_revoke_keys() {
        let h = harness(100).await;
        let (tenant_id, first_id, first) = register(&h, "acme", "free").await;

        let (response, body) = send(
            h.admin(),
            json_request("POST", &format!("/admin/tenants/{tenant_id}/keys"), json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let second = body["api_key"].as_str().unwrap().to_string();
        assert_ne!(first, second);

        let (response, _) = send(h.admin(), delete(&format!("/admin/keys/{first_id}"))).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let (response, _) =
            send(h.public(), keyed_request("GET", "/v1/tenant", &first, None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let (response, _) =
            send(h.public(), keyed_request("GET", "/v1/tenant", &second, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let h = harness(100).await;
        let (response, _) = send(
            h.admin(),
            json_request("POST", "/admin/tenants/nope/keys", json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let (response, _) = send(h.admin(), delete("/admin/keys/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let (tenant_id, _, _) = register(&h, "acme", "free").await;
        let (response, _) =
            send(h.admin(), delete(&format!("/admin/tenants/{tenant_id}/oauth"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

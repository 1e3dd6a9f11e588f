//! Router test fixtures: a fully wired gateway against one in-process mock
//! serving both the OAuth token endpoint and the CRM API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::body::Body;
use axum::extract::Path;
use axum::http::{HeaderMap, Request, Response};
use axum::routing::{get, post};
use crm_auth::SecretCipher;
use common::Secret;
use serde_json::{Value, json};
use tenant_store::SqliteStore;
use tokio::net::TcpListener;
use tower::ServiceExt;

use crate::app::Gateway;
use crate::config::{Config, Secrets};

pub struct Harness {
    pub gateway: Gateway,
    pub store: Arc<SqliteStore>,
    pub token_calls: Arc<AtomicUsize>,
}

impl Harness {
    pub fn public(&self) -> Router {
        crate::build_router(self.gateway.app.clone(), 16)
    }

    pub fn admin(&self) -> Router {
        crate::admin::build_admin_router(self.gateway.admin.clone())
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }
}

async fn start_mock() -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new()
        .route(
            "/oauth/token",
            post(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    axum::Json(json!({
                        "access_token": format!("at_issued_{n}"),
                        "refresh_token": format!("rt_issued_{n}"),
                        "expires_in": 3600,
                        "scope": "contacts.readonly contacts.write",
                        "token_type": "Bearer",
                        "locationId": "loc_1",
                        "companyId": "co_1",
                    }))
                }
            }),
        )
        .route(
            "/crm/locations/{location}/contacts",
            get(
                |Path(location): Path<String>, headers: HeaderMap| async move {
                    axum::Json(json!({
                        "location": location,
                        "auth": headers.get("authorization").and_then(|v| v.to_str().ok()),
                        "contacts": [],
                    }))
                },
            ),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), calls)
}

/// Gateway allowing `max_requests` per tenant per minute.
pub async fn harness(max_requests: u64) -> Harness {
    let (base, token_calls) = start_mock().await;
    let config = Config::parse(&format!(
        r#"
[server]
listen_addr = "127.0.0.1:8080"

[oauth]
client_id = "client-123"
redirect_uri = "https://gateway.example/oauth/callback"
authorize_url = "https://idp.example/oauth/chooselocation"
token_url = "{base}/oauth/token"
scopes = ["contacts.readonly"]

[limits]
rate_max_requests = {max_requests}

[upstream]
base_url = "{base}/crm"
timeout_secs = 5

[[operations]]
name = "contacts.list"
path = "/locations/{{location_id}}/contacts"

[[operations]]
name = "contacts.import"
method = "POST"
path = "/contacts/import"
permission = "bulk"
"#
    ))
    .unwrap();

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let gateway = Gateway::build(
        &config,
        Secrets {
            cipher_key: SecretCipher::generate_key(),
            key_salt: Secret::new("router-test-salt-0123".into()),
            oauth_client_secret: Secret::new("client-secret".into()),
        },
        store.clone(),
        crate::metrics::detached_handle(),
    )
    .unwrap();
    Harness {
        gateway,
        store,
        token_calls,
    }
}

/// Send one request and decode the JSON body (`Null` when empty).
pub async fn send(router: Router, request: Request<Body>) -> (Response<()>, Value) {
    let response = router.oneshot(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (Response::from_parts(parts, ()), value)
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn keyed_request(method: &str, uri: &str, api_key: &str, body: Option<Value>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(crm_auth::API_KEY_HEADER, api_key)
        .header("content-type", "application/json")
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap()
}

/// Register an api_key tenant through the admin router; returns (tenant_id, key_id, api_key).
pub async fn register(h: &Harness, subdomain: &str, plan: &str) -> (String, String, String) {
    let (response, body) = send(
        h.admin(),
        json_request(
            "POST",
            "/admin/tenants",
            json!({
                "subdomain": subdomain,
                "plan_tier": plan,
                "location_id": "loc_static",
                "upstream_api_key": "crm-static-key",
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), 201, "register failed: {body}");
    (
        body["tenant_id"].as_str().unwrap().to_string(),
        body["key_id"].as_str().unwrap().to_string(),
        body["api_key"].as_str().unwrap().to_string(),
    )
}

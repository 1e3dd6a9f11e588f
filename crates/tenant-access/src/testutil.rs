//! Shared fixtures: in-memory store, fixed keys, and a mock token endpoint

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use common::{Secret, now_millis};
use crm_auth::{KeyCodec, OAuthClient, OAuthSettings, SecretCipher};
use tenant_store::{
    AuthMethod, CredentialStore, InstallationStatus, OAuthInstallation, PlanTier, SqliteStore,
    Tenant, TenantStatus,
};
use tokio::net::TcpListener;

pub(crate) struct MockTokenServer {
    pub url: String,
    pub calls: Arc<AtomicUsize>,
}

impl MockTokenServer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Token endpoint answering every grant with a fresh numbered token pair
/// after `delay`. Non-2xx `status` answers with an `invalid_grant` body.
pub(crate) async fn start_token_server(status: StatusCode, delay: Duration) -> MockTokenServer {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new().route(
        "/oauth/token",
        post(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                let body = if status.is_success() {
                    format!(
                        r#"{{"access_token":"at_issued_{n}","refresh_token":"rt_issued_{n}","expires_in":3600,"scope":"contacts.readonly contacts.write","token_type":"Bearer","locationId":"loc_1","companyId":"co_1"}}"#
                    )
                } else {
                    r#"{"error":"invalid_grant"}"#.to_string()
                };
                (status, [("content-type", "application/json")], body)
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockTokenServer {
        url: format!("http://{addr}/oauth/token"),
        calls,
    }
}

pub(crate) fn oauth_client(token_url: &str) -> Arc<OAuthClient> {
    Arc::new(OAuthClient::new(
        OAuthSettings {
            client_id: "client-123".into(),
            client_secret: Secret::new("client-secret".into()),
            redirect_uri: "https://gateway.example/oauth/callback".into(),
            authorize_url: "https://idp.example/oauth/chooselocation".into(),
            token_url: token_url.into(),
            scopes: vec!["contacts.readonly".into(), "contacts.write".into()],
            timeout: Duration::from_secs(5),
        },
        reqwest::Client::new(),
    ))
}

pub(crate) fn cipher() -> Arc<SecretCipher> {
    Arc::new(SecretCipher::new(&[42u8; 32]).unwrap())
}

pub(crate) fn key_codec() -> Arc<KeyCodec> {
    Arc::new(KeyCodec::new(Secret::new("test-salt-0123456789".into())).unwrap())
}

pub(crate) fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().unwrap())
}

/// Insert an OAuth tenant whose installation `loc_1` carries `at_seed` /
/// `rt_seed` expiring at `expires_at`.
pub(crate) async fn seed_oauth_tenant(
    store: &SqliteStore,
    cipher: &SecretCipher,
    expires_at: u64,
) -> (String, String) {
    let now = now_millis();
    let tenant = Tenant {
        id: "tenant-oauth".into(),
        subdomain: "oauth-co".into(),
        auth_method: AuthMethod::OAuth,
        oauth_installation_id: Some("loc_1".into()),
        location_id: Some("loc_1".into()),
        upstream_api_key: None,
        plan_tier: PlanTier::Pro,
        usage_limit: PlanTier::Pro.usage_limit(),
        current_usage: 0,
        status: TenantStatus::Active,
        created_at: now,
        updated_at: now,
    };
    store.create_tenant(&tenant).await.unwrap();
    store
        .create_oauth_installation(&OAuthInstallation {
            id: "loc_1".into(),
            tenant_id: tenant.id.clone(),
            location_id: "loc_1".into(),
            company_id: Some("co_1".into()),
            access_token: cipher.encrypt("at_seed").unwrap(),
            refresh_token: cipher.encrypt("rt_seed").unwrap(),
            expires_at,
            scopes: vec!["contacts.readonly".into()],
            status: InstallationStatus::Active,
            installed_at: now,
            last_refreshed_at: None,
        })
        .await
        .unwrap();
    (tenant.id, "loc_1".into())
}

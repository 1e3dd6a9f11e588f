//! OAuth install flow
//!
//! 1. `begin` mints a provisional tenant id and a `state` nonce bound to it,
//!    and returns the provider authorization URL
//! 2. The provider redirects back with `code` and `state`
//! 3. `complete` consumes the nonce, exchanges the code, encrypts the token
//!    pair, and persists tenant, installation and a first API key in one
//!    transaction
//!
//! A callback that fails validation persists nothing and decrypts nothing.

use std::fmt;
use std::sync::Arc;

use common::now_millis;
use crm_auth::{KeyCodec, OAuthClient, OAuthStateStore, SecretCipher};
use tenant_store::{
    ApiKeyRecord, AuthMethod, CredentialStore, InstallationStatus, OAuthInstallBundle,
    OAuthInstallation, PlanTier, Tenant, TenantStatus,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registration::{IssuedTenantKey, validate_subdomain};

const PENDING_FULL_RETRY_SECS: u64 = 60;

/// What a `state` nonce is bound to while the user is at the provider.
#[derive(Debug, Clone)]
pub struct PendingInstall {
    pub tenant_id: String,
    pub subdomain: String,
    pub plan_tier: PlanTier,
}

/// Where to send the user to authorize.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub tenant_id: String,
    pub url: String,
}

/// Result of a successful callback.
pub struct CompletedInstall {
    pub installation_id: String,
    pub key: IssuedTenantKey,
}

impl fmt::Debug for CompletedInstall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedInstall")
            .field("installation_id", &self.installation_id)
            .field("key", &self.key)
            .finish()
    }
}

pub struct InstallFlow {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<SecretCipher>,
    keys: Arc<KeyCodec>,
    oauth: Arc<OAuthClient>,
    states: Arc<OAuthStateStore<PendingInstall>>,
}

impl InstallFlow {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<SecretCipher>,
        keys: Arc<KeyCodec>,
        oauth: Arc<OAuthClient>,
        states: Arc<OAuthStateStore<PendingInstall>>,
    ) -> Self {
        Self {
            store,
            cipher,
            keys,
            oauth,
            states,
        }
    }

    /// Start an install for `subdomain` on `plan_tier`.
    pub async fn begin(&self, subdomain: &str, plan_tier: PlanTier) -> Result<AuthorizationRedirect> {
        validate_subdomain(subdomain)?;
        let tenant_id = Uuid::new_v4().to_string();
        let state = self
            .states
            .issue(PendingInstall {
                tenant_id: tenant_id.clone(),
                subdomain: subdomain.to_string(),
                plan_tier,
            })
            .await
            .ok_or(Error::RateLimited {
                retry_after_secs: PENDING_FULL_RETRY_SECS,
            })?;
        let url = self.oauth.authorization_url(&state).map_err(|e| {
            warn!(error = %e, "failed to build authorization url");
            Error::InvalidRequest("oauth is misconfigured".into())
        })?;
        info!(tenant_id = %tenant_id, subdomain, "oauth install started");
        Ok(AuthorizationRedirect { tenant_id, url })
    }

    /// Finish an install from the provider callback parameters.
    pub async fn complete(&self, code: Option<&str>, state: Option<&str>) -> Result<CompletedInstall> {
        let state = state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::OAuthRejected("missing state".into()))?;
        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::OAuthRejected("missing code".into()))?;
        let pending = self.states.consume(state).await.ok_or_else(|| {
            warn!("oauth callback with unknown or expired state");
            Error::OAuthRejected("unknown or expired state".into())
        })?;

        let tokens = self.oauth.exchange_code(code).await.map_err(|e| {
            warn!(tenant_id = %pending.tenant_id, error = %e, "authorization code exchange failed");
            Error::ExchangeFailed(e.to_string())
        })?;
        let location_id = tokens
            .location_id
            .clone()
            .ok_or_else(|| Error::ExchangeFailed("token response has no locationId".into()))?;
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::ExchangeFailed("token response has no refresh_token".into()))?;

        let now = now_millis();
        let access_envelope = self.seal(&tokens.access_token)?;
        let refresh_envelope = self.seal(refresh_token)?;
        let issued = self.keys.issue();
        let key_id = Uuid::new_v4().to_string();

        let bundle = OAuthInstallBundle {
            tenant: Tenant {
                id: pending.tenant_id.clone(),
                subdomain: pending.subdomain.clone(),
                auth_method: AuthMethod::OAuth,
                oauth_installation_id: Some(location_id.clone()),
                location_id: Some(location_id.clone()),
                upstream_api_key: None,
                plan_tier: pending.plan_tier,
                usage_limit: pending.plan_tier.usage_limit(),
                current_usage: 0,
                status: TenantStatus::Active,
                created_at: now,
                updated_at: now,
            },
            installation: OAuthInstallation {
                id: location_id.clone(),
                tenant_id: pending.tenant_id.clone(),
                location_id: location_id.clone(),
                company_id: tokens.company_id.clone(),
                access_token: access_envelope,
                refresh_token: refresh_envelope,
                expires_at: tokens.expires_at(now),
                scopes: tokens.scopes(),
                status: InstallationStatus::Active,
                installed_at: now,
                last_refreshed_at: None,
            },
            api_key: ApiKeyRecord {
                id: key_id.clone(),
                tenant_id: pending.tenant_id.clone(),
                key_hash: issued.key_hash.clone(),
                key_prefix: issued.key_prefix.clone(),
                is_active: true,
                created_at: now,
                last_used_at: None,
            },
        };

        let tenant_id = self.store.install_oauth(&bundle).await.map_err(|e| {
            warn!(tenant_id = %pending.tenant_id, error = %e, "failed to persist oauth install");
            match e {
                tenant_store::Error::Conflict(_) => Error::Conflict(
                    "subdomain or installation is already registered to another tenant".into(),
                ),
                other => Error::InstallFailed(other.to_string()),
            }
        })?;
        info!(tenant_id = %tenant_id, installation_id = %location_id, "oauth install complete");

        Ok(CompletedInstall {
            installation_id: location_id,
            key: IssuedTenantKey {
                tenant_id,
                key_id,
                key_prefix: issued.key_prefix,
                api_key: issued.raw,
            },
        })
    }

    /// De-authorize a tenant: remove its installation so it can no longer
    /// resolve an upstream credential.
    pub async fn uninstall(&self, tenant_id: &str) -> Result<String> {
        let config = self.store.find_tenant_config(tenant_id).await?;
        let installation_id = config
            .tenant
            .oauth_installation_id
            .ok_or_else(|| Error::NotFound(format!("oauth installation for tenant {tenant_id}")))?;
        self.store.remove_oauth_installation(&installation_id).await?;
        info!(tenant_id, installation_id = %installation_id, "oauth installation removed");
        Ok(installation_id)
    }

    fn seal(&self, plaintext: &str) -> Result<String> {
        self.cipher.encrypt(plaintext).map_err(|e| {
            warn!(error = %e, "failed to encrypt oauth token");
            Error::InstallFailed("encryption failed".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{cipher, key_codec, oauth_client, start_token_server, store};
    use axum::http::StatusCode;
    use std::collections::HashMap;
    use std::time::Duration;
    use tenant_store::SqliteStore;

    struct Harness {
        flow: InstallFlow,
        store: Arc<SqliteStore>,
        cipher: Arc<SecretCipher>,
        keys: Arc<KeyCodec>,
    }

    fn harness(token_url: &str, state_ttl: Duration) -> Harness {
        let (store, cipher, keys) = (store(), cipher(), key_codec());
        let flow = InstallFlow::new(
            store.clone(),
            cipher.clone(),
            keys.clone(),
            oauth_client(token_url),
            Arc::new(OAuthStateStore::new(state_ttl, 100)),
        );
        Harness {
            flow,
            store,
            cipher,
            keys,
        }
    }

    fn state_from(url: &str) -> String {
        let parsed = reqwest::Url::parse(url).unwrap();
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        params["state"].clone()
    }

    #[tokio::test]
    async fn full_install_persists_encrypted_tokens_and_issues_key() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_secs(600));

        let redirect = h.flow.begin("acme", PlanTier::Pro).await.unwrap();
        assert!(redirect.url.starts_with("https://idp.example/oauth/chooselocation?"));
        let state = state_from(&redirect.url);

        let done = h.flow.complete(Some("code-1"), Some(&state)).await.unwrap();
        assert_eq!(done.key.tenant_id, redirect.tenant_id);
        assert_eq!(done.installation_id, "loc_1");
        assert_eq!(server.calls(), 1);

        let (tenant, _) = h
            .store
            .find_tenant_and_active_key_by_hash(&h.keys.hash(done.key.api_key.expose()))
            .await
            .unwrap();
        assert_eq!(tenant.auth_method, AuthMethod::OAuth);
        assert_eq!(tenant.plan_tier, PlanTier::Pro);

        let installation = h.store.find_oauth_installation("loc_1").await.unwrap();
        assert_ne!(installation.access_token, "at_issued_1");
        assert_eq!(
            h.cipher.decrypt(&installation.access_token).unwrap().expose(),
            "at_issued_1"
        );
        assert_eq!(installation.company_id.as_deref(), Some("co_1"));
    }

    #[tokio::test]
    async fn state_is_single_use() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_secs(600));
        let state = state_from(&h.flow.begin("acme", PlanTier::Free).await.unwrap().url);

        h.flow.complete(Some("code-1"), Some(&state)).await.unwrap();
        assert!(matches!(
            h.flow.complete(Some("code-1"), Some(&state)).await,
            Err(Error::OAuthRejected(_))
        ));
        assert_eq!(server.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_state_never_creates_installation() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_secs(600));
        h.flow.begin("acme", PlanTier::Free).await.unwrap();

        assert!(matches!(
            h.flow.complete(Some("code-1"), Some("forged-state")).await,
            Err(Error::OAuthRejected(_))
        ));
        assert_eq!(server.calls(), 0);
        assert!(h.store.find_oauth_installation("loc_1").await.is_err());
    }

    #[tokio::test]
    async fn expired_state_never_creates_installation() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_millis(20));
        let state = state_from(&h.flow.begin("acme", PlanTier::Free).await.unwrap().url);

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(
            h.flow.complete(Some("code-1"), Some(&state)).await,
            Err(Error::OAuthRejected(_))
        ));
        assert_eq!(server.calls(), 0);
        assert!(h.store.find_oauth_installation("loc_1").await.is_err());
    }

    #[tokio::test]
    async fn missing_parameters_are_rejected() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_secs(600));
        let state = state_from(&h.flow.begin("acme", PlanTier::Free).await.unwrap().url);

        assert!(matches!(
            h.flow.complete(None, Some(&state)).await,
            Err(Error::OAuthRejected(_))
        ));
        assert!(matches!(
            h.flow.complete(Some("code"), None).await,
            Err(Error::OAuthRejected(_))
        ));
        assert!(matches!(
            h.flow.complete(Some(""), Some(&state)).await,
            Err(Error::OAuthRejected(_))
        ));
        // Missing code is checked before the nonce is consumed
        assert!(h.flow.complete(Some("code"), Some(&state)).await.is_ok());
    }

    #[tokio::test]
    async fn exchange_failure_leaves_no_partial_state() {
        let server = start_token_server(StatusCode::BAD_REQUEST, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_secs(600));
        let redirect = h.flow.begin("acme", PlanTier::Free).await.unwrap();
        let state = state_from(&redirect.url);

        assert!(matches!(
            h.flow.complete(Some("bad-code"), Some(&state)).await,
            Err(Error::ExchangeFailed(_))
        ));
        assert!(h.store.find_tenant_config(&redirect.tenant_id).await.is_err());
        assert!(h.store.find_oauth_installation("loc_1").await.is_err());
    }

    #[tokio::test]
    async fn uninstall_removes_installation() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_secs(600));
        let state = state_from(&h.flow.begin("acme", PlanTier::Free).await.unwrap().url);
        let done = h.flow.complete(Some("code"), Some(&state)).await.unwrap();

        let removed = h.flow.uninstall(&done.key.tenant_id).await.unwrap();
        assert_eq!(removed, "loc_1");
        assert!(h.store.find_oauth_installation("loc_1").await.is_err());
        assert!(matches!(
            h.flow.uninstall(&done.key.tenant_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn install_cannot_take_over_registered_tenant() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_secs(600));
        let registrar = crate::registration::Registrar::new(
            h.store.clone(),
            h.cipher.clone(),
            h.keys.clone(),
        );
        let owner = registrar
            .register(crate::registration::NewTenant {
                subdomain: "acme".into(),
                plan_tier: PlanTier::Free,
                location_id: Some("loc_static".into()),
                upstream_api_key: common::Secret::new("crm-static-key".into()),
            })
            .await
            .unwrap();

        let state = state_from(&h.flow.begin("acme", PlanTier::Enterprise).await.unwrap().url);
        assert!(matches!(
            h.flow.complete(Some("code"), Some(&state)).await,
            Err(Error::Conflict(_))
        ));

        let config = h.store.find_tenant_config(&owner.tenant_id).await.unwrap();
        assert_eq!(config.tenant.auth_method, AuthMethod::ApiKey);
        assert_eq!(config.tenant.plan_tier, PlanTier::Free);
        assert!(config.tenant.upstream_api_key.is_some());
        assert!(h.store.find_oauth_installation("loc_1").await.is_err());
    }

    #[tokio::test]
    async fn second_subdomain_cannot_claim_installed_location() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let h = harness(&server.url, Duration::from_secs(600));
        let state = state_from(&h.flow.begin("acme", PlanTier::Free).await.unwrap().url);
        let first = h.flow.complete(Some("code"), Some(&state)).await.unwrap();

        // Same provider location under a different subdomain
        let state = state_from(&h.flow.begin("globex", PlanTier::Free).await.unwrap().url);
        assert!(matches!(
            h.flow.complete(Some("code"), Some(&state)).await,
            Err(Error::Conflict(_))
        ));
        let installation = h.store.find_oauth_installation("loc_1").await.unwrap();
        assert_eq!(installation.tenant_id, first.key.tenant_id);

        // The owner re-granting the same location keeps its tenant
        let state = state_from(&h.flow.begin("acme", PlanTier::Free).await.unwrap().url);
        let again = h.flow.complete(Some("code"), Some(&state)).await.unwrap();
        assert_eq!(again.key.tenant_id, first.key.tenant_id);
    }

    #[tokio::test]
    async fn begin_refuses_when_pending_states_are_full() {
        let flow = InstallFlow::new(
            store(),
            cipher(),
            key_codec(),
            oauth_client("http://127.0.0.1:1/oauth/token"),
            Arc::new(OAuthStateStore::new(Duration::from_secs(600), 1)),
        );
        flow.begin("acme", PlanTier::Free).await.unwrap();
        assert!(matches!(
            flow.begin("globex", PlanTier::Free).await,
            Err(Error::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn begin_rejects_invalid_subdomain() {
        let h = harness("http://127.0.0.1:1/oauth/token", Duration::from_secs(600));
        assert!(matches!(
            h.flow.begin("Not Valid", PlanTier::Free).await,
            Err(Error::InvalidRequest(_))
        ));
    }
}

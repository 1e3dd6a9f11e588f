//! Raw API key to authenticated tenant context
//!
//! Resolution order:
//! 1. Shape check (no I/O)
//! 2. Hash and look up an active key whose tenant is active
//! 3. Usage quota
//! 4. Rate limit
//! 5. Live upstream credential (OAuth token or decrypted static key)
//!
//! Steps 1-4 never decrypt anything or call out of process.

use std::sync::Arc;

use common::{Secret, now_millis};
use crm_auth::{KeyCodec, SecretCipher};
use tenant_store::{AuthMethod, CredentialStore, Permission, PlanTier, Tenant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lifecycle::TokenLifecycleManager;
use crate::limiter::{RateDecision, RateLimiter, retry_after_secs};

/// Plaintext upstream credential for one request. Never persisted or logged.
#[derive(Debug, Clone)]
pub struct UpstreamCredential {
    pub auth_method: AuthMethod,
    pub token: Secret<String>,
    /// Provider account the credential is scoped to, when known.
    pub location_id: Option<String>,
}

/// An authenticated tenant ready for dispatch.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub subdomain: String,
    pub key_id: String,
    pub plan_tier: PlanTier,
    pub permissions: &'static [Permission],
    pub credential: UpstreamCredential,
}

impl TenantContext {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

pub struct TenantResolver {
    store: Arc<dyn CredentialStore>,
    keys: Arc<KeyCodec>,
    cipher: Arc<SecretCipher>,
    limiter: Arc<dyn RateLimiter>,
    tokens: Arc<TokenLifecycleManager>,
}

impl TenantResolver {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keys: Arc<KeyCodec>,
        cipher: Arc<SecretCipher>,
        limiter: Arc<dyn RateLimiter>,
        tokens: Arc<TokenLifecycleManager>,
    ) -> Self {
        Self {
            store,
            keys,
            cipher,
            limiter,
            tokens,
        }
    }

    pub async fn authenticate(&self, raw_key: &str) -> Result<TenantContext> {
        if !KeyCodec::is_well_formed(raw_key) {
            return Err(Error::MalformedKey);
        }

        let digest = self.keys.hash(raw_key);
        let (tenant, key) = match self.store.find_tenant_and_active_key_by_hash(&digest).await {
            Ok(found) => found,
            Err(tenant_store::Error::NotFound(_)) => return Err(Error::InvalidKey),
            Err(e) => return Err(e.into()),
        };
        if !tenant.is_active() {
            debug!(tenant_id = %tenant.id, "key belongs to suspended tenant");
            return Err(Error::InvalidKey);
        }

        if let Err(e) = self.store.touch_api_key(&key.id, now_millis()).await {
            warn!(key_id = %key.id, error = %e, "failed to record key use");
        }

        if tenant.quota_exhausted() {
            return Err(Error::QuotaExceeded);
        }

        if let RateDecision::Denied { retry_after } =
            self.limiter.check_and_increment(&tenant.id).await
        {
            return Err(Error::RateLimited {
                retry_after_secs: retry_after_secs(retry_after),
            });
        }

        let credential = self.credential_for(&tenant).await?;

        Ok(TenantContext {
            permissions: tenant.plan_tier.permissions(),
            plan_tier: tenant.plan_tier,
            key_id: key.id,
            subdomain: tenant.subdomain,
            tenant_id: tenant.id,
            credential,
        })
    }

    async fn credential_for(&self, tenant: &Tenant) -> Result<UpstreamCredential> {
        let token = match tenant.auth_method {
            AuthMethod::OAuth => {
                let Some(installation_id) = tenant.oauth_installation_id.as_deref() else {
                    warn!(tenant_id = %tenant.id, "oauth tenant has no installation");
                    return Err(Error::CredentialUnavailable);
                };
                self.tokens.get_valid_access_token(installation_id).await?
            }
            AuthMethod::ApiKey => {
                let Some(envelope) = tenant.upstream_api_key.as_deref() else {
                    warn!(tenant_id = %tenant.id, "api_key tenant has no upstream key");
                    return Err(Error::CredentialUnavailable);
                };
                self.cipher.decrypt(envelope).map_err(|e| {
                    warn!(tenant_id = %tenant.id, error = %e, "upstream key failed integrity check");
                    Error::CredentialUnavailable
                })?
            }
        };

        Ok(UpstreamCredential {
            auth_method: tenant.auth_method,
            token,
            location_id: tenant.location_id.clone(),
        })
    }
}

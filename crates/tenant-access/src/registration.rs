//! Tenant registration and API key management

use std::fmt;
use std::sync::Arc;

use common::{Secret, now_millis};
use crm_auth::{KeyCodec, SecretCipher};
use tenant_store::{ApiKeyRecord, AuthMethod, CredentialStore, PlanTier, Tenant, TenantStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const MAX_SUBDOMAIN_LEN: usize = 63;

/// Request to onboard a tenant that authenticates upstream with a static key.
pub struct NewTenant {
    pub subdomain: String,
    pub plan_tier: PlanTier,
    pub location_id: Option<String>,
    pub upstream_api_key: Secret<String>,
}

/// A freshly issued tenant API key. `api_key` is shown once and never stored.
pub struct IssuedTenantKey {
    pub tenant_id: String,
    pub key_id: String,
    pub key_prefix: String,
    pub api_key: Secret<String>,
}

impl fmt::Debug for IssuedTenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedTenantKey")
            .field("tenant_id", &self.tenant_id)
            .field("key_id", &self.key_id)
            .field("key_prefix", &self.key_prefix)
            .field("api_key", &self.api_key)
            .finish()
    }
}

/// DNS-label rules: 1-63 chars, lowercase ASCII letters, digits and hyphens,
/// no leading or trailing hyphen.
pub fn validate_subdomain(subdomain: &str) -> Result<()> {
    let valid = !subdomain.is_empty()
        && subdomain.len() <= MAX_SUBDOMAIN_LEN
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "subdomain must be 1-{MAX_SUBDOMAIN_LEN} lowercase letters, digits or hyphens"
        )))
    }
}

pub struct Registrar {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<SecretCipher>,
    keys: Arc<KeyCodec>,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<SecretCipher>,
        keys: Arc<KeyCodec>,
    ) -> Self {
        Self {
            store,
            cipher,
            keys,
        }
    }

    /// Create an `api_key` tenant and issue its first key.
    pub async fn register(&self, request: NewTenant) -> Result<IssuedTenantKey> {
        validate_subdomain(&request.subdomain)?;
        if request.upstream_api_key.is_blank() {
            return Err(Error::InvalidRequest("upstream api key is empty".into()));
        }

        let envelope = self
            .cipher
            .encrypt(request.upstream_api_key.expose())
            .map_err(|e| {
                warn!(error = %e, "failed to encrypt upstream api key");
                Error::Store("encryption failed".into())
            })?;

        let now = now_millis();
        let tenant = Tenant {
            id: Uuid::new_v4().to_string(),
            subdomain: request.subdomain,
            auth_method: AuthMethod::ApiKey,
            oauth_installation_id: None,
            location_id: request.location_id,
            upstream_api_key: Some(envelope),
            plan_tier: request.plan_tier,
            usage_limit: request.plan_tier.usage_limit(),
            current_usage: 0,
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.create_tenant(&tenant).await?;
        info!(tenant_id = %tenant.id, subdomain = %tenant.subdomain, plan = %tenant.plan_tier, "tenant registered");

        self.mint_key(&tenant.id).await
    }

    /// Issue an additional active key for an existing tenant.
    pub async fn issue_key(&self, tenant_id: &str) -> Result<IssuedTenantKey> {
        self.store.find_tenant_config(tenant_id).await?;
        self.mint_key(tenant_id).await
    }

    /// Deactivate a key. The record is kept.
    pub async fn revoke_key(&self, key_id: &str) -> Result<()> {
        self.store.revoke_api_key(key_id).await?;
        info!(key_id, "api key revoked");
        Ok(())
    }

    async fn mint_key(&self, tenant_id: &str) -> Result<IssuedTenantKey> {
        let issued = self.keys.issue();
        let record = ApiKeyRecord {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            key_hash: issued.key_hash,
            key_prefix: issued.key_prefix.clone(),
            is_active: true,
            created_at: now_millis(),
            last_used_at: None,
        };
        self.store.create_api_key(&record).await?;
        info!(tenant_id, key_id = %record.id, key_prefix = %record.key_prefix, "api key issued");

        Ok(IssuedTenantKey {
            tenant_id: tenant_id.to_string(),
            key_id: record.id,
            key_prefix: issued.key_prefix,
            api_key: issued.raw,
        })
    }
}

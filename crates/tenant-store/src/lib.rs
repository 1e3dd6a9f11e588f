//! Tenant, API key and OAuth installation persistence
//!
//! `CredentialStore` is the only way the rest of the gateway reads or writes
//! tenant state. Writes are upserts keyed on tenant id, key hash and
//! installation id so callers can retry them safely. Secret columns hold
//! cipher envelopes produced upstream of this crate; the store never sees
//! plaintext.

pub mod error;
pub mod model;
pub mod sqlite;

pub use error::{Error, Result};
pub use model::{
    ApiKeyRecord, AuthMethod, InstallationStatus, OAuthInstallBundle, OAuthInstallation,
    ParseEnumError, Permission, PlanTier, Tenant, TenantConfig, TenantStatus, TokenUpdate,
    UsageRecord,
};
pub use sqlite::SqliteStore;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`CredentialStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence abstraction over tenants, API keys, OAuth installations and
/// usage records.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    fn create_tenant<'a>(&'a self, tenant: &'a Tenant) -> StoreFuture<'a, ()>;

    /// Insert a key record. Re-inserting the same hash is a no-op.
    fn create_api_key<'a>(&'a self, key: &'a ApiKeyRecord) -> StoreFuture<'a, ()>;

    /// Resolve a key digest to its tenant. Inactive keys are `NotFound`.
    fn find_tenant_and_active_key_by_hash<'a>(
        &'a self,
        key_hash: &'a str,
    ) -> StoreFuture<'a, (Tenant, ApiKeyRecord)>;

    fn touch_api_key<'a>(&'a self, key_id: &'a str, used_at: u64) -> StoreFuture<'a, ()>;

    /// Deactivate a key. Keys are never deleted.
    fn revoke_api_key<'a>(&'a self, key_id: &'a str) -> StoreFuture<'a, ()>;

    fn find_tenant_config<'a>(&'a self, tenant_id: &'a str) -> StoreFuture<'a, TenantConfig>;

    fn create_oauth_installation<'a>(
        &'a self,
        installation: &'a OAuthInstallation,
    ) -> StoreFuture<'a, ()>;

    fn find_oauth_installation<'a>(
        &'a self,
        installation_id: &'a str,
    ) -> StoreFuture<'a, OAuthInstallation>;

    /// Replace access token, refresh token and expiry in one statement.
    fn update_oauth_tokens<'a>(&'a self, update: &'a TokenUpdate) -> StoreFuture<'a, ()>;

    fn mark_installation_revoked<'a>(&'a self, installation_id: &'a str) -> StoreFuture<'a, ()>;

    /// Switch a tenant to OAuth and point it at `installation_id`. Clears any
    /// static upstream key.
    fn link_tenant_to_oauth<'a>(
        &'a self,
        tenant_id: &'a str,
        installation_id: &'a str,
        location_id: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Persist a completed OAuth install in one transaction. Returns the id of
    /// the tenant the installation ended up linked to.
    fn install_oauth<'a>(&'a self, bundle: &'a OAuthInstallBundle) -> StoreFuture<'a, String>;

    /// De-authorize: delete the installation and unlink its tenant.
    fn remove_oauth_installation<'a>(&'a self, installation_id: &'a str) -> StoreFuture<'a, ()>;

    /// Active installations whose access token expires before `before` (ms).
    fn list_installations_expiring_before(
        &self,
        before: u64,
    ) -> StoreFuture<'_, Vec<OAuthInstallation>>;

    /// Append a usage row and add its cost to the tenant's running usage.
    fn record_usage<'a>(&'a self, usage: &'a UsageRecord) -> StoreFuture<'a, ()>;
}

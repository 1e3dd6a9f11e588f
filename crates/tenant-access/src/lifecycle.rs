//! Access token lifecycle for OAuth installations
//!
//! Hands out a currently valid upstream access token per installation:
//! - outside the refresh buffer the stored token is decrypted and returned
//!   without any network call
//! - inside the buffer one caller takes the installation's lease, re-reads the
//!   row, refreshes, and persists the new pair atomically; everyone else waits
//!   on the lease and then finds the fresh token already stored
//!
//! This is the only writer of token columns. Failures surface as
//! `CredentialUnavailable`; a stale or empty token is never returned.

use std::sync::Arc;
use std::time::Duration;

use common::{Secret, now_millis};
use crm_auth::{OAuthClient, SecretCipher};
use dashmap::DashMap;
use metrics::counter;
use tenant_store::{CredentialStore, OAuthInstallation, TokenUpdate};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub struct TokenLifecycleManager {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<SecretCipher>,
    oauth: Arc<OAuthClient>,
    refresh_buffer: Duration,
    lease_timeout: Duration,
    leases: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenLifecycleManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<SecretCipher>,
        oauth: Arc<OAuthClient>,
        refresh_buffer: Duration,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            oauth,
            refresh_buffer,
            lease_timeout,
            leases: DashMap::new(),
        }
    }

    pub fn refresh_buffer(&self) -> Duration {
        self.refresh_buffer
    }

    /// Return a plaintext access token that is valid beyond the refresh buffer.
    pub async fn get_valid_access_token(&self, installation_id: &str) -> Result<Secret<String>> {
        self.token_valid_for(installation_id, self.refresh_buffer).await
    }

    /// Refresh now if the token expires within `horizon`. Used by the
    /// background sweep with a horizon wider than the buffer.
    pub async fn refresh_if_expiring_within(
        &self,
        installation_id: &str,
        horizon: Duration,
    ) -> Result<()> {
        self.token_valid_for(installation_id, horizon.max(self.refresh_buffer))
            .await
            .map(|_| ())
    }

    async fn token_valid_for(&self, installation_id: &str, margin: Duration) -> Result<Secret<String>> {
        let installation = self.load_active(installation_id).await?;
        if is_fresh(&installation, margin) {
            return self.open_access_token(&installation);
        }

        let lease = self.lease(installation_id);
        let result = self.refresh_under_lease(&lease, installation_id, margin).await;
        drop(lease);
        // Drop idle leases so the map tracks only installations mid-refresh
        self.leases
            .remove_if(installation_id, |_, lease| Arc::strong_count(lease) == 1);
        result
    }

    async fn refresh_under_lease(
        &self,
        lease: &Mutex<()>,
        installation_id: &str,
        margin: Duration,
    ) -> Result<Secret<String>> {
        let _held = tokio::time::timeout(self.lease_timeout, lease.lock())
            .await
            .map_err(|_| {
                warn!(installation_id, "timed out waiting for refresh lease");
                counter!("gateway_token_refresh_total", "outcome" => "lease_timeout").increment(1);
                Error::CredentialUnavailable
            })?;

        // Another caller may have refreshed while we waited
        let installation = self.load_active(installation_id).await?;
        if is_fresh(&installation, margin) {
            debug!(installation_id, "token refreshed by concurrent caller");
            return self.open_access_token(&installation);
        }

        self.refresh(&installation).await
    }

    /// Active installations that will enter the refresh buffer within
    /// `lookahead`.
    pub async fn expiring_installations(&self, lookahead: Duration) -> Result<Vec<String>> {
        let horizon = now_millis()
            .saturating_add(as_millis(self.refresh_buffer))
            .saturating_add(as_millis(lookahead));
        let installations = self
            .store
            .list_installations_expiring_before(horizon)
            .await?;
        Ok(installations.into_iter().map(|i| i.id).collect())
    }

    fn lease(&self, installation_id: &str) -> Arc<Mutex<()>> {
        let entry = self
            .leases
            .entry(installation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    async fn load_active(&self, installation_id: &str) -> Result<OAuthInstallation> {
        let installation = self
            .store
            .find_oauth_installation(installation_id)
            .await
            .map_err(|e| {
                warn!(installation_id, error = %e, "installation lookup failed");
                Error::CredentialUnavailable
            })?;
        if !installation.is_active() {
            debug!(installation_id, "installation revoked");
            return Err(Error::CredentialUnavailable);
        }
        Ok(installation)
    }

    fn open_access_token(&self, installation: &OAuthInstallation) -> Result<Secret<String>> {
        self.cipher
            .decrypt(&installation.access_token)
            .map_err(|e| {
                warn!(installation_id = %installation.id, error = %e, "stored access token failed integrity check");
                Error::CredentialUnavailable
            })
    }

    async fn refresh(&self, installation: &OAuthInstallation) -> Result<Secret<String>> {
        let installation_id = installation.id.as_str();
        let refresh_token = self.cipher.decrypt(&installation.refresh_token).map_err(|e| {
            warn!(installation_id, error = %e, "stored refresh token failed integrity check");
            Error::CredentialUnavailable
        })?;

        let tokens = match self.oauth.refresh(refresh_token.expose()).await {
            Ok(tokens) => tokens,
            Err(crm_auth::Error::RefreshRejected { status, .. }) => {
                warn!(installation_id, status, "refresh token rejected, revoking installation");
                counter!("gateway_token_refresh_total", "outcome" => "rejected").increment(1);
                if let Err(e) = self.store.mark_installation_revoked(installation_id).await {
                    warn!(installation_id, error = %e, "failed to mark installation revoked");
                }
                return Err(Error::CredentialUnavailable);
            }
            Err(e) => {
                warn!(installation_id, error = %e, "token refresh failed");
                counter!("gateway_token_refresh_total", "outcome" => "failed").increment(1);
                return Err(Error::CredentialUnavailable);
            }
        };

        let now = now_millis();
        let expires_at = tokens.expires_at(now);
        // Providers that do not rotate refresh tokens omit the field
        let next_refresh = tokens
            .refresh_token
            .as_deref()
            .unwrap_or(refresh_token.expose().as_str());
        let update = TokenUpdate {
            installation_id: installation_id.to_string(),
            access_token: self.seal(installation_id, &tokens.access_token)?,
            refresh_token: self.seal(installation_id, next_refresh)?,
            expires_at,
            refreshed_at: now,
        };
        self.store.update_oauth_tokens(&update).await.map_err(|e| {
            warn!(installation_id, error = %e, "failed to persist refreshed tokens");
            counter!("gateway_token_refresh_total", "outcome" => "failed").increment(1);
            Error::CredentialUnavailable
        })?;

        counter!("gateway_token_refresh_total", "outcome" => "refreshed").increment(1);
        info!(installation_id, expires_at, "access token refreshed");
        Ok(Secret::new(tokens.access_token))
    }

    fn seal(&self, installation_id: &str, plaintext: &str) -> Result<String> {
        self.cipher.encrypt(plaintext).map_err(|e| {
            warn!(installation_id, error = %e, "failed to encrypt refreshed token");
            Error::CredentialUnavailable
        })
    }
}

fn is_fresh(installation: &OAuthInstallation, margin: Duration) -> bool {
    installation.expires_at.saturating_sub(now_millis()) > as_millis(margin)
}

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{cipher, oauth_client, seed_oauth_tenant, start_token_server, store};
    use axum::http::StatusCode;
    use tenant_store::InstallationStatus;

    const HOUR_MS: u64 = 3_600_000;

    fn manager(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<SecretCipher>,
        token_url: &str,
    ) -> TokenLifecycleManager {
        TokenLifecycleManager::new(
            store,
            cipher,
            oauth_client(token_url),
            Duration::from_secs(300),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn fresh_token_returned_without_refresh() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let (store, cipher) = (store(), cipher());
        let (_, installation_id) =
            seed_oauth_tenant(&store, &cipher, now_millis() + HOUR_MS).await;
        let manager = manager(store, cipher, &server.url);

        let token = manager.get_valid_access_token(&installation_id).await.unwrap();
        assert_eq!(token.expose(), "at_seed");
        assert_eq!(server.calls(), 0);
    }

    #[tokio::test]
    async fn token_inside_buffer_is_refreshed_once_and_persisted() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let (store, cipher) = (store(), cipher());
        let old_expiry = now_millis() + 60_000;
        let (_, installation_id) = seed_oauth_tenant(&store, &cipher, old_expiry).await;
        let manager = manager(store.clone(), cipher.clone(), &server.url);

        let token = manager.get_valid_access_token(&installation_id).await.unwrap();
        assert_eq!(token.expose(), "at_issued_1");
        assert_eq!(server.calls(), 1);

        let stored = store.find_oauth_installation(&installation_id).await.unwrap();
        assert!(stored.expires_at > old_expiry);
        assert!(stored.last_refreshed_at.is_some());
        assert_eq!(cipher.decrypt(&stored.refresh_token).unwrap().expose(), "rt_issued_1");
        assert_ne!(stored.access_token, "at_issued_1", "stored encrypted");

        // Now fresh: served from the store
        let again = manager.get_valid_access_token(&installation_id).await.unwrap();
        assert_eq!(again.expose(), "at_issued_1");
        assert_eq!(server.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = start_token_server(StatusCode::OK, Duration::from_millis(100)).await;
        let (store, cipher) = (store(), cipher());
        let (_, installation_id) = seed_oauth_tenant(&store, &cipher, now_millis() + 1_000).await;
        let manager = Arc::new(manager(store, cipher, &server.url));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let id = installation_id.clone();
            handles.push(tokio::spawn(async move {
                manager.get_valid_access_token(&id).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().expose(), "at_issued_1");
        }
        assert_eq!(server.calls(), 1, "exactly one upstream refresh");
    }

    #[tokio::test]
    async fn rejected_refresh_revokes_installation() {
        let server = start_token_server(StatusCode::BAD_REQUEST, Duration::ZERO).await;
        let (store, cipher) = (store(), cipher());
        let (_, installation_id) = seed_oauth_tenant(&store, &cipher, now_millis()).await;
        let manager = manager(store.clone(), cipher, &server.url);

        assert!(matches!(
            manager.get_valid_access_token(&installation_id).await,
            Err(Error::CredentialUnavailable)
        ));
        let stored = store.find_oauth_installation(&installation_id).await.unwrap();
        assert_eq!(stored.status, InstallationStatus::Revoked);

        // Revoked installations are never retried upstream
        assert!(manager.get_valid_access_token(&installation_id).await.is_err());
        assert_eq!(server.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_keeps_installation_active() {
        let server = start_token_server(StatusCode::SERVICE_UNAVAILABLE, Duration::ZERO).await;
        let (store, cipher) = (store(), cipher());
        let (_, installation_id) = seed_oauth_tenant(&store, &cipher, now_millis()).await;
        let manager = manager(store.clone(), cipher, &server.url);

        assert!(matches!(
            manager.get_valid_access_token(&installation_id).await,
            Err(Error::CredentialUnavailable)
        ));
        let stored = store.find_oauth_installation(&installation_id).await.unwrap();
        assert_eq!(stored.status, InstallationStatus::Active);
    }

    #[tokio::test]
    async fn missing_installation_is_unavailable() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let manager = manager(store(), cipher(), &server.url);
        assert!(matches!(
            manager.get_valid_access_token("ghost").await,
            Err(Error::CredentialUnavailable)
        ));
    }

    #[tokio::test]
    async fn corrupted_envelope_fails_closed() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let (store, seeding_cipher) = (store(), cipher());
        let (_, installation_id) =
            seed_oauth_tenant(&store, &seeding_cipher, now_millis() + HOUR_MS).await;
        // Different key: every stored envelope fails its tag check
        let other = Arc::new(SecretCipher::new(&[1u8; 32]).unwrap());
        let manager = manager(store, other, &server.url);

        assert!(matches!(
            manager.get_valid_access_token(&installation_id).await,
            Err(Error::CredentialUnavailable)
        ));
        assert_eq!(server.calls(), 0);
    }

    #[tokio::test]
    async fn lease_wait_is_bounded() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let (store, cipher) = (store(), cipher());
        let (_, installation_id) = seed_oauth_tenant(&store, &cipher, now_millis()).await;
        let manager = TokenLifecycleManager::new(
            store,
            cipher,
            oauth_client(&server.url),
            Duration::from_secs(300),
            Duration::from_millis(50),
        );

        let lease = manager.lease(&installation_id);
        let _held = lease.lock().await;

        assert!(matches!(
            manager.get_valid_access_token(&installation_id).await,
            Err(Error::CredentialUnavailable)
        ));
        assert_eq!(server.calls(), 0);
    }

    #[tokio::test]
    async fn leases_are_dropped_after_refresh() {
        let server = start_token_server(StatusCode::OK, Duration::from_millis(50)).await;
        let (store, cipher) = (store(), cipher());
        let (_, installation_id) = seed_oauth_tenant(&store, &cipher, now_millis()).await;
        let manager = Arc::new(manager(store, cipher, &server.url));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let id = installation_id.clone();
            handles.push(tokio::spawn(async move {
                manager.get_valid_access_token(&id).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(server.calls(), 1);
        assert!(manager.leases.is_empty());
    }

    #[tokio::test]
    async fn horizon_wider_than_buffer_refreshes_early() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let (store, cipher) = (store(), cipher());
        let (_, installation_id) =
            seed_oauth_tenant(&store, &cipher, now_millis() + 330_000).await;
        let manager = manager(store, cipher, &server.url);

        // 330s out is outside the 300s buffer: the request path leaves it alone
        manager.get_valid_access_token(&installation_id).await.unwrap();
        assert_eq!(server.calls(), 0);

        manager
            .refresh_if_expiring_within(&installation_id, Duration::from_secs(360))
            .await
            .unwrap();
        assert_eq!(server.calls(), 1);

        // Already fresh beyond the horizon
        manager
            .refresh_if_expiring_within(&installation_id, Duration::from_secs(360))
            .await
            .unwrap();
        assert_eq!(server.calls(), 1);
    }

    #[tokio::test]
    async fn expiring_installations_respects_buffer() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let (store, cipher) = (store(), cipher());
        let (_, installation_id) =
            seed_oauth_tenant(&store, &cipher, now_millis() + 400_000).await;
        let manager = manager(store, cipher, &server.url);

        // 400s out, buffer 300s: not yet due
        assert!(manager.expiring_installations(Duration::ZERO).await.unwrap().is_empty());
        // With a 2 minute lookahead it is due
        assert_eq!(
            manager
                .expiring_installations(Duration::from_secs(120))
                .await
                .unwrap(),
            vec![installation_id]
        );
    }
}

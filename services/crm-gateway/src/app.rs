//! Component wiring
//!
//! Every component is built once here from the loaded config and shared by
//! `Arc`. The HTTP layers and background tasks only see what they need.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crm_auth::{KeyCodec, OAuthClient, OAuthSettings, OAuthStateStore, SecretCipher};
use metrics_exporter_prometheus::PrometheusHandle;
use operations::{Dispatcher, HttpOperation, OperationCatalog, UpstreamTarget};
use tenant_access::{
    FixedWindowLimiter, InstallFlow, PendingInstall, Registrar, TenantResolver,
    TokenLifecycleManager,
};
use tenant_store::CredentialStore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{Config, Secrets};

/// State shared by the public router.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<TenantResolver>,
    pub dispatcher: Arc<Dispatcher>,
    pub install: Arc<InstallFlow>,
    pub store: Arc<dyn CredentialStore>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// State shared by the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub registrar: Arc<Registrar>,
    pub install: Arc<InstallFlow>,
}

/// Everything `main` needs to serve and to run background work.
pub struct Gateway {
    pub app: AppState,
    pub admin: AdminState,
    pub tokens: Arc<TokenLifecycleManager>,
    pub states: Arc<OAuthStateStore<PendingInstall>>,
    pub limiter: Arc<FixedWindowLimiter>,
}

impl Gateway {
    pub fn build(
        config: &Config,
        secrets: Secrets,
        store: Arc<dyn CredentialStore>,
        prometheus: PrometheusHandle,
    ) -> Result<Self> {
        let cipher = Arc::new(
            SecretCipher::from_base64(&secrets.cipher_key)
                .context("GATEWAY_CIPHER_KEY must be base64 of 32 bytes")?,
        );
        let keys = Arc::new(KeyCodec::new(secrets.key_salt).context("invalid GATEWAY_KEY_SALT")?);

        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;

        let oauth = Arc::new(OAuthClient::new(
            OAuthSettings {
                client_id: config.oauth.client_id.clone(),
                client_secret: secrets.oauth_client_secret,
                redirect_uri: config.oauth.redirect_uri.clone(),
                authorize_url: config.oauth.authorize_url.clone(),
                token_url: config.oauth.token_url.clone(),
                scopes: config.oauth.scopes.clone(),
                timeout: Duration::from_secs(config.oauth.timeout_secs),
            },
            http.clone(),
        ));

        let states = Arc::new(OAuthStateStore::new(
            config.limits.oauth_state_ttl(),
            config.limits.oauth_max_pending_states,
        ));
        let limiter = Arc::new(FixedWindowLimiter::new(
            config.limits.rate_window(),
            config.limits.rate_max_requests,
        ));
        let tokens = Arc::new(TokenLifecycleManager::new(
            store.clone(),
            cipher.clone(),
            oauth.clone(),
            config.limits.refresh_buffer(),
            config.limits.refresh_lease_timeout(),
        ));

        let resolver = Arc::new(TenantResolver::new(
            store.clone(),
            keys.clone(),
            cipher.clone(),
            limiter.clone(),
            tokens.clone(),
        ));
        let registrar = Arc::new(Registrar::new(store.clone(), cipher.clone(), keys.clone()));
        let install = Arc::new(InstallFlow::new(
            store.clone(),
            cipher,
            keys,
            oauth,
            states.clone(),
        ));

        let catalog = Arc::new(build_catalog(config, http)?);
        info!(operations = catalog.len(), "operation catalog loaded");
        let dispatcher = Arc::new(Dispatcher::new(catalog, store.clone()));

        Ok(Self {
            app: AppState {
                resolver,
                dispatcher,
                install: install.clone(),
                store,
                prometheus,
                started_at: Instant::now(),
            },
            admin: AdminState { registrar, install },
            tokens,
            states,
            limiter,
        })
    }
}

/// Turn `[[operations]]` entries into a validated catalog.
fn build_catalog(config: &Config, http: reqwest::Client) -> Result<OperationCatalog> {
    let target = Arc::new(UpstreamTarget::new(
        &config.upstream.base_url,
        http,
        Duration::from_secs(config.upstream.timeout_secs),
    )?);
    let mut catalog = OperationCatalog::new();
    for spec in &config.operations {
        let name = spec.name.clone();
        let operation = HttpOperation::from_spec(spec.clone(), target.clone())
            .with_context(|| format!("invalid operation {name:?}"))?;
        catalog
            .register(Arc::new(operation))
            .with_context(|| format!("cannot register operation {name:?}"))?;
    }
    Ok(catalog)
}

/// Spawn the periodic purge of idle rate windows.
pub fn spawn_limiter_cleanup(limiter: Arc<FixedWindowLimiter>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = limiter.purge_expired();
            if removed > 0 {
                debug!(removed, "purged idle rate windows");
            }
        }
    })
}

//! OAuth 2.0 client for the upstream CRM identity provider
//!
//! Two token-endpoint interactions, both form-encoded POSTs:
//! 1. Authorization code exchange (end of the install flow)
//! 2. Refresh-token grant (driven by the token lifecycle manager)
//!
//! Each call makes exactly one HTTP request with an explicit timeout and never
//! retries; retry policy belongs to the caller.

use std::fmt;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Upper bound on how much of an error body is carried into error messages.
const ERROR_BODY_LIMIT: usize = 512;

/// Static client registration with the identity provider.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub timeout: Duration,
}

/// Token endpoint response for both grants.
///
/// `expires_in` is a delta in seconds; the caller turns it into an absolute
/// millisecond timestamp. `locationId`/`companyId` are the provider's account
/// identifiers for the installing sub-account.
#[derive(Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(rename = "locationId", default)]
    pub location_id: Option<String>,
    #[serde(rename = "companyId", default)]
    pub company_id: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("location_id", &self.location_id)
            .field("company_id", &self.company_id)
            .finish()
    }
}

impl TokenResponse {
    /// Granted scopes, split on whitespace.
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Absolute expiry in unix milliseconds, measured from `now_millis`.
    pub fn expires_at(&self, now_millis: u64) -> u64 {
        now_millis.saturating_add(self.expires_in.saturating_mul(1000))
    }
}

pub struct OAuthClient {
    settings: OAuthSettings,
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(settings: OAuthSettings, http: reqwest::Client) -> Self {
        Self { settings, http }
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    /// Build the provider authorization URL carrying `state`.
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let scope = self.settings.scopes.join(" ");
        let url = reqwest::Url::parse_with_params(
            &self.settings.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| Error::Endpoint(format!("authorize_url: {e}")))?;
        Ok(url.into())
    }

    /// Exchange an authorization code for a token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.settings.token_url)
            .timeout(self.settings.timeout)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.expose().as_str()),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::ExchangeFailed(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            warn!(status = status.as_u16(), "authorization code exchange rejected");
            return Err(Error::ExchangeFailed(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let tokens = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::ExchangeFailed(format!("invalid token response: {e}")))?;
        if tokens.refresh_token.is_none() {
            return Err(Error::ExchangeFailed(
                "token response carried no refresh_token".into(),
            ));
        }
        debug!(expires_in = tokens.expires_in, "authorization code exchanged");
        Ok(tokens)
    }

    /// Redeem a refresh token for a new token pair.
    ///
    /// A 4xx answer means the refresh token is revoked, expired or already
    /// rotated: [`Error::RefreshRejected`]. Anything else that fails is
    /// [`Error::RefreshFailed`] and may succeed on a later attempt.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.settings.token_url)
            .timeout(self.settings.timeout)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.expose().as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::RefreshFailed(format!("refresh request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = error_body(response).await;
            return Err(Error::RefreshRejected {
                status: status.as_u16(),
                message: body,
            });
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(Error::RefreshFailed(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::RefreshFailed(format!("invalid refresh response: {e}")))
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let mut body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

//! Error types for tenant resolution, token lifecycle and onboarding

/// Errors surfaced while authenticating a tenant or managing its credentials.
///
/// Display strings are safe to return to clients: they never carry hashes,
/// keys, tokens or internal ids. Details are logged where the error arises.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed api key")]
    MalformedKey,

    /// Unknown or revoked key, or the owning tenant is not active.
    #[error("invalid api key")]
    InvalidKey,

    #[error("usage quota exceeded")]
    QuotaExceeded,

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// No usable upstream credential right now. Fails closed.
    #[error("upstream credential unavailable")]
    CredentialUnavailable,

    /// OAuth callback with a missing, unknown, expired or reused `state`, or
    /// without a `code`.
    #[error("oauth callback rejected: {0}")]
    OAuthRejected(String),

    #[error("oauth code exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("oauth install failed: {0}")]
    InstallFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(String),
}

/// Result alias for tenant access operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::MalformedKey => "malformed_key",
            Error::InvalidKey => "invalid_key",
            Error::QuotaExceeded => "quota_exceeded",
            Error::RateLimited { .. } => "rate_limited",
            Error::CredentialUnavailable => "credential_unavailable",
            Error::OAuthRejected(_) => "invalid_state",
            Error::ExchangeFailed(_) => "exchange_failed",
            Error::InstallFailed(_) => "install_failed",
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Store(_) => "store_error",
        }
    }
}

impl From<tenant_store::Error> for Error {
    fn from(err: tenant_store::Error) -> Self {
        match err {
            tenant_store::Error::NotFound(what) => Error::NotFound(what),
            tenant_store::Error::Conflict(what) => Error::Conflict(what),
            tenant_store::Error::Database(msg) => Error::Store(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display_includes_retry_after() {
        let err = Error::RateLimited {
            retry_after_secs: 42,
        };
        assert_eq!(err.to_string(), "rate limit exceeded, retry after 42s");
        assert_eq!(err.reason(), "rate_limited");
    }

    #[test]
    fn store_errors_keep_their_kind() {
        let err: Error = tenant_store::Error::Conflict("subdomain".into()).into();
        assert!(matches!(err, Error::Conflict(_)));
        let err: Error = tenant_store::Error::Database("disk".into()).into();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn callback_failures_map_to_generic_codes() {
        assert_eq!(Error::OAuthRejected("x".into()).reason(), "invalid_state");
        assert_eq!(Error::ExchangeFailed("x".into()).reason(), "exchange_failed");
        assert_eq!(Error::InstallFailed("x".into()).reason(), "install_failed");
    }
}

//! Error types for cryptographic and OAuth operations

/// Errors from secret handling and the upstream identity provider.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Ciphertext envelope malformed or its authentication tag did not verify.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("invalid OAuth endpoint: {0}")]
    Endpoint(String),

    #[error("upstream code exchange failed: {0}")]
    ExchangeFailed(String),

    /// The provider answered the refresh with a 4xx: the refresh token is dead.
    #[error("refresh token rejected ({status}): {message}")]
    RefreshRejected { status: u16, message: String },

    #[error("upstream refresh failed: {0}")]
    RefreshFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

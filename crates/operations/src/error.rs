//! Error types for operation lookup and invocation

use tenant_store::Permission;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("plan does not include {required} access required by {operation}")]
    PermissionDenied {
        operation: String,
        required: Permission,
    },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The upstream API answered with a non-2xx status.
    #[error("upstream returned {status}")]
    Upstream { status: u16, body: String },

    #[error("upstream request failed: {0}")]
    Transport(String),

    /// Catalog construction problem (duplicate or malformed entry).
    #[error("invalid catalog entry: {0}")]
    Catalog(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status to report for this failure, also stored on usage records.
    ///
    /// Upstream 4xx answers pass through (the caller sent something the CRM
    /// rejected); upstream 5xx and transport failures become 502, or 504 for
    /// timeouts.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::UnknownOperation(_) => 404,
            Error::PermissionDenied { .. } => 403,
            Error::InvalidParams(_) => 400,
            Error::Upstream { status, .. } if (400..500).contains(status) => *status,
            Error::Upstream { .. } => 502,
            Error::Transport(msg) if msg.contains("timed out") => 504,
            Error::Transport(_) => 502,
            Error::Catalog(_) => 500,
        }
    }
}

//! Fixed values shared by the key codec, state store and OAuth client

/// Prefix of every tenant API key. Lets the resolver reject foreign or
/// mistyped keys before touching the database.
pub const KEY_PREFIX: &str = "crmgw_";

/// Request header carrying the tenant API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Default lifetime of an OAuth `state` nonce.
pub const DEFAULT_STATE_TTL_SECS: u64 = 600;

/// Default cap on outstanding OAuth authorizations.
pub const DEFAULT_MAX_PENDING_STATES: usize = 10_000;

/// Default margin before expiry at which access tokens are refreshed.
pub const DEFAULT_REFRESH_BUFFER_SECS: u64 = 300;

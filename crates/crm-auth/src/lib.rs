//! Credential primitives for the CRM gateway
//!
//! Standalone library with no dependency on storage or the HTTP service:
//! - `cipher`: AES-256-GCM sealing of secrets at rest
//! - `keys`: tenant API key minting and salted lookup hashes
//! - `state`: single-use OAuth `state` nonces with a TTL
//! - `oauth`: authorization URL, code exchange and refresh against the
//!   CRM identity provider

pub mod cipher;
pub mod constants;
pub mod error;
pub mod keys;
pub mod oauth;
pub mod state;

pub use cipher::SecretCipher;
pub use constants::*;
pub use error::{Error, Result};
pub use keys::{IssuedKey, KeyCodec};
pub use oauth::{OAuthClient, OAuthSettings, TokenResponse};
pub use state::{OAuthStateStore, spawn_state_cleanup};

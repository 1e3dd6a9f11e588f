//! Tenant API key issuance and lookup hashing
//!
//! Raw keys look like `crmgw_<43 url-safe base64 chars>` (32 random bytes).
//! Only `hash(raw)` is persisted: HMAC-SHA256 keyed with a server-side salt,
//! hex encoded. The hash is deterministic for a given salt so it can serve as
//! the unique lookup column, and it cannot be inverted to recover the key.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use hmac::{Hmac, Mac};
use rand::RngExt;
use sha2::Sha256;

use crate::constants::KEY_PREFIX;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const KEY_ENTROPY_BYTES: usize = 32;
/// 32 bytes → 43 base64url chars without padding.
const KEY_BODY_LEN: usize = 43;
const DISPLAY_PREFIX_LEN: usize = 12;
const MIN_SALT_BYTES: usize = 16;

/// A freshly minted key. `raw` is shown to the caller exactly once.
pub struct IssuedKey {
    pub raw: Secret<String>,
    pub key_hash: String,
    pub key_prefix: String,
}

impl fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedKey")
            .field("raw", &self.raw)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

pub struct KeyCodec {
    salt: Secret<String>,
}

impl fmt::Debug for KeyCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCodec").field("salt", &self.salt).finish()
    }
}

impl KeyCodec {
    /// Build a codec around the configured salt.
    ///
    /// There is no fallback salt: an empty or short one is a misconfiguration
    /// and is refused here rather than silently weakening every key hash.
    pub fn new(salt: Secret<String>) -> Result<Self> {
        if salt.is_blank() {
            return Err(Error::KeyMaterial("key hash salt is empty".into()));
        }
        if salt.byte_len() < MIN_SALT_BYTES {
            return Err(Error::KeyMaterial(format!(
                "key hash salt must be at least {MIN_SALT_BYTES} bytes"
            )));
        }
        Ok(Self { salt })
    }

    /// Mint a new raw key from the OS CSPRNG.
    pub fn generate() -> Secret<String> {
        let mut bytes = [0u8; KEY_ENTROPY_BYTES];
        rand::rng().fill(&mut bytes);
        let raw = format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes));
        bytes.fill(0);
        Secret::new(raw)
    }

    /// Mint a key together with its lookup hash and display prefix.
    pub fn issue(&self) -> IssuedKey {
        let raw = Self::generate();
        let key_hash = self.hash(raw.expose());
        let key_prefix = Self::display_prefix(raw.expose());
        IssuedKey {
            raw,
            key_hash,
            key_prefix,
        }
    }

    /// Cheap shape check: prefix, exact body length, url-safe alphabet.
    pub fn is_well_formed(raw: &str) -> bool {
        let Some(body) = raw.strip_prefix(KEY_PREFIX) else {
            return false;
        };
        body.len() == KEY_BODY_LEN
            && body
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    /// Deterministic, salted, one-way lookup digest (lowercase hex).
    pub fn hash(&self, raw: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.salt.expose().as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(raw.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Cosmetic prefix for listing keys without revealing them.
    pub fn display_prefix(raw: &str) -> String {
        raw.chars().take(DISPLAY_PREFIX_LEN).collect()
    }
}

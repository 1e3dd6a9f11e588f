//! Authenticated encryption of secrets at rest
//!
//! OAuth tokens and upstream API keys are sealed with AES-256-GCM before they
//! reach the credential store. Every call draws a fresh 96-bit nonce. The
//! stored envelope is `base64(nonce):base64(tag):base64(ciphertext)`, each
//! part encoded on its own so the envelope round-trips exactly and can be
//! inspected for shape without decrypting.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use rand::RngExt;

use crate::error::{Error, Result};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SEPARATOR: char = ':';

/// Process-wide cipher for secrets at rest.
///
/// Built once at startup from the configured key. Rotating the key makes every
/// previously sealed envelope undecryptable; migrating them is out of scope.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl SecretCipher {
    /// Build a cipher from raw key bytes. The key must be exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::KeyMaterial(format!(
                "cipher key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::KeyMaterial("cipher key rejected".into()))?;
        Ok(Self { cipher })
    }

    /// Build a cipher from a base64-encoded key (the configured form).
    pub fn from_base64(key: &Secret<String>) -> Result<Self> {
        let bytes = Secret::new(
            STANDARD
                .decode(key.expose().trim())
                .map_err(|_| Error::KeyMaterial("cipher key is not valid base64".into()))?,
        );
        Self::new(bytes.expose())
    }

    /// Generate a random base64 key. Used for throwaway development setups only.
    pub fn generate_key() -> Secret<String> {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill(&mut bytes);
        let encoded = STANDARD.encode(bytes);
        bytes.fill(0);
        Secret::new(encoded)
    }

    /// Seal `plaintext` into a `nonce:tag:ciphertext` envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::Encrypt)?;

        // aes-gcm appends the tag to the ciphertext
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            STANDARD.encode(nonce),
            STANDARD.encode(tag),
            STANDARD.encode(body)
        ))
    }

    /// Open an envelope produced by [`SecretCipher::encrypt`].
    ///
    /// Fails with [`Error::Integrity`] when the envelope does not have exactly
    /// three parts, a part is not base64, the nonce or tag has the wrong
    /// length, or the tag does not verify under this key.
    pub fn decrypt(&self, envelope: &str) -> Result<Secret<String>> {
        let mut parts = envelope.split(SEPARATOR);
        let (Some(nonce), Some(tag), Some(body), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Integrity(
                "envelope must have exactly three parts".into(),
            ));
        };

        let nonce = decode_part(nonce, "nonce")?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::Integrity(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let tag = decode_part(tag, "tag")?;
        if tag.len() != TAG_LEN {
            return Err(Error::Integrity(format!(
                "tag must be {TAG_LEN} bytes, got {}",
                tag.len()
            )));
        }
        let mut sealed = decode_part(body, "ciphertext")?;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| Error::Integrity("authentication tag mismatch".into()))?;

        String::from_utf8(plaintext)
            .map(Secret::new)
            .map_err(|_| Error::Integrity("plaintext is not UTF-8".into()))
    }
}

fn decode_part(part: &str, what: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(part)
        .map_err(|_| Error::Integrity(format!("{what} is not valid base64")))
}

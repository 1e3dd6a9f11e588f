//! Redacting wrapper for key material, tokens and salts

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value. Renders as `[REDACTED]` in Debug/Display so it can sit
/// inside structs that are logged, and is zeroized when dropped.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the inner value. Callers must not log or persist it in clear.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize + AsRef<[u8]>> Secret<T> {
    /// True when the secret is empty or only ASCII whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.as_ref().iter().all(|b| b.is_ascii_whitespace())
    }

    /// Length of the secret in bytes.
    pub fn byte_len(&self) -> usize {
        self.0.as_ref().len()
    }
}

impl<T: Zeroize> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

//! OAuth `state` nonces for CSRF protection
//!
//! A nonce is minted when the authorization URL is built and bound to a
//! caller-defined payload (the provisional tenant being onboarded). The
//! callback must present a stored, unexpired nonce; each nonce is single-use.
//! Entries are keyed by the SHA-256 of the nonce, so lookup is a single map
//! access whose timing says nothing about the nonce itself; the stored nonce is
//! then compared in constant time.
//!
//! At most `max_pending` authorizations are held at once. When full, expired
//! entries are purged first; if none have expired, `issue` refuses.
//!
//! State is in-memory only: a restart forgets all pending authorizations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const STATE_ENTROPY_BYTES: usize = 32;

struct PendingState<T> {
    nonce: String,
    payload: T,
    created_at: Instant,
}

/// Pending authorizations keyed by their `state` nonce.
pub struct OAuthStateStore<T> {
    ttl: Duration,
    max_pending: usize,
    pending: Mutex<HashMap<[u8; 32], PendingState<T>>>,
}

fn digest(state: &str) -> [u8; 32] {
    Sha256::digest(state.as_bytes()).into()
}

impl<T: Send + 'static> OAuthStateStore<T> {
    pub fn new(ttl: Duration, max_pending: usize) -> Self {
        Self {
            ttl,
            max_pending,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a nonce bound to `payload`. `None` when `max_pending` unexpired
    /// authorizations are already outstanding.
    pub async fn issue(&self, payload: T) -> Option<String> {
        let mut bytes = [0u8; STATE_ENTROPY_BYTES];
        rand::rng().fill(&mut bytes);
        let state = URL_SAFE_NO_PAD.encode(bytes);

        let mut pending = self.pending.lock().await;
        if pending.len() >= self.max_pending {
            let ttl = self.ttl;
            pending.retain(|_, s| s.created_at.elapsed() < ttl);
            if pending.len() >= self.max_pending {
                warn!(max_pending = self.max_pending, "oauth state store full");
                return None;
            }
        }
        pending.insert(
            digest(&state),
            PendingState {
                nonce: state.clone(),
                payload,
                created_at: Instant::now(),
            },
        );
        Some(state)
    }

    /// Validate and consume a presented nonce.
    ///
    /// Returns the bound payload when the nonce matches a stored, unexpired
    /// entry. A matching but expired entry is removed and rejected.
    pub async fn consume(&self, presented: &str) -> Option<T> {
        if presented.is_empty() {
            return None;
        }
        let entry = self.pending.lock().await.remove(&digest(presented))?;
        if !bool::from(entry.nonce.as_bytes().ct_eq(presented.as_bytes())) {
            return None;
        }

        if entry.created_at.elapsed() >= self.ttl {
            debug!("oauth state presented after expiry");
            return None;
        }
        Some(entry.payload)
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        let ttl = self.ttl;
        pending.retain(|_, s| s.created_at.elapsed() < ttl);
        before - pending.len()
    }

    /// Number of pending authorizations.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Spawn a periodic purge of expired nonces.
pub fn spawn_state_cleanup<T: Send + 'static>(
    store: Arc<OAuthStateStore<T>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.purge_expired().await;
            if removed > 0 {
                debug!(removed, "purged expired oauth states");
            }
        }
    })
}

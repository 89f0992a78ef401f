//! Time-bounded session cache
//!
//! Sessions are keyed by `lowercase(fingerprint:sessionId)`. Key material is
//! wiped in place whenever a session leaves the store (removal, replacement,
//! expiry, teardown), so a request still holding an [`Arc<SessionContext>`]
//! sees zeroed bytes and [`SessionContext::is_wiped`] instead of a live key.

use crate::KEY_LEN;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::{Zeroize, Zeroizing};

/// Key material and expiry of one session
pub struct SessionContext {
    key: Mutex<Zeroizing<[u8; KEY_LEN]>>,
    client_public_key: Mutex<Zeroizing<Vec<u8>>>,
    expires_at: DateTime<Utc>,
    wiped: AtomicBool,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("expires_at", &self.expires_at)
            .field("wiped", &self.is_wiped())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn new(
        key: Zeroizing<[u8; KEY_LEN]>,
        client_public_key: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: Mutex::new(key),
            client_public_key: Mutex::new(Zeroizing::new(client_public_key)),
            expires_at,
            wiped: AtomicBool::new(false),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Zero the key and client public key in place
    pub fn wipe(&self) {
        self.wiped.store(true, Ordering::SeqCst);
        self.key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .zeroize();
        self.client_public_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .zeroize();
    }

    pub fn is_wiped(&self) -> bool {
        self.wiped.load(Ordering::SeqCst)
    }

    /// Run `f` with the session key
    ///
    /// After [`wipe`](Self::wipe) the key reads as all zeros.
    pub fn with_key<R>(&self, f: impl FnOnce(&[u8; KEY_LEN]) -> R) -> R {
        let key = self.key.lock().unwrap_or_else(PoisonError::into_inner);
        f(&**key)
    }

    /// Copy of the client's public key (empty once wiped)
    pub fn client_public_key(&self) -> Vec<u8> {
        self.client_public_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_vec()
    }
}

/// Storage seam for session key material
pub trait SessionStore: Send + Sync {
    /// Insert or replace; a replaced session is wiped
    fn store(&self, client_fingerprint: &str, session_id: &str, context: Arc<SessionContext>);

    /// Live session, if any; an expired hit is evicted and wiped
    fn try_get(&self, client_fingerprint: &str, session_id: &str) -> Option<Arc<SessionContext>>;

    /// Wipe and remove; unknown keys are ignored
    fn remove(&self, client_fingerprint: &str, session_id: &str);

    /// Wipe and remove every expired session, returning how many
    fn cleanup_expired(&self) -> usize;

    /// Wipe and remove every session
    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Case-insensitive cache key for a session
pub fn session_key(client_fingerprint: &str, session_id: &str) -> String {
    format!("{}:{}", client_fingerprint, session_id).to_lowercase()
}

/// Concurrent in-process session store
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Arc<SessionContext>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict_if_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.sessions.remove_if(key, |_, ctx| ctx.is_expired_at(now)) {
            Some((_, ctx)) => {
                ctx.wipe();
                true
            }
            None => false,
        }
    }
}

impl SessionStore for InMemorySessionStore {
    fn store(&self, client_fingerprint: &str, session_id: &str, context: Arc<SessionContext>) {
        let key = session_key(client_fingerprint, session_id);
        if let Some(old) = self.sessions.insert(key, Arc::clone(&context)) {
            if !Arc::ptr_eq(&old, &context) {
                old.wipe();
            }
        }
    }

    fn try_get(&self, client_fingerprint: &str, session_id: &str) -> Option<Arc<SessionContext>> {
        let key = session_key(client_fingerprint, session_id);
        let found = self.sessions.get(&key).map(|entry| Arc::clone(entry.value()))?;

        let now = Utc::now();
        if found.is_expired_at(now) {
            self.evict_if_expired(&key, now);
            return None;
        }
        Some(found)
    }

    fn remove(&self, client_fingerprint: &str, session_id: &str) {
        if let Some((_, ctx)) = self
            .sessions
            .remove(&session_key(client_fingerprint, session_id))
        {
            ctx.wipe();
        }
    }

    fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter(|key| self.evict_if_expired(key, now))
            .count()
    }

    fn clear(&self) {
        self.sessions.retain(|_, ctx| {
            ctx.wipe();
            false
        });
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

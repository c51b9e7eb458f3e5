//! In-memory credential health store.
//!
//! Tracks per-credential availability: available (absent entry), cooling down
//! until a deadline, or dead until explicitly revived. Keyed by the decrypted
//! credential value since that is what the dispatcher hands to adapters.
//! There is no background sweeper; expired cooldowns are evicted lazily on
//! read. Cooldown durations are policy owned by the dispatcher, not data
//! stored here.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Non-available credential states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyStatus {
    Cooldown,
    Dead,
}

#[derive(Debug, Clone, Copy)]
struct KeyState {
    status: KeyStatus,
    unlock_at: Option<Instant>,
}

/// Thread-safe credential health store.
#[derive(Default)]
pub struct KeyHealthStore {
    states: RwLock<HashMap<String, KeyState>>,
}

impl KeyHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the credential may be used right now.
    ///
    /// The fast path takes only the read lock; an expired cooldown upgrades
    /// to the write lock for lazy eviction.
    pub fn is_available(&self, key: &str) -> bool {
        let state = {
            let states = self.states.read().expect("key health lock poisoned");
            match states.get(key) {
                Some(state) => *state,
                None => return true,
            }
        };

        match state.status {
            KeyStatus::Dead => false,
            KeyStatus::Cooldown => {
                let expired = state
                    .unlock_at
                    .map(|unlock| Instant::now() >= unlock)
                    .unwrap_or(true);
                if expired {
                    self.mark_available(key);
                }
                expired
            }
        }
    }

    /// Put the credential into cooldown, overriding any existing state.
    pub fn mark_cooldown(&self, key: &str, duration: Duration) {
        let mut states = self.states.write().expect("key health lock poisoned");
        states.insert(
            key.to_string(),
            KeyState {
                status: KeyStatus::Cooldown,
                unlock_at: Some(Instant::now() + duration),
            },
        );
    }

    /// Mark the credential dead. Only [`KeyHealthStore::mark_available`]
    /// brings it back within the process lifetime.
    pub fn mark_dead(&self, key: &str) {
        let mut states = self.states.write().expect("key health lock poisoned");
        states.insert(
            key.to_string(),
            KeyState {
                status: KeyStatus::Dead,
                unlock_at: None,
            },
        );
    }

    /// Clear any recorded state, making the credential available again.
    pub fn mark_available(&self, key: &str) {
        let mut states = self.states.write().expect("key health lock poisoned");
        states.remove(key);
    }

    /// Number of credentials currently tracked (cooldown or dead).
    pub fn tracked(&self) -> usize {
        self.states.read().expect("key health lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_is_available() {
        let store = KeyHealthStore::new();
        assert!(store.is_available("sk-new"));
    }

    #[test]
    fn test_dead_until_marked_available() {
        let store = KeyHealthStore::new();
        store.mark_dead("sk-a");
        assert!(!store.is_available("sk-a"));
        assert!(!store.is_available("sk-a"));

        store.mark_available("sk-a");
        assert!(store.is_available("sk-a"));
    }

    #[test]
    fn test_cooldown_expires_and_evicts() {
        let store = KeyHealthStore::new();
        store.mark_cooldown("sk-b", Duration::from_secs(60));
        assert!(!store.is_available("sk-b"));

        // Zero-duration cooldown is immediately expired; the read evicts it
        store.mark_cooldown("sk-b", Duration::from_secs(0));
        assert!(store.is_available("sk-b"));
        assert_eq!(store.tracked(), 0);
    }

    #[test]
    fn test_cooldown_overrides_dead() {
        let store = KeyHealthStore::new();
        store.mark_dead("sk-c");
        store.mark_cooldown("sk-c", Duration::from_secs(0));
        assert!(store.is_available("sk-c"));
    }
}

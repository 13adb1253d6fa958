//! Connection cache
//!
//! TTL map of peers that completed a handshake recently. Shared by every
//! worker of every dispatch loop, so it is backed by a sharded concurrent
//! map rather than a single lock.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Default time a completed handshake stays valid
pub const DEFAULT_HANDSHAKE_TTL: Duration = Duration::from_secs(30 * 60);

/// Peers with a recently completed handshake, keyed by `host:port`
#[derive(Debug, Default)]
pub struct ConnectionCache {
    entries: DashMap<String, Instant>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an entry
    pub fn add(&self, key: impl Into<String>, expiry: Instant) {
        self.entries.insert(key.into(), expiry);
    }

    /// Insert or refresh an entry expiring `ttl` from now
    pub fn add_for(&self, key: impl Into<String>, ttl: Duration) {
        self.add(key, Instant::now() + ttl);
    }

    /// True when `key` is present and unexpired; expired entries are removed
    pub fn is_cached(&self, key: &str) -> bool {
        let now = Instant::now();
        {
            match self.entries.get(key) {
                Some(expiry) if *expiry > now => return true,
                Some(_) => {}
                None => return false,
            }
        }
        self.entries.remove_if(key, |_, expiry| *expiry <= now);
        false
    }

    /// Expiry of an entry, expired or not
    pub fn expiry_of(&self, key: &str) -> Option<Instant> {
        self.entries.get(key).map(|expiry| *expiry)
    }

    /// Sweep every expired entry, returning how many were dropped
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, expiry| {
            let keep = *expiry > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            log::debug!("Swept {} expired handshake entries", removed);
        }
        removed
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

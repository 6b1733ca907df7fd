//! Concurrent registry of known peer urls
//!
//! Entries registered manually never expire. Entries learned from heartbeats
//! carry a last-seen timestamp and are considered stale once the configured
//! timeout has elapsed without a refresh.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub url: String,
    pub last_seen: Instant,
    /// False for manually registered peers
    pub expiring: bool,
}

impl PeerEntry {
    fn is_stale(&self, now: Instant, stale_timeout: Option<Duration>) -> bool {
        match stale_timeout {
            Some(timeout) if self.expiring => now.saturating_duration_since(self.last_seen) > timeout,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    entries: DashMap<String, PeerEntry>,
    stale_timeout: Option<Duration>,
}

impl PeerRegistry {
    /// Registry whose entries never go stale
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_timeout(stale_timeout: Duration) -> Self {
        PeerRegistry {
            entries: DashMap::new(),
            stale_timeout: Some(stale_timeout),
        }
    }

    pub fn stale_timeout(&self) -> Option<Duration> {
        self.stale_timeout
    }

    /// Register a url permanently. Returns true if the url was not known.
    pub fn register(&self, url: &str) -> bool {
        let now = Instant::now();
        let previous = self.entries.insert(
            url.to_string(),
            PeerEntry {
                url: url.to_string(),
                last_seen: now,
                expiring: false,
            },
        );
        previous.is_none()
    }

    /// Record a heartbeat for a url. Returns true if the url was newly discovered.
    ///
    /// A manually registered url stays permanent.
    pub fn refresh(&self, url: &str) -> bool {
        let now = Instant::now();
        let mut discovered = false;
        self.entries
            .entry(url.to_string())
            .and_modify(|entry| {
                if entry.is_stale(now, self.stale_timeout) {
                    discovered = true;
                }
                entry.last_seen = now;
            })
            .or_insert_with(|| {
                discovered = true;
                PeerEntry {
                    url: url.to_string(),
                    last_seen: now,
                    expiring: true,
                }
            });
        discovered
    }

    /// Remove a url. Removing an unknown url is a no-op.
    pub fn unregister(&self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    pub fn contains(&self, url: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(url)
            .is_some_and(|entry| !entry.is_stale(now, self.stale_timeout))
    }

    /// Snapshot of the live urls. Later mutations do not affect the returned list.
    pub fn list(&self) -> Vec<String> {
        let now = Instant::now();
        let mut urls: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_stale(now, self.stale_timeout))
            .map(|entry| entry.key().clone())
            .collect();
        urls.sort();
        urls
    }

    /// Drop stale entries and return their urls.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_stale(now, self.stale_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for url in &stale {
            if self
                .entries
                .remove_if(url, |_, entry| entry.is_stale(now, self.stale_timeout))
                .is_some()
            {
                debug!("Removed stale peer: {}", url);
            }
        }
        stale
    }

    /// Number of entries, including stale ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

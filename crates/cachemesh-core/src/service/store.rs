//! Local cache storage used by replicated caches and the peer listener.
//!
//! All operations here are "quiet": they never trigger replication, so a
//! peer applying a remote event does not echo it back to the cluster.

use dashmap::DashMap;

use crate::model::{Element, EventMessage};

pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    fn get_quiet(&self, key: &str) -> Option<Element>;

    fn put_quiet(&self, element: Element);

    /// Returns true if an entry was removed
    fn remove_quiet(&self, key: &str) -> bool;

    fn remove_all_quiet(&self);

    fn keys(&self) -> Vec<String>;

    fn size(&self) -> usize {
        self.keys().len()
    }

    /// Apply a replicated event message
    fn apply(&self, message: EventMessage) {
        match message {
            EventMessage::Put { element } => self.put_quiet(element),
            EventMessage::Remove { key } => {
                self.remove_quiet(&key);
            }
            EventMessage::RemoveAll => self.remove_all_quiet(),
        }
    }
}

/// In-memory store backed by a concurrent map
pub struct MemoryCacheStore {
    name: String,
    entries: DashMap<String, Element>,
}

impl MemoryCacheStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
        }
    }
}

impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_quiet(&self, key: &str) -> Option<Element> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn put_quiet(&self, element: Element) {
        self.entries.insert(element.key.clone(), element);
    }

    fn remove_quiet(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn remove_all_quiet(&self) {
        self.entries.clear();
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    fn size(&self) -> usize {
        self.entries.len()
    }
}

//! In-process weak etag storage.
//!
//! One stored value per row identity (`WeakEtag::cache_key`), reachable through
//! any number of lookup keys. A lookup key may reach several identities: rows
//! written in one transaction share their `xmin`, so the version-only key of
//! each of them is the same. Removing through a key drops every value it
//! reaches, together with every other key pointing at those values.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use metrics::gauge;

use crate::domain::etag::WeakEtag;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_NAIVE_ENTRIES: &str = "featuretag_cache_naive_entries";

struct StoredEtag {
    etag: WeakEtag,
    keys: HashSet<String>,
}

#[derive(Default)]
struct Entries {
    /// Lookup key -> identities, oldest first. Never holds an empty list.
    index: HashMap<String, Vec<String>>,
    /// Identity -> value and the lookup keys that reach it.
    values: HashMap<String, StoredEtag>,
}

impl Entries {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity.saturating_mul(2)),
            values: HashMap::with_capacity(capacity),
        }
    }

    fn unlink(&mut self, key: &str, identity: &str) {
        let now_empty = match self.index.get_mut(key) {
            Some(identities) => {
                identities.retain(|candidate| candidate != identity);
                identities.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.index.remove(key);
        }
    }
}

/// Weak etag store guarded by a single `RwLock`.
///
/// The capacity given at construction only pre-sizes the maps; entries are
/// never evicted.
// TODO: add a configurable capacity bound with eviction once the read path
// can tolerate dropped entries for rows it still serves.
pub struct BoundedStore {
    entries: RwLock<Entries>,
}

impl BoundedStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::with_capacity(capacity)),
        }
    }

    /// Insert or overwrite `value` and make it reachable through `key`.
    /// Always reports `true`.
    pub fn add(&self, key: &str, value: WeakEtag) -> bool {
        let identity = value.cache_key();
        let mut entries = rw_write(&self.entries, SOURCE, "add");

        let identities = entries.index.entry(key.to_string()).or_default();
        if !identities.contains(&identity) {
            identities.push(identity.clone());
        }

        match entries.values.get_mut(&identity) {
            Some(stored) => {
                stored.etag = value;
                stored.keys.insert(key.to_string());
            }
            None => {
                let mut keys = HashSet::with_capacity(2);
                keys.insert(key.to_string());
                entries.values.insert(
                    identity,
                    StoredEtag {
                        etag: value,
                        keys,
                    },
                );
            }
        }

        gauge!(METRIC_NAIVE_ENTRIES).set(entries.values.len() as f64);
        true
    }

    /// Remove every value reachable through `key`, along with all of their keys.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "remove");
        let Some(identities) = entries.index.remove(key) else {
            return false;
        };

        for identity in &identities {
            let Some(stored) = entries.values.remove(identity) else {
                continue;
            };
            for alias in stored.keys.iter().filter(|alias| alias.as_str() != key) {
                entries.unlink(alias, identity);
            }
        }

        gauge!(METRIC_NAIVE_ENTRIES).set(entries.values.len() as f64);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        rw_read(&self.entries, SOURCE, "contains")
            .index
            .contains_key(key)
    }

    /// Most recently linked value reachable through `key`.
    pub fn get(&self, key: &str) -> Option<WeakEtag> {
        let entries = rw_read(&self.entries, SOURCE, "get");
        let identity = entries.index.get(key)?.last()?;
        entries
            .values
            .get(identity)
            .map(|stored| stored.etag.clone())
    }

    /// Number of stored values. A value reachable by two keys counts once.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        rw_read(&self.entries, SOURCE, "key_count").index.len()
    }
}

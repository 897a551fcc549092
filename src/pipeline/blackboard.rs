use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::signal::ChangeSignal;
use super::unit::UnitId;
use crate::core::errors::{GenError, Result};

/// Opaque artifact as stored on the blackboard
pub type Artifact = Arc<dyn Any + Send + Sync>;

struct Entry {
    value: Artifact,
    type_name: &'static str,
    writer: Option<UnitId>,
}

/// Shared key to artifact store. The only mutable state units share.
///
/// Every entry is synchronized independently, so concurrent writes to
/// distinct keys never lose or tear each other. The blackboard does not
/// order a writer and a reader of the same key; readiness gating does.
#[derive(Clone)]
pub struct Blackboard {
    entries: Arc<DashMap<String, Entry>>,
    signal: ChangeSignal,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::with_signal(ChangeSignal::new())
    }

    pub(crate) fn with_signal(signal: ChangeSignal) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            signal,
        }
    }

    /// Store `value` under `key`, replacing any previous artifact
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.set_by(key.into(), Arc::new(value), None);
    }

    /// Store an already shared artifact
    pub fn set_shared<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        self.set_by(key.into(), value, None);
    }

    pub(crate) fn set_by<T: Any + Send + Sync>(
        &self,
        key: String,
        value: Arc<T>,
        writer: Option<UnitId>,
    ) {
        let entry = Entry {
            value,
            type_name: type_name::<T>(),
            writer,
        };

        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            match (previous.writer, writer) {
                (Some(before), Some(now)) if before != now => {
                    warn!(key = %key, first = before, second = now, "Artifact written by two different units");
                }
                _ => debug!(key = %key, "Artifact overwritten"),
            }
        } else {
            debug!(key = %key, writer = ?writer, "Artifact stored");
        }

        self.signal.notify();
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Fetch an artifact the caller knows is present.
    ///
    /// An absent key is a broken contract between units and comes back as
    /// [`GenError::MissingArtifact`].
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>> {
        let value = self
            .get_raw(key)
            .ok_or_else(|| GenError::missing_artifact(key))?;
        value
            .downcast::<T>()
            .map_err(|_| GenError::artifact_type(key, type_name::<T>()))
    }

    /// Fetch an artifact if it is present and of type `T`
    pub fn try_get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get_raw(key)?.downcast::<T>().ok()
    }

    /// Fetch and clone an artifact out of the store
    pub fn get_cloned<T: Any + Send + Sync + Clone>(&self, key: &str) -> Result<T> {
        self.get::<T>(key).map(|value| T::clone(&value))
    }

    pub fn get_raw(&self, key: &str) -> Option<Artifact> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.value))
    }

    /// Unit that last wrote `key`, if it was written from a unit
    pub fn writer_of(&self, key: &str) -> Option<UnitId> {
        self.entries.get(key).and_then(|entry| entry.writer)
    }

    pub fn remove(&self, key: &str) -> Option<Artifact> {
        let removed = self.entries.remove(key).map(|(_, entry)| entry.value);
        if removed.is_some() {
            self.signal.notify();
        }
        removed
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.signal.notify();
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.signal.subscribe()
    }
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for key in self.keys() {
            if let Some(entry) = self.entries.get(&key) {
                map.entry(&key, &entry.type_name);
            }
        }
        map.finish()
    }
}

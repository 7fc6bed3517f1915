use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{ChangeCallback, ChangeEvent, StoreError, SubjectData, SubjectStore};
use crate::types::SubjectRef;

/// In-process store backed by a `DashMap`.
///
/// Used by hosts without a database and as the fixture store in tests:
/// every `put`/`remove` notifies watchers, `load_count` reports how many
/// backend fetches were served, and `fail_with` injects backend errors.
#[derive(Default)]
pub struct MemoryStore {
    subjects: DashMap<SubjectRef, SubjectData>,
    failures: DashMap<SubjectRef, String>,
    watchers: RwLock<Vec<ChangeCallback>>,
    loads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a JSON object keyed by `collection:identity`.
    ///
    /// ```json
    /// { "user:alice": { "segments": [ { "permissions": { "build.*": 1 } } ] } }
    /// ```
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let raw: BTreeMap<String, SubjectData> = serde_json::from_str(json)
            .map_err(|e| StoreError::Backend(format!("fixture parse error: {}", e)))?;
        let store = Self::new();
        for (key, data) in raw {
            let subject: SubjectRef = key
                .parse()
                .map_err(|e| StoreError::Backend(format!("fixture key {:?}: {}", key, e)))?;
            store.subjects.insert(subject, data);
        }
        Ok(store)
    }

    /// Insert or replace a subject and notify watchers.
    pub fn put(&self, subject: SubjectRef, data: SubjectData) {
        self.subjects.insert(subject.clone(), data);
        self.notify(ChangeEvent::Subject(subject));
    }

    pub fn remove(&self, subject: &SubjectRef) -> Option<SubjectData> {
        let removed = self.subjects.remove(subject).map(|(_, data)| data);
        if removed.is_some() {
            self.notify(ChangeEvent::Subject(subject.clone()));
        }
        removed
    }

    pub fn get(&self, subject: &SubjectRef) -> Option<SubjectData> {
        self.subjects.get(subject).map(|d| d.clone())
    }

    /// Make every load of `subject` fail with a backend error until cleared.
    pub fn fail_with(&self, subject: SubjectRef, message: impl Into<String>) {
        self.failures.insert(subject, message.into());
    }

    pub fn clear_failure(&self, subject: &SubjectRef) {
        self.failures.remove(subject);
    }

    /// Broadcast a change event, e.g. after an out-of-band bulk import.
    pub fn notify(&self, event: ChangeEvent) {
        let watchers = self.watchers.read().clone();
        for watcher in watchers {
            watcher(event.clone());
        }
    }

    /// Number of `load_subject` calls served so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn load_subject(&self, subject: &SubjectRef) -> Result<SubjectData, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if let Some(msg) = self.failures.get(subject) {
            return Err(StoreError::Backend(msg.clone()));
        }
        self.subjects
            .get(subject)
            .map(|d| d.clone())
            .ok_or_else(|| StoreError::NotFound(subject.clone()))
    }

    fn watch_for_changes(&self, callback: ChangeCallback) {
        self.watchers.write().push(callback);
    }
}

//! Persistence collaborator interface.
//!
//! The engine never talks to a database directly. A host injects a
//! [`SubjectStore`] that loads one subject's segments on demand and reports
//! upstream changes through a callback.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::segment::Segment;
use crate::types::SubjectRef;

/// Store-side failure. `Clone` so a single in-flight load can hand the same
/// outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("subject not found: {0}")]
    NotFound(SubjectRef),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Everything the engine needs to know about one subject.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectData {
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl SubjectData {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }
}

/// Upstream data change reported by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// One subject's data changed.
    Subject(SubjectRef),
    /// Anything may have changed.
    All,
}

pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[async_trait]
pub trait SubjectStore: Send + Sync + 'static {
    /// Load one subject. Missing subjects fail with [`StoreError::NotFound`].
    async fn load_subject(&self, subject: &SubjectRef) -> Result<SubjectData, StoreError>;

    /// Register a callback invoked whenever underlying data changes.
    fn watch_for_changes(&self, callback: ChangeCallback);
}

//! Subject graph: resident subjects, deduplicated backend loads, and
//! replace-on-write segment updates.
//!
//! Each subject node holds an immutable `Arc<[Arc<Segment>]>` snapshot that
//! writers swap atomically under a per-subject writer lock, so readers on
//! any thread see either the old or the new list, never a torn one. Every
//! write bumps the cache generation before it returns.
//!
//! Loads run as tasks spawned on the runtime handle the graph was built
//! with, shared by every concurrent requester: at most one fetch per
//! subject is in flight, and a caller that abandons its query does not
//! cancel the fetch other waiters depend on. Callers may await queries
//! from any executor.

mod traverse;

pub use traverse::{Traversal, Visit, DEFAULT_COLLECTION};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::cache::ResolutionCache;
use crate::config::ResolverConfig;
use crate::error::{PermissionError, Result};
use crate::segment::{Segment, SegmentBuilder};
use crate::store::{ChangeEvent, StoreError, SubjectData, SubjectStore};
use crate::types::{ContextSet, SubjectRef};

/// Residency state of a subject node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Live,
    /// Upstream data changed; the next access reloads it.
    Stale,
    /// Logically deleted: queries on it fail, as a parent it is pruned.
    Tombstoned,
}

pub type SegmentList = Arc<[Arc<Segment>]>;

#[derive(Debug)]
struct NodeInner {
    segments: SegmentList,
    state: NodeState,
}

#[derive(Debug)]
pub struct SubjectNode {
    subject: SubjectRef,
    inner: RwLock<NodeInner>,
    writer: Mutex<()>,
}

impl SubjectNode {
    fn new(subject: SubjectRef, segments: SegmentList, state: NodeState) -> Self {
        Self {
            subject,
            inner: RwLock::new(NodeInner { segments, state }),
            writer: Mutex::new(()),
        }
    }

    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    pub fn segments(&self) -> SegmentList {
        Arc::clone(&self.inner.read().segments)
    }

    fn publish(&self, segments: SegmentList, state: NodeState) {
        let mut inner = self.inner.write();
        inner.segments = segments;
        inner.state = state;
    }

    fn mark_stale(&self) {
        self.inner.write().state = NodeState::Stale;
    }
}

pub type LoadOutcome = std::result::Result<Option<Arc<SubjectNode>>, StoreError>;
type LoadFuture = Shared<BoxFuture<'static, LoadOutcome>>;

struct GraphState {
    store: Arc<dyn SubjectStore>,
    runtime: Handle,
    cache: Arc<ResolutionCache>,
    separator: char,
    cycle_detection: bool,
    fallback_subjects: bool,
    nodes: DashMap<SubjectRef, Arc<SubjectNode>>,
    /// In-flight loads, tagged with a load id so a superseded load never
    /// removes or installs over its successor.
    loading: Mutex<AHashMap<SubjectRef, (u64, LoadFuture)>>,
    next_load: AtomicU64,
}

impl GraphState {
    /// Compile a segment's patterns eagerly and log the rejected ones.
    fn compile(&self, subject: &SubjectRef, segment: Segment) -> Arc<Segment> {
        for failure in segment.pattern_failures(self.separator).iter() {
            tracing::warn!(
                subject = %subject,
                pattern = %failure.pattern,
                error = %failure.error,
                "skipping malformed permission pattern"
            );
        }
        Arc::new(segment)
    }

    fn prepare(&self, subject: &SubjectRef, segments: Vec<Segment>) -> SegmentList {
        segments
            .into_iter()
            .map(|segment| self.compile(subject, segment))
            .collect()
    }

    /// Publish a finished load. Runs under the `loading` lock.
    fn install(
        &self,
        subject: &SubjectRef,
        outcome: std::result::Result<SubjectData, StoreError>,
    ) -> LoadOutcome {
        match outcome {
            Ok(data) => {
                let segments = self.prepare(subject, data.segments);
                let node = self
                    .nodes
                    .entry(subject.clone())
                    .or_insert_with(|| {
                        Arc::new(SubjectNode::new(
                            subject.clone(),
                            Arc::clone(&segments),
                            NodeState::Live,
                        ))
                    })
                    .clone();
                let _writer = node.writer.lock();
                if node.state() == NodeState::Stale {
                    node.publish(segments, NodeState::Live);
                }
                tracing::debug!(subject = %subject, "subject loaded");
                Ok(Some(Arc::clone(&node)))
            }
            Err(StoreError::NotFound(_)) => {
                // A stale node whose data vanished upstream is now deleted.
                let existing = self.nodes.get(subject).map(|n| Arc::clone(&n));
                match existing {
                    Some(node) => {
                        let _writer = node.writer.lock();
                        if node.state() == NodeState::Stale {
                            node.publish(Arc::from(Vec::new()), NodeState::Tombstoned);
                        }
                        Ok(Some(Arc::clone(&node)))
                    }
                    None => Ok(None),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn mark_stale(&self, subject: &SubjectRef) {
        let mut loading = self.loading.lock();
        loading.remove(subject);
        if let Some(node) = self.nodes.get(subject) {
            node.mark_stale();
        }
    }

    fn mark_all_stale(&self) {
        let mut loading = self.loading.lock();
        loading.clear();
        for node in self.nodes.iter() {
            node.mark_stale();
        }
    }

    fn on_change(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Subject(subject) => {
                self.mark_stale(&subject);
                self.cache.invalidate_subject(&subject);
            }
            ChangeEvent::All => {
                self.mark_all_stale();
                self.cache.invalidate_all();
            }
        }
    }
}

/// Resident subject graph shared by all queries of one resolver.
#[derive(Clone)]
pub struct SubjectGraph {
    state: Arc<GraphState>,
}

impl SubjectGraph {
    /// Create a graph over `store` and subscribe to its change events.
    /// Backend loads are spawned on `runtime`.
    pub fn new(
        store: Arc<dyn SubjectStore>,
        cache: Arc<ResolutionCache>,
        config: &ResolverConfig,
        runtime: Handle,
    ) -> Self {
        let state = Arc::new(GraphState {
            store: Arc::clone(&store),
            runtime,
            cache,
            separator: config.separator,
            cycle_detection: config.cycle_detection,
            fallback_subjects: config.fallback_subjects,
            nodes: DashMap::new(),
            loading: Mutex::new(AHashMap::new()),
            next_load: AtomicU64::new(0),
        });

        let weak: Weak<GraphState> = Arc::downgrade(&state);
        store.watch_for_changes(Arc::new(move |event| {
            if let Some(state) = weak.upgrade() {
                state.on_change(event);
            }
        }));

        Self { state }
    }

    pub fn separator(&self) -> char {
        self.state.separator
    }

    pub fn is_resident(&self, subject: &SubjectRef) -> bool {
        self.state.nodes.contains_key(subject)
    }

    pub fn resident_count(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn in_flight_loads(&self) -> usize {
        self.state.loading.lock().len()
    }

    /// Resident node for `subject`, loading it first when absent or stale.
    /// `Ok(None)` means the store has no such subject.
    pub async fn node(&self, subject: &SubjectRef) -> LoadOutcome {
        let resident = self
            .state
            .nodes
            .get(subject)
            .filter(|node| node.state() != NodeState::Stale)
            .map(|node| Arc::clone(&node));
        if let Some(node) = resident {
            return Ok(Some(node));
        }
        self.load(subject).await
    }

    fn load(&self, subject: &SubjectRef) -> LoadFuture {
        let mut loading = self.state.loading.lock();
        if let Some((_, pending)) = loading.get(subject) {
            return pending.clone();
        }

        let id = self.state.next_load.fetch_add(1, Ordering::Relaxed);
        let state = Arc::clone(&self.state);
        let key = subject.clone();
        tracing::debug!(subject = %key, "loading subject");
        let handle = self.state.runtime.spawn(async move {
            let outcome = state.store.load_subject(&key).await;
            let mut loading = state.loading.lock();
            let current = matches!(loading.get(&key), Some((owner, _)) if *owner == id);
            if !current {
                // Superseded by a change event; deliver without installing.
                return match outcome {
                    Ok(data) => {
                        let segments = state.prepare(&key, data.segments);
                        Ok(Some(Arc::new(SubjectNode::new(key, segments, NodeState::Live))))
                    }
                    Err(StoreError::NotFound(_)) => Ok(None),
                    Err(err) => Err(err),
                };
            }
            loading.remove(&key);
            state.install(&key, outcome)
        });

        let pending = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(StoreError::Backend(format!("load task failed: {}", err))),
            }
        }
        .boxed()
        .shared();
        loading.insert(subject.clone(), (id, pending.clone()));
        pending
    }

    /// Node to write to: resident, loaded, or created empty when the store
    /// has no such subject.
    async fn writable_node(&self, subject: &SubjectRef) -> Result<Arc<SubjectNode>> {
        if let Some(node) = self.node(subject).await? {
            return Ok(node);
        }
        Ok(self.create_node(subject))
    }

    fn create_node(&self, subject: &SubjectRef) -> Arc<SubjectNode> {
        self.state
            .nodes
            .entry(subject.clone())
            .or_insert_with(|| {
                Arc::new(SubjectNode::new(
                    subject.clone(),
                    Arc::from(Vec::new()),
                    NodeState::Live,
                ))
            })
            .clone()
    }

    /// Publish under the node's writer lock and invalidate before returning.
    fn commit(&self, node: &SubjectNode, segments: SegmentList, state: NodeState) {
        node.publish(segments, state);
        self.state.cache.invalidate_subject(&node.subject);
    }

    /// Replace all segments of `subject`.
    pub fn set_segments(&self, subject: &SubjectRef, segments: Vec<Segment>) {
        let node = self.create_node(subject);
        let prepared = self.state.prepare(subject, segments);
        let _writer = node.writer.lock();
        self.commit(&node, prepared, NodeState::Live);
    }

    /// Replace the segment whose context set equals `contexts` (creating it
    /// when absent) with the result of `update` applied to its builder.
    pub async fn update_segment<F>(
        &self,
        subject: &SubjectRef,
        contexts: &ContextSet,
        update: F,
    ) -> Result<Arc<Segment>>
    where
        F: FnOnce(SegmentBuilder) -> SegmentBuilder,
    {
        let node = self.writable_node(subject).await?;
        let _writer = node.writer.lock();

        let current = node.segments();
        let position = current.iter().position(|s| s.contexts() == contexts);
        let builder = match position {
            Some(i) => current[i].to_builder(),
            None => Segment::builder().contexts(contexts.clone()),
        };
        let segment = update(builder).contexts(contexts.clone()).build();
        let segment = self.state.compile(subject, segment);

        let mut next: Vec<Arc<Segment>> = current.to_vec();
        match position {
            Some(i) => next[i] = Arc::clone(&segment),
            None => next.push(Arc::clone(&segment)),
        }
        self.commit(&node, next.into(), NodeState::Live);
        Ok(segment)
    }

    /// Remove the segment whose context set equals `contexts`. Returns
    /// whether one existed.
    pub async fn remove_segment(&self, subject: &SubjectRef, contexts: &ContextSet) -> Result<bool> {
        let Some(node) = self.node(subject).await? else {
            return Ok(false);
        };
        let _writer = node.writer.lock();
        let current = node.segments();
        let next: Vec<Arc<Segment>> = current
            .iter()
            .filter(|s| s.contexts() != contexts)
            .cloned()
            .collect();
        if next.len() == current.len() {
            return Ok(false);
        }
        let state = node.state();
        self.commit(&node, next.into(), state);
        Ok(true)
    }

    /// Logically delete `subject`: its segments are dropped but the node
    /// stays resident so cached edges never dangle.
    pub fn tombstone(&self, subject: &SubjectRef) {
        let node = self.create_node(subject);
        let _writer = node.writer.lock();
        self.commit(&node, Arc::from(Vec::new()), NodeState::Tombstoned);
    }

    /// Current segments of a live subject.
    pub async fn segments(&self, subject: &SubjectRef) -> Result<SegmentList> {
        match self.node(subject).await? {
            Some(node) if node.state() != NodeState::Tombstoned => Ok(node.segments()),
            _ => Err(PermissionError::SubjectNotFound(subject.clone())),
        }
    }

    /// Force a reload of `subject` on next access.
    pub fn mark_stale(&self, subject: &SubjectRef) {
        self.state.mark_stale(subject);
        self.state.cache.invalidate_subject(subject);
    }

    pub fn mark_all_stale(&self) {
        self.state.mark_all_stale();
        self.state.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InvalidationMode;
    use crate::store::MemoryStore;

    fn user(id: &str) -> SubjectRef {
        SubjectRef::new("user", id)
    }

    fn graph_over(store: Arc<MemoryStore>) -> (SubjectGraph, Arc<ResolutionCache>) {
        let cache = Arc::new(ResolutionCache::new(InvalidationMode::Coarse, 0));
        let graph = SubjectGraph::new(
            store,
            Arc::clone(&cache),
            &ResolverConfig::default(),
            Handle::current(),
        );
        (graph, cache)
    }

    #[tokio::test]
    async fn resident_subject_is_loaded_once() {
        let store = Arc::new(MemoryStore::new());
        store.put(user("alice"), SubjectData::default());
        let (graph, _) = graph_over(Arc::clone(&store));

        assert!(graph.node(&user("alice")).await.unwrap().is_some());
        assert!(graph.node(&user("alice")).await.unwrap().is_some());
        assert_eq!(store.load_count(), 1);
        assert!(graph.is_resident(&user("alice")));
        assert_eq!(graph.in_flight_loads(), 0);
    }

    #[tokio::test]
    async fn missing_subject_is_not_resident() {
        let store = Arc::new(MemoryStore::new());
        let (graph, _) = graph_over(store);
        assert!(graph.node(&user("ghost")).await.unwrap().is_none());
        assert!(!graph.is_resident(&user("ghost")));
    }

    #[tokio::test]
    async fn writes_bump_generation() {
        let store = Arc::new(MemoryStore::new());
        let (graph, cache) = graph_over(store);
        let before = cache.current_generation();

        graph.set_segments(&user("bob"), vec![Segment::builder().permission("a", 1).build()]);
        let seg = graph
            .update_segment(&user("bob"), &ContextSet::new(), |b| b.permission("b", -1))
            .await
            .unwrap();
        assert_eq!(seg.permission("a"), Some(1));
        assert_eq!(seg.permission("b"), Some(-1));
        assert_eq!(cache.current_generation(), before + 2);
        assert_eq!(graph.segments(&user("bob")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_creates_context_scoped_segment() {
        let store = Arc::new(MemoryStore::new());
        let (graph, _) = graph_over(store);
        let nether: ContextSet = vec![crate::types::ContextValue::new("world", "nether")].into();

        graph
            .update_segment(&user("carol"), &ContextSet::new(), |b| b.permission("a", 1))
            .await
            .unwrap();
        graph
            .update_segment(&user("carol"), &nether, |b| b.permission("a", -1))
            .await
            .unwrap();
        assert_eq!(graph.segments(&user("carol")).await.unwrap().len(), 2);

        assert!(graph.remove_segment(&user("carol"), &nether).await.unwrap());
        assert!(!graph.remove_segment(&user("carol"), &nether).await.unwrap());
        assert_eq!(graph.segments(&user("carol")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tombstoned_subject_reads_as_missing() {
        let store = Arc::new(MemoryStore::new());
        let (graph, _) = graph_over(store);
        graph.set_segments(&user("dave"), vec![Segment::default()]);
        graph.tombstone(&user("dave"));
        assert!(graph.is_resident(&user("dave")));
        assert!(graph.segments(&user("dave")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn change_event_forces_reload() {
        let store = Arc::new(MemoryStore::new());
        store.put(user("erin"), SubjectData::default());
        let (graph, cache) = graph_over(Arc::clone(&store));
        assert_eq!(graph.segments(&user("erin")).await.unwrap().len(), 0);

        let generation = cache.current_generation();
        store.put(
            user("erin"),
            SubjectData::new(vec![Segment::builder().permission("x", 1).build()]),
        );
        assert!(cache.current_generation() > generation);
        assert_eq!(graph.segments(&user("erin")).await.unwrap().len(), 1);
        assert_eq!(store.load_count(), 2);

        store.remove(&user("erin"));
        assert!(graph.segments(&user("erin")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn backend_error_is_not_installed() {
        let store = Arc::new(MemoryStore::new());
        store.put(user("fay"), SubjectData::default());
        store.fail_with(user("fay"), "down");
        let (graph, _) = graph_over(Arc::clone(&store));
        assert_eq!(
            graph.node(&user("fay")).await.unwrap_err(),
            StoreError::Backend("down".into())
        );
        assert!(!graph.is_resident(&user("fay")));

        store.clear_failure(&user("fay"));
        assert!(graph.node(&user("fay")).await.unwrap().is_some());
    }
}

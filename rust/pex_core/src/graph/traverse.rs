//! Breadth-first ancestor traversal over an arena of subject slots.
//!
//! Every subject is visited once, at the depth it was first reached. All
//! edges of applicable segments are recorded (including edges into already
//! visited subjects) and an iterative three-colour DFS over them reports a
//! cycle, so diamonds are deduplicated while loops fail the query.

use std::sync::Arc;

use ahash::AHashMap;
use futures::future::join_all;

use super::{NodeState, SubjectGraph};
use crate::context::ContextRegistry;
use crate::error::{PermissionError, Result};
use crate::segment::Segment;
use crate::types::{ContextSet, SubjectRef};

/// Collection holding the fallback subjects.
pub const DEFAULT_COLLECTION: &str = "default";

/// One live subject reached by a traversal.
#[derive(Debug, Clone)]
pub struct Visit {
    pub subject: SubjectRef,
    /// Edge distance from the root; fallback subjects sit below the
    /// deepest regular ancestor.
    pub depth: usize,
    /// Context-applicable segments, in stored order.
    pub segments: Vec<Arc<Segment>>,
}

#[derive(Debug, Clone, Default)]
pub struct Traversal {
    /// Live subjects in breadth-first order, root first.
    pub visits: Vec<Visit>,
    /// Every subject consulted, including pruned ones.
    pub dependencies: Vec<SubjectRef>,
    /// A non-root ancestor was pruned because of a backend error.
    pub degraded: bool,
}

struct Slot {
    subject: SubjectRef,
    depth: usize,
    fallback: bool,
    edges: Vec<usize>,
    /// `None` while pending or when pruned.
    segments: Option<Vec<Arc<Segment>>>,
}

struct Walk {
    slots: Vec<Slot>,
    index: AHashMap<SubjectRef, usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

impl Walk {
    fn new(root: SubjectRef) -> Self {
        let mut walk = Self {
            slots: Vec::new(),
            index: AHashMap::new(),
        };
        walk.reach(&root, 0, false);
        walk
    }

    /// Slot for `subject`, created when first reached. Returns whether it
    /// is new.
    fn reach(&mut self, subject: &SubjectRef, depth: usize, fallback: bool) -> (usize, bool) {
        if let Some(&i) = self.index.get(subject) {
            return (i, false);
        }
        let i = self.slots.len();
        self.slots.push(Slot {
            subject: subject.clone(),
            depth,
            fallback,
            edges: Vec::new(),
            segments: None,
        });
        self.index.insert(subject.clone(), i);
        (i, true)
    }

    fn max_depth(&self) -> usize {
        self.slots.iter().map(|s| s.depth).max().unwrap_or(0)
    }

    /// First cycle found by DFS, as a closed path `a -> ... -> a`.
    fn find_cycle(&self) -> Option<Vec<SubjectRef>> {
        let mut colour = vec![Colour::White; self.slots.len()];
        for start in 0..self.slots.len() {
            if colour[start] != Colour::White {
                continue;
            }
            colour[start] = Colour::Grey;
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                let Some(&child) = self.slots[node].edges.get(next) else {
                    colour[node] = Colour::Black;
                    stack.pop();
                    continue;
                };
                top.1 += 1;
                match colour[child] {
                    Colour::White => {
                        colour[child] = Colour::Grey;
                        stack.push((child, 0));
                    }
                    Colour::Grey => {
                        let from = stack.iter().position(|&(n, _)| n == child)?;
                        let mut cycle: Vec<SubjectRef> = stack[from..]
                            .iter()
                            .map(|&(n, _)| self.slots[n].subject.clone())
                            .collect();
                        cycle.push(self.slots[child].subject.clone());
                        return Some(cycle);
                    }
                    Colour::Black => {}
                }
            }
        }
        None
    }

    fn finish(self, degraded: bool) -> Traversal {
        let dependencies = self.slots.iter().map(|s| s.subject.clone()).collect();
        let visits = self
            .slots
            .into_iter()
            .filter_map(|slot| {
                slot.segments.map(|segments| Visit {
                    subject: slot.subject,
                    depth: slot.depth,
                    segments,
                })
            })
            .collect();
        Traversal {
            visits,
            dependencies,
            degraded,
        }
    }
}

fn fallback_subjects(root: &SubjectRef) -> [SubjectRef; 2] {
    [
        SubjectRef::new(DEFAULT_COLLECTION, root.collection.clone()),
        SubjectRef::new(DEFAULT_COLLECTION, DEFAULT_COLLECTION),
    ]
}

impl SubjectGraph {
    /// Collect the context-applicable segments of `root` and its ancestors.
    ///
    /// Subjects of one depth tier are loaded concurrently. A missing or
    /// tombstoned root fails with `SubjectNotFound`; missing ancestors are
    /// pruned.
    pub async fn traverse(
        &self,
        root: &SubjectRef,
        active: &ContextSet,
        contexts: &ContextRegistry,
    ) -> Result<Traversal> {
        let mut walk = Walk::new(root.clone());
        let mut frontier = vec![0];
        let mut fallback_pending = self.state.fallback_subjects;
        let mut degraded = false;

        loop {
            if frontier.is_empty() {
                if !fallback_pending {
                    break;
                }
                fallback_pending = false;
                let depth = walk.max_depth() + 1;
                for subject in fallback_subjects(root) {
                    let (i, fresh) = walk.reach(&subject, depth, true);
                    if fresh {
                        frontier.push(i);
                    }
                }
                continue;
            }

            let subjects: Vec<SubjectRef> = frontier
                .iter()
                .map(|&i| walk.slots[i].subject.clone())
                .collect();
            let outcomes = join_all(subjects.iter().map(|s| self.node(s))).await;

            let mut next = Vec::new();
            for (&i, outcome) in frontier.iter().zip(outcomes) {
                let slot = &walk.slots[i];
                let node = match outcome {
                    Ok(Some(node)) if node.state() != NodeState::Tombstoned => node,
                    Ok(_) if i == 0 => return Err(PermissionError::SubjectNotFound(root.clone())),
                    Err(err) if i == 0 => return Err(err.into()),
                    Ok(_) if slot.fallback => {
                        tracing::trace!(subject = %slot.subject, "no fallback subject");
                        continue;
                    }
                    Ok(_) => {
                        tracing::warn!(subject = %slot.subject, root = %root, "pruning missing ancestor");
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(
                            subject = %slot.subject,
                            root = %root,
                            error = %err,
                            "pruning ancestor after backend error"
                        );
                        degraded = true;
                        continue;
                    }
                };

                let depth = slot.depth;
                let fallback = slot.fallback;
                let applicable: Vec<Arc<Segment>> = node
                    .segments()
                    .iter()
                    .filter(|s| s.applies_to(active, contexts))
                    .cloned()
                    .collect();
                for segment in &applicable {
                    for parent in segment.parents() {
                        let (j, fresh) = walk.reach(parent, depth + 1, fallback);
                        walk.slots[i].edges.push(j);
                        if fresh {
                            next.push(j);
                        }
                    }
                }
                walk.slots[i].segments = Some(applicable);
            }
            frontier = next;
        }

        if self.state.cycle_detection {
            if let Some(cycle) = walk.find_cycle() {
                return Err(PermissionError::CycleDetected { cycle });
            }
        }

        let traversal = walk.finish(degraded);
        tracing::debug!(
            root = %root,
            visited = traversal.visits.len(),
            consulted = traversal.dependencies.len(),
            "traversal complete"
        );
        Ok(traversal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResolutionCache;
    use crate::config::{InvalidationMode, ResolverConfig};
    use crate::store::{MemoryStore, SubjectData};

    fn group(id: &str) -> SubjectRef {
        SubjectRef::new("group", id)
    }

    fn inherits(parents: &[&str]) -> SubjectData {
        let mut builder = Segment::builder();
        for p in parents {
            builder = builder.parent(group(p));
        }
        SubjectData::new(vec![builder.build()])
    }

    fn graph(store: Arc<MemoryStore>, config: ResolverConfig) -> SubjectGraph {
        let cache = Arc::new(ResolutionCache::new(InvalidationMode::Coarse, 0));
        SubjectGraph::new(store, cache, &config, tokio::runtime::Handle::current())
    }

    fn names(t: &Traversal) -> Vec<String> {
        t.visits.iter().map(|v| v.subject.identity.clone()).collect()
    }

    #[tokio::test]
    async fn breadth_first_with_depths() {
        let store = Arc::new(MemoryStore::new());
        store.put(group("a"), inherits(&["b", "c"]));
        store.put(group("b"), inherits(&["d"]));
        store.put(group("c"), inherits(&[]));
        store.put(group("d"), inherits(&[]));
        let g = graph(store, ResolverConfig::default());

        let t = g
            .traverse(&group("a"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap();
        assert_eq!(names(&t), vec!["a", "b", "c", "d"]);
        let depths: Vec<usize> = t.visits.iter().map(|v| v.depth).collect();
        assert_eq!(depths, vec![0, 1, 1, 2]);
    }

    #[tokio::test]
    async fn diamond_visits_shared_ancestor_once() {
        let store = Arc::new(MemoryStore::new());
        store.put(group("child"), inherits(&["left", "right"]));
        store.put(group("left"), inherits(&["base"]));
        store.put(group("right"), inherits(&["base"]));
        store.put(group("base"), inherits(&[]));
        let g = graph(Arc::clone(&store), ResolverConfig::default());

        let t = g
            .traverse(&group("child"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap();
        assert_eq!(names(&t), vec!["child", "left", "right", "base"]);
        assert_eq!(store.load_count(), 4);
    }

    #[tokio::test]
    async fn cycle_is_reported_with_path() {
        let store = Arc::new(MemoryStore::new());
        store.put(group("a"), inherits(&["b"]));
        store.put(group("b"), inherits(&["a"]));
        let g = graph(Arc::clone(&store), ResolverConfig::default());

        let err = g
            .traverse(&group("a"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap_err();
        match err {
            PermissionError::CycleDetected { cycle } => {
                assert_eq!(cycle, vec![group("a"), group("b"), group("a")]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }

        let lenient = graph(
            store,
            ResolverConfig {
                cycle_detection: false,
                ..Default::default()
            },
        );
        let t = lenient
            .traverse(&group("a"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap();
        assert_eq!(names(&t), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn self_parent_is_a_cycle() {
        let store = Arc::new(MemoryStore::new());
        store.put(group("narcissus"), inherits(&["narcissus"]));
        let g = graph(store, ResolverConfig::default());
        let err = g
            .traverse(&group("narcissus"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PermissionError::CycleDetected { ref cycle } if cycle.len() == 2));
    }

    #[tokio::test]
    async fn missing_root_and_pruned_parent() {
        let store = Arc::new(MemoryStore::new());
        store.put(group("a"), inherits(&["ghost", "b"]));
        store.put(group("b"), inherits(&[]));
        let g = graph(store, ResolverConfig::default());

        let err = g
            .traverse(&group("nobody"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let t = g
            .traverse(&group("a"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap();
        assert_eq!(names(&t), vec!["a", "b"]);
        assert_eq!(t.dependencies.len(), 3);
        assert!(!t.degraded);
    }

    #[tokio::test]
    async fn backend_error_on_parent_degrades() {
        let store = Arc::new(MemoryStore::new());
        store.put(group("a"), inherits(&["flaky"]));
        store.put(group("flaky"), inherits(&[]));
        store.fail_with(group("flaky"), "timeout");
        let g = graph(Arc::clone(&store), ResolverConfig::default());

        let t = g
            .traverse(&group("a"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap();
        assert_eq!(names(&t), vec!["a"]);
        assert!(t.degraded);

        store.fail_with(group("a"), "timeout");
        store.notify(crate::store::ChangeEvent::All);
        let err = g
            .traverse(&group("a"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PermissionError::Backend(_)));
    }

    #[tokio::test]
    async fn inapplicable_segment_parents_are_not_followed() {
        let store = Arc::new(MemoryStore::new());
        let nether = crate::types::ContextValue::new("world", "nether");
        store.put(
            group("a"),
            SubjectData::new(vec![Segment::builder()
                .context(nether.clone())
                .parent(group("b"))
                .build()]),
        );
        store.put(group("b"), inherits(&[]));
        let g = graph(store, ResolverConfig::default());

        let t = g
            .traverse(&group("a"), &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap();
        assert_eq!(names(&t), vec!["a"]);

        let active: ContextSet = vec![nether].into();
        let t = g
            .traverse(&group("a"), &active, &ContextRegistry::default())
            .await
            .unwrap();
        assert_eq!(names(&t), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn fallback_subjects_come_last() {
        let store = Arc::new(MemoryStore::new());
        let alice = SubjectRef::new("user", "alice");
        store.put(alice.clone(), inherits(&["member"]));
        store.put(group("member"), inherits(&[]));
        store.put(SubjectRef::new("default", "user"), inherits(&[]));
        store.put(SubjectRef::new("default", "default"), inherits(&[]));
        let g = graph(
            store,
            ResolverConfig {
                fallback_subjects: true,
                ..Default::default()
            },
        );

        let t = g
            .traverse(&alice, &ContextSet::new(), &ContextRegistry::default())
            .await
            .unwrap();
        let order: Vec<String> = t.visits.iter().map(|v| v.subject.to_string()).collect();
        assert_eq!(
            order,
            vec!["user:alice", "group:member", "default:user", "default:default"]
        );
        assert_eq!(t.visits[2].depth, 2);
    }
}

//! Resolver: cache lookup, traversal, and merge for point and bulk queries.
//!
//! ```text
//! query ─► cache ─hit─► ResolutionResult ─► merge(permission) ─► Decision
//!            │miss
//!            ▼
//!      SubjectGraph::traverse ─► collected segments ─► cache.put
//! ```

mod merge;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::cache::ResolutionCache;
use crate::config::ResolverConfig;
use crate::context::{ContextDefinition, ContextRegistry};
use crate::error::{PermissionError, Result};
use crate::glob::{Filter, GlobSyntaxError};
use crate::graph::{SubjectGraph, Traversal};
use crate::ladder::{LadderRegistry, RankLadder};
use crate::store::SubjectStore;
use crate::types::{ContextSet, Decision, SubjectRef};

use merge::Collected;

/// A glob pattern rejected in one of the traversed segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternFailureReport {
    pub subject: SubjectRef,
    pub pattern: String,
    pub error: GlobSyntaxError,
}

/// Merged outcome of one `(subject, contexts)` resolution.
///
/// Holds the collected segments rather than a precomputed permission map,
/// since glob rules cover unbounded permission sets; point decisions are
/// merged on demand.
#[derive(Debug)]
pub struct ResolutionResult {
    subject: SubjectRef,
    contexts: ContextSet,
    separator: char,
    collected: Vec<Collected>,
    options: BTreeMap<String, String>,
    ancestry: Vec<SubjectRef>,
    dependencies: Vec<SubjectRef>,
    failures: Vec<PatternFailureReport>,
    generation: u64,
    degraded: bool,
}

impl ResolutionResult {
    fn from_traversal(
        subject: SubjectRef,
        contexts: ContextSet,
        separator: char,
        traversal: Traversal,
        generation: u64,
    ) -> Self {
        let mut collected = Vec::new();
        let mut ancestry = Vec::with_capacity(traversal.visits.len());
        let mut failures = Vec::new();

        for (order, visit) in traversal.visits.into_iter().enumerate() {
            for (segment_index, segment) in visit.segments.into_iter().enumerate() {
                failures.extend(segment.pattern_failures(separator).iter().map(|f| {
                    PatternFailureReport {
                        subject: visit.subject.clone(),
                        pattern: f.pattern.clone(),
                        error: f.error.clone(),
                    }
                }));
                collected.push(Collected {
                    segment,
                    depth: visit.depth,
                    order,
                    segment_index,
                });
            }
            ancestry.push(visit.subject);
        }

        let options = merge::merge_options(&collected);
        Self {
            subject,
            contexts,
            separator,
            collected,
            options,
            ancestry,
            dependencies: traversal.dependencies,
            failures,
            generation,
            degraded: traversal.degraded,
        }
    }

    #[cfg(test)]
    pub(crate) fn empty(subject: SubjectRef, dependencies: Vec<SubjectRef>, generation: u64) -> Self {
        Self {
            ancestry: vec![subject.clone()],
            subject,
            contexts: ContextSet::new(),
            separator: '.',
            collected: Vec::new(),
            options: BTreeMap::new(),
            dependencies,
            failures: Vec::new(),
            generation,
            degraded: false,
        }
    }

    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    /// Active contexts the result was computed for, including accumulated
    /// values such as server tags.
    pub fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    /// Effective decision for `permission`.
    pub fn decision(&self, permission: &str) -> Decision {
        merge::merge_permission(&self.collected, self.separator, permission)
    }

    /// Merged decisions for every distinct pattern that could match
    /// `filter`. Undefined outcomes are omitted.
    pub fn decisions_matching(&self, filter: &Filter) -> BTreeMap<String, Decision> {
        let rule_sets: Vec<_> = self
            .collected
            .iter()
            .map(|c| c.segment.rules(self.separator))
            .collect();
        let patterns: BTreeSet<&str> = rule_sets
            .iter()
            .flat_map(|rules| rules.iter())
            .filter(|rule| rule.glob.may_match_filter(filter))
            .map(|rule| rule.pattern())
            .collect();

        patterns
            .into_iter()
            .filter_map(|pattern| {
                let decision = merge::merge_pattern(&self.collected, self.separator, pattern);
                (!decision.is_undefined()).then(|| (pattern.to_string(), decision))
            })
            .collect()
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Live subjects traversed, root first, in breadth-first order.
    pub fn ancestry(&self) -> &[SubjectRef] {
        &self.ancestry
    }

    /// Every subject consulted, including pruned ancestors.
    pub fn dependencies(&self) -> &[SubjectRef] {
        &self.dependencies
    }

    pub fn failures(&self) -> &[PatternFailureReport] {
        &self.failures
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// An ancestor was pruned because its backend load failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn segment_count(&self) -> usize {
        self.collected.len()
    }
}

/// Permission resolver over one subject graph.
///
/// Backend loads are spawned on the runtime handle supplied at
/// construction; queries themselves may be awaited from any executor.
pub struct Resolver {
    config: ResolverConfig,
    graph: SubjectGraph,
    cache: Arc<ResolutionCache>,
    contexts: ContextRegistry,
    ladders: LadderRegistry,
}

impl Resolver {
    /// Resolver spawning loads on the ambient Tokio runtime.
    pub fn new(store: Arc<dyn SubjectStore>, config: ResolverConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| PermissionError::NoRuntime)?;
        Self::with_runtime(store, config, runtime)
    }

    /// Resolver spawning loads on a host-supplied runtime.
    pub fn with_runtime(
        store: Arc<dyn SubjectStore>,
        config: ResolverConfig,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ResolutionCache::new(
            config.invalidation,
            config.max_cache_entries,
        ));
        let graph = SubjectGraph::new(store, Arc::clone(&cache), &config, runtime);
        let contexts = ContextRegistry::from_config(&config);
        tracing::debug!(
            separator = %config.separator,
            invalidation = ?config.invalidation,
            cycle_detection = config.cycle_detection,
            "resolver created"
        );
        Ok(Self {
            config,
            graph,
            cache,
            contexts,
            ladders: LadderRegistry::default(),
        })
    }

    /// Register an additional context definition.
    pub fn with_context_definition(mut self, definition: Arc<dyn ContextDefinition>) -> Self {
        self.contexts.register(definition);
        self.cache.invalidate_all();
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn graph(&self) -> &SubjectGraph {
        &self.graph
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn ladders(&self) -> &LadderRegistry {
        &self.ladders
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    /// Resolve `subject` under `contexts`, served from cache when valid.
    pub async fn resolve(
        &self,
        subject: &SubjectRef,
        contexts: &ContextSet,
    ) -> Result<Arc<ResolutionResult>> {
        let active = self.contexts.accumulate(contexts);
        if let Some(hit) = self.cache.get(subject, &active) {
            return Ok(hit);
        }

        // Read before traversing so a concurrent write leaves this stale.
        let generation = self.cache.current_generation();
        let traversal = self.graph.traverse(subject, &active, &self.contexts).await?;
        let result = Arc::new(ResolutionResult::from_traversal(
            subject.clone(),
            active.clone(),
            self.config.separator,
            traversal,
            generation,
        ));

        for failure in result.failures() {
            tracing::debug!(
                subject = %failure.subject,
                pattern = %failure.pattern,
                "malformed pattern excluded from resolution"
            );
        }

        if result.is_degraded() {
            tracing::warn!(subject = %subject, "not caching resolution with pruned ancestors");
        } else {
            self.cache.put(subject.clone(), active, Arc::clone(&result));
        }
        Ok(result)
    }

    /// Point query: the effective decision for one permission.
    pub async fn query(
        &self,
        subject: &SubjectRef,
        contexts: &ContextSet,
        permission: &str,
    ) -> Result<Decision> {
        let result = self.resolve(subject, contexts).await?;
        Ok(result.decision(permission))
    }

    /// Bulk query over every pattern that could match `filter`: a plain
    /// prefix, or a glob when it contains glob metacharacters.
    pub async fn resolve_all(
        &self,
        subject: &SubjectRef,
        contexts: &ContextSet,
        filter: &str,
    ) -> Result<BTreeMap<String, Decision>> {
        let filter = Filter::parse(filter, self.config.separator)?;
        let result = self.resolve(subject, contexts).await?;
        Ok(result.decisions_matching(&filter))
    }

    pub async fn option(
        &self,
        subject: &SubjectRef,
        contexts: &ContextSet,
        key: &str,
    ) -> Result<Option<String>> {
        let result = self.resolve(subject, contexts).await?;
        Ok(result.option(key).map(str::to_string))
    }

    /// Add or replace a rank ladder. Invalidates the whole cache.
    pub fn set_ladder(&self, ladder: RankLadder) -> Option<Arc<RankLadder>> {
        let previous = self.ladders.insert(ladder);
        self.cache.invalidate_all();
        previous
    }

    pub fn remove_ladder(&self, name: &str) -> Option<Arc<RankLadder>> {
        let removed = self.ladders.remove(name);
        if removed.is_some() {
            self.cache.invalidate_all();
        }
        removed
    }

    fn ladder(&self, name: &str) -> Result<Arc<RankLadder>> {
        self.ladders
            .get(name)
            .ok_or_else(|| PermissionError::UnknownLadder(name.to_string()))
    }

    /// Promote `subject` one rank on `ladder` within the segment scoped to
    /// `contexts`. Returns the rank held afterwards.
    pub async fn promote(
        &self,
        subject: &SubjectRef,
        ladder: &str,
        contexts: &ContextSet,
    ) -> Result<Option<SubjectRef>> {
        let ladder = self.ladder(ladder)?;
        self.climb(subject, &ladder, contexts, RankLadder::promote)
            .await
    }

    /// Demote `subject` one rank; demoting from the lowest rank leaves the
    /// ladder. Returns the rank held afterwards.
    pub async fn demote(
        &self,
        subject: &SubjectRef,
        ladder: &str,
        contexts: &ContextSet,
    ) -> Result<Option<SubjectRef>> {
        let ladder = self.ladder(ladder)?;
        self.climb(subject, &ladder, contexts, RankLadder::demote)
            .await
    }

    async fn climb(
        &self,
        subject: &SubjectRef,
        ladder: &RankLadder,
        contexts: &ContextSet,
        step: fn(&RankLadder, &[SubjectRef]) -> Option<Vec<SubjectRef>>,
    ) -> Result<Option<SubjectRef>> {
        let segment = self
            .graph
            .update_segment(subject, contexts, |builder| {
                match step(ladder, builder.current_parents()) {
                    Some(parents) => builder.parents(parents),
                    None => builder,
                }
            })
            .await?;
        let rank = ladder.highest_rank(segment.parents()).cloned();
        tracing::debug!(
            subject = %subject,
            ladder = ladder.name(),
            rank = ?rank.as_ref().map(|r| r.to_string()),
            "rank changed"
        );
        Ok(rank)
    }
}

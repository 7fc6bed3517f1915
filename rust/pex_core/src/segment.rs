//! Rule segments: weighted, context-scoped bundles of permission rules,
//! options and parent links owned by one subject.
//!
//! Segments are immutable once built. Writers derive a new segment through
//! [`Segment::to_builder`] and publish it; readers holding the old `Arc`
//! keep a consistent snapshot.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::context::ContextRegistry;
use crate::glob::{self, Glob, GlobSyntaxError};
use crate::types::{ContextSet, ContextValue, SubjectRef};

/// Compiled permission rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub glob: Glob,
    pub value: i32,
}

impl Rule {
    pub fn pattern(&self) -> &str {
        self.glob.pattern()
    }
}

/// A pattern rejected at compile time, excluded from matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternFailure {
    pub pattern: String,
    pub error: GlobSyntaxError,
}

#[derive(Debug, Clone)]
struct CompiledRules {
    separator: char,
    rules: Vec<Rule>,
    failures: Vec<PatternFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Segment {
    contexts: ContextSet,
    weight: i32,
    permissions: BTreeMap<String, i32>,
    options: BTreeMap<String, String>,
    parents: Vec<SubjectRef>,
    #[serde(skip)]
    compiled: OnceLock<CompiledRules>,
}

impl Segment {
    pub fn builder() -> SegmentBuilder {
        SegmentBuilder::default()
    }

    /// Builder seeded with this segment's data.
    pub fn to_builder(&self) -> SegmentBuilder {
        SegmentBuilder {
            contexts: self.contexts.clone(),
            weight: self.weight,
            permissions: self.permissions.clone(),
            options: self.options.clone(),
            parents: self.parents.clone(),
        }
    }

    pub fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn permissions(&self) -> &BTreeMap<String, i32> {
        &self.permissions
    }

    pub fn permission(&self, pattern: &str) -> Option<i32> {
        self.permissions.get(pattern).copied()
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn parents(&self) -> &[SubjectRef] {
        &self.parents
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.options.is_empty() && self.parents.is_empty()
    }

    pub fn applies_to(&self, active: &ContextSet, registry: &ContextRegistry) -> bool {
        registry.applies(&self.contexts, active)
    }

    /// Compiled rules, memoized for the segment's lifetime.
    ///
    /// The memo holds the first separator asked for; any other separator
    /// compiles a fresh, unmemoized rule set.
    pub fn rules(&self, separator: char) -> Cow<'_, [Rule]> {
        match self.compiled(separator) {
            Some(compiled) => Cow::Borrowed(&compiled.rules),
            None => Cow::Owned(self.compile(separator).rules),
        }
    }

    /// Patterns that failed to compile.
    pub fn pattern_failures(&self, separator: char) -> Cow<'_, [PatternFailure]> {
        match self.compiled(separator) {
            Some(compiled) => Cow::Borrowed(&compiled.failures),
            None => Cow::Owned(self.compile(separator).failures),
        }
    }

    fn compiled(&self, separator: char) -> Option<&CompiledRules> {
        let compiled = self.compiled.get_or_init(|| self.compile(separator));
        (compiled.separator == separator).then_some(compiled)
    }

    fn compile(&self, separator: char) -> CompiledRules {
        let mut rules = Vec::with_capacity(self.permissions.len());
        let mut failures = Vec::new();
        for (pattern, &value) in &self.permissions {
            match glob::compile(pattern, separator) {
                Ok(glob) => rules.push(Rule { glob, value }),
                Err(error) => failures.push(PatternFailure {
                    pattern: pattern.clone(),
                    error,
                }),
            }
        }
        CompiledRules {
            separator,
            rules,
            failures,
        }
    }
}

/// Accumulates segment data; later writes to the same key replace earlier
/// ones.
#[derive(Debug, Clone, Default)]
pub struct SegmentBuilder {
    contexts: ContextSet,
    weight: i32,
    permissions: BTreeMap<String, i32>,
    options: BTreeMap<String, String>,
    parents: Vec<SubjectRef>,
}

impl SegmentBuilder {
    pub fn context(mut self, context: ContextValue) -> Self {
        self.contexts.insert(context);
        self
    }

    pub fn contexts(mut self, contexts: ContextSet) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Set a rule value: positive grants, negative denies, zero resets.
    pub fn permission(mut self, pattern: impl Into<String>, value: i32) -> Self {
        self.permissions.insert(pattern.into(), value);
        self
    }

    pub fn remove_permission(mut self, pattern: &str) -> Self {
        self.permissions.remove(pattern);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn remove_option(mut self, key: &str) -> Self {
        self.options.remove(key);
        self
    }

    /// Append a parent; a parent already listed keeps its position.
    pub fn parent(mut self, parent: SubjectRef) -> Self {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
        self
    }

    /// Parents accumulated so far.
    pub fn current_parents(&self) -> &[SubjectRef] {
        &self.parents
    }

    pub fn remove_parent(mut self, parent: &SubjectRef) -> Self {
        self.parents.retain(|p| p != parent);
        self
    }

    pub fn parents(mut self, parents: Vec<SubjectRef>) -> Self {
        self.parents.clear();
        for parent in parents {
            self = self.parent(parent);
        }
        self
    }

    pub fn build(self) -> Segment {
        Segment {
            contexts: self.contexts,
            weight: self.weight,
            permissions: self.permissions,
            options: self.options,
            parents: self.parents,
            compiled: OnceLock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_write_replaces_identical_pattern() {
        let seg = Segment::builder()
            .permission("example.build", 1)
            .permission("example.build", -1)
            .build();
        assert_eq!(seg.permissions().len(), 1);
        assert_eq!(seg.permission("example.build"), Some(-1));
    }

    #[test]
    fn rules_compile_once_and_skip_bad_patterns() {
        let seg = Segment::builder()
            .permission("example.*", 1)
            .permission("broken.{a,", 1)
            .permission("plain", -2)
            .build();

        let rules = seg.rules('.');
        assert_eq!(rules.len(), 2);
        assert!(matches!(rules, Cow::Borrowed(_)));
        assert!(std::ptr::eq(&*rules, &*seg.rules('.')));

        let failures = seg.pattern_failures('.');
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].pattern, "broken.{a,");
        assert!(matches!(
            failures[0].error,
            GlobSyntaxError::UnclosedGroup { .. }
        ));
    }

    #[test]
    fn other_separator_recompiles_instead_of_reusing_memo() {
        let seg = Segment::builder().permission("fs/*", 1).build();

        // '/' is an ordinary character under '.'
        assert!(seg.rules('.')[0].glob.matches("fs/etc/passwd"));

        let slashed = seg.rules('/');
        assert!(matches!(slashed, Cow::Owned(_)));
        assert!(slashed[0].glob.matches("fs/etc"));
        assert!(!slashed[0].glob.matches("fs/etc/passwd"));
        assert!(seg.pattern_failures('/').is_empty());
    }

    #[test]
    fn parents_keep_first_position() {
        let a = SubjectRef::new("group", "a");
        let b = SubjectRef::new("group", "b");
        let seg = Segment::builder()
            .parent(a.clone())
            .parent(b.clone())
            .parent(a.clone())
            .build();
        assert_eq!(seg.parents(), &[a.clone(), b.clone()]);

        let seg = seg.to_builder().remove_parent(&a).build();
        assert_eq!(seg.parents(), &[b]);
    }

    #[test]
    fn to_builder_produces_independent_snapshot() {
        let original = Segment::builder().weight(5).option("prefix", "[A]").build();
        let updated = original.to_builder().option("prefix", "[B]").build();
        assert_eq!(original.option("prefix"), Some("[A]"));
        assert_eq!(updated.option("prefix"), Some("[B]"));
        assert_eq!(updated.weight(), 5);
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{
            "contexts": [{"key": "world", "value": "nether"}],
            "weight": 10,
            "permissions": {"build.*": 1},
            "options": {"prefix": "[Admin]"},
            "parents": [{"collection": "group", "identity": "mod"}]
        }"#;
        let seg: Segment = serde_json::from_str(json).unwrap();
        assert_eq!(seg.weight(), 10);
        assert_eq!(seg.contexts().len(), 1);
        assert_eq!(seg.parents()[0], SubjectRef::new("group", "mod"));
        assert_eq!(seg.rules('.').len(), 1);
    }
}

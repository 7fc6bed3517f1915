//! Context definitions: per-key matching semantics for segment contexts.
//!
//! A segment requiring `key=own` is satisfied by an active context
//! `key=active` when the definition registered for `key` says
//! `matches(own, active)`. Unregistered keys compare by string equality.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, NaiveDateTime, Timelike};

use crate::config::ResolverConfig;
use crate::types::{ContextSet, ContextValue};

pub const SERVER_TAG: &str = "server-tag";
pub const BEFORE_TIME: &str = "before-time";
pub const AFTER_TIME: &str = "after-time";

/// Matching semantics for one context key.
pub trait ContextDefinition: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a segment requiring `own` applies under active value `active`.
    fn matches(&self, own: &str, active: &str) -> bool;

    /// Values active on every query regardless of what the caller passes.
    fn current_values(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Plain string equality.
#[derive(Debug, Clone)]
pub struct SimpleContextDefinition {
    name: String,
}

impl SimpleContextDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ContextDefinition for SimpleContextDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, own: &str, active: &str) -> bool {
        own == active
    }
}

/// `server-tag`: equality, with the configured tags always active.
#[derive(Debug, Clone)]
pub struct ServerTagContextDefinition {
    tags: Vec<String>,
}

impl ServerTagContextDefinition {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }
}

impl ContextDefinition for ServerTagContextDefinition {
    fn name(&self) -> &str {
        SERVER_TAG
    }

    fn matches(&self, own: &str, active: &str) -> bool {
        own == active
    }

    fn current_values(&self) -> Vec<String> {
        self.tags.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeComparison {
    Before,
    After,
}

/// `before-time` / `after-time`, compared at one-second precision.
///
/// The caller supplies the current time as the active value.
#[derive(Debug, Clone)]
pub struct TimeContextDefinition {
    name: &'static str,
    comparison: TimeComparison,
}

impl TimeContextDefinition {
    pub fn before() -> Self {
        Self {
            name: BEFORE_TIME,
            comparison: TimeComparison::Before,
        }
    }

    pub fn after() -> Self {
        Self {
            name: AFTER_TIME,
            comparison: TimeComparison::After,
        }
    }
}

impl ContextDefinition for TimeContextDefinition {
    fn name(&self) -> &str {
        self.name
    }

    fn matches(&self, own: &str, active: &str) -> bool {
        let (Some(own), Some(active)) = (parse_time(own), parse_time(active)) else {
            tracing::trace!(context = self.name, own, active, "unparseable time context");
            return false;
        };
        match self.comparison {
            TimeComparison::Before => active < own,
            TimeComparison::After => active > own,
        }
    }
}

/// Parse RFC 3339, naive `YYYY-MM-DDTHH:MM:SS`, or Unix epoch seconds.
pub fn parse_time(value: &str) -> Option<NaiveDateTime> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            value
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(|dt| dt.naive_utc())
        })?;
    parsed.with_nanosecond(0)
}

/// Registry of context definitions keyed by context name.
#[derive(Clone, Default)]
pub struct ContextRegistry {
    definitions: AHashMap<String, Arc<dyn ContextDefinition>>,
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.definitions.keys().collect();
        names.sort();
        f.debug_struct("ContextRegistry")
            .field("definitions", &names)
            .finish()
    }
}

impl ContextRegistry {
    /// Built-in definitions: `server-tag`, `before-time`, `after-time`.
    pub fn from_config(config: &ResolverConfig) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(ServerTagContextDefinition::new(
            config.server_tags.clone(),
        )));
        registry.register(Arc::new(TimeContextDefinition::before()));
        registry.register(Arc::new(TimeContextDefinition::after()));
        registry
    }

    pub fn register(&mut self, definition: Arc<dyn ContextDefinition>) {
        self.definitions
            .insert(definition.name().to_string(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ContextDefinition>> {
        self.definitions.get(name)
    }

    /// Caller contexts plus every definition's always-active values.
    pub fn accumulate(&self, active: &ContextSet) -> ContextSet {
        let mut out = active.clone();
        for (name, definition) in &self.definitions {
            for value in definition.current_values() {
                out.insert(ContextValue::new(name.clone(), value));
            }
        }
        out
    }

    fn satisfies(&self, required: &ContextValue, active: &ContextSet) -> bool {
        active.values(&required.key).any(|candidate| {
            if required.exact || candidate.exact {
                return candidate.value == required.value;
            }
            match self.definitions.get(&required.key) {
                Some(definition) => definition.matches(&required.value, &candidate.value),
                None => candidate.value == required.value,
            }
        })
    }

    /// Set inclusion under the registered definitions. An empty requirement
    /// applies everywhere.
    pub fn applies(&self, required: &ContextSet, active: &ContextSet) -> bool {
        required.iter().all(|ctx| self.satisfies(ctx, active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[(&str, &str)]) -> ContextSet {
        values
            .iter()
            .map(|(k, v)| ContextValue::new(*k, *v))
            .collect()
    }

    fn registry() -> ContextRegistry {
        ContextRegistry::from_config(&ResolverConfig {
            server_tags: vec!["lobby".to_string()],
            ..Default::default()
        })
    }

    #[test]
    fn empty_requirement_applies_everywhere() {
        let reg = registry();
        assert!(reg.applies(&ContextSet::new(), &ContextSet::new()));
        assert!(reg.applies(&ContextSet::new(), &set(&[("world", "nether")])));
    }

    #[test]
    fn inclusion_not_equality() {
        let reg = registry();
        let required = set(&[("world", "nether")]);
        assert!(reg.applies(&required, &set(&[("world", "nether"), ("server", "a")])));
        assert!(!reg.applies(&required, &set(&[("world", "end")])));
        assert!(!reg.applies(&set(&[("world", "nether"), ("server", "a")]), &required));
    }

    #[test]
    fn multiple_values_per_key() {
        let reg = registry();
        let active = set(&[("world", "nether"), ("world", "end")]);
        assert!(reg.applies(&set(&[("world", "end")]), &active));
        assert!(reg.applies(&set(&[("world", "nether"), ("world", "end")]), &active));
    }

    #[test]
    fn server_tags_are_accumulated() {
        let reg = registry();
        let active = reg.accumulate(&ContextSet::new());
        assert!(reg.applies(&set(&[(SERVER_TAG, "lobby")]), &active));
        assert!(!reg.applies(&set(&[(SERVER_TAG, "survival")]), &active));
    }

    #[test]
    fn time_windows() {
        let reg = registry();
        let noon = set(&[
            (BEFORE_TIME, "2024-06-01T12:00:00"),
            (AFTER_TIME, "2024-06-01T12:00:00"),
        ]);
        assert!(reg.applies(&set(&[(BEFORE_TIME, "2024-06-02T00:00:00Z")]), &noon));
        assert!(!reg.applies(&set(&[(BEFORE_TIME, "2024-06-01T00:00:00")]), &noon));
        assert!(reg.applies(&set(&[(AFTER_TIME, "1700000000")]), &noon));
        assert!(!reg.applies(&set(&[(AFTER_TIME, "2024-06-01T12:00:00")]), &noon));
        assert!(!reg.applies(&set(&[(AFTER_TIME, "not a time")]), &noon));
    }

    #[test]
    fn exact_flag_bypasses_definition() {
        let reg = registry();
        let required: ContextSet = vec![ContextValue::exact(BEFORE_TIME, "2030-01-01T00:00:00")].into();
        let active = set(&[(BEFORE_TIME, "2024-01-01T00:00:00")]);
        assert!(!reg.applies(&required, &active));
        let same = set(&[(BEFORE_TIME, "2030-01-01T00:00:00")]);
        assert!(reg.applies(&required, &same));
    }

    #[test]
    fn parse_time_formats_agree() {
        let a = parse_time("2024-06-01T12:00:00Z").unwrap();
        let b = parse_time("2024-06-01T12:00:00").unwrap();
        let c = parse_time("1717243200").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(parse_time("2024-06-01T12:00:00.750Z").unwrap(), a);
    }
}

//! Rule and option merging over collected segments.
//!
//! Among matching rules the winner is the greatest under, in order:
//! segment weight, glob specificity, traversal order (closer subject first,
//! then earlier segment), literal over wildcard, and finally pattern text.
//!
//! A matching zero rule at depth N halts inheritance for that permission:
//! only rules at depth <= N compete, so same-tier rules still beat the
//! reset on weight or specificity.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;

use crate::segment::{Rule, Segment};
use crate::types::Decision;

/// A segment collected by traversal, with its position in the walk.
#[derive(Debug, Clone)]
pub(crate) struct Collected {
    pub segment: Arc<Segment>,
    pub depth: usize,
    /// Breadth-first index of the owning subject.
    pub order: usize,
    /// Position among the owning subject's applicable segments.
    pub segment_index: usize,
}

struct Candidate<'a> {
    rule: &'a Rule,
    source: &'a Collected,
}

/// `Greater` when `a` takes precedence over `b`.
fn precedence(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.source
        .segment
        .weight()
        .cmp(&b.source.segment.weight())
        .then_with(|| a.rule.glob.specificity().cmp(&b.rule.glob.specificity()))
        .then_with(|| b.source.order.cmp(&a.source.order))
        .then_with(|| b.source.segment_index.cmp(&a.source.segment_index))
        .then_with(|| a.rule.glob.is_literal().cmp(&b.rule.glob.is_literal()))
        .then_with(|| b.rule.pattern().cmp(a.rule.pattern()))
}

/// Merge every rule for which `is_match` holds.
fn merge_by<F>(collected: &[Collected], separator: char, is_match: F) -> Decision
where
    F: Fn(&Rule) -> bool,
{
    let rule_sets: Vec<(&Collected, Cow<'_, [Rule]>)> = collected
        .iter()
        .map(|source| (source, source.segment.rules(separator)))
        .collect();
    let candidates: Vec<Candidate<'_>> = rule_sets
        .iter()
        .flat_map(|(source, rules)| {
            let source: &Collected = source;
            rules.iter().map(move |rule| Candidate { rule, source })
        })
        .filter(|c| is_match(c.rule))
        .collect();

    let halt = candidates
        .iter()
        .filter(|c| c.rule.value == 0)
        .map(|c| c.source.depth)
        .min();

    candidates
        .iter()
        .filter(|c| halt.map_or(true, |depth| c.source.depth <= depth))
        .max_by(|a, b| precedence(a, b))
        .map_or(Decision::Undefined, |winner| Decision::from_value(winner.rule.value))
}

/// Effective decision for one permission string.
pub(crate) fn merge_permission(collected: &[Collected], separator: char, permission: &str) -> Decision {
    merge_by(collected, separator, |rule| rule.glob.matches(permission))
}

/// Effective decision for a pattern text in bulk queries: a rule always
/// matches its own pattern text, other rules match it as a candidate string.
pub(crate) fn merge_pattern(collected: &[Collected], separator: char, pattern: &str) -> Decision {
    merge_by(collected, separator, |rule| {
        rule.pattern() == pattern || rule.glob.matches(pattern)
    })
}

/// Merge option maps by exact key: weight first, then traversal order.
pub(crate) fn merge_options(collected: &[Collected]) -> BTreeMap<String, String> {
    let mut best: AHashMap<&str, (&Collected, &str)> = AHashMap::new();
    for source in collected {
        for (key, value) in source.segment.options() {
            let replace = match best.get(key.as_str()) {
                None => true,
                Some((current, _)) => {
                    source
                        .segment
                        .weight()
                        .cmp(&current.segment.weight())
                        .then_with(|| current.order.cmp(&source.order))
                        .then_with(|| current.segment_index.cmp(&source.segment_index))
                        == Ordering::Greater
                }
            };
            if replace {
                best.insert(key.as_str(), (source, value.as_str()));
            }
        }
    }
    best.into_iter()
        .map(|(key, (_, value))| (key.to_string(), value.to_string()))
        .collect()
}

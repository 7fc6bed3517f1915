//! Rank ladders: ordered promotion chains of subjects.
//!
//! Index 0 is the lowest rank. Ladder operations compute a new parent list
//! for one segment; applying it is the caller's write.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::types::SubjectRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankLadder {
    name: String,
    ranks: Vec<SubjectRef>,
}

impl RankLadder {
    /// Build a ladder from lowest to highest rank. Repeated ranks keep their
    /// first position.
    pub fn new(name: impl Into<String>, ranks: Vec<SubjectRef>) -> Self {
        let mut unique: Vec<SubjectRef> = Vec::with_capacity(ranks.len());
        for rank in ranks {
            if !unique.contains(&rank) {
                unique.push(rank);
            }
        }
        Self {
            name: name.into(),
            ranks: unique,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ranks(&self) -> &[SubjectRef] {
        &self.ranks
    }

    pub fn rank_of(&self, subject: &SubjectRef) -> Option<usize> {
        self.ranks.iter().position(|r| r == subject)
    }

    pub fn is_on_ladder(&self, parents: &[SubjectRef]) -> bool {
        parents.iter().any(|p| self.rank_of(p).is_some())
    }

    /// Highest ladder rank among `parents`.
    pub fn highest_rank<'a>(&'a self, parents: &[SubjectRef]) -> Option<&'a SubjectRef> {
        self.highest_index(parents).map(|i| &self.ranks[i])
    }

    fn highest_index(&self, parents: &[SubjectRef]) -> Option<usize> {
        parents.iter().filter_map(|p| self.rank_of(p)).max()
    }

    /// Parent list after one promotion, or `None` when already at the top
    /// (or the ladder is empty).
    pub fn promote(&self, parents: &[SubjectRef]) -> Option<Vec<SubjectRef>> {
        let Some(current) = self.highest_index(parents) else {
            let lowest = self.ranks.first()?;
            let mut out = parents.to_vec();
            out.push(lowest.clone());
            return Some(out);
        };
        let next = self.ranks.get(current + 1)?;
        Some(self.replace(parents, current, Some(next)))
    }

    /// Parent list after one demotion, or `None` when not on the ladder.
    /// Demoting from the lowest rank removes it.
    pub fn demote(&self, parents: &[SubjectRef]) -> Option<Vec<SubjectRef>> {
        let current = self.highest_index(parents)?;
        let lower = current.checked_sub(1).map(|i| &self.ranks[i]);
        Some(self.replace(parents, current, lower))
    }

    /// Swap rank `from` for `to` in place; drop it when `to` is absent or
    /// already held.
    fn replace(
        &self,
        parents: &[SubjectRef],
        from: usize,
        to: Option<&SubjectRef>,
    ) -> Vec<SubjectRef> {
        let from = &self.ranks[from];
        let to = to.filter(|t| !parents.contains(t));
        parents
            .iter()
            .filter_map(|p| {
                if p == from {
                    to.cloned()
                } else {
                    Some(p.clone())
                }
            })
            .collect()
    }
}

/// Named ladders. Mutated through the resolver so every change also
/// invalidates cached results.
#[derive(Debug, Default)]
pub struct LadderRegistry {
    ladders: RwLock<AHashMap<String, Arc<RankLadder>>>,
}

impl LadderRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<RankLadder>> {
        self.ladders.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ladders.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.ladders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ladders.read().is_empty()
    }

    pub(crate) fn insert(&self, ladder: RankLadder) -> Option<Arc<RankLadder>> {
        self.ladders
            .write()
            .insert(ladder.name().to_string(), Arc::new(ladder))
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<RankLadder>> {
        self.ladders.write().remove(name)
    }
}

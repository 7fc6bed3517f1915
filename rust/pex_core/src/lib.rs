//! `pex_core`: permission resolution engine.
//!
//! Computes, for a subject and a set of active contexts, the effective
//! decision for permission strings by walking the subject's inheritance
//! graph and merging weighted glob rules.
//!
//! Modules:
//! - `types`    — domain types (SubjectRef, ContextSet, Decision)
//! - `error`    — query-level error taxonomy
//! - `config`   — resolver configuration and JSON parsing
//! - `glob`     — glob compiler, matcher and specificity
//! - `context`  — per-key context matching definitions
//! - `segment`  — weighted, context-scoped rule segments
//! - `ladder`   — rank ladders (promotion chains)
//! - `store`    — persistence collaborator interface + in-memory store
//! - `graph`    — resident subject graph, deduplicated loads, traversal
//! - `cache`    — generation-stamped resolution cache
//! - `resolver` — point and bulk queries

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod glob;
pub mod graph;
pub mod ladder;
pub mod resolver;
pub mod segment;
pub mod store;
pub mod types;

pub use config::{parse_resolver_config, InvalidationMode, ResolverConfig};
pub use error::{PermissionError, Result};
pub use glob::{Glob, GlobSyntaxError, Specificity};
pub use ladder::RankLadder;
pub use resolver::{ResolutionResult, Resolver};
pub use segment::{Segment, SegmentBuilder};
pub use store::{ChangeEvent, MemoryStore, StoreError, SubjectData, SubjectStore};
pub use types::{ContextSet, ContextValue, Decision, SubjectRef};

//! Declarative safety rule registry.
//!
//! This crate provides:
//! - YAML-based rule definition with serde deserialization
//! - Filesystem loader with hot-reload via `notify` watcher
//! - Snapshot compilation: Aho-Corasick keyword automaton, multi-pattern
//!   regex set, and boolean composite trees
//! - [`RuleRegistry`]: atomic, versioned snapshot publication with
//!   subscriber callbacks and dynamic injection

pub mod compile;
pub mod error;
pub mod loader;
pub mod registry;
pub mod schema;

pub use compile::{CompiledRules, PatternOrigin, RegistrySnapshot};
pub use error::RegistryError;
pub use loader::{LoadResult, LoadStatus, RuleLoader};
pub use registry::{RuleOrigin, RuleRegistry};
pub use schema::{CompositeExpr, CompositeLeaf, MatchType, Rule, RuleFile, RuleScope};

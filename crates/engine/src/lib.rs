//! Guardian evaluation engine.
//!
//! Evaluates input text against the current registry snapshot inside a hard
//! latency budget: one linear Aho-Corasick pass for keywords, one regex-set
//! pass with per-pattern timeout accounting, then pure boolean algebra for
//! composite rules. Results are cached in a sharded LRU keyed on
//! `(registry_version, scope, normalized_text)`.

pub mod cache;
pub mod error;
pub mod evaluate;
pub mod normalize;
pub mod result;

pub use cache::ShardedCache;
pub use error::EngineError;
pub use evaluate::{EngineConfig, Guardian};
pub use normalize::{normalize, NormalizedInput};
pub use result::{EvaluationResult, Match, QuickCheck};

//! Engine error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The registry has never published a snapshot. Upstream must refuse
    /// all traffic (fail-closed) until a load succeeds.
    #[error("no active registry snapshot")]
    NotActivated,
}

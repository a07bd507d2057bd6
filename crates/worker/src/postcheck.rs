//! Optional ML post-check collaborator.
//!
//! The classifier itself is pluggable; only the threshold policy is fixed
//! here: a score at or above the block threshold blocks the output, at or
//! above the escalate threshold holds it for review.

use async_trait::async_trait;

use guardian_core::types::Severity;

use crate::model::ModelError;

/// Severity thresholds applied to ML post-check scores.
#[derive(Debug, Clone, Copy)]
pub struct MlThresholds {
    pub block_at: Severity,
    pub escalate_at: Severity,
}

impl Default for MlThresholds {
    fn default() -> Self {
        Self {
            block_at: Severity::Critical,
            escalate_at: Severity::High,
        }
    }
}

/// A model-based scorer for generated output.
#[async_trait]
pub trait MlPostCheck: Send + Sync {
    /// Score the output; `None` means no concern detected.
    async fn score(&self, text: &str) -> Result<Option<Severity>, ModelError>;
}

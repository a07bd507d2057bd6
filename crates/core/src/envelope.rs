//! Request and refusal envelopes crossing the pipeline boundary.

use serde::{Deserialize, Serialize};

use crate::types::{ReasonCode, TrustTier};

/// Inbound request after the framework collaborator has authenticated it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Stable subject identity (user id or IP).
    pub subject_id: String,
    /// Trust tier assigned at authentication.
    pub trust_tier: TrustTier,
    /// Raw input text to evaluate and (if admitted) infer on.
    pub input_text: String,
    /// Caller-provided trace id for end-to-end correlation.
    pub trace_id: String,
}

/// Synchronous refusal returned to the caller.
///
/// Deliberately non-informative: no rule ids, no pattern texts, no stack
/// traces. The support ticket id equals the audit id so incidents are
/// traceable internally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefusalEnvelope {
    pub refused: bool,
    pub reason_code: ReasonCode,
    pub explanation: String,
    pub support_ticket_id: String,
}

impl RefusalEnvelope {
    /// Build a refusal with the fixed outward-facing explanation.
    pub fn new(reason_code: ReasonCode, support_ticket_id: impl Into<String>) -> Self {
        Self {
            refused: true,
            reason_code,
            explanation: "request denied".to_string(),
            support_ticket_id: support_ticket_id.into(),
        }
    }
}

//! Queue envelope types. Fields are fixed and versioned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use guardian_core::types::{RuleAction, Severity, TrustTier};

/// Compact record of the pre-check outcome carried with the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreCheckSummary {
    pub registry_version: u64,
    pub highest_severity: Option<Severity>,
    pub terminal_action: Option<RuleAction>,
}

/// An admitted request awaiting a worker. Immutable once enqueued;
/// consumed exactly once in effect (at-least-once delivery with idempotent
/// processing keyed on `request_id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedRequest {
    pub request_id: String,
    pub trace_id: String,
    pub subject_id: String,
    pub tier: TrustTier,
    pub input_text: String,
    pub submitted_ts: DateTime<Utc>,
    pub pre_check_result: PreCheckSummary,
    /// Envelope schema version for forward-compatible evolution.
    #[serde(default = "default_envelope_version")]
    pub envelope_version: u16,
}

fn default_envelope_version() -> u16 {
    1
}

impl QueuedRequest {
    /// Build a new envelope with a fresh request id.
    pub fn new(
        trace_id: impl Into<String>,
        subject_id: impl Into<String>,
        tier: TrustTier,
        input_text: impl Into<String>,
        pre_check_result: PreCheckSummary,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            subject_id: subject_id.into(),
            tier,
            input_text: input_text.into(),
            submitted_ts: Utc::now(),
            pre_check_result,
            envelope_version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serde_roundtrip() {
        let request = QueuedRequest::new(
            "trace-1",
            "u1",
            TrustTier::User,
            "What is the capital of France?",
            PreCheckSummary {
                registry_version: 3,
                highest_severity: None,
                terminal_action: None,
            },
        );
        let json = serde_json::to_string(&request).unwrap();
        let back: QueuedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
        assert_eq!(back.envelope_version, 1);
    }

    #[test]
    fn test_missing_envelope_version_defaults() {
        let json = r#"{
            "request_id": "r1",
            "trace_id": "t1",
            "subject_id": "u1",
            "tier": "user",
            "input_text": "hi",
            "submitted_ts": "2026-01-01T00:00:00Z",
            "pre_check_result": {"registry_version": 1, "highest_severity": null, "terminal_action": null}
        }"#;
        let request: QueuedRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.envelope_version, 1);
    }
}

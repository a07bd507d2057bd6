//! Escalation notification templates.

use minijinja::Environment;
use serde::Serialize;

use guardian_core::types::{ReasonCode, Severity};

use crate::traits::NotifyError;

const SUBJECT_TEMPLATE: &str =
    "[{{ severity | upper }}] safety escalation {{ audit_id }}";

const BODY_TEMPLATE: &str = "\
Safety escalation requires review.

audit id:    {{ audit_id }}
subject:     {{ subject_id }}
trace:       {{ trace_id }}
stage:       {{ stage }}
severity:    {{ severity }}
reason:      {{ reason_code }}
rules hit:   {{ rule_count }}

Review with the audit id above; approve releases any held output,
block feeds the pattern into the dynamic blocklist.
";

/// Context rendered into escalation subjects and bodies.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationContext {
    pub audit_id: String,
    pub subject_id: String,
    pub trace_id: String,
    pub stage: String,
    pub severity: Severity,
    pub reason_code: Option<ReasonCode>,
    pub rule_count: usize,
}

/// Shared minijinja environment with the escalation templates loaded.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("escalation_subject", SUBJECT_TEMPLATE)
            .expect("built-in subject template is valid");
        env.add_template("escalation_body", BODY_TEMPLATE)
            .expect("built-in body template is valid");
        Self { env }
    }

    /// Render (subject, body) for an escalation.
    pub fn render_escalation(
        &self,
        context: &EscalationContext,
    ) -> Result<(String, String), NotifyError> {
        let subject = self
            .env
            .get_template("escalation_subject")
            .and_then(|t| t.render(context))
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        let body = self
            .env
            .get_template("escalation_body")
            .and_then(|t| t.render(context))
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok((subject, body))
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> EscalationContext {
        EscalationContext {
            audit_id: "audit-123".to_string(),
            subject_id: "u1".to_string(),
            trace_id: "trace-9".to_string(),
            stage: "post".to_string(),
            severity: Severity::Critical,
            reason_code: Some(ReasonCode::JailbreakAttempt),
            rule_count: 2,
        }
    }

    #[test]
    fn test_subject_contains_severity_and_audit_id() {
        let renderer = TemplateRenderer::new();
        let (subject, _) = renderer.render_escalation(&context()).unwrap();
        assert!(subject.contains("CRITICAL"));
        assert!(subject.contains("audit-123"));
    }

    #[test]
    fn test_body_contains_reason_and_trace() {
        let renderer = TemplateRenderer::new();
        let (_, body) = renderer.render_escalation(&context()).unwrap();
        assert!(body.contains("JAILBREAK_ATTEMPT"));
        assert!(body.contains("trace-9"));
        assert!(body.contains("rules hit:   2"));
    }
}

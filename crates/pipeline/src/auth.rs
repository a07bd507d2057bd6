//! Authentication collaborator.
//!
//! The framework performs authentication before invoking the pipeline;
//! this module supplies the static API-key provider used by deployments
//! without an external identity service. Keys map to trust tiers via
//! `SAFETY_API_KEYS` (`key:tier,key:tier`).

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

use guardian_core::types::TrustTier;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("unknown credentials")]
    Unknown,
}

/// Credentials presented with a request.
#[derive(Debug, Clone)]
pub enum Credentials {
    ApiKey(String),
}

/// An authenticated request origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthedSubject {
    pub subject_id: String,
    pub tier: TrustTier,
}

/// Maps credentials to a subject identity and trust tier.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<AuthedSubject, AuthError>;
}

/// Static key → tier map from configuration.
pub struct StaticKeyAuth {
    keys: HashMap<String, TrustTier>,
}

impl StaticKeyAuth {
    pub fn new(keys: HashMap<String, TrustTier>) -> Self {
        Self { keys }
    }
}

impl AuthProvider for StaticKeyAuth {
    fn authenticate(&self, credentials: &Credentials) -> Result<AuthedSubject, AuthError> {
        match credentials {
            Credentials::ApiKey(key) => {
                let tier = *self.keys.get(key).ok_or(AuthError::Unknown)?;
                // Subject identity is a digest of the key, so logs and
                // stores never carry the raw credential.
                let mut hasher = Sha256::new();
                hasher.update(key.as_bytes());
                let digest = format!("{:x}", hasher.finalize());
                Ok(AuthedSubject {
                    subject_id: format!("key_{}", &digest[..16]),
                    tier,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_key_authenticates() {
        let auth = StaticKeyAuth::new(HashMap::from([(
            "secret-key".to_string(),
            TrustTier::Verified,
        )]));
        let subject = auth
            .authenticate(&Credentials::ApiKey("secret-key".to_string()))
            .unwrap();
        assert_eq!(subject.tier, TrustTier::Verified);
        assert!(subject.subject_id.starts_with("key_"));
        assert!(!subject.subject_id.contains("secret-key"));
    }

    #[test]
    fn test_unknown_key_fails() {
        let auth = StaticKeyAuth::new(HashMap::new());
        assert!(auth
            .authenticate(&Credentials::ApiKey("nope".to_string()))
            .is_err());
    }

    #[test]
    fn test_same_key_stable_subject() {
        let auth = StaticKeyAuth::new(HashMap::from([("k".to_string(), TrustTier::User)]));
        let a = auth.authenticate(&Credentials::ApiKey("k".to_string())).unwrap();
        let b = auth.authenticate(&Credentials::ApiKey("k".to_string())).unwrap();
        assert_eq!(a, b);
    }
}

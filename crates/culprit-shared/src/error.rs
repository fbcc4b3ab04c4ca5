//! Error types for Culprit.

use crate::diagnosis::EvidenceSource;
use thiserror::Error;

/// Failure reported by an external evidence provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider timed out after {0} ms")]
    Timeout(u64),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider error: {0}")]
    Other(String),
}

impl ProviderError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Timeout(_) => "provider_timeout",
            ProviderError::Auth(_) => "catalog_auth_error",
            ProviderError::RateLimited(_) => "rate_limited",
            ProviderError::Network(_) => "network_error",
            ProviderError::Other(_) => "provider_error",
        }
    }
}

/// A single rule node that could not be interpreted. Absorbed by the extractor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("Malformed rule {rule_id} at {path}: {reason}")]
    MalformedRule {
        rule_id: String,
        path: String,
        reason: String,
    },
}

/// Failure of a diagnosis call as a whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiagnosisError {
    #[error("No evidence source available: {}", describe_failures(.failures))]
    EvidenceUnavailable {
        failures: Vec<(EvidenceSource, String)>,
    },

    #[error("Diagnosis cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl DiagnosisError {
    pub fn code(&self) -> &'static str {
        match self {
            DiagnosisError::EvidenceUnavailable { .. } => "evidence_unavailable",
            DiagnosisError::Cancelled => "cancelled",
            DiagnosisError::InvalidRequest(_) => "invalid_request",
        }
    }
}

fn describe_failures(failures: &[(EvidenceSource, String)]) -> String {
    failures
        .iter()
        .map(|(source, reason)| format!("{} ({})", source, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_unavailable_message() {
        let err = DiagnosisError::EvidenceUnavailable {
            failures: vec![
                (EvidenceSource::EventHistory, "timed out".to_string()),
                (EvidenceSource::RuleCatalog, "denied".to_string()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("event_history (timed out)"));
        assert!(msg.contains("rule_catalog (denied)"));
        assert_eq!(err.code(), "evidence_unavailable");
    }

    #[test]
    fn test_provider_error_codes() {
        assert!(ProviderError::Auth("scope".into()).is_auth());
        assert_eq!(ProviderError::Timeout(10).code(), "provider_timeout");
    }
}

//! Error types for the authorization evaluator

use std::io;

use thiserror::Error;

/// Result type alias for the authorization evaluator
pub type Result<T> = std::result::Result<T, Error>;

/// Authorization evaluator errors.
///
/// Ordinary deny outcomes (unauthenticated session, invalid client
/// certificate, unknown route) are never errors; they are carried as reason
/// codes on the returned decision.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error: malformed signing key, unparsable CA/CRL,
    /// malformed rule. Rejects the whole reload.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The rule engine faulted while evaluating a route policy.
    #[error("Policy evaluation fault: {0}")]
    EvaluationFault(String),

    /// Client certificate material could not be parsed.
    #[error("Client certificate validation fault: {0}")]
    CertificateValidationFault(String),

    /// Evaluation was cancelled by the caller or by a failing sibling task.
    #[error("Evaluation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` for errors that abort a single request rather than a
    /// reload.
    #[must_use]
    pub fn is_request_fault(&self) -> bool {
        matches!(
            self,
            Self::EvaluationFault(_) | Self::CertificateValidationFault(_) | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_faults_are_distinguished_from_reload_errors() {
        assert!(Error::EvaluationFault("boom".into()).is_request_fault());
        assert!(Error::CertificateValidationFault("bad pem".into()).is_request_fault());
        assert!(Error::Cancelled.is_request_fault());
        assert!(!Error::Config("bad key".into()).is_request_fault());
    }

    #[test]
    fn display_includes_detail() {
        let e = Error::Config("couldn't parse client CA".into());
        assert_eq!(e.to_string(), "Configuration error: couldn't parse client CA");
    }
}

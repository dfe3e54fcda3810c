//! Error types shared by the sidecar injector crates
//!
//! Errors carry enough context (resource kind, object name, the step that
//! failed) to make a log line actionable without a stack trace.

use thiserror::Error;

/// Main error type for shared Kubernetes plumbing
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A manifest could not be rendered or parsed
    #[error("manifest error for {kind}: {message}")]
    Manifest {
        /// Kind of the manifest, or "unknown" before it was parsed
        kind: String,
        /// Description of what's wrong
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "create_client", "telemetry")
        context: String,
    },
}

impl Error {
    /// Create a manifest error for the given kind
    pub fn manifest(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_error_names_kind() {
        let err = Error::manifest("Issuer", "missing metadata.name");
        assert_eq!(
            err.to_string(),
            "manifest error for Issuer: missing metadata.name"
        );
    }

    #[test]
    fn internal_error_formats_context() {
        let err = Error::internal_with_context("create_client", "no kubeconfig");
        assert_eq!(err.to_string(), "internal error [create_client]: no kubeconfig");
    }

    #[test]
    fn not_found_detection() {
        let err = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(err.is_not_found());
        assert!(!Error::serialization("x").is_not_found());
    }

    #[test]
    fn serde_errors_convert() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(json_err), Error::Serialization { .. }));
    }
}

//! Errors raised while deciding on an admission request
//!
//! Every variant becomes a denial; the Display text is what the pod's creator
//! sees as the rejection reason.

use thiserror::Error;

use sidecar_injector_common::crd::UnknownCollector;

/// Why a pod could not be mutated
#[derive(Debug, Error)]
pub enum MutationError {
    /// The review targets something other than a Pod
    #[error("{0} is not supported")]
    UnsupportedKind(String),

    /// The review carried no object for a create
    #[error("admission request has no object")]
    MissingObject,

    /// The object is not a valid Pod
    #[error("failed to decode pod: {0}")]
    Decode(#[source] serde_json::Error),

    /// Collector annotation or default names an unknown collector
    #[error(transparent)]
    InvalidCollector(#[from] UnknownCollector),

    /// No aggregator host from annotation or environment
    #[error("aggregator host is required")]
    AggregatorHostRequired,

    /// No application log directory from annotation or environment
    #[error("application log dir is required")]
    ApplicationLogDirRequired,

    /// The config-volume annotation names a volume the pod does not have
    #[error("config volume does not exist")]
    ConfigVolumeMissing,

    /// The expose-port annotation is not a port number
    #[error("expose port must be a number between 1 and 65535, got {0:?}")]
    InvalidPort(String),

    /// The mutated pod could not be serialized for diffing
    #[error("failed to serialize pod: {0}")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_annotation_contract() {
        assert_eq!(
            MutationError::AggregatorHostRequired.to_string(),
            "aggregator host is required"
        );
        assert_eq!(
            MutationError::ApplicationLogDirRequired.to_string(),
            "application log dir is required"
        );
        assert_eq!(
            MutationError::ConfigVolumeMissing.to_string(),
            "config volume does not exist"
        );
        assert_eq!(
            MutationError::UnsupportedKind("Deployment".to_string()).to_string(),
            "Deployment is not supported"
        );
    }

    #[test]
    fn collector_error_is_transparent() {
        let err = MutationError::from(UnknownCollector("vector".to_string()));
        assert_eq!(
            err.to_string(),
            "collector must be fluentd or fluent-bit, vector is not matched"
        );
    }
}

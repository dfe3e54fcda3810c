//! Reconcile errors
//!
//! Every variant is retried by the work queue; none of them crash the
//! controller.

use thiserror::Error;

use sidecar_injector_pki::PkiError;

use crate::watch::ChildKind;

/// Why a sync did not converge
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API failure
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A same-named object exists without our controller owner reference
    #[error("Resource {name:?} already exists and is not managed by SidecarInjector")]
    OwnershipConflict {
        /// Kind of the conflicting object
        kind: ChildKind,
        /// Name of the conflicting object
        name: String,
    },

    /// Key or certificate generation failed
    #[error("failed to issue webhook certificate: {0}")]
    Pki(#[from] PkiError),

    /// Manifest rendering or apply failed
    #[error(transparent)]
    Common(#[from] sidecar_injector_common::Error),

    /// The injector has no uid yet, so children cannot point at it
    #[error("SidecarInjector {0:?} has no uid")]
    MissingUid(String),

    /// The existing TLS secret lacks the certificate
    #[error("secret {0:?} has no cert.pem")]
    MissingCertificate(String),
}

impl ReconcileError {
    /// Whether this is an ownership conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::OwnershipConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_the_object() {
        let err = ReconcileError::OwnershipConflict {
            kind: ChildKind::Service,
            name: "sidecar-injector-default".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Resource \"sidecar-injector-default\" already exists and is not managed by SidecarInjector"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn pki_errors_convert() {
        let err: ReconcileError = PkiError::KeyGenerationFailed("boom".to_string()).into();
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("boom"));
    }
}

//! Common types for the fluentd sidecar injector: the CRD, the configuration
//! contract shared by controller and webhook, errors and Kubernetes plumbing.

#![deny(missing_docs)]

pub mod annotations;
pub mod crd;
pub mod env;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod manifest;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name reported on Events and used as the server-side apply field manager
pub const CONTROLLER_NAME: &str = "sidecar-injector-controller";

/// Label key stamped on every object the controller generates
pub const INJECTOR_LABEL_KEY: &str = "sidecarinjectors.operator.h3poteto.dev";

/// Label values for [`INJECTOR_LABEL_KEY`], one per generated object role
pub mod labels {
    /// Handler Deployment
    pub const WEBHOOK_DEPLOYMENT: &str = "webhook-deployment";
    /// Handler pods, also used as the Service selector
    pub const WEBHOOK_POD: &str = "webhook-pod";
    /// TLS Secret
    pub const WEBHOOK_CERTS: &str = "webhook-certs";
    /// Handler Service
    pub const WEBHOOK_SERVICE: &str = "webhook-service";
    /// MutatingWebhookConfiguration
    pub const WEBHOOK_CONFIGURATION: &str = "webhook-configuration";
}

/// Port the webhook handler listens on inside its pod
pub const WEBHOOK_CONTAINER_PORT: u16 = 8080;

/// Port exposed by the handler Service
pub const WEBHOOK_SERVICE_PORT: i32 = 443;

/// HTTP path of the mutation endpoint
pub const MUTATE_PATH: &str = "/mutate";

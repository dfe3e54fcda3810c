//! Mutating admission webhook for the fluentd sidecar injector
//!
//! The API server posts an AdmissionReview for every pod creation matched by
//! the webhook registration. Pods annotated for injection get a shared log
//! volume and a fluentd or fluent-bit forwarder container; the response
//! carries the change as a JSON Patch.

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod mutation;
pub mod review;
pub mod server;
pub mod sidecar;

pub use config::InjectorDefaults;
pub use error::MutationError;
pub use mutation::validate;

//! SidecarInjector CRD
//!
//! A SidecarInjector declares one admission webhook deployment that injects a
//! log-forwarding sidecar (fluentd or fluent-bit) into annotated pods. The
//! spec carries the cluster-wide defaults handed to the webhook handler pods.

use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// SidecarInjector declares a webhook that injects logging sidecars.
///
/// Example:
/// ```yaml
/// apiVersion: operator.h3poteto.dev/v1alpha1
/// kind: SidecarInjector
/// metadata:
///   name: default
/// spec:
///   collector: fluentd
///   fluentd:
///     aggregatorHost: fluentd-aggregator.logging.svc
///     aggregatorPort: 24224
///     applicationLogDir: /var/log/app
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.h3poteto.dev",
    version = "v1alpha1",
    kind = "SidecarInjector",
    plural = "sidecarinjectors",
    shortname = "si",
    status = "SidecarInjectorStatus",
    printcolumn = r#"{"name":"Collector","type":"string","jsonPath":".spec.collector"}"#,
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".status.injectorDeploymentName"}"#,
    printcolumn = r#"{"name":"Pods","type":"integer","jsonPath":".status.injectorPodCount"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.injectorServiceReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SidecarInjectorSpec {
    /// Which collector the webhook injects by default
    #[serde(default)]
    pub collector: Collector,

    /// Defaults for the fluentd collector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluentd: Option<FluentDConfig>,

    /// Defaults for the fluent-bit collector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluentbit: Option<FluentBitConfig>,
}

/// Log collector flavour
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Collector {
    /// fluentd forwarder
    #[default]
    #[serde(rename = "fluentd")]
    Fluentd,
    /// fluent-bit forwarder
    #[serde(rename = "fluent-bit")]
    FluentBit,
}

impl Collector {
    /// Wire name used in annotations, env and the CRD
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fluentd => "fluentd",
            Self::FluentBit => "fluent-bit",
        }
    }
}

impl fmt::Display for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collector name other than `fluentd` or `fluent-bit`
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("collector must be fluentd or fluent-bit, {0} is not matched")]
pub struct UnknownCollector(pub String);

impl FromStr for Collector {
    type Err = UnknownCollector;

    /// An empty value selects fluentd.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "fluentd" => Ok(Self::Fluentd),
            "fluent-bit" => Ok(Self::FluentBit),
            other => Err(UnknownCollector(other.to_string())),
        }
    }
}

/// Fluentd sidecar defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluentDConfig {
    /// Sidecar image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    /// Host of the aggregator the sidecar forwards to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_host: Option<String>,

    /// Port of the aggregator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_port: Option<i32>,

    /// Directory the application writes its logs into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_log_dir: Option<String>,

    /// Prefix prepended to the fluentd tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_prefix: Option<String>,

    /// Record key holding the event time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_key: Option<String>,

    /// strptime format of the event time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_format: Option<String>,

    /// Free-form environment string passed through to the sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_env: Option<String>,
}

/// Fluent-bit sidecar defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluentBitConfig {
    /// Sidecar image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    /// Host of the aggregator the sidecar forwards to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_host: Option<String>,

    /// Port of the aggregator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_port: Option<i32>,

    /// Directory the application writes its logs into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_log_dir: Option<String>,

    /// Prefix prepended to the fluent-bit tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_prefix: Option<String>,

    /// Free-form environment string passed through to the sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_env: Option<String>,
}

/// SidecarInjector status, derived from the live handler objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SidecarInjectorStatus {
    /// Name of the handler Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injector_deployment_name: Option<String>,

    /// Available replicas of the handler Deployment
    #[serde(default)]
    pub injector_pod_count: i32,

    /// Whether the handler Service has a cluster IP and at least one port
    #[serde(default)]
    pub injector_service_ready: bool,
}

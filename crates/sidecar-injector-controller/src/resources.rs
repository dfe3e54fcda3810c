//! Desired state of the objects owned by a SidecarInjector
//!
//! Pure builders; the reconciler decides whether to create them.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec, TCPSocketAction, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta, OwnerReference,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use sidecar_injector_common::crd::{Collector, SidecarInjectorSpec};
use sidecar_injector_common::{
    env, labels, INJECTOR_LABEL_KEY, MUTATE_PATH, WEBHOOK_CONTAINER_PORT, WEBHOOK_SERVICE_PORT,
};
use sidecar_injector_pki::IssuedCertificate;

/// Secret key holding the private key
pub const SERVER_KEY_NAME: &str = "key.pem";
/// Secret key holding the certificate
pub const SERVER_CERT_NAME: &str = "cert.pem";
/// Key cert-manager writes the private key to
pub const CERT_MANAGER_KEY_NAME: &str = "tls.key";
/// Key cert-manager writes the certificate to
pub const CERT_MANAGER_CERT_NAME: &str = "tls.crt";
/// Annotation asking cert-manager's cainjector to fill the CA bundle
pub const INJECT_CA_FROM_ANNOTATION: &str = "cert-manager.io/inject-ca-from";

const HANDLER_REPLICAS: i32 = 2;
const HANDLER_CONTAINER: &str = "webhook-handler";
const CERTS_VOLUME: &str = "webhook-certs";
const CERTS_MOUNT_PATH: &str = "/etc/webhook/certs";
const WEBHOOK_TIMEOUT_SECONDS: i32 = 30;

/// Failure policy of the webhook registration
///
/// An unreachable handler skips injection instead of blocking pod creation,
/// trading guaranteed log capture for cluster availability.
pub const FAILURE_POLICY: &str = "Ignore";

/// Names of every child derived from one injector name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildNames {
    /// TLS Secret, also the cert-manager Certificate's target
    pub secret: String,
    /// Handler Service
    pub service: String,
    /// Handler Deployment
    pub deployment: String,
    /// MutatingWebhookConfiguration
    pub webhook: String,
    /// cert-manager Issuer
    pub issuer: String,
    /// cert-manager Certificate
    pub certificate: String,
}

impl ChildNames {
    /// Names for the injector called `name`
    pub fn new(name: &str) -> Self {
        Self {
            secret: format!("sidecar-injector-certs-{name}"),
            service: format!("sidecar-injector-{name}"),
            deployment: format!("{name}-handler"),
            webhook: format!("sidecar-injector-webhook-{name}"),
            issuer: format!("sidecar-injector-issuer-{name}"),
            certificate: format!("sidecar-injector-certificate-{name}"),
        }
    }

    /// DNS name the handler is reached at; also the certificate subject
    pub fn service_dns(&self, namespace: &str) -> String {
        format!("{}.{}.svc", self.service, namespace)
    }
}

/// How the API server learns to trust the handler
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaSource {
    /// Embed this PEM bundle
    Bundle(String),
    /// Let cert-manager inject the CA of `namespace/certificate`
    CertManager {
        /// Namespace of the Certificate
        namespace: String,
        /// Certificate name
        certificate: String,
    },
}

fn meta(name: &str, namespace: Option<&str>, label: &str, owner: &OwnerReference) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([(
            INJECTOR_LABEL_KEY.to_string(),
            label.to_string(),
        )])),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

fn pod_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(
        INJECTOR_LABEL_KEY.to_string(),
        labels::WEBHOOK_POD.to_string(),
    )])
}

/// TLS secret carrying a freshly issued pair
pub fn secret(
    names: &ChildNames,
    namespace: &str,
    owner: &OwnerReference,
    issued: &IssuedCertificate,
) -> Secret {
    Secret {
        metadata: meta(&names.secret, Some(namespace), labels::WEBHOOK_CERTS, owner),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            (
                SERVER_KEY_NAME.to_string(),
                ByteString(issued.key_pem.clone().into_bytes()),
            ),
            (
                SERVER_CERT_NAME.to_string(),
                ByteString(issued.cert_pem.clone().into_bytes()),
            ),
        ])),
        ..Default::default()
    }
}

/// Certificate PEM stored in a TLS secret, if present
pub fn secret_certificate(secret: &Secret) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(SERVER_CERT_NAME))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(SERVER_CERT_NAME).cloned())
        })
        .filter(|pem| !pem.is_empty())
}

/// ClusterIP Service fronting the handler pods
pub fn service(names: &ChildNames, namespace: &str, owner: &OwnerReference) -> Service {
    Service {
        metadata: meta(&names.service, Some(namespace), labels::WEBHOOK_SERVICE, owner),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(pod_selector()),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                protocol: Some("TCP".to_string()),
                port: WEBHOOK_SERVICE_PORT,
                target_port: Some(IntOrString::Int(WEBHOOK_CONTAINER_PORT.into())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Environment handed to the handler pods: `COLLECTOR` plus every set field
/// of the SidecarInjector settings under its collector prefix
pub fn handler_env(spec: &SidecarInjectorSpec) -> Vec<EnvVar> {
    let mut vars = vec![var(env::COLLECTOR, spec.collector.as_str().to_string())];
    let mut push = |collector: Collector, name: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            vars.push(var(&env::prefixed(collector, name), value));
        }
    };

    if let Some(fluentd) = &spec.fluentd {
        let c = Collector::Fluentd;
        push(c, env::DOCKER_IMAGE, fluentd.docker_image.clone());
        push(c, env::AGGREGATOR_HOST, fluentd.aggregator_host.clone());
        push(c, env::AGGREGATOR_PORT, port(fluentd.aggregator_port));
        push(c, env::APPLICATION_LOG_DIR, fluentd.application_log_dir.clone());
        push(c, env::TAG_PREFIX, fluentd.tag_prefix.clone());
        push(c, env::TIME_KEY, fluentd.time_key.clone());
        push(c, env::TIME_FORMAT, fluentd.time_format.clone());
        push(c, env::CUSTOM_ENV, fluentd.custom_env.clone());
    }
    if let Some(fluentbit) = &spec.fluentbit {
        let c = Collector::FluentBit;
        push(c, env::DOCKER_IMAGE, fluentbit.docker_image.clone());
        push(c, env::AGGREGATOR_HOST, fluentbit.aggregator_host.clone());
        push(c, env::AGGREGATOR_PORT, port(fluentbit.aggregator_port));
        push(c, env::APPLICATION_LOG_DIR, fluentbit.application_log_dir.clone());
        push(c, env::TAG_PREFIX, fluentbit.tag_prefix.clone());
        push(c, env::CUSTOM_ENV, fluentbit.custom_env.clone());
    }
    vars
}

fn port(port: Option<i32>) -> Option<String> {
    port.filter(|p| *p != 0).map(|p| p.to_string())
}

fn var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

fn tcp_probe(period: i32, success: i32, failure: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(WEBHOOK_CONTAINER_PORT.into()),
            host: None,
        }),
        initial_delay_seconds: Some(30),
        timeout_seconds: Some(60),
        period_seconds: Some(period),
        success_threshold: Some(success),
        failure_threshold: Some(failure),
        ..Default::default()
    }
}

fn quantities(memory: &str, cpu: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("memory".to_string(), Quantity(memory.to_string())),
        ("cpu".to_string(), Quantity(cpu.to_string())),
    ])
}

/// Deployment running the webhook handler
///
/// `cert_manager` selects which key names the handler reads from the TLS
/// secret.
pub fn deployment(
    spec: &SidecarInjectorSpec,
    names: &ChildNames,
    namespace: &str,
    owner: &OwnerReference,
    image: &str,
    cert_manager: bool,
) -> Deployment {
    let (cert, key) = if cert_manager {
        (CERT_MANAGER_CERT_NAME, CERT_MANAGER_KEY_NAME)
    } else {
        (SERVER_CERT_NAME, SERVER_KEY_NAME)
    };

    let container = Container {
        name: HANDLER_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("Always".to_string()),
        args: Some(vec![
            "webhook".to_string(),
            format!("--tls-cert-file={CERTS_MOUNT_PATH}/{cert}"),
            format!("--tls-key-file={CERTS_MOUNT_PATH}/{key}"),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: WEBHOOK_CONTAINER_PORT.into(),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(handler_env(spec)),
        resources: Some(ResourceRequirements {
            requests: Some(quantities("200Mi", "100m")),
            limits: Some(quantities("500Mi", "1000m")),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: CERTS_VOLUME.to_string(),
            mount_path: CERTS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        liveness_probe: Some(tcp_probe(20, 1, 4)),
        readiness_probe: Some(tcp_probe(10, 2, 2)),
        ..Default::default()
    };

    Deployment {
        metadata: meta(
            &names.deployment,
            Some(namespace),
            labels::WEBHOOK_DEPLOYMENT,
            owner,
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(HANDLER_REPLICAS),
            selector: LabelSelector {
                match_labels: Some(pod_selector()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_selector()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: CERTS_VOLUME.to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(names.secret.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    service_account_name: Some("default".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Webhook registration sending pod creations to the handler Service
pub fn webhook_configuration(
    names: &ChildNames,
    namespace: &str,
    owner: &OwnerReference,
    ca: &CaSource,
) -> MutatingWebhookConfiguration {
    let mut metadata = meta(&names.webhook, None, labels::WEBHOOK_CONFIGURATION, owner);
    let ca_bundle = match ca {
        CaSource::Bundle(pem) => Some(ByteString(pem.clone().into_bytes())),
        CaSource::CertManager {
            namespace,
            certificate,
        } => {
            metadata.annotations = Some(BTreeMap::from([(
                INJECT_CA_FROM_ANNOTATION.to_string(),
                format!("{namespace}/{certificate}"),
            )]));
            None
        }
    };

    MutatingWebhookConfiguration {
        metadata,
        webhooks: Some(vec![MutatingWebhook {
            name: names.service_dns(namespace),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    namespace: namespace.to_string(),
                    name: names.service.clone(),
                    path: Some(MUTATE_PATH.to_string()),
                    port: Some(WEBHOOK_SERVICE_PORT),
                }),
                ca_bundle,
                url: None,
            },
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("*".to_string()),
            }]),
            failure_policy: Some(FAILURE_POLICY.to_string()),
            match_policy: Some("Equivalent".to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(WEBHOOK_TIMEOUT_SECONDS),
            admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
            object_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: INJECTOR_LABEL_KEY.to_string(),
                    operator: "NotIn".to_string(),
                    values: Some(vec![labels::WEBHOOK_POD.to_string()]),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }]),
    }
}

//! cert-manager manifests for the managed-certificate path
//!
//! The Issuer and Certificate are rendered from embedded templates and handed
//! to a [`ManifestApplier`]. Rendered manifests already carry the controller
//! owner reference, so garbage collection removes them with the injector.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use minijinja::{context, Environment};
use tracing::{debug, info};

use crate::kube_utils::not_found_as_none;
use crate::{Error, CONTROLLER_NAME};

const ISSUER_TEMPLATE: &str = include_str!("../templates/issuer.yaml");
const CERTIFICATE_TEMPLATE: &str = include_str!("../templates/certificate.yaml");

/// Render the self-signed cert-manager Issuer
pub fn issuer_manifest(
    issuer_name: &str,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<String, Error> {
    render(
        "Issuer",
        ISSUER_TEMPLATE,
        context! {
            issuer_name => issuer_name,
            namespace => namespace,
            owner => owner_context(owner),
        },
    )
}

/// Render the cert-manager Certificate for the webhook Service
pub fn certificate_manifest(
    certificate_name: &str,
    secret_name: &str,
    service_name: &str,
    issuer_name: &str,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<String, Error> {
    render(
        "Certificate",
        CERTIFICATE_TEMPLATE,
        context! {
            certificate_name => certificate_name,
            secret_name => secret_name,
            service_name => service_name,
            issuer_name => issuer_name,
            namespace => namespace,
            owner => owner_context(owner),
        },
    )
}

fn owner_context(owner: &OwnerReference) -> minijinja::Value {
    context! {
        api_version => &owner.api_version,
        kind => &owner.kind,
        name => &owner.name,
        uid => &owner.uid,
    }
}

fn render(kind: &str, template: &str, ctx: minijinja::Value) -> Result<String, Error> {
    let mut env = Environment::new();
    env.add_template("manifest", template)
        .map_err(|e| Error::manifest(kind, format!("invalid template: {}", e)))?;
    env.get_template("manifest")
        .and_then(|t| t.render(ctx))
        .map_err(|e| Error::manifest(kind, format!("failed to render: {}", e)))
}

/// Parsed manifest ready for the dynamic API
#[derive(Debug, Clone)]
pub struct ParsedManifest {
    /// The manifest body
    pub object: DynamicObject,
    /// Resource name
    pub name: String,
    /// Optional namespace
    pub namespace: Option<String>,
    /// API resource definition
    pub api_resource: ApiResource,
}

/// Parse a YAML or JSON manifest and resolve its API resource
pub fn parse_manifest(manifest: &str) -> Result<ParsedManifest, Error> {
    let value: serde_json::Value = serde_yaml::from_str(manifest)?;

    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::manifest("unknown", "manifest missing apiVersion"))?;
    let kind = value
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::manifest("unknown", "manifest missing kind"))?;
    let name = value
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::manifest(kind, "manifest missing metadata.name"))?
        .to_string();
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let (group, version) = parse_api_version(api_version);
    let gvk = kube::core::GroupVersionKind::gvk(&group, &version, kind);
    let api_resource = ApiResource::from_gvk(&gvk);
    let object: DynamicObject = serde_json::from_value(value)?;

    Ok(ParsedManifest {
        object,
        name,
        namespace,
        api_resource,
    })
}

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Applies rendered manifests to the cluster
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Create the object described by `manifest` unless it already exists
    async fn apply(&self, manifest: &str) -> Result<(), Error>;
}

/// [`ManifestApplier`] using server-side apply against the dynamic API
pub struct KubeManifestApplier {
    client: Client,
}

impl KubeManifestApplier {
    /// Create an applier on `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestApplier for KubeManifestApplier {
    async fn apply(&self, manifest: &str) -> Result<(), Error> {
        let parsed = parse_manifest(manifest)?;
        let kind = parsed.api_resource.kind.clone();
        let api: Api<DynamicObject> = match &parsed.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &parsed.api_resource),
            None => Api::all_with(self.client.clone(), &parsed.api_resource),
        };

        if not_found_as_none(api.get(&parsed.name).await)?.is_some() {
            debug!(kind = %kind, name = %parsed.name, "Manifest object already exists");
            return Ok(());
        }

        api.patch(
            &parsed.name,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Apply(&parsed.object),
        )
        .await?;
        info!(kind = %kind, name = %parsed.name, "Applied manifest");
        Ok(())
    }
}

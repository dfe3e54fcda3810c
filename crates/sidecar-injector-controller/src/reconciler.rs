//! SidecarInjector reconciliation
//!
//! [`sync`] converges one injector: TLS material, webhook registration,
//! handler Deployment, handler Service, then status. Every step reads first
//! and only creates what is missing, so a sync against a converged cluster
//! performs no writes. Children are never adopted: a same-named object
//! without our controller owner reference fails the sync until someone
//! removes it.

use std::sync::Arc;

use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use sidecar_injector_common::crd::{SidecarInjector, SidecarInjectorStatus};
use sidecar_injector_common::events::{EventPublisher, InjectorEvent, KubeEventPublisher};
use sidecar_injector_common::kube_utils::{controller_owner_ref, is_controlled_by};
use sidecar_injector_common::manifest::{
    certificate_manifest, issuer_manifest, KubeManifestApplier, ManifestApplier,
};
use sidecar_injector_common::CONTROLLER_NAME;

use crate::client::{InjectorClient, KubeInjectorClient};
use crate::error::ReconcileError;
use crate::resources::{self, CaSource, ChildNames};
use crate::watch::ChildKind;

/// Settings shared by every sync
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Namespace the handler objects live in
    pub namespace: String,
    /// Image of the webhook handler container
    pub webhook_image: String,
    /// Delegate TLS to cert-manager instead of issuing a secret
    pub use_cert_manager: bool,
    /// Reporter instance on emitted events, usually the pod name
    pub instance: Option<String>,
}

/// Dependencies of the reconciler
pub struct Context {
    /// Cluster access
    pub client: Arc<dyn InjectorClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// cert-manager manifest applier
    pub manifests: Arc<dyn ManifestApplier>,
    /// Settings
    pub config: ReconcilerConfig,
}

impl Context {
    /// Assemble a context from its parts
    pub fn new(
        client: Arc<dyn InjectorClient>,
        events: Arc<dyn EventPublisher>,
        manifests: Arc<dyn ManifestApplier>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            events,
            manifests,
            config,
        }
    }

    /// Production context on `client`
    pub fn from_client(client: Client, config: ReconcilerConfig) -> Self {
        Self {
            client: Arc::new(KubeInjectorClient::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(
                client.clone(),
                CONTROLLER_NAME,
                config.instance.clone(),
            )),
            manifests: Arc::new(KubeManifestApplier::new(client)),
            config,
        }
    }
}

/// Derive status from the live handler objects
///
/// The pod count is the Deployment's available replicas as reported. The
/// Service is ready only with both a cluster IP and at least one port.
pub fn derive_status(deployment: &Deployment, service: &Service) -> SidecarInjectorStatus {
    let spec = service.spec.as_ref();
    let has_ports = spec
        .and_then(|s| s.ports.as_ref())
        .is_some_and(|ports| !ports.is_empty());
    let has_address = spec
        .and_then(|s| s.cluster_ip.as_deref())
        .is_some_and(|ip| !ip.is_empty());

    SidecarInjectorStatus {
        injector_deployment_name: deployment.metadata.name.clone(),
        injector_pod_count: deployment
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0),
        injector_service_ready: has_ports && has_address,
    }
}

/// Objects read or created during one sync
struct Ensured<T> {
    object: T,
    created: bool,
}

impl<T> Ensured<T> {
    fn existing(object: T) -> Self {
        Self {
            object,
            created: false,
        }
    }

    fn created(object: T) -> Self {
        Self {
            object,
            created: true,
        }
    }
}

fn check_owned(kind: ChildKind, meta: &ObjectMeta, uid: &str) -> Result<(), ReconcileError> {
    if is_controlled_by(meta, uid) {
        Ok(())
    } else {
        Err(ReconcileError::OwnershipConflict {
            kind,
            name: meta.name.clone().unwrap_or_default(),
        })
    }
}

/// One reconcile pass
struct SyncRun<'a> {
    ctx: &'a Context,
    injector: &'a SidecarInjector,
    owner: OwnerReference,
    uid: String,
    names: ChildNames,
}

impl SyncRun<'_> {
    fn namespace(&self) -> &str {
        &self.ctx.config.namespace
    }

    async fn ensure_secret(&self) -> Result<Ensured<Secret>, ReconcileError> {
        let ns = self.namespace();
        if let Some(secret) = self.ctx.client.get_secret(ns, &self.names.secret).await? {
            check_owned(ChildKind::Secret, &secret.metadata, &self.uid)?;
            return Ok(Ensured::existing(secret));
        }

        let issued = sidecar_injector_pki::issue(&self.names.service_dns(ns))?;
        let desired = resources::secret(&self.names, ns, &self.owner, &issued);
        let created = self.ctx.client.create_secret(&desired).await?;
        info!(name = %self.names.secret, namespace = %ns, "created webhook TLS secret");
        Ok(Ensured::created(created))
    }

    async fn apply_cert_manager(&self) -> Result<(), ReconcileError> {
        let ns = self.namespace();
        let issuer = issuer_manifest(&self.names.issuer, ns, &self.owner)?;
        self.ctx.manifests.apply(&issuer).await?;

        let certificate = certificate_manifest(
            &self.names.certificate,
            &self.names.secret,
            &self.names.service,
            &self.names.issuer,
            ns,
            &self.owner,
        )?;
        self.ctx.manifests.apply(&certificate).await?;
        Ok(())
    }

    async fn ensure_webhook(
        &self,
        ca: &CaSource,
    ) -> Result<Ensured<MutatingWebhookConfiguration>, ReconcileError> {
        if let Some(webhook) = self.ctx.client.get_webhook(&self.names.webhook).await? {
            check_owned(
                ChildKind::MutatingWebhookConfiguration,
                &webhook.metadata,
                &self.uid,
            )?;
            return Ok(Ensured::existing(webhook));
        }

        let desired =
            resources::webhook_configuration(&self.names, self.namespace(), &self.owner, ca);
        let created = self.ctx.client.create_webhook(&desired).await?;
        info!(name = %self.names.webhook, "created MutatingWebhookConfiguration");
        Ok(Ensured::created(created))
    }

    async fn ensure_deployment(&self) -> Result<Ensured<Deployment>, ReconcileError> {
        let ns = self.namespace();
        if let Some(deployment) = self
            .ctx
            .client
            .get_deployment(ns, &self.names.deployment)
            .await?
        {
            check_owned(ChildKind::Deployment, &deployment.metadata, &self.uid)?;
            return Ok(Ensured::existing(deployment));
        }

        let desired = resources::deployment(
            &self.injector.spec,
            &self.names,
            ns,
            &self.owner,
            &self.ctx.config.webhook_image,
            self.ctx.config.use_cert_manager,
        );
        let created = self.ctx.client.create_deployment(&desired).await?;
        info!(name = %self.names.deployment, namespace = %ns, "created handler Deployment");
        Ok(Ensured::created(created))
    }

    async fn ensure_service(&self) -> Result<Ensured<Service>, ReconcileError> {
        let ns = self.namespace();
        if let Some(service) = self.ctx.client.get_service(ns, &self.names.service).await? {
            check_owned(ChildKind::Service, &service.metadata, &self.uid)?;
            return Ok(Ensured::existing(service));
        }

        let desired = resources::service(&self.names, ns, &self.owner);
        let created = self.ctx.client.create_service(&desired).await?;
        info!(name = %self.names.service, namespace = %ns, "created handler Service");
        Ok(Ensured::created(created))
    }

    /// Steps 2-5; returns whether anything was created
    async fn ensure_children(&self) -> Result<(Deployment, Service, bool), ReconcileError> {
        let mut created = false;

        let ca = if self.ctx.config.use_cert_manager {
            self.apply_cert_manager().await?;
            CaSource::CertManager {
                namespace: self.namespace().to_string(),
                certificate: self.names.certificate.clone(),
            }
        } else {
            let secret = self.ensure_secret().await?;
            created |= secret.created;
            let pem = resources::secret_certificate(&secret.object)
                .ok_or_else(|| ReconcileError::MissingCertificate(self.names.secret.clone()))?;
            CaSource::Bundle(pem)
        };

        created |= self.ensure_webhook(&ca).await?.created;

        let deployment = self.ensure_deployment().await?;
        created |= deployment.created;

        let service = self.ensure_service().await?;
        created |= service.created;

        Ok((deployment.object, service.object, created))
    }
}

/// Converge the injector named `key`
///
/// A key that no longer resolves is a success. An ownership conflict is
/// reported as a Warning event and returned as an error so the key is
/// retried; status is left untouched in that case.
pub async fn sync(key: &str, ctx: &Context) -> Result<(), ReconcileError> {
    let Some(injector) = ctx.client.get_injector(key).await? else {
        debug!(key, "SidecarInjector no longer exists");
        return Ok(());
    };

    let uid = injector
        .metadata
        .uid
        .clone()
        .ok_or_else(|| ReconcileError::MissingUid(key.to_string()))?;
    let owner = controller_owner_ref(&injector)
        .ok_or_else(|| ReconcileError::MissingUid(key.to_string()))?;
    let object_ref = injector.object_ref(&());

    let run = SyncRun {
        ctx,
        injector: &injector,
        owner,
        uid,
        names: ChildNames::new(&injector.name_any()),
    };

    let (deployment, service, created) = match run.ensure_children().await {
        Ok(children) => children,
        Err(ReconcileError::OwnershipConflict { kind, name }) => {
            warn!(key, %kind, name = %name, "child exists without SidecarInjector ownership");
            ctx.events
                .record(
                    &object_ref,
                    InjectorEvent::ResourceExists { name: name.clone() },
                )
                .await;
            return Err(ReconcileError::OwnershipConflict { kind, name });
        }
        Err(e) => return Err(e),
    };

    let status = derive_status(&deployment, &service);
    let status_changed = injector.status.as_ref() != Some(&status);
    if status_changed {
        ctx.client.patch_status(key, &status).await?;
        debug!(key, ?status, "updated SidecarInjector status");
    }

    if created || status_changed {
        ctx.events.record(&object_ref, InjectorEvent::Synced).await;
    }
    info!(key, "SidecarInjector synced");
    Ok(())
}

//! Kubernetes access used by the reconciler
//!
//! Reads and creates of each child kind plus the injector's own status,
//! behind a trait so sync logic can run against mocks.

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;

use sidecar_injector_common::crd::{SidecarInjector, SidecarInjectorStatus};
use sidecar_injector_common::kube_utils::{not_found_as_none, patch_cluster_resource_status};
use sidecar_injector_common::CONTROLLER_NAME;

use crate::error::ReconcileError;

/// Cluster operations the reconciler performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InjectorClient: Send + Sync {
    /// Get a SidecarInjector by name
    async fn get_injector(&self, name: &str) -> Result<Option<SidecarInjector>, ReconcileError>;

    /// Replace the status of a SidecarInjector
    async fn patch_status(
        &self,
        name: &str,
        status: &SidecarInjectorStatus,
    ) -> Result<(), ReconcileError>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ReconcileError>;

    /// Create a Secret
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ReconcileError>;

    /// Get a Service
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ReconcileError>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<Service, ReconcileError>;

    /// Get a Deployment
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ReconcileError>;

    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment)
        -> Result<Deployment, ReconcileError>;

    /// Get a MutatingWebhookConfiguration
    async fn get_webhook(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>, ReconcileError>;

    /// Create a MutatingWebhookConfiguration
    async fn create_webhook(
        &self,
        webhook: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, ReconcileError>;
}

/// [`InjectorClient`] backed by the API server
pub struct KubeInjectorClient {
    client: Client,
}

impl KubeInjectorClient {
    /// Wrap `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        }
    }

    fn namespace_of(meta: &ObjectMeta) -> &str {
        meta.namespace.as_deref().unwrap_or("default")
    }
}

#[async_trait]
impl InjectorClient for KubeInjectorClient {
    async fn get_injector(&self, name: &str) -> Result<Option<SidecarInjector>, ReconcileError> {
        let api: Api<SidecarInjector> = Api::all(self.client.clone());
        Ok(not_found_as_none(api.get(name).await)?)
    }

    async fn patch_status(
        &self,
        name: &str,
        status: &SidecarInjectorStatus,
    ) -> Result<(), ReconcileError> {
        patch_cluster_resource_status::<SidecarInjector>(&self.client, name, status, CONTROLLER_NAME)
            .await?;
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ReconcileError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(not_found_as_none(api.get(name).await)?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ReconcileError> {
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), Self::namespace_of(&secret.metadata));
        Ok(api.create(&Self::post_params(), secret).await?)
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ReconcileError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(not_found_as_none(api.get(name).await)?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ReconcileError> {
        let api: Api<Service> =
            Api::namespaced(self.client.clone(), Self::namespace_of(&service.metadata));
        Ok(api.create(&Self::post_params(), service).await?)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ReconcileError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(not_found_as_none(api.get(name).await)?)
    }

    async fn create_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, ReconcileError> {
        let api: Api<Deployment> =
            Api::namespaced(self.client.clone(), Self::namespace_of(&deployment.metadata));
        Ok(api.create(&Self::post_params(), deployment).await?)
    }

    async fn get_webhook(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>, ReconcileError> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(not_found_as_none(api.get(name).await)?)
    }

    async fn create_webhook(
        &self,
        webhook: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, ReconcileError> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(api.create(&Self::post_params(), webhook).await?)
    }
}

//! Watch producers feeding SidecarInjector keys into the work queue
//!
//! Each watched kind runs as its own producer task and sends keys over a
//! channel; [`forward`] drains the channel into the [`WorkQueue`]. Child
//! objects are mapped to their owning injector through the controller owner
//! reference; anything not controlled by a SidecarInjector is dropped.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use sidecar_injector_common::crd::SidecarInjector;
use sidecar_injector_common::kube_utils::controller_of;
use sidecar_injector_common::INJECTOR_LABEL_KEY;

use crate::queue::WorkQueue;

const OWNER_KIND: &str = "SidecarInjector";
const WATCH_TIMEOUT_SECS: u32 = 25;
const CHANNEL_CAPACITY: usize = 256;

/// The closed set of object kinds a SidecarInjector owns
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildKind {
    /// TLS Secret
    Secret,
    /// Handler Service
    Service,
    /// Handler Deployment
    Deployment,
    /// Webhook registration
    MutatingWebhookConfiguration,
}

impl ChildKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Secret => "Secret",
            ChildKind::Service => "Service",
            ChildKind::Deployment => "Deployment",
            ChildKind::MutatingWebhookConfiguration => "MutatingWebhookConfiguration",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of the injector controlling `meta`, if it is a SidecarInjector
pub fn owner_key(meta: &ObjectMeta) -> Option<String> {
    controller_of(meta)
        .filter(|owner| owner.kind == OWNER_KIND)
        .map(|owner| owner.name.clone())
}

/// Objects carried by a watch event
fn touched<K>(event: Event<K>) -> Option<K> {
    match event {
        Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj) => Some(obj),
        Event::Init | Event::InitDone => None,
    }
}

async fn watch_injectors(
    api: Api<SidecarInjector>,
    tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
) {
    let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
    let stream = watcher::watcher(api, config).default_backoff();
    tokio::pin!(stream);

    info!("watching SidecarInjectors");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    if let Some(injector) = touched(event) {
                        if tx.send(injector.name_any()).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, "SidecarInjector watch error, will retry"),
                None => break,
            }
        }
    }
}

async fn watch_children<K>(
    api: Api<K>,
    kind: ChildKind,
    tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
) where
    K: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + 'static,
{
    let config = watcher::Config::default()
        .labels(INJECTOR_LABEL_KEY)
        .timeout(WATCH_TIMEOUT_SECS);
    let stream = watcher::watcher(api, config).default_backoff();
    tokio::pin!(stream);

    info!(%kind, "watching owned objects");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    let Some(obj) = touched(event) else { continue };
                    match owner_key(obj.meta()) {
                        Some(key) => {
                            trace!(%kind, name = %obj.name_any(), owner = %key, "child changed");
                            if tx.send(key).await.is_err() {
                                break;
                            }
                        }
                        None => debug!(%kind, name = %obj.name_any(), "ignoring object without SidecarInjector owner"),
                    }
                }
                Some(Err(e)) => warn!(%kind, error = %e, "watch error, will retry"),
                None => break,
            }
        }
    }
}

/// Drain producer keys into `queue` until every sender is gone
pub async fn forward(mut rx: mpsc::Receiver<String>, queue: Arc<WorkQueue>) {
    while let Some(key) = rx.recv().await {
        queue.add(&key);
    }
}

/// Spawn every producer plus the forwarder
///
/// Children are watched in `namespace`; injectors and webhook registrations
/// are cluster-scoped.
pub fn spawn_producers(
    client: Client,
    namespace: &str,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
) -> JoinSet<()> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut tasks = JoinSet::new();

    tasks.spawn(watch_injectors(
        Api::all(client.clone()),
        tx.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(watch_children::<Secret>(
        Api::namespaced(client.clone(), namespace),
        ChildKind::Secret,
        tx.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(watch_children::<Service>(
        Api::namespaced(client.clone(), namespace),
        ChildKind::Service,
        tx.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(watch_children::<Deployment>(
        Api::namespaced(client.clone(), namespace),
        ChildKind::Deployment,
        tx.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(watch_children::<MutatingWebhookConfiguration>(
        Api::all(client),
        ChildKind::MutatingWebhookConfiguration,
        tx,
        shutdown,
    ));
    tasks.spawn(forward(rx, queue));
    tasks
}

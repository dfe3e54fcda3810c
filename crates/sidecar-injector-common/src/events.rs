//! Kubernetes Events emitted on SidecarInjector objects
//!
//! The reconciler records an [`InjectorEvent`]; how it reaches the cluster is
//! behind [`EventPublisher`]. Publishing never fails a sync: errors are
//! logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// A sync converged every child object
    pub const SYNCED: &str = "Synced";
    /// A child object name is taken by an object this injector does not own
    pub const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
}

/// Event actions
pub mod actions {
    /// One pass of the reconcile loop
    pub const RECONCILE: &str = "Reconcile";
}

/// Note attached to [`reasons::SYNCED`]
pub const MESSAGE_SYNCED: &str = "SidecarInjector synced successfully";

/// Note attached to [`reasons::ERR_RESOURCE_EXISTS`]
pub fn message_resource_exists(name: &str) -> String {
    format!("Resource {name:?} already exists and is not managed by SidecarInjector")
}

/// Something worth telling the owner of a SidecarInjector about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InjectorEvent {
    /// Every child exists and status is current
    Synced,
    /// A child name is held by an object the injector does not control
    ResourceExists {
        /// Name of the conflicting object
        name: String,
    },
}

impl InjectorEvent {
    /// Normal or Warning
    pub fn event_type(&self) -> EventType {
        match self {
            InjectorEvent::Synced => EventType::Normal,
            InjectorEvent::ResourceExists { .. } => EventType::Warning,
        }
    }

    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            InjectorEvent::Synced => reasons::SYNCED,
            InjectorEvent::ResourceExists { .. } => reasons::ERR_RESOURCE_EXISTS,
        }
    }

    /// Human-readable note
    pub fn note(&self) -> String {
        match self {
            InjectorEvent::Synced => MESSAGE_SYNCED.to_string(),
            InjectorEvent::ResourceExists { name } => message_resource_exists(name),
        }
    }
}

/// Sink for events about a SidecarInjector
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `event` on the object behind `resource_ref`
    async fn record(&self, resource_ref: &ObjectReference, event: InjectorEvent);
}

/// [`EventPublisher`] writing to the events.k8s.io API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller`, tagged with `instance` when known
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn record(&self, resource_ref: &ObjectReference, event: InjectorEvent) {
        let reason = event.reason();
        let published = self
            .recorder
            .publish(
                &Event {
                    type_: event.event_type(),
                    reason: reason.to_string(),
                    note: Some(event.note()),
                    action: actions::RECONCILE.to_string(),
                    secondary: None,
                },
                resource_ref,
            )
            .await;
        if let Err(e) = published {
            warn!(
                reason,
                object = ?resource_ref.name,
                error = %e,
                "failed to publish event"
            );
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn record(&self, _resource_ref: &ObjectReference, _event: InjectorEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_a_warning_quoting_the_name() {
        let event = InjectorEvent::ResourceExists {
            name: "sidecar-injector-default".to_string(),
        };
        assert_eq!(event.event_type(), EventType::Warning);
        assert_eq!(event.reason(), "ErrResourceExists");
        assert_eq!(
            event.note(),
            "Resource \"sidecar-injector-default\" already exists and is not managed by SidecarInjector"
        );
    }

    #[test]
    fn synced_is_normal() {
        assert_eq!(InjectorEvent::Synced.event_type(), EventType::Normal);
        assert_eq!(InjectorEvent::Synced.reason(), "Synced");
        assert_eq!(InjectorEvent::Synced.note(), MESSAGE_SYNCED);
    }
}

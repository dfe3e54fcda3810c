//! Admission decision for pod creation
//!
//! [`validate`] is a pure function of the request, the environment defaults and
//! the pod's annotations. Every failure becomes a denial; nothing partial is
//! ever returned.

use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use tracing::{debug, info, warn};

use sidecar_injector_common::annotations;

use crate::config::InjectorDefaults;
use crate::context::{resolve_collector, PodMutationContext};
use crate::error::MutationError;
use crate::review::{Operation, ReviewRequest, ReviewResponse};
use crate::sidecar;

/// Warning attached to pods that pass through untouched
pub const NOT_MUTATED: &str = "Object is not mutated";

/// Outcome of a successful mutation attempt
#[derive(Debug)]
pub enum Mutation {
    /// The pod did not opt in
    Skipped,
    /// The sidecar was injected; carries the mutated pod
    Injected(Box<Pod>),
}

/// Decide on one admission request
pub fn validate(request: &ReviewRequest, defaults: &InjectorDefaults) -> ReviewResponse {
    if request.kind.kind != "Pod" {
        let err = MutationError::UnsupportedKind(request.kind.kind.clone());
        warn!(uid = %request.uid, error = %err, "denying admission request");
        return ReviewResponse::deny(&request.uid, err.to_string());
    }

    if request.operation != Operation::Create {
        debug!(uid = %request.uid, operation = ?request.operation, "allowing non-create request");
        return ReviewResponse::allow(&request.uid);
    }

    match review_pod(request, defaults) {
        Ok(response) => response,
        Err(err) => {
            warn!(
                uid = %request.uid,
                namespace = request.namespace.as_deref().unwrap_or_default(),
                error = %err,
                "denying pod creation"
            );
            ReviewResponse::deny(&request.uid, err.to_string())
        }
    }
}

fn review_pod(
    request: &ReviewRequest,
    defaults: &InjectorDefaults,
) -> Result<ReviewResponse, MutationError> {
    let object = request.object.as_ref().ok_or(MutationError::MissingObject)?;
    let pod = Pod::deserialize(object).map_err(MutationError::Decode)?;

    match mutate_pod(&pod, defaults)? {
        Mutation::Skipped => Ok(ReviewResponse::allow(&request.uid).with_warning(NOT_MUTATED)),
        Mutation::Injected(mutated) => {
            // the API server applies the patch to the object it sent us
            let after = serde_json::to_value(&*mutated).map_err(MutationError::Encode)?;
            let patch = json_patch::diff(object, &after);
            info!(
                uid = %request.uid,
                namespace = request.namespace.as_deref().unwrap_or_default(),
                operations = patch.0.len(),
                "injected sidecar"
            );
            Ok(ReviewResponse::allow(&request.uid).with_patch(patch))
        }
    }
}

/// Apply the injection policy to a copy of `pod`
pub fn mutate_pod(pod: &Pod, defaults: &InjectorDefaults) -> Result<Mutation, MutationError> {
    let empty = Default::default();
    let pod_annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);

    let enabled = pod_annotations
        .get(annotations::INJECTION)
        .is_some_and(|v| v == annotations::INJECTION_ENABLED);
    if !enabled {
        return Ok(Mutation::Skipped);
    }

    let collector = resolve_collector(pod_annotations, defaults)?;
    let ctx = PodMutationContext::resolve(collector, pod_annotations, defaults)?;

    let mut mutated = pod.clone();
    sidecar::inject(&mut mutated, &ctx)?;
    Ok(Mutation::Injected(Box::new(mutated)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{GroupVersionKind, ReviewVersion};
    use crate::sidecar::{CONTAINER_NAME, VOLUME_NAME};
    use serde_json::{json, Value};

    fn request(kind: &str, operation: Operation, object: Option<Value>) -> ReviewRequest {
        ReviewRequest {
            version: ReviewVersion::V1,
            uid: "uid-1".to_string(),
            kind: GroupVersionKind {
                group: String::new(),
                version: "v1".to_string(),
                kind: kind.to_string(),
            },
            namespace: Some("default".to_string()),
            name: None,
            operation,
            object,
            dry_run: false,
        }
    }

    fn nginx_pod(annotations: &[(&str, &str)]) -> Value {
        let annotations: serde_json::Map<String, Value> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web", "annotations": annotations},
            "spec": {"containers": [{"name": "nginx", "image": "nginx:latest"}]}
        })
    }

    fn enabled(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        let mut pairs = vec![
            (annotations::INJECTION, "enabled"),
            (annotations::AGGREGATOR_HOST, "127.0.0.1"),
            (annotations::APPLICATION_LOG_DIR, "/var/log/nginx"),
        ];
        pairs.extend_from_slice(extra);
        pairs
    }

    fn apply(object: &Value, response: &ReviewResponse) -> Pod {
        let mut doc = object.clone();
        json_patch::patch(&mut doc, response.patch.as_ref().unwrap()).unwrap();
        serde_json::from_value(doc).unwrap()
    }

    fn sidecar_env(pod: &Pod) -> Vec<String> {
        pod.spec.as_ref().unwrap().containers[1]
            .env
            .iter()
            .flatten()
            .map(|e| e.name.clone())
            .collect()
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    #[test]
    fn story_annotated_pod_gets_a_sidecar_and_shared_log_volume() {
        let object = nginx_pod(&enabled(&[]));
        let response = validate(
            &request("Pod", Operation::Create, Some(object.clone())),
            &InjectorDefaults::default(),
        );
        assert!(response.allowed, "{:?}", response.warnings);

        let pod = apply(&object, &response);
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[1].name, CONTAINER_NAME);
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);
        for container in &spec.containers {
            assert!(container
                .volume_mounts
                .iter()
                .flatten()
                .any(|m| m.name == VOLUME_NAME && m.mount_path == "/var/log/nginx"));
        }
    }

    #[test]
    fn story_collector_selects_the_sidecar_flavour() {
        let bit = nginx_pod(&enabled(&[(annotations::COLLECTOR, "fluent-bit")]));
        let response = validate(
            &request("Pod", Operation::Create, Some(bit.clone())),
            &InjectorDefaults::default(),
        );
        let env = sidecar_env(&apply(&bit, &response));
        assert!(env.contains(&"REFRESH_INTERVAL".to_string()));
        assert!(env.contains(&"ROTATE_WAIT".to_string()));
        assert!(!env.contains(&"TIME_KEY".to_string()));
        assert!(!env.contains(&"TIME_FORMAT".to_string()));

        let fluentd = nginx_pod(&enabled(&[]));
        let response = validate(
            &request("Pod", Operation::Create, Some(fluentd.clone())),
            &InjectorDefaults::default(),
        );
        let env = sidecar_env(&apply(&fluentd, &response));
        assert!(env.contains(&"TIME_KEY".to_string()));
        assert!(env.contains(&"TIME_FORMAT".to_string()));
        assert!(!env.contains(&"REFRESH_INTERVAL".to_string()));
        assert!(!env.contains(&"ROTATE_WAIT".to_string()));
    }

    #[test]
    fn story_missing_aggregator_host_denies_without_patch() {
        let object = nginx_pod(&[
            (annotations::INJECTION, "enabled"),
            (annotations::APPLICATION_LOG_DIR, "/var/log/nginx"),
        ]);
        let response = validate(
            &request("Pod", Operation::Create, Some(object)),
            &InjectorDefaults::default(),
        );
        assert!(!response.allowed);
        assert!(response.patch.is_none());
        assert!(response.warnings[0].contains("aggregator host is required"));
    }

    #[test]
    fn story_environment_defaults_fill_required_fields() {
        let defaults = InjectorDefaults::from_lookup(|name| match name {
            "FLUENTD_AGGREGATOR_HOST" => Some("agg.logging".to_string()),
            "APPLICATION_LOG_DIR" => Some("/var/log/app".to_string()),
            _ => None,
        });
        let object = nginx_pod(&[(annotations::INJECTION, "enabled")]);
        let response = validate(
            &request("Pod", Operation::Create, Some(object.clone())),
            &defaults,
        );
        assert!(response.allowed);

        let pod = apply(&object, &response);
        let sidecar = &pod.spec.unwrap().containers[1];
        let host = sidecar
            .env
            .iter()
            .flatten()
            .find(|e| e.name == "AGGREGATOR_HOST")
            .and_then(|e| e.value.clone());
        assert_eq!(host.as_deref(), Some("agg.logging"));
    }

    // =========================================================================
    // Decision policy
    // =========================================================================

    #[test]
    fn pod_without_opt_in_is_allowed_unpatched() {
        let object = nginx_pod(&[]);
        let response = validate(
            &request("Pod", Operation::Create, Some(object)),
            &InjectorDefaults::default(),
        );
        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(response.warnings, vec![NOT_MUTATED.to_string()]);
    }

    #[test]
    fn injection_annotation_must_equal_enabled() {
        let object = nginx_pod(&[(annotations::INJECTION, "true")]);
        let response = validate(
            &request("Pod", Operation::Create, Some(object)),
            &InjectorDefaults::default(),
        );
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn non_pod_kind_is_denied() {
        let response = validate(
            &request("Deployment", Operation::Create, None),
            &InjectorDefaults::default(),
        );
        assert!(!response.allowed);
        assert_eq!(
            response.status_message.as_deref(),
            Some("Deployment is not supported")
        );
    }

    #[test]
    fn non_create_operations_are_allowed() {
        for operation in [Operation::Update, Operation::Delete, Operation::Connect] {
            let response = validate(
                &request("Pod", operation, Some(nginx_pod(&enabled(&[])))),
                &InjectorDefaults::default(),
            );
            assert!(response.allowed);
            assert!(response.patch.is_none());
            assert!(response.warnings.is_empty());
        }
    }

    #[test]
    fn undecodable_pod_is_denied() {
        let response = validate(
            &request("Pod", Operation::Create, Some(json!({"spec": {"containers": "nginx"}}))),
            &InjectorDefaults::default(),
        );
        assert!(!response.allowed);
        assert!(response.warnings[0].starts_with("failed to decode pod"));
    }

    #[test]
    fn missing_object_is_denied() {
        let response = validate(
            &request("Pod", Operation::Create, None),
            &InjectorDefaults::default(),
        );
        assert!(!response.allowed);
    }

    #[test]
    fn unknown_collector_is_denied() {
        let object = nginx_pod(&enabled(&[(annotations::COLLECTOR, "vector")]));
        let response = validate(
            &request("Pod", Operation::Create, Some(object)),
            &InjectorDefaults::default(),
        );
        assert!(!response.allowed);
        assert_eq!(
            response.warnings[0],
            "collector must be fluentd or fluent-bit, vector is not matched"
        );
    }

    #[test]
    fn missing_config_volume_is_denied() {
        let object = nginx_pod(&enabled(&[(annotations::CONFIG_VOLUME, "fluentd-config")]));
        let response = validate(
            &request("Pod", Operation::Create, Some(object)),
            &InjectorDefaults::default(),
        );
        assert!(!response.allowed);
        assert_eq!(response.warnings[0], "config volume does not exist");
    }

    #[test]
    fn existing_config_volume_is_mounted() {
        let mut object = nginx_pod(&enabled(&[(annotations::CONFIG_VOLUME, "fluentd-config")]));
        object["spec"]["volumes"] = json!([{"name": "fluentd-config", "configMap": {"name": "cfg"}}]);
        let response = validate(
            &request("Pod", Operation::Create, Some(object.clone())),
            &InjectorDefaults::default(),
        );
        assert!(response.allowed);

        let pod = apply(&object, &response);
        let spec = pod.spec.unwrap();
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 2);
        let mounts = spec.containers[1].volume_mounts.clone().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.name == "fluentd-config" && m.mount_path == "/fluentd/etc"));
    }

    #[test]
    fn mutate_pod_leaves_the_input_untouched() {
        let pod: Pod = serde_json::from_value(nginx_pod(&enabled(&[]))).unwrap();
        let before = pod.clone();
        let mutation = mutate_pod(&pod, &InjectorDefaults::default()).unwrap();
        assert_eq!(pod, before);
        assert!(matches!(mutation, Mutation::Injected(_)));
    }

    #[test]
    fn patch_only_adds_to_the_submitted_object() {
        let mut object = nginx_pod(&enabled(&[]));
        object["metadata"]["labels"] = json!({"app": "web"});
        object["spec"]["restartPolicy"] = json!("Always");
        object["spec"]["containers"][0]["ports"] = json!([{"containerPort": 80}]);
        let response = validate(
            &request("Pod", Operation::Create, Some(object.clone())),
            &InjectorDefaults::default(),
        );
        assert!(response.allowed);

        let patch = response.patch.clone().unwrap();
        let ops = serde_json::to_value(&patch).unwrap();
        assert!(ops
            .as_array()
            .unwrap()
            .iter()
            .all(|op| op["op"] == "add"));

        let mut doc = object.clone();
        json_patch::patch(&mut doc, &patch).unwrap();
        assert_eq!(doc["metadata"]["labels"], object["metadata"]["labels"]);
        assert_eq!(doc["spec"]["restartPolicy"], "Always");
        assert_eq!(doc["spec"]["containers"][0]["ports"], object["spec"]["containers"][0]["ports"]);
        assert_eq!(doc["spec"]["containers"][1]["name"], CONTAINER_NAME);
    }
}

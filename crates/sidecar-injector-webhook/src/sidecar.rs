//! Pod surgery: shared log volume, per-container mounts and the sidecar itself

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    Pod, ResourceFieldSelector, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::context::{CollectorSettings, PodMutationContext, SidecarResources};
use crate::error::MutationError;

/// Name of the injected container
pub const CONTAINER_NAME: &str = "fluentd-sidecar";
/// Name of the shared log volume
pub const VOLUME_NAME: &str = "fluentd-sidecar-injector-logs";

/// Inject the sidecar described by `ctx` into `pod`
///
/// On error the pod may be partially modified; callers discard it.
pub fn inject(pod: &mut Pod, ctx: &PodMutationContext) -> Result<(), MutationError> {
    let spec = pod.spec.get_or_insert_with(Default::default);

    let config_mount = match &ctx.config_volume {
        Some(name) => {
            let exists = spec
                .volumes
                .iter()
                .flatten()
                .any(|volume| &volume.name == name);
            if !exists {
                return Err(MutationError::ConfigVolumeMissing);
            }
            Some(VolumeMount {
                name: name.clone(),
                mount_path: ctx.config_mount_path().to_string(),
                ..Default::default()
            })
        }
        None => None,
    };

    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });

    let log_mount = VolumeMount {
        name: VOLUME_NAME.to_string(),
        mount_path: ctx.application_log_dir.clone(),
        read_only: Some(false),
        ..Default::default()
    };
    for container in spec.containers.iter_mut() {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(log_mount.clone());
    }

    let mut mounts = vec![log_mount];
    mounts.extend(config_mount);

    spec.containers.push(Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(ctx.docker_image.clone()),
        ports: ctx.expose_port.map(|port| {
            vec![ContainerPort {
                container_port: port,
                ..Default::default()
            }]
        }),
        env: Some(sidecar_env(ctx)),
        resources: Some(resources(&ctx.resources)),
        volume_mounts: Some(mounts),
        ..Default::default()
    });
    Ok(())
}

fn sidecar_env(ctx: &PodMutationContext) -> Vec<EnvVar> {
    let mut env = Vec::new();
    let mut push = |name: &str, value: &str| {
        if !value.is_empty() {
            env.push(EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                value_from: None,
            });
        }
    };

    match &ctx.settings {
        CollectorSettings::Fluentd {
            time_key,
            time_format,
            log_format,
            send_timeout,
            recover_wait,
            hard_timeout,
        } => {
            push("SEND_TIMEOUT", send_timeout);
            push("RECOVER_WAIT", recover_wait);
            push("HARD_TIMEOUT", hard_timeout);
            push("AGGREGATOR_HOST", &ctx.aggregator_host);
            push("AGGREGATOR_PORT", &ctx.aggregator_port);
            push("LOG_FORMAT", log_format);
            push("CUSTOM_ENV", &ctx.custom_env);
            push("APPLICATION_LOG_DIR", &ctx.application_log_dir);
            push("TAG_PREFIX", &ctx.tag_prefix);
            push("TIME_KEY", time_key);
            push("TIME_FORMAT", time_format);
        }
        CollectorSettings::FluentBit {
            refresh_interval,
            rotate_wait,
        } => {
            push("REFRESH_INTERVAL", refresh_interval);
            push("ROTATE_WAIT", rotate_wait);
            push("AGGREGATOR_HOST", &ctx.aggregator_host);
            push("AGGREGATOR_PORT", &ctx.aggregator_port);
            push("CUSTOM_ENV", &ctx.custom_env);
            push("APPLICATION_LOG_DIR", &ctx.application_log_dir);
            push("TAG_PREFIX", &ctx.tag_prefix);
        }
    }

    env.extend(downward_api_env());
    env
}

fn downward_api_env() -> Vec<EnvVar> {
    let field = |name: &str, path: &str| EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    };
    let resource = |name: &str, path: &str| EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            resource_field_ref: Some(ResourceFieldSelector {
                container_name: Some(CONTAINER_NAME.to_string()),
                resource: path.to_string(),
                divisor: None,
            }),
            ..Default::default()
        }),
    };

    vec![
        field("NODE_NAME", "spec.nodeName"),
        field("POD_NAME", "metadata.name"),
        field("POD_NAMESPACE", "metadata.namespace"),
        field("POD_IP", "status.podIP"),
        field("POD_SERVICE_ACCOUNT", "spec.serviceAccountName"),
        resource("CPU_REQUEST", "requests.cpu"),
        resource("CPU_LIMIT", "limits.cpu"),
        resource("MEM_REQUEST", "requests.memory"),
        resource("MEM_LIMIT", "limits.memory"),
    ]
}

fn resources(res: &SidecarResources) -> ResourceRequirements {
    let quantities = |memory: &Option<String>, cpu: &Option<String>| {
        let mut map = BTreeMap::new();
        if let Some(memory) = memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        if let Some(cpu) = cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        (!map.is_empty()).then_some(map)
    };

    ResourceRequirements {
        requests: quantities(&res.memory_request, &res.cpu_request),
        limits: quantities(&res.memory_limit, &res.cpu_limit),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use sidecar_injector_common::crd::Collector;

    fn context(collector: Collector) -> PodMutationContext {
        let settings = match collector {
            Collector::Fluentd => CollectorSettings::Fluentd {
                time_key: "time".to_string(),
                time_format: "%Y".to_string(),
                log_format: "json".to_string(),
                send_timeout: "60s".to_string(),
                recover_wait: "10s".to_string(),
                hard_timeout: "120s".to_string(),
            },
            Collector::FluentBit => CollectorSettings::FluentBit {
                refresh_interval: "60".to_string(),
                rotate_wait: "5".to_string(),
            },
        };
        PodMutationContext {
            collector,
            docker_image: "img:1".to_string(),
            aggregator_host: "agg".to_string(),
            aggregator_port: "24224".to_string(),
            application_log_dir: "/var/log/app".to_string(),
            tag_prefix: "app".to_string(),
            custom_env: String::new(),
            expose_port: None,
            config_volume: None,
            resources: SidecarResources {
                memory_request: Some("200Mi".to_string()),
                memory_limit: Some("1000Mi".to_string()),
                cpu_request: Some("100m".to_string()),
                cpu_limit: None,
            },
            settings,
        }
    }

    fn pod(containers: &[&str], volumes: &[&str]) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                volumes: (!volumes.is_empty()).then(|| {
                    volumes
                        .iter()
                        .map(|name| Volume {
                            name: name.to_string(),
                            ..Default::default()
                        })
                        .collect()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn env_names(container: &Container) -> Vec<String> {
        container
            .env
            .iter()
            .flatten()
            .map(|e| e.name.clone())
            .collect()
    }

    #[test]
    fn sidecar_is_appended_last_and_every_container_gets_the_mount() {
        let mut pod = pod(&["nginx", "php"], &[]);
        inject(&mut pod, &context(Collector::Fluentd)).unwrap();

        let spec = pod.spec.unwrap();
        let names: Vec<_> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["nginx", "php", CONTAINER_NAME]);
        for container in &spec.containers {
            assert!(container
                .volume_mounts
                .iter()
                .flatten()
                .any(|m| m.name == VOLUME_NAME && m.mount_path == "/var/log/app"));
        }
        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        assert!(volumes[0].empty_dir.is_some());
    }

    #[test]
    fn empty_values_are_not_exported() {
        let mut pod = pod(&["nginx"], &[]);
        inject(&mut pod, &context(Collector::Fluentd)).unwrap();
        let sidecar = &pod.spec.unwrap().containers[1];
        let names = env_names(sidecar);
        assert!(!names.contains(&"CUSTOM_ENV".to_string()));
        assert!(names.contains(&"POD_IP".to_string()));
        assert!(names.contains(&"MEM_LIMIT".to_string()));
    }

    #[test]
    fn resource_env_points_at_the_sidecar() {
        let mut pod = pod(&["nginx"], &[]);
        inject(&mut pod, &context(Collector::FluentBit)).unwrap();
        let sidecar = &pod.spec.unwrap().containers[1];
        let cpu = sidecar
            .env
            .iter()
            .flatten()
            .find(|e| e.name == "CPU_REQUEST")
            .and_then(|e| e.value_from.as_ref())
            .and_then(|v| v.resource_field_ref.as_ref())
            .unwrap();
        assert_eq!(cpu.container_name.as_deref(), Some(CONTAINER_NAME));
        assert_eq!(cpu.resource, "requests.cpu");

        let resources = sidecar.resources.as_ref().unwrap();
        assert_eq!(
            resources.requests.as_ref().unwrap().get("memory"),
            Some(&Quantity("200Mi".to_string()))
        );
        assert!(resources.limits.as_ref().unwrap().get("cpu").is_none());
    }

    #[test]
    fn config_volume_is_mounted_at_the_collector_path() {
        let mut ctx = context(Collector::FluentBit);
        ctx.config_volume = Some("fluent-bit-config".to_string());
        let mut pod = pod(&["nginx"], &["fluent-bit-config"]);
        inject(&mut pod, &ctx).unwrap();

        let spec = pod.spec.unwrap();
        let sidecar = spec.containers.last().unwrap();
        let mounts = sidecar.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].name, "fluent-bit-config");
        assert_eq!(mounts[1].mount_path, "/fluent-bit/etc");
        // the application container only gets the log volume
        assert_eq!(spec.containers[0].volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn unknown_config_volume_is_rejected() {
        let mut ctx = context(Collector::Fluentd);
        ctx.config_volume = Some("missing".to_string());
        let mut pod = pod(&["nginx"], &["other"]);
        assert!(matches!(
            inject(&mut pod, &ctx),
            Err(MutationError::ConfigVolumeMissing)
        ));
    }

    #[test]
    fn expose_port_adds_a_container_port() {
        let mut ctx = context(Collector::Fluentd);
        ctx.expose_port = Some(24231);
        let mut pod = pod(&["nginx"], &[]);
        inject(&mut pod, &ctx).unwrap();
        let ports = pod.spec.unwrap().containers[1].ports.clone().unwrap();
        assert_eq!(ports[0].container_port, 24231);
    }
}

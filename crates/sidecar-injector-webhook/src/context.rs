//! Per-request sidecar configuration
//!
//! Every field is resolved in strict precedence: pod annotation, then the
//! environment default, then the built-in constant. A present annotation wins
//! even when empty, which is how a pod clears an optional setting.

use std::collections::BTreeMap;

use sidecar_injector_common::annotations;
use sidecar_injector_common::crd::Collector;

use crate::config::{CollectorDefaults, InjectorDefaults};
use crate::error::MutationError;

/// Built-in fluentd constants
pub mod fluentd {
    /// Sidecar image
    pub const DOCKER_IMAGE: &str = "ghcr.io/h3poteto/fluentd-forward:latest";
    /// Aggregator port
    pub const AGGREGATOR_PORT: &str = "24224";
    /// Tag prefix
    pub const TAG_PREFIX: &str = "app";
    /// Record key holding the event time
    pub const TIME_KEY: &str = "time";
    /// strptime format of the event time
    pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";
    /// Parser format
    pub const LOG_FORMAT: &str = "json";
    /// forward output send timeout
    pub const SEND_TIMEOUT: &str = "60s";
    /// forward output recover wait
    pub const RECOVER_WAIT: &str = "10s";
    /// forward output hard timeout
    pub const HARD_TIMEOUT: &str = "120s";
    /// Where a config volume is mounted
    pub const CONFIG_MOUNT_PATH: &str = "/fluentd/etc";
}

/// Built-in fluent-bit constants
pub mod fluentbit {
    /// Sidecar image
    pub const DOCKER_IMAGE: &str = "ghcr.io/h3poteto/fluentbit-forward:latest";
    /// Aggregator port
    pub const AGGREGATOR_PORT: &str = "24224";
    /// Tag prefix
    pub const TAG_PREFIX: &str = "app";
    /// tail input refresh interval in seconds
    pub const REFRESH_INTERVAL: &str = "60";
    /// tail input rotate wait in seconds
    pub const ROTATE_WAIT: &str = "5";
    /// Where a config volume is mounted
    pub const CONFIG_MOUNT_PATH: &str = "/fluent-bit/etc";
}

/// Default sidecar memory request
pub const DEFAULT_MEMORY_REQUEST: &str = "200Mi";
/// Default sidecar cpu request
pub const DEFAULT_CPU_REQUEST: &str = "100m";
/// Default sidecar memory limit
pub const DEFAULT_MEMORY_LIMIT: &str = "1000Mi";

type Annotations = BTreeMap<String, String>;

/// Resource requests and limits of the sidecar; `None` leaves it unset
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarResources {
    /// Memory request
    pub memory_request: Option<String>,
    /// Memory limit
    pub memory_limit: Option<String>,
    /// CPU request
    pub cpu_request: Option<String>,
    /// CPU limit
    pub cpu_limit: Option<String>,
}

impl SidecarResources {
    fn resolve(annotations: &Annotations) -> Self {
        let pick = |key: &str, default: Option<&str>| {
            annotations
                .get(key)
                .cloned()
                .or_else(|| default.map(str::to_string))
                .filter(|v| !v.is_empty())
        };
        Self {
            memory_request: pick(annotations::MEMORY_REQUEST, Some(DEFAULT_MEMORY_REQUEST)),
            memory_limit: pick(annotations::MEMORY_LIMIT, Some(DEFAULT_MEMORY_LIMIT)),
            cpu_request: pick(annotations::CPU_REQUEST, Some(DEFAULT_CPU_REQUEST)),
            cpu_limit: pick(annotations::CPU_LIMIT, None),
        }
    }
}

/// Settings only one collector understands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectorSettings {
    /// fluentd forward output
    Fluentd {
        /// Record key holding the event time
        time_key: String,
        /// strptime format of the event time
        time_format: String,
        /// Parser format
        log_format: String,
        /// Send timeout
        send_timeout: String,
        /// Recover wait
        recover_wait: String,
        /// Hard timeout
        hard_timeout: String,
    },
    /// fluent-bit tail input
    FluentBit {
        /// Refresh interval
        refresh_interval: String,
        /// Rotate wait
        rotate_wait: String,
    },
}

/// Fully resolved configuration for one injection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodMutationContext {
    /// Collector flavour
    pub collector: Collector,
    /// Sidecar image
    pub docker_image: String,
    /// Aggregator host, never empty
    pub aggregator_host: String,
    /// Aggregator port
    pub aggregator_port: String,
    /// Shared log directory, never empty
    pub application_log_dir: String,
    /// Tag prefix
    pub tag_prefix: String,
    /// Custom environment string
    pub custom_env: String,
    /// Extra container port
    pub expose_port: Option<i32>,
    /// Existing pod volume to mount as the collector config directory
    pub config_volume: Option<String>,
    /// Sidecar resources
    pub resources: SidecarResources,
    /// Collector-specific settings
    pub settings: CollectorSettings,
}

/// Pick the collector: annotation, then `COLLECTOR`, then fluentd
pub fn resolve_collector(
    annotations: &Annotations,
    defaults: &InjectorDefaults,
) -> Result<Collector, MutationError> {
    let raw = annotations
        .get(annotations::COLLECTOR)
        .or(defaults.collector.as_ref());
    match raw {
        Some(value) => Ok(value.parse()?),
        None => Ok(Collector::default()),
    }
}

fn resolve(annotations: &Annotations, key: &str, env: &Option<String>, builtin: &str) -> String {
    annotations
        .get(key)
        .or(env.as_ref())
        .cloned()
        .unwrap_or_else(|| builtin.to_string())
}

impl PodMutationContext {
    /// Resolve the context for `collector` from the pod's annotations
    pub fn resolve(
        collector: Collector,
        annotations: &Annotations,
        defaults: &InjectorDefaults,
    ) -> Result<Self, MutationError> {
        let env = defaults.for_collector(collector);

        let aggregator_host = resolve(annotations, annotations::AGGREGATOR_HOST, &env.aggregator_host, "");
        if aggregator_host.is_empty() {
            return Err(MutationError::AggregatorHostRequired);
        }

        let application_log_dir = resolve(
            annotations,
            annotations::APPLICATION_LOG_DIR,
            &env.application_log_dir,
            "",
        );
        if application_log_dir.is_empty() {
            return Err(MutationError::ApplicationLogDirRequired);
        }

        let (image, port, tag_prefix) = match collector {
            Collector::Fluentd => (
                fluentd::DOCKER_IMAGE,
                fluentd::AGGREGATOR_PORT,
                fluentd::TAG_PREFIX,
            ),
            Collector::FluentBit => (
                fluentbit::DOCKER_IMAGE,
                fluentbit::AGGREGATOR_PORT,
                fluentbit::TAG_PREFIX,
            ),
        };

        let expose_port = annotations
            .get(annotations::EXPOSE_PORT)
            .map(|raw| parse_port(raw))
            .transpose()?;

        Ok(Self {
            collector,
            docker_image: resolve(annotations, annotations::DOCKER_IMAGE, &env.docker_image, image),
            aggregator_host,
            aggregator_port: resolve(annotations, annotations::AGGREGATOR_PORT, &env.aggregator_port, port),
            application_log_dir,
            tag_prefix: resolve(annotations, annotations::TAG_PREFIX, &env.tag_prefix, tag_prefix),
            custom_env: resolve(annotations, annotations::CUSTOM_ENV, &env.custom_env, ""),
            expose_port,
            config_volume: annotations.get(annotations::CONFIG_VOLUME).cloned(),
            resources: SidecarResources::resolve(annotations),
            settings: Self::settings(collector, annotations, env),
        })
    }

    fn settings(
        collector: Collector,
        annotations: &Annotations,
        env: &CollectorDefaults,
    ) -> CollectorSettings {
        match collector {
            Collector::Fluentd => CollectorSettings::Fluentd {
                time_key: resolve(annotations, annotations::TIME_KEY, &env.time_key, fluentd::TIME_KEY),
                time_format: resolve(
                    annotations,
                    annotations::TIME_FORMAT,
                    &env.time_format,
                    fluentd::TIME_FORMAT,
                ),
                log_format: resolve(
                    annotations,
                    annotations::LOG_FORMAT,
                    &env.log_format,
                    fluentd::LOG_FORMAT,
                ),
                send_timeout: resolve(
                    annotations,
                    annotations::SEND_TIMEOUT,
                    &env.send_timeout,
                    fluentd::SEND_TIMEOUT,
                ),
                recover_wait: resolve(
                    annotations,
                    annotations::RECOVER_WAIT,
                    &env.recover_wait,
                    fluentd::RECOVER_WAIT,
                ),
                hard_timeout: resolve(
                    annotations,
                    annotations::HARD_TIMEOUT,
                    &env.hard_timeout,
                    fluentd::HARD_TIMEOUT,
                ),
            },
            Collector::FluentBit => CollectorSettings::FluentBit {
                refresh_interval: resolve(
                    annotations,
                    annotations::REFRESH_INTERVAL,
                    &env.refresh_interval,
                    fluentbit::REFRESH_INTERVAL,
                ),
                rotate_wait: resolve(
                    annotations,
                    annotations::ROTATE_WAIT,
                    &env.rotate_wait,
                    fluentbit::ROTATE_WAIT,
                ),
            },
        }
    }

    /// Mount path of the config volume inside the sidecar
    pub fn config_mount_path(&self) -> &'static str {
        match self.collector {
            Collector::Fluentd => fluentd::CONFIG_MOUNT_PATH,
            Collector::FluentBit => fluentbit::CONFIG_MOUNT_PATH,
        }
    }
}

fn parse_port(raw: &str) -> Result<i32, MutationError> {
    match raw.trim().parse::<i32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port),
        _ => Err(MutationError::InvalidPort(raw.to_string())),
    }
}

//! Pod annotation keys understood by the mutation webhook.
//!
//! Every key lives under [`PREFIX`]. A present annotation always wins over the
//! environment defaults, even when its value is empty.

/// Domain prefix of all injector annotations
pub const PREFIX: &str = "fluentd-sidecar-injector.h3poteto.dev";

/// Value of [`INJECTION`] that opts a pod in
pub const INJECTION_ENABLED: &str = "enabled";

/// Opt-in switch
pub const INJECTION: &str = "fluentd-sidecar-injector.h3poteto.dev/injection";
/// `fluentd` or `fluent-bit`
pub const COLLECTOR: &str = "fluentd-sidecar-injector.h3poteto.dev/collector";
/// Sidecar image
pub const DOCKER_IMAGE: &str = "fluentd-sidecar-injector.h3poteto.dev/docker-image";
/// Aggregator host
pub const AGGREGATOR_HOST: &str = "fluentd-sidecar-injector.h3poteto.dev/aggregator-host";
/// Aggregator port
pub const AGGREGATOR_PORT: &str = "fluentd-sidecar-injector.h3poteto.dev/aggregator-port";
/// Directory shared between the application and the sidecar
pub const APPLICATION_LOG_DIR: &str = "fluentd-sidecar-injector.h3poteto.dev/application-log-dir";
/// Tag prefix
pub const TAG_PREFIX: &str = "fluentd-sidecar-injector.h3poteto.dev/tag-prefix";
/// fluentd time key
pub const TIME_KEY: &str = "fluentd-sidecar-injector.h3poteto.dev/time-key";
/// fluentd time format
pub const TIME_FORMAT: &str = "fluentd-sidecar-injector.h3poteto.dev/time-format";
/// fluentd parser format
pub const LOG_FORMAT: &str = "fluentd-sidecar-injector.h3poteto.dev/log-format";
/// fluentd forward send timeout
pub const SEND_TIMEOUT: &str = "fluentd-sidecar-injector.h3poteto.dev/send-timeout";
/// fluentd forward recover wait
pub const RECOVER_WAIT: &str = "fluentd-sidecar-injector.h3poteto.dev/recover-wait";
/// fluentd forward hard timeout
pub const HARD_TIMEOUT: &str = "fluentd-sidecar-injector.h3poteto.dev/hard-timeout";
/// fluent-bit tail refresh interval
pub const REFRESH_INTERVAL: &str = "fluentd-sidecar-injector.h3poteto.dev/refresh-interval";
/// fluent-bit tail rotate wait
pub const ROTATE_WAIT: &str = "fluentd-sidecar-injector.h3poteto.dev/rotate-wait";
/// Extra container port exposed by the sidecar
pub const EXPOSE_PORT: &str = "fluentd-sidecar-injector.h3poteto.dev/expose-port";
/// Name of an existing pod volume mounted as the collector config directory
pub const CONFIG_VOLUME: &str = "fluentd-sidecar-injector.h3poteto.dev/config-volume";
/// Free-form environment string passed to the sidecar
pub const CUSTOM_ENV: &str = "fluentd-sidecar-injector.h3poteto.dev/custom-env";
/// Sidecar memory request
pub const MEMORY_REQUEST: &str = "fluentd-sidecar-injector.h3poteto.dev/memory-request";
/// Sidecar memory limit
pub const MEMORY_LIMIT: &str = "fluentd-sidecar-injector.h3poteto.dev/memory-limit";
/// Sidecar cpu request
pub const CPU_REQUEST: &str = "fluentd-sidecar-injector.h3poteto.dev/cpu-request";
/// Sidecar cpu limit
pub const CPU_LIMIT: &str = "fluentd-sidecar-injector.h3poteto.dev/cpu-limit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_carries_the_prefix() {
        let keys = [
            INJECTION,
            COLLECTOR,
            DOCKER_IMAGE,
            AGGREGATOR_HOST,
            AGGREGATOR_PORT,
            APPLICATION_LOG_DIR,
            TAG_PREFIX,
            TIME_KEY,
            TIME_FORMAT,
            LOG_FORMAT,
            SEND_TIMEOUT,
            RECOVER_WAIT,
            HARD_TIMEOUT,
            REFRESH_INTERVAL,
            ROTATE_WAIT,
            EXPOSE_PORT,
            CONFIG_VOLUME,
            CUSTOM_ENV,
            MEMORY_REQUEST,
            MEMORY_LIMIT,
            CPU_REQUEST,
            CPU_LIMIT,
        ];
        for key in keys {
            assert!(key.starts_with(&format!("{}/", PREFIX)), "{key}");
        }
    }
}

//! Environment variable names that carry collector defaults from the
//! SidecarInjector spec into the webhook handler process.
//!
//! The controller writes the prefixed names into the handler Deployment; the
//! webhook reads the prefixed name first and falls back to the bare one.

use crate::crd::Collector;

/// Default collector for pods without a collector annotation
pub const COLLECTOR: &str = "COLLECTOR";

/// Sidecar image
pub const DOCKER_IMAGE: &str = "DOCKER_IMAGE";
/// Aggregator host
pub const AGGREGATOR_HOST: &str = "AGGREGATOR_HOST";
/// Aggregator port
pub const AGGREGATOR_PORT: &str = "AGGREGATOR_PORT";
/// Application log directory
pub const APPLICATION_LOG_DIR: &str = "APPLICATION_LOG_DIR";
/// Tag prefix
pub const TAG_PREFIX: &str = "TAG_PREFIX";
/// Custom environment string
pub const CUSTOM_ENV: &str = "CUSTOM_ENV";
/// fluentd time key
pub const TIME_KEY: &str = "TIME_KEY";
/// fluentd time format
pub const TIME_FORMAT: &str = "TIME_FORMAT";
/// fluentd log format
pub const LOG_FORMAT: &str = "LOG_FORMAT";
/// fluentd forward send timeout
pub const SEND_TIMEOUT: &str = "SEND_TIMEOUT";
/// fluentd forward recover wait
pub const RECOVER_WAIT: &str = "RECOVER_WAIT";
/// fluentd forward hard timeout
pub const HARD_TIMEOUT: &str = "HARD_TIMEOUT";
/// fluent-bit tail refresh interval
pub const REFRESH_INTERVAL: &str = "REFRESH_INTERVAL";
/// fluent-bit tail rotate wait
pub const ROTATE_WAIT: &str = "ROTATE_WAIT";

/// Prefix namespacing a setting to one collector
pub fn prefix(collector: Collector) -> &'static str {
    match collector {
        Collector::Fluentd => "FLUENTD_",
        Collector::FluentBit => "FLUENTBIT_",
    }
}

/// Fully qualified variable name, e.g. `FLUENTBIT_DOCKER_IMAGE`
pub fn prefixed(collector: Collector, name: &str) -> String {
    format!("{}{}", prefix(collector), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_names() {
        assert_eq!(
            prefixed(Collector::Fluentd, AGGREGATOR_HOST),
            "FLUENTD_AGGREGATOR_HOST"
        );
        assert_eq!(
            prefixed(Collector::FluentBit, DOCKER_IMAGE),
            "FLUENTBIT_DOCKER_IMAGE"
        );
    }
}

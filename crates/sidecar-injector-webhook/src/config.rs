//! Environment-supplied collector defaults
//!
//! Loaded once at webhook startup and passed to every [`crate::validate`]
//! call. Each setting is read from the collector-prefixed variable first
//! (`FLUENTD_AGGREGATOR_HOST`), then from the bare name (`AGGREGATOR_HOST`).
//! Empty variables count as unset.

use sidecar_injector_common::crd::Collector;
use sidecar_injector_common::env;

/// Defaults for one collector; `None` falls through to the built-in constant
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectorDefaults {
    /// Sidecar image
    pub docker_image: Option<String>,
    /// Aggregator host
    pub aggregator_host: Option<String>,
    /// Aggregator port
    pub aggregator_port: Option<String>,
    /// Application log directory
    pub application_log_dir: Option<String>,
    /// Tag prefix
    pub tag_prefix: Option<String>,
    /// Custom environment string
    pub custom_env: Option<String>,
    /// fluentd time key
    pub time_key: Option<String>,
    /// fluentd time format
    pub time_format: Option<String>,
    /// fluentd log format
    pub log_format: Option<String>,
    /// fluentd send timeout
    pub send_timeout: Option<String>,
    /// fluentd recover wait
    pub recover_wait: Option<String>,
    /// fluentd hard timeout
    pub hard_timeout: Option<String>,
    /// fluent-bit refresh interval
    pub refresh_interval: Option<String>,
    /// fluent-bit rotate wait
    pub rotate_wait: Option<String>,
}

impl CollectorDefaults {
    /// Load the settings relevant to `collector` through `lookup`
    pub fn load<F>(collector: Collector, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&env::prefixed(collector, name))
                .filter(|v| !v.is_empty())
                .or_else(|| lookup(name).filter(|v| !v.is_empty()))
        };

        let mut defaults = Self {
            docker_image: get(env::DOCKER_IMAGE),
            aggregator_host: get(env::AGGREGATOR_HOST),
            aggregator_port: get(env::AGGREGATOR_PORT),
            application_log_dir: get(env::APPLICATION_LOG_DIR),
            tag_prefix: get(env::TAG_PREFIX),
            custom_env: get(env::CUSTOM_ENV),
            ..Default::default()
        };

        match collector {
            Collector::Fluentd => {
                defaults.time_key = get(env::TIME_KEY);
                defaults.time_format = get(env::TIME_FORMAT);
                defaults.log_format = get(env::LOG_FORMAT);
                defaults.send_timeout = get(env::SEND_TIMEOUT);
                defaults.recover_wait = get(env::RECOVER_WAIT);
                defaults.hard_timeout = get(env::HARD_TIMEOUT);
            }
            Collector::FluentBit => {
                defaults.refresh_interval = get(env::REFRESH_INTERVAL);
                defaults.rotate_wait = get(env::ROTATE_WAIT);
            }
        }
        defaults
    }
}

/// Every environment-supplied default the webhook knows about
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InjectorDefaults {
    /// Raw `COLLECTOR` value, validated per request
    pub collector: Option<String>,
    /// fluentd defaults
    pub fluentd: CollectorDefaults,
    /// fluent-bit defaults
    pub fluentbit: CollectorDefaults,
}

impl InjectorDefaults {
    /// Read defaults from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read defaults through an arbitrary lookup
    ///
    /// Each field is looked up as `<COLLECTOR>_<NAME>` and then `<NAME>`,
    /// with the prefix chosen per collector, which a static clap `env`
    /// binding cannot express.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            collector: lookup(env::COLLECTOR).filter(|v| !v.is_empty()),
            fluentd: CollectorDefaults::load(Collector::Fluentd, &lookup),
            fluentbit: CollectorDefaults::load(Collector::FluentBit, &lookup),
        }
    }

    /// Defaults for `collector`
    pub fn for_collector(&self, collector: Collector) -> &CollectorDefaults {
        match collector {
            Collector::Fluentd => &self.fluentd,
            Collector::FluentBit => &self.fluentbit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn prefixed_variable_wins_over_bare() {
        let defaults = InjectorDefaults::from_lookup(lookup(&[
            ("FLUENTD_AGGREGATOR_HOST", "fluentd-agg"),
            ("AGGREGATOR_HOST", "shared-agg"),
        ]));
        assert_eq!(defaults.fluentd.aggregator_host.as_deref(), Some("fluentd-agg"));
        assert_eq!(defaults.fluentbit.aggregator_host.as_deref(), Some("shared-agg"));
    }

    #[test]
    fn empty_variables_are_unset() {
        let defaults = InjectorDefaults::from_lookup(lookup(&[
            ("COLLECTOR", ""),
            ("FLUENTBIT_DOCKER_IMAGE", ""),
        ]));
        assert!(defaults.collector.is_none());
        assert!(defaults.fluentbit.docker_image.is_none());
    }

    #[test]
    fn collector_specific_settings_stay_with_their_collector() {
        let defaults = InjectorDefaults::from_lookup(lookup(&[
            ("TIME_KEY", "ts"),
            ("ROTATE_WAIT", "10"),
        ]));
        assert_eq!(defaults.fluentd.time_key.as_deref(), Some("ts"));
        assert!(defaults.fluentbit.time_key.is_none());
        assert_eq!(defaults.fluentbit.rotate_wait.as_deref(), Some("10"));
        assert!(defaults.fluentd.rotate_wait.is_none());
    }

    #[test]
    fn collector_is_kept_raw() {
        let defaults = InjectorDefaults::from_lookup(lookup(&[("COLLECTOR", "fluent-bit")]));
        assert_eq!(defaults.collector.as_deref(), Some("fluent-bit"));
    }
}

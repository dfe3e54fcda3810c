//! Custom Resource Definitions for the sidecar injector

mod sidecar_injector;

pub use sidecar_injector::{
    Collector, FluentBitConfig, FluentDConfig, SidecarInjector, SidecarInjectorSpec,
    SidecarInjectorStatus, UnknownCollector,
};

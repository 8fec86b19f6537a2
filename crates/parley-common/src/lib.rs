//! ---
//! parley_section: "01-shared-runtime"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Shared primitives for every extension context."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
//! Shared primitives for the Parley workspace.
//! This crate exposes configuration loading and logging setup consumed by
//! the message bus and by whatever hosts it.

pub mod config;
pub mod logging;

pub use config::{BusConfig, HostFlavor, HostConfig, LoadedBusConfig, LocateConfig, LoggingConfig};
pub use logging::{init_tracing, log_file_name, LogFormat};

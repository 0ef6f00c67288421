//! Configuration for the procwarden process manager.
//!
//! Every section has named fields with documented defaults; an empty TOML
//! document deserializes into [`ProcwardenConfig::default`]. Use
//! [`ConfigManager`] to resolve the system and file layers.

pub mod executor;
pub mod loader;
pub mod root;
pub mod termination;

pub use executor::ExecutorConfig;
pub use loader::{
    CONFIG_PATH_ENV, ConfigLayerEntry, ConfigLayerSource, ConfigLayerStack, ConfigManager,
    SYSTEM_CONFIG_PATH, merge_toml_values,
};
pub use root::{DiscoveryConfig, LockConfig, LogLevel, LoggingConfig, ProcwardenConfig};
pub use termination::TerminationConfig;

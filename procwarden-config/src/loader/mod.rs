mod layers;
mod manager;
mod merge;

pub use layers::{ConfigLayerEntry, ConfigLayerSource, ConfigLayerStack};
pub use manager::{CONFIG_PATH_ENV, ConfigManager, SYSTEM_CONFIG_PATH};
pub use merge::merge_toml_values;

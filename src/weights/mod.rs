pub mod fetch;
pub mod loader;
pub mod remap;
pub mod types;

pub use fetch::fetch;
pub use loader::{load_safetensors, save_safetensors, LoadReport};
pub use remap::{KeyMapper, KeyMapping};
pub use types::WeightsError;

use crate::config::WeightsConfig;
use crate::model::{EfficientNetConfig, Model, Train};

/// Name given to the pretrained network
pub const PRETRAINED_NAME: &str = "efficientnet_b0";

/// Builds EfficientNet-B0 and fills it with the configured ImageNet-1k checkpoint,
/// downloading it into the cache first if needed.
pub fn load_pretrained(config: &WeightsConfig) -> Result<Model<Train>, WeightsError> {
    let path = config.path();
    fetch(&config.url, &path)?;

    let architecture = EfficientNetConfig::b0();
    let mut model = Model::from_config(PRETRAINED_NAME, &architecture, 0);
    load_safetensors(&mut model, &path, &KeyMapper::new(&architecture))?;
    Ok(model)
}

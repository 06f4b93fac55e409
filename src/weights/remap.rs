use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::EfficientNetConfig;

static BLOCK_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^blocks\.(\d+)\.(\d+)\.(conv_pw|conv_dw|conv_pwl|bn1|bn2|bn3|se\.conv_reduce|se\.conv_expand)\.(\w+)$")
        .expect("valid block key pattern")
});

static TOP_LEVEL_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(conv_stem|bn1|conv_head|bn2|classifier)\.(\w+)$").expect("valid top-level key pattern")
});

/// Where a checkpoint key lands in the module tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMapping {
    /// Qualified tensor name in the module tree
    Tensor(String),
    /// Bookkeeping entries with no tensor counterpart (`num_batches_tracked`)
    Ignored,
}

/// Translates checkpoint keys into module-tree names.
///
/// Keys already in the module tree's naming pass through unchanged. Keys in
/// timm's naming (`conv_stem`, `blocks.S.B.conv_dw`, ...) are rewritten; a
/// block's layers are numbered differently depending on whether it starts
/// with an expansion convolution, so the mapper is built from the network
/// configuration.
#[derive(Debug, Clone)]
pub struct KeyMapper {
    /// (stage, block) pairs whose block has an expansion convolution
    expanding: HashSet<(usize, usize)>,
    /// Index of the head convolution inside `features`
    head_index: usize,
}

impl KeyMapper {
    pub fn new(config: &EfficientNetConfig) -> Self {
        let stages = config.stages();
        let expanding = stages
            .iter()
            .enumerate()
            .flat_map(|(s, stage)| {
                (0..stage.num_layers)
                    .filter(move |&b| stage.block_expands(b))
                    .map(move |b| (s, b))
            })
            .collect();
        Self {
            expanding,
            head_index: stages.len() + 1,
        }
    }

    pub fn map(&self, key: &str) -> KeyMapping {
        if key.ends_with("num_batches_tracked") {
            return KeyMapping::Ignored;
        }

        if let Some(caps) = BLOCK_KEY.captures(key) {
            let (stage, block) = match (caps[1].parse::<usize>(), caps[2].parse::<usize>()) {
                (Ok(stage), Ok(block)) => (stage, block),
                _ => return KeyMapping::Tensor(key.to_string()),
            };
            let layer = match self.block_layer(stage, block, &caps[3]) {
                Some(layer) => layer,
                None => return KeyMapping::Tensor(key.to_string()),
            };
            return KeyMapping::Tensor(format!("features.{}.{}.block.{}.{}", stage + 1, block, layer, &caps[4]));
        }

        if let Some(caps) = TOP_LEVEL_KEY.captures(key) {
            let prefix = match &caps[1] {
                "conv_stem" => "features.0.0".to_string(),
                "bn1" => "features.0.1".to_string(),
                "conv_head" => format!("features.{}.0", self.head_index),
                "bn2" => format!("features.{}.1", self.head_index),
                _ => "classifier.1".to_string(),
            };
            return KeyMapping::Tensor(format!("{}.{}", prefix, &caps[2]));
        }

        KeyMapping::Tensor(key.to_string())
    }

    fn block_layer(&self, stage: usize, block: usize, layer: &str) -> Option<&'static str> {
        if self.expanding.contains(&(stage, block)) {
            match layer {
                "conv_pw" => Some("0.0"),
                "bn1" => Some("0.1"),
                "conv_dw" => Some("1.0"),
                "bn2" => Some("1.1"),
                "se.conv_reduce" => Some("2.fc1"),
                "se.conv_expand" => Some("2.fc2"),
                "conv_pwl" => Some("3.0"),
                "bn3" => Some("3.1"),
                _ => None,
            }
        } else {
            // Depthwise-separable block: conv_pw is the projection
            match layer {
                "conv_dw" => Some("0.0"),
                "bn1" => Some("0.1"),
                "se.conv_reduce" => Some("1.fc1"),
                "se.conv_expand" => Some("1.fc2"),
                "conv_pw" => Some("2.0"),
                "bn2" => Some("2.1"),
                _ => None,
            }
        }
    }
}

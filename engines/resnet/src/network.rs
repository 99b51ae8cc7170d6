//! Residual network topology.

use serde::{Deserialize, Serialize};

use inferbench_core::{Error, Result};

use crate::graph::{Graph, GraphBuilder, NodeId};

/// Shape of the network; the defaults give the 18-layer variant at 224px
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNetConfig {
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    #[serde(default = "default_base_width")]
    pub base_width: usize,
    #[serde(default = "default_blocks")]
    pub blocks_per_stage: Vec<usize>,
    #[serde(default = "default_classes")]
    pub classes: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_input_size() -> usize {
    224
}

fn default_base_width() -> usize {
    64
}

fn default_blocks() -> Vec<usize> {
    vec![2, 2, 2, 2]
}

fn default_classes() -> usize {
    1000
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            base_width: default_base_width(),
            blocks_per_stage: default_blocks(),
            classes: default_classes(),
            seed: 0,
        }
    }
}

impl ResNetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.blocks_per_stage.is_empty() || self.blocks_per_stage.contains(&0) {
            return Err(Error::validation(
                "blocks_per_stage needs at least one stage and one block per stage",
            ));
        }
        if self.base_width == 0 || self.classes == 0 || self.input_size == 0 {
            return Err(Error::validation(
                "input_size, base_width and classes must be positive",
            ));
        }
        Ok(())
    }
}

/// conv3x3-bn-relu-conv3x3-bn plus shortcut, then add and relu
fn basic_block(
    builder: &mut GraphBuilder,
    name: &str,
    x: NodeId,
    in_channels: usize,
    channels: usize,
    stride: usize,
) -> Result<NodeId> {
    let y = builder.conv2d(&format!("{}.conv1", name), x, channels, 3, stride, 1)?;
    let y = builder.batch_norm(&format!("{}.bn1", name), y)?;
    let y = builder.relu(&format!("{}.relu1", name), y)?;
    let y = builder.conv2d(&format!("{}.conv2", name), y, channels, 3, 1, 1)?;
    let y = builder.batch_norm(&format!("{}.bn2", name), y)?;

    let shortcut = if stride != 1 || in_channels != channels {
        let s = builder.conv2d(&format!("{}.downsample", name), x, channels, 1, stride, 0)?;
        builder.batch_norm(&format!("{}.downsample_bn", name), s)?
    } else {
        x
    };

    let sum = builder.add(&format!("{}.add", name), y, shortcut)?;
    builder.relu(&format!("{}.relu2", name), sum)
}

/// Stem, residual stages, pooling and classifier
pub fn build_resnet(config: &ResNetConfig) -> Result<Graph> {
    config.validate()?;
    let mut builder = GraphBuilder::new(config.seed);

    let x = builder.input(3, config.input_size, config.input_size);
    let x = builder.conv2d("stem.conv", x, config.base_width, 7, 2, 3)?;
    let x = builder.batch_norm("stem.bn", x)?;
    let x = builder.relu("stem.relu", x)?;
    let mut x = builder.max_pool("stem.pool", x, 3, 2, 1)?;

    let mut channels = config.base_width;
    for (stage, &blocks) in config.blocks_per_stage.iter().enumerate() {
        let width = config.base_width << stage;
        for block in 0..blocks {
            let stride = if stage > 0 && block == 0 { 2 } else { 1 };
            let name = format!("layer{}.{}", stage + 1, block);
            x = basic_block(&mut builder, &name, x, channels, width, stride)?;
            channels = width;
        }
    }

    let x = builder.global_avg_pool("pool", x)?;
    let x = builder.dense("fc", x, config.classes)?;
    builder.finish(x)
}

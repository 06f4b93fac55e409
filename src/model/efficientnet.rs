use rand::Rng;

use super::layers::{BatchNorm2d, Conv2d, Layer, Linear};
use super::module::Module;

/// Base stage table of EfficientNet-B0:
/// (expand_ratio, kernel, stride, input_channels, out_channels, num_layers)
const BASE_STAGES: [(usize, usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 32, 16, 1),
    (6, 3, 2, 16, 24, 2),
    (6, 5, 2, 24, 40, 2),
    (6, 3, 2, 40, 80, 3),
    (6, 5, 1, 80, 112, 3),
    (6, 5, 2, 112, 192, 4),
    (6, 3, 1, 192, 320, 1),
];

/// One stage of inverted-residual blocks, after width and depth scaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MBConvConfig {
    pub expand_ratio: usize,
    pub kernel: usize,
    pub stride: usize,
    pub input_channels: usize,
    pub out_channels: usize,
    pub num_layers: usize,
}

impl MBConvConfig {
    /// Input channels of the `index`-th block in this stage
    pub fn block_input(&self, index: usize) -> usize {
        if index == 0 {
            self.input_channels
        } else {
            self.out_channels
        }
    }

    /// Whether the `index`-th block starts with a 1x1 expansion convolution
    pub fn block_expands(&self, index: usize) -> bool {
        let input = self.block_input(index);
        make_divisible((input * self.expand_ratio) as f64, 8) != input
    }
}

/// Hyper-parameters of an EfficientNet (v1) network.
#[derive(Debug, Clone, PartialEq)]
pub struct EfficientNetConfig {
    /// Channel multiplier applied to every stage
    pub width_mult: f64,
    /// Layer-count multiplier applied to every stage
    pub depth_mult: f64,
    /// Dropout probability in front of the classifier
    pub dropout: f32,
    pub num_classes: usize,
    /// Maximum stochastic depth probability, reached by the last block
    pub stochastic_depth_prob: f32,
    pub norm_eps: f32,
    pub norm_momentum: f32,
    /// Channels of the input image
    pub in_channels: usize,
}

impl EfficientNetConfig {
    /// EfficientNet-B0 with the ImageNet-1k head.
    pub fn b0() -> Self {
        Self {
            width_mult: 1.0,
            depth_mult: 1.0,
            dropout: 0.2,
            num_classes: 1000,
            stochastic_depth_prob: 0.2,
            norm_eps: 1e-5,
            norm_momentum: 0.1,
            in_channels: 3,
        }
    }

    /// Stage table with channels rounded to multiples of 8 and depths rounded up.
    pub fn stages(&self) -> Vec<MBConvConfig> {
        BASE_STAGES
            .iter()
            .map(|&(expand_ratio, kernel, stride, input, out, layers)| MBConvConfig {
                expand_ratio,
                kernel,
                stride,
                input_channels: make_divisible(input as f64 * self.width_mult, 8),
                out_channels: make_divisible(out as f64 * self.width_mult, 8),
                num_layers: (layers as f64 * self.depth_mult).ceil() as usize,
            })
            .collect()
    }

    /// Channels produced by the last feature stage
    pub fn last_channels(&self) -> usize {
        let stages = self.stages();
        4 * stages.last().map_or(0, |stage| stage.out_channels)
    }

    /// Builds the module tree with freshly initialized weights.
    pub fn build<R: Rng>(&self, rng: &mut R) -> Module {
        let stages = self.stages();
        let total_blocks: usize = stages.iter().map(|stage| stage.num_layers).sum();

        let first_channels = stages.first().map_or(0, |stage| stage.input_channels);
        let mut features = vec![self.conv_norm_act(self.in_channels, first_channels, 3, 2, 1, true, rng)];

        let mut block_id = 0;
        for stage in &stages {
            let mut blocks = Vec::with_capacity(stage.num_layers);
            for index in 0..stage.num_layers {
                let stride = if index == 0 { stage.stride } else { 1 };
                let sd_prob = self.stochastic_depth_prob * block_id as f32 / total_blocks as f32;
                blocks.push(self.mbconv(stage, index, stride, sd_prob, rng));
                block_id += 1;
            }
            features.push(Module::sequential(blocks));
        }

        let last_input = stages.last().map_or(first_channels, |stage| stage.out_channels);
        let last_channels = 4 * last_input;
        features.push(self.conv_norm_act(last_input, last_channels, 1, 1, 1, true, rng));

        let classifier = Module::sequential(vec![
            Module::leaf(Layer::Dropout { p: self.dropout }),
            Module::leaf(Layer::Linear(Linear::new(last_channels, self.num_classes, rng))),
        ]);

        Module::container(
            Layer::EfficientNet,
            vec![
                ("features".to_string(), Module::sequential(features)),
                ("avgpool".to_string(), Module::leaf(Layer::AdaptiveAvgPool2d { output_size: 1 })),
                ("classifier".to_string(), classifier),
            ],
        )
    }

    fn conv_norm_act<R: Rng>(
        &self,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        activation: bool,
        rng: &mut R,
    ) -> Module {
        let mut children = vec![
            Module::leaf(Layer::Conv2d(Conv2d::new(in_channels, out_channels, kernel, stride, groups, false, rng))),
            Module::leaf(Layer::BatchNorm2d(BatchNorm2d::new(out_channels, self.norm_eps, self.norm_momentum))),
        ];
        if activation {
            children.push(Module::leaf(Layer::SiLU));
        }
        Module::container(
            Layer::Conv2dNormActivation,
            children
                .into_iter()
                .enumerate()
                .map(|(i, child)| (i.to_string(), child))
                .collect(),
        )
    }

    fn mbconv<R: Rng>(&self, stage: &MBConvConfig, index: usize, stride: usize, sd_prob: f32, rng: &mut R) -> Module {
        let input = stage.block_input(index);
        let expanded = make_divisible((input * stage.expand_ratio) as f64, 8);

        let mut layers = Vec::with_capacity(4);
        if expanded != input {
            layers.push(self.conv_norm_act(input, expanded, 1, 1, 1, true, rng));
        }
        layers.push(self.conv_norm_act(expanded, expanded, stage.kernel, stride, expanded, true, rng));

        let squeeze = (input / 4).max(1);
        layers.push(Module::container(
            Layer::SqueezeExcitation,
            vec![
                ("avgpool".to_string(), Module::leaf(Layer::AdaptiveAvgPool2d { output_size: 1 })),
                ("fc1".to_string(), Module::leaf(Layer::Conv2d(Conv2d::new(expanded, squeeze, 1, 1, 1, true, rng)))),
                ("fc2".to_string(), Module::leaf(Layer::Conv2d(Conv2d::new(squeeze, expanded, 1, 1, 1, true, rng)))),
                ("activation".to_string(), Module::leaf(Layer::SiLU)),
                ("scale_activation".to_string(), Module::leaf(Layer::Sigmoid)),
            ],
        ));
        layers.push(self.conv_norm_act(expanded, stage.out_channels, 1, 1, 1, false, rng));

        Module::container(
            Layer::MBConv { use_res_connect: stride == 1 && input == stage.out_channels },
            vec![
                ("block".to_string(), Module::sequential(layers)),
                ("stochastic_depth".to_string(), Module::leaf(Layer::StochasticDepth { p: sd_prob })),
            ],
        )
    }
}

/// Rounds `value` to the nearest multiple of `divisor`, never going below
/// `divisor` and never more than 10% below `value`.
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let rounded = ((value + divisor as f64 / 2.0) as usize / divisor) * divisor;
    let mut result = rounded.max(divisor);
    if (result as f64) < 0.9 * value {
        result += divisor;
    }
    result
}

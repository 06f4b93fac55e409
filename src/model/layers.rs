use std::fmt;

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

/// Whether a named tensor is trained (a parameter) or tracked state (a buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Parameter,
    Buffer,
}

/// 2D convolution with a square kernel and "same"-style padding.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    /// Filters, shaped [out_channels, in_channels / groups, kernel_size, kernel_size]
    pub weight: ArrayD<f32>,
    /// Per-output-channel bias
    pub bias: Option<ArrayD<f32>>,
}

impl Conv2d {
    /// Creates a convolution with kaiming-normal (fan-out) weights and a zero bias.
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let fan_out = out_channels * kernel_size * kernel_size;
        let std = (2.0 / fan_out as f32).sqrt();
        let shape = [out_channels, in_channels / groups, kernel_size, kernel_size];
        let weight = ArrayD::from_shape_fn(IxDyn(&shape), |_| {
            let z: f32 = rng.sample(StandardNormal);
            z * std
        });

        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding: (kernel_size - 1) / 2,
            groups,
            weight,
            bias: bias.then(|| ArrayD::zeros(IxDyn(&[out_channels]))),
        }
    }
}

impl fmt::Display for Conv2d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Conv2d({}, {}, kernel_size=({k}, {k}), stride=({s}, {s})",
            self.in_channels,
            self.out_channels,
            k = self.kernel_size,
            s = self.stride,
        )?;
        if self.padding != 0 {
            write!(f, ", padding=({p}, {p})", p = self.padding)?;
        }
        if self.groups != 1 {
            write!(f, ", groups={}", self.groups)?;
        }
        if self.bias.is_none() {
            write!(f, ", bias=False")?;
        }
        write!(f, ")")
    }
}

/// Batch normalization over the channel axis of an NCHW tensor.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub num_features: usize,
    pub eps: f32,
    pub momentum: f32,
    pub weight: ArrayD<f32>,
    pub bias: ArrayD<f32>,
    pub running_mean: ArrayD<f32>,
    pub running_var: ArrayD<f32>,
}

impl BatchNorm2d {
    pub fn new(num_features: usize, eps: f32, momentum: f32) -> Self {
        let shape = IxDyn(&[num_features]);
        Self {
            num_features,
            eps,
            momentum,
            weight: ArrayD::ones(shape.clone()),
            bias: ArrayD::zeros(shape.clone()),
            running_mean: ArrayD::zeros(shape.clone()),
            running_var: ArrayD::ones(shape),
        }
    }
}

impl fmt::Display for BatchNorm2d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BatchNorm2d({}, eps={}, momentum={}, affine=True, track_running_stats=True)",
            self.num_features,
            py_float(self.eps),
            py_float(self.momentum),
        )
    }
}

/// Fully connected layer, weight shaped [out_features, in_features].
#[derive(Debug, Clone)]
pub struct Linear {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: ArrayD<f32>,
    pub bias: Option<ArrayD<f32>>,
}

impl Linear {
    /// Creates a linear layer with weights uniform in ±1/sqrt(out_features) and a zero bias.
    pub fn new<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (out_features as f32).sqrt();
        let weight = ArrayD::from_shape_fn(IxDyn(&[out_features, in_features]), |_| {
            rng.random_range(-bound..bound)
        });

        Self {
            in_features,
            out_features,
            weight,
            bias: Some(ArrayD::zeros(IxDyn(&[out_features]))),
        }
    }
}

impl fmt::Display for Linear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Linear(in_features={}, out_features={}, bias={})",
            self.in_features,
            self.out_features,
            if self.bias.is_some() { "True" } else { "False" },
        )
    }
}

/// The kinds of layer an EfficientNet module tree is built from.
///
/// Container kinds carry no parameters of their own; their behavior is
/// defined by their children.
#[derive(Debug, Clone)]
pub enum Layer {
    EfficientNet,
    Sequential,
    Conv2dNormActivation,
    MBConv { use_res_connect: bool },
    SqueezeExcitation,
    Conv2d(Conv2d),
    BatchNorm2d(BatchNorm2d),
    SiLU,
    Sigmoid,
    AdaptiveAvgPool2d { output_size: usize },
    Dropout { p: f32 },
    StochasticDepth { p: f32 },
    Linear(Linear),
}

impl Layer {
    /// Short type name, as a framework would print it
    pub fn type_name(&self) -> &'static str {
        match self {
            Layer::EfficientNet => "EfficientNet",
            Layer::Sequential => "Sequential",
            Layer::Conv2dNormActivation => "Conv2dNormActivation",
            Layer::MBConv { .. } => "MBConv",
            Layer::SqueezeExcitation => "SqueezeExcitation",
            Layer::Conv2d(_) => "Conv2d",
            Layer::BatchNorm2d(_) => "BatchNorm2d",
            Layer::SiLU => "SiLU",
            Layer::Sigmoid => "Sigmoid",
            Layer::AdaptiveAvgPool2d { .. } => "AdaptiveAvgPool2d",
            Layer::Dropout { .. } => "Dropout",
            Layer::StochasticDepth { .. } => "StochasticDepth",
            Layer::Linear(_) => "Linear",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Layer::EfficientNet
                | Layer::Sequential
                | Layer::Conv2dNormActivation
                | Layer::MBConv { .. }
                | Layer::SqueezeExcitation
        )
    }

    /// Tensors owned directly by this layer, in declaration order.
    pub fn tensors(&self) -> Vec<(&'static str, ParamKind, &ArrayD<f32>)> {
        match self {
            Layer::Conv2d(conv) => {
                let mut tensors = vec![("weight", ParamKind::Parameter, &conv.weight)];
                if let Some(bias) = &conv.bias {
                    tensors.push(("bias", ParamKind::Parameter, bias));
                }
                tensors
            }
            Layer::BatchNorm2d(bn) => vec![
                ("weight", ParamKind::Parameter, &bn.weight),
                ("bias", ParamKind::Parameter, &bn.bias),
                ("running_mean", ParamKind::Buffer, &bn.running_mean),
                ("running_var", ParamKind::Buffer, &bn.running_var),
            ],
            Layer::Linear(linear) => {
                let mut tensors = vec![("weight", ParamKind::Parameter, &linear.weight)];
                if let Some(bias) = &linear.bias {
                    tensors.push(("bias", ParamKind::Parameter, bias));
                }
                tensors
            }
            _ => Vec::new(),
        }
    }

    /// Mutable access to one of this layer's own tensors by its local name.
    pub fn tensor_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        match (self, name) {
            (Layer::Conv2d(conv), "weight") => Some(&mut conv.weight),
            (Layer::Conv2d(conv), "bias") => conv.bias.as_mut(),
            (Layer::BatchNorm2d(bn), "weight") => Some(&mut bn.weight),
            (Layer::BatchNorm2d(bn), "bias") => Some(&mut bn.bias),
            (Layer::BatchNorm2d(bn), "running_mean") => Some(&mut bn.running_mean),
            (Layer::BatchNorm2d(bn), "running_var") => Some(&mut bn.running_var),
            (Layer::Linear(linear), "weight") => Some(&mut linear.weight),
            (Layer::Linear(linear), "bias") => linear.bias.as_mut(),
            _ => None,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Conv2d(conv) => write!(f, "{}", conv),
            Layer::BatchNorm2d(bn) => write!(f, "{}", bn),
            Layer::Linear(linear) => write!(f, "{}", linear),
            Layer::SiLU => write!(f, "SiLU(inplace=True)"),
            Layer::Sigmoid => write!(f, "Sigmoid()"),
            Layer::AdaptiveAvgPool2d { output_size } => {
                write!(f, "AdaptiveAvgPool2d(output_size={})", output_size)
            }
            Layer::Dropout { p } => write!(f, "Dropout(p={}, inplace=True)", py_float(*p)),
            Layer::StochasticDepth { p } => write!(f, "StochasticDepth(p={}, mode=row)", py_float(*p)),
            other => write!(f, "{}", other.type_name()),
        }
    }
}

/// Formats a float the way Python's `repr` does for the values that show up
/// in layer descriptors (`0.1`, `0.0`, `1e-05`).
pub(crate) fn py_float(value: f32) -> String {
    if value != 0.0 && value.abs() < 1e-4 {
        let repr = format!("{:e}", value);
        match repr.split_once('e') {
            Some((mantissa, exponent)) => {
                let (sign, digits) = match exponent.strip_prefix('-') {
                    Some(digits) => ("-", digits),
                    None => ("+", exponent),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => repr,
        }
    } else if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_py_float_matches_python_repr() {
        assert_eq!(py_float(1e-5), "1e-05");
        assert_eq!(py_float(1e-3), "0.001");
        assert_eq!(py_float(0.1), "0.1");
        assert_eq!(py_float(0.0), "0.0");
        assert_eq!(py_float(0.0125), "0.0125");
    }

    #[test]
    fn test_conv_descriptor() {
        let mut rng = StdRng::seed_from_u64(0);
        let stem = Conv2d::new(3, 32, 3, 2, 1, false, &mut rng);
        assert_eq!(
            stem.to_string(),
            "Conv2d(3, 32, kernel_size=(3, 3), stride=(2, 2), padding=(1, 1), bias=False)"
        );

        let depthwise = Conv2d::new(96, 96, 5, 2, 96, false, &mut rng);
        assert_eq!(
            depthwise.to_string(),
            "Conv2d(96, 96, kernel_size=(5, 5), stride=(2, 2), padding=(2, 2), groups=96, bias=False)"
        );

        let squeeze = Conv2d::new(32, 8, 1, 1, 1, true, &mut rng);
        assert_eq!(squeeze.to_string(), "Conv2d(32, 8, kernel_size=(1, 1), stride=(1, 1))");
    }

    #[test]
    fn test_conv_weight_shape_respects_groups() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv2d::new(16, 16, 3, 1, 16, false, &mut rng);
        assert_eq!(conv.weight.shape(), &[16, 1, 3, 3]);
        assert!(conv.bias.is_none());
    }

    #[test]
    fn test_batch_norm_defaults() {
        let bn = BatchNorm2d::new(32, 1e-5, 0.1);
        assert!(bn.weight.iter().all(|&v| v == 1.0));
        assert!(bn.running_var.iter().all(|&v| v == 1.0));
        assert!(bn.running_mean.iter().all(|&v| v == 0.0));
        assert_eq!(
            bn.to_string(),
            "BatchNorm2d(32, eps=1e-05, momentum=0.1, affine=True, track_running_stats=True)"
        );
    }

    #[test]
    fn test_linear_init_is_bounded() {
        let mut rng = StdRng::seed_from_u64(2);
        let linear = Linear::new(1280, 1000, &mut rng);
        let bound = 1.0 / (1000f32).sqrt();
        assert!(linear.weight.iter().all(|w| w.abs() <= bound));
        assert_eq!(linear.to_string(), "Linear(in_features=1280, out_features=1000, bias=True)");
    }

    #[test]
    fn test_buffers_are_marked() {
        let layer = Layer::BatchNorm2d(BatchNorm2d::new(4, 1e-5, 0.1));
        let kinds: Vec<_> = layer.tensors().into_iter().map(|(name, kind, _)| (name, kind)).collect();
        assert_eq!(kinds[2], ("running_mean", ParamKind::Buffer));
        assert_eq!(kinds[0], ("weight", ParamKind::Parameter));
    }
}

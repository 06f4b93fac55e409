use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndarray::{Array1, ArrayD, Axis};
use protobuf::{Message, MessageField};
use tracing::{debug, info};

use super::builder::GraphBuilder;
use super::operators::{attr_float, attr_int, attr_ints};
use super::protos::{ModelProto, OperatorSetIdProto};
use super::types::{self, Dim};
use crate::error::ExportError;
use crate::model::module::qualify;
use crate::model::{BatchNorm2d, Conv2d, Eval, Layer, Linear, Model, Module};

/// Name of the single graph input
pub const INPUT_NAME: &str = "input";
/// Name of the single graph output
pub const OUTPUT_NAME: &str = "output";
/// Symbolic name of the dynamic batch axis
pub const BATCH_AXIS: &str = "batch_size";
pub const GRAPH_NAME: &str = "main_graph";

/// Knobs of the exporter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Embed parameter values as initializers; otherwise they become graph inputs
    pub export_params: bool,
    /// Fold BatchNorm into the preceding convolution
    pub do_constant_folding: bool,
    pub opset_version: i64,
    pub ir_version: i64,
    pub producer_name: String,
    pub producer_version: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            export_params: true,
            do_constant_folding: true,
            opset_version: 11,
            ir_version: 6,
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What an export produced
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub path: PathBuf,
    /// Size of the written artifact
    pub bytes: usize,
    pub opset_version: i64,
    pub ir_version: i64,
    pub inputs: Vec<(String, Vec<Dim>)>,
    pub outputs: Vec<(String, Vec<Dim>)>,
    pub node_count: usize,
    pub initializer_count: usize,
    /// Scalars embedded as initializers
    pub embedded_values: usize,
    pub constant_folding: bool,
    /// When the exported model handle was created
    pub model_loaded_at: DateTime<Utc>,
    pub exported_at: DateTime<Utc>,
}

/// Traces `model` for an input of `input_shape` and writes the ONNX graph to `path`.
///
/// The destination's parent directories are created; an existing file is
/// overwritten.
///
/// # Arguments
/// * `model` - Network in evaluation mode
/// * `sample` - Representative input; only its shape is used
/// * `path` - Destination of the artifact
/// * `options` - Exporter settings
pub fn export(
    model: &Model<Eval>,
    sample: &ArrayD<f32>,
    path: &Path,
    options: &ExportOptions,
) -> Result<ExportReport, ExportError> {
    info!(
        "Exporting {} ({} mode, {} parameters) for input {:?} to {}",
        model.name(),
        model.mode_name(),
        model.num_parameters(),
        sample.shape(),
        path.display()
    );
    let proto = to_model_proto(model, sample.shape(), options)?;
    let bytes = proto
        .write_to_bytes()
        .map_err(|e| ExportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &bytes)?;

    let graph = proto.graph.get_or_default();
    let declared = |values: &[super::protos::ValueInfoProto]| {
        values
            .iter()
            .filter_map(|info| types::declared_shape(info).ok().map(|(_, dims)| (info.name.clone(), dims)))
            .collect::<Vec<_>>()
    };
    let report = ExportReport {
        path: path.to_path_buf(),
        bytes: bytes.len(),
        opset_version: options.opset_version,
        ir_version: options.ir_version,
        inputs: declared(&graph.input),
        outputs: declared(&graph.output),
        node_count: graph.node.len(),
        initializer_count: graph.initializer.len(),
        embedded_values: graph.initializer.iter().map(|t| t.raw_data.len() / 4).sum(),
        constant_folding: options.do_constant_folding,
        model_loaded_at: model.loaded_at(),
        exported_at: Utc::now(),
    };
    info!("Wrote {} bytes ({} nodes) to {}", report.bytes, report.node_count, path.display());
    Ok(report)
}

/// Builds the ONNX model for `model` traced at `input_shape`; axis 0 is exported as dynamic.
pub fn to_model_proto(
    model: &Model<Eval>,
    input_shape: &[usize],
    options: &ExportOptions,
) -> Result<ModelProto, ExportError> {
    if input_shape.len() != 4 {
        return Err(ExportError::ShapeMismatch(format!(
            "expected (batch, channels, height, width), got {:?}",
            input_shape
        )));
    }
    if input_shape.contains(&0) {
        return Err(ExportError::ShapeMismatch(format!("input shape {:?} has an empty axis", input_shape)));
    }
    let channels = model
        .input_channels()
        .ok_or_else(|| ExportError::ShapeMismatch("model has no convolution to receive the input".to_string()))?;
    if input_shape[1] != channels {
        return Err(ExportError::ShapeMismatch(format!(
            "model expects {} input channels, got {}",
            channels, input_shape[1]
        )));
    }

    let mut builder = GraphBuilder::new(options.opset_version, options.export_params);
    let mut dims = vec![Dim::Symbolic(BATCH_AXIS.to_string())];
    dims.extend(types::fixed(&input_shape[1..]));
    let input = builder.input(INPUT_NAME, dims);

    let mut lowering = Lowering { builder, options };
    let result = lowering.module(model.root(), "", "", input)?;
    let graph = lowering.builder.finish(GRAPH_NAME, &result, OUTPUT_NAME)?;

    let mut opset = OperatorSetIdProto::new();
    opset.domain = String::new();
    opset.version = options.opset_version;

    let mut proto = ModelProto::new();
    proto.ir_version = options.ir_version;
    proto.producer_name = options.producer_name.clone();
    proto.producer_version = options.producer_version.clone();
    proto.opset_import = vec![opset];
    proto.graph = MessageField::some(graph);
    Ok(proto)
}

/// Walks the module tree in forward order, emitting nodes
struct Lowering<'o> {
    builder: GraphBuilder,
    options: &'o ExportOptions,
}

impl Lowering<'_> {
    fn module(&mut self, module: &Module, name: &str, scope: &str, x: String) -> Result<String, ExportError> {
        match module.layer() {
            Layer::EfficientNet => {
                let x = self.child(module, name, scope, "features", x)?;
                let x = self.child(module, name, scope, "avgpool", x)?;
                let x = self.builder.node(scope, "Flatten", vec![x], vec![attr_int("axis", 1)])?;
                self.child(module, name, scope, "classifier", x)
            }
            Layer::Sequential | Layer::Conv2dNormActivation => self.sequence(module, name, scope, x),
            Layer::MBConv { use_res_connect } => {
                let y = self.child(module, name, scope, "block", x.clone())?;
                let y = self.child(module, name, scope, "stochastic_depth", y)?;
                if *use_res_connect {
                    self.builder.node(scope, "Add", vec![y, x], vec![])
                } else {
                    Ok(y)
                }
            }
            Layer::SqueezeExcitation => {
                let s = self.child(module, name, scope, "avgpool", x.clone())?;
                let s = self.child(module, name, scope, "fc1", s)?;
                let s = self.child(module, name, scope, "activation", s)?;
                let s = self.child(module, name, scope, "fc2", s)?;
                let s = self.child(module, name, scope, "scale_activation", s)?;
                self.builder.node(scope, "Mul", vec![s, x], vec![])
            }
            Layer::Conv2d(conv) => self.conv(conv, None, name, scope, x),
            Layer::BatchNorm2d(bn) => self.batch_norm(bn, name, scope, x),
            Layer::SiLU => {
                let gate = self.builder.node(scope, "Sigmoid", vec![x.clone()], vec![])?;
                self.builder.node(scope, "Mul", vec![x, gate], vec![])
            }
            Layer::Sigmoid => self.builder.node(scope, "Sigmoid", vec![x], vec![]),
            Layer::AdaptiveAvgPool2d { output_size: 1 } => self.builder.node(scope, "GlobalAveragePool", vec![x], vec![]),
            Layer::AdaptiveAvgPool2d { output_size } => Err(ExportError::UnsupportedOperator(format!(
                "{}: AdaptiveAvgPool2d with output size {} has no ONNX lowering",
                name, output_size
            ))),
            // Identity at inference time
            Layer::Dropout { .. } | Layer::StochasticDepth { .. } => Ok(x),
            Layer::Linear(linear) => self.linear(linear, name, scope, x),
        }
    }

    fn child(&mut self, parent: &Module, name: &str, scope: &str, child: &str, x: String) -> Result<String, ExportError> {
        let module = parent.child(child).ok_or_else(|| {
            ExportError::UnsupportedOperator(format!(
                "{} '{}' has no child '{}'",
                parent.layer().type_name(),
                name,
                child
            ))
        })?;
        let qualified = qualify(name, child);
        let child_scope = format!("{}/{}", scope, qualified);
        self.module(module, &qualified, &child_scope, x)
    }

    fn sequence(&mut self, module: &Module, name: &str, scope: &str, mut x: String) -> Result<String, ExportError> {
        let children: Vec<(&str, &Module)> = module.children().collect();
        let mut i = 0;
        while i < children.len() {
            let (child_name, child) = children[i];
            let qualified = qualify(name, child_name);
            let child_scope = format!("{}/{}", scope, qualified);

            let folded = match (child.layer(), children.get(i + 1).map(|(_, next)| next.layer())) {
                (Layer::Conv2d(conv), Some(Layer::BatchNorm2d(bn))) if self.options.do_constant_folding => Some((conv, bn)),
                _ => None,
            };
            match folded {
                Some((conv, bn)) => {
                    debug!("Folding {} into {}", qualify(name, children[i + 1].0), qualified);
                    x = self.conv(conv, Some(bn), &qualified, &child_scope, x)?;
                    i += 2;
                }
                None => {
                    x = self.module(child, &qualified, &child_scope, x)?;
                    i += 1;
                }
            }
        }
        Ok(x)
    }

    fn conv(&mut self, conv: &Conv2d, bn: Option<&BatchNorm2d>, name: &str, scope: &str, x: String) -> Result<String, ExportError> {
        let (weight, bias) = match bn {
            Some(bn) => {
                let (weight, bias) = fold_batch_norm(conv, bn)?;
                (weight, Some(bias))
            }
            None => (conv.weight.clone(), conv.bias.clone()),
        };

        let mut inputs = vec![x, self.builder.parameter(&format!("{}.weight", name), &weight)];
        if let Some(bias) = bias {
            inputs.push(self.builder.parameter(&format!("{}.bias", name), &bias));
        }

        let k = conv.kernel_size as i64;
        let s = conv.stride as i64;
        let p = conv.padding as i64;
        let attributes = vec![
            attr_ints("dilations", &[1, 1]),
            attr_int("group", conv.groups as i64),
            attr_ints("kernel_shape", &[k, k]),
            attr_ints("pads", &[p, p, p, p]),
            attr_ints("strides", &[s, s]),
        ];
        self.builder.node(scope, "Conv", inputs, attributes)
    }

    fn batch_norm(&mut self, bn: &BatchNorm2d, name: &str, scope: &str, x: String) -> Result<String, ExportError> {
        let inputs = vec![
            x,
            self.builder.parameter(&format!("{}.weight", name), &bn.weight),
            self.builder.parameter(&format!("{}.bias", name), &bn.bias),
            self.builder.parameter(&format!("{}.running_mean", name), &bn.running_mean),
            self.builder.parameter(&format!("{}.running_var", name), &bn.running_var),
        ];
        // ONNX momentum weighs the running statistic, the framework's weighs the batch statistic
        let attributes = vec![attr_float("epsilon", bn.eps), attr_float("momentum", 1.0 - bn.momentum)];
        self.builder.node(scope, "BatchNormalization", inputs, attributes)
    }

    fn linear(&mut self, linear: &Linear, name: &str, scope: &str, x: String) -> Result<String, ExportError> {
        let mut inputs = vec![x, self.builder.parameter(&format!("{}.weight", name), &linear.weight)];
        if let Some(bias) = &linear.bias {
            inputs.push(self.builder.parameter(&format!("{}.bias", name), bias));
        }
        let attributes = vec![
            attr_float("alpha", 1.0),
            attr_float("beta", 1.0),
            attr_int("transB", 1),
        ];
        self.builder.node(scope, "Gemm", inputs, attributes)
    }
}

/// Folds inference-mode BatchNorm into the convolution before it:
/// `w' = w * g / sqrt(var + eps)` per output channel, `b' = beta + (b - mean) * g / sqrt(var + eps)`.
pub fn fold_batch_norm(conv: &Conv2d, bn: &BatchNorm2d) -> Result<(ArrayD<f32>, ArrayD<f32>), ExportError> {
    if bn.num_features != conv.out_channels {
        return Err(ExportError::ShapeMismatch(format!(
            "BatchNorm2d({}) cannot follow a convolution with {} output channels",
            bn.num_features, conv.out_channels
        )));
    }

    let scale: Vec<f32> = bn
        .weight
        .iter()
        .zip(bn.running_var.iter())
        .map(|(gamma, var)| gamma / (var + bn.eps).sqrt())
        .collect();

    let mut weight = conv.weight.clone();
    for (mut filter, &s) in weight.axis_iter_mut(Axis(0)).zip(&scale) {
        filter.mapv_inplace(|v| v * s);
    }

    let conv_bias: Vec<f32> = match &conv.bias {
        Some(bias) => bias.iter().copied().collect(),
        None => vec![0.0; conv.out_channels],
    };
    let bias: Vec<f32> = bn
        .bias
        .iter()
        .zip(bn.running_mean.iter())
        .zip(conv_bias.iter().zip(&scale))
        .map(|((beta, mean), (b, s))| beta + (b - mean) * s)
        .collect();

    Ok((weight, Array1::from(bias).into_dyn()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EfficientNetConfig;
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny() -> Model<Eval> {
        let config = EfficientNetConfig {
            width_mult: 0.25,
            depth_mult: 0.5,
            num_classes: 10,
            ..EfficientNetConfig::b0()
        };
        Model::from_config("tiny", &config, 3).eval()
    }

    #[test]
    fn test_graph_interface() {
        let proto = to_model_proto(&tiny(), &[1, 3, 32, 32], &ExportOptions::default()).unwrap();
        let graph = proto.graph.as_ref().unwrap();
        assert_eq!(graph.name, GRAPH_NAME);
        assert_eq!(proto.opset_import[0].version, 11);
        assert_eq!(proto.ir_version, 6);

        let (_, input) = types::declared_shape(&graph.input[0]).unwrap();
        assert_eq!(graph.input.len(), 1);
        assert_eq!(graph.input[0].name, INPUT_NAME);
        assert_eq!(types::format_shape(&input), "batch_size × 3 × 32 × 32");

        let (_, output) = types::declared_shape(&graph.output[0]).unwrap();
        assert_eq!(graph.output[0].name, OUTPUT_NAME);
        assert_eq!(output, vec![Dim::Symbolic(BATCH_AXIS.into()), Dim::Fixed(10)]);
    }

    #[test]
    fn test_node_naming_follows_module_scope() {
        let proto = to_model_proto(&tiny(), &[1, 3, 32, 32], &ExportOptions::default()).unwrap();
        let graph = proto.graph.as_ref().unwrap();
        assert_eq!(graph.node[0].name, "/features/features.0/features.0.0/Conv");
        assert_eq!(graph.node[0].output[0], "/features/features.0/features.0.0/Conv_output_0");
        assert_eq!(graph.initializer[0].name, "features.0.0.weight");
        assert!(graph.node.iter().any(|n| n.name == "/Flatten"));
        assert_eq!(graph.node.last().map(|n| n.op_type.as_str()), Some("Gemm"));
        // depth 0.5 gives two-block stages, whose second block is residual
        assert!(graph.node.iter().any(|n| n.op_type == "Add"));
    }

    #[test]
    fn test_constant_folding_removes_batch_norm() {
        let folded = to_model_proto(&tiny(), &[1, 3, 32, 32], &ExportOptions::default()).unwrap();
        let unfolded = to_model_proto(
            &tiny(),
            &[1, 3, 32, 32],
            &ExportOptions { do_constant_folding: false, ..ExportOptions::default() },
        )
        .unwrap();
        let count = |proto: &ModelProto, op: &str| proto.graph.as_ref().unwrap().node.iter().filter(|n| n.op_type == op).count();
        assert_eq!(count(&folded, "BatchNormalization"), 0);
        assert!(count(&unfolded, "BatchNormalization") > 0);
        assert_eq!(count(&folded, "Conv"), count(&unfolded, "Conv"));
    }

    #[test]
    fn test_input_shape_validation() {
        let model = tiny();
        let options = ExportOptions::default();
        for shape in [&[1, 3, 32][..], &[1, 4, 32, 32], &[0, 3, 32, 32]] {
            let err = to_model_proto(&model, shape, &options).unwrap_err();
            assert!(matches!(err, ExportError::ShapeMismatch(_)), "{:?} gave {}", shape, err);
        }
    }

    #[test]
    fn test_unsupported_pool_size() {
        let root = Module::sequential(vec![
            Module::leaf(Layer::Conv2d(Conv2d::new(3, 4, 3, 1, 1, true, &mut StdRng::seed_from_u64(0)))),
            Module::leaf(Layer::AdaptiveAvgPool2d { output_size: 7 }),
        ]);
        let model = Model::new("pool", root).eval();
        let err = to_model_proto(&model, &[1, 3, 8, 8], &ExportOptions::default()).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedOperator(_)));
    }

    #[test]
    fn test_opset_too_old() {
        let options = ExportOptions { opset_version: 6, ..ExportOptions::default() };
        let err = to_model_proto(&tiny(), &[1, 3, 32, 32], &options).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedOperator(_)));
    }

    #[test]
    fn test_fold_batch_norm() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new(1, 2, 1, 1, 1, false, &mut rng);
        let mut bn = BatchNorm2d::new(2, 0.0, 0.1);
        bn.weight = ArrayD::from_shape_vec(IxDyn(&[2]), vec![2.0, 1.0]).unwrap();
        bn.bias = ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.5, -1.0]).unwrap();
        bn.running_mean = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 0.0]).unwrap();
        bn.running_var = ArrayD::from_shape_vec(IxDyn(&[2]), vec![4.0, 1.0]).unwrap();

        let (weight, bias) = fold_batch_norm(&conv, &bn).unwrap();
        let w: Vec<f32> = conv.weight.iter().copied().collect();
        let folded: Vec<f32> = weight.iter().copied().collect();
        assert!((folded[0] - w[0]).abs() < 1e-6);
        assert!((folded[1] - w[1]).abs() < 1e-6);
        assert_eq!(bias.iter().copied().collect::<Vec<_>>(), vec![0.5 - 1.0, -1.0]);
    }
}

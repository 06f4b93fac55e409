use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use ndarray::{ArrayD, IxDyn};
use protobuf::Message;
use tract_onnx::prelude::*;
use tracing::{debug, info};

use crate::error::ExportError;
use crate::onnx::protos::{ModelProto, ValueInfoProto};
use crate::onnx::types::{self, Dim};

fn execution(msg: impl Into<String>) -> ExportError {
    ExportError::SessionExecution(msg.into())
}

/// A graph input or output with its declared shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionValue {
    pub name: String,
    pub dims: Vec<Dim>,
}

/// Inference session over a decoded ONNX model, backed by tract.
///
/// Named axes (such as `batch_size`) are bound from the shapes of the feeds
/// on every run, and the graph is planned for those concrete shapes. Outputs
/// are checked against their declared shapes under the same bindings.
pub struct InferenceSession {
    model: ModelProto,
    inputs: Vec<SessionValue>,
    outputs: Vec<SessionValue>,
}

impl InferenceSession {
    /// Creates a session and makes sure the runtime accepts the graph.
    pub fn new(model: ModelProto) -> Result<Self, ExportError> {
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| execution("model has no graph"))?;

        let initializers: HashSet<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
        let declared = |info: &ValueInfoProto| {
            types::declared_shape(info)
                .map(|(_, dims)| SessionValue { name: info.name.clone(), dims })
                .map_err(execution)
        };
        let inputs = graph
            .input
            .iter()
            .filter(|input| !initializers.contains(input.name.as_str()))
            .map(declared)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = graph.output.iter().map(declared).collect::<Result<Vec<_>, _>>()?;

        // Loading once up front surfaces unsupported graphs before any run
        let bytes = model
            .write_to_bytes()
            .map_err(|e| execution(format!("failed to encode model: {}", e)))?;
        tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(bytes))
            .map_err(|e| execution(format!("runtime rejected the model: {:#}", e)))?;

        info!("Created inference session with inputs {:?}", inputs.iter().map(|i| &i.name).collect::<Vec<_>>());
        Ok(Self { model, inputs, outputs })
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|input| input.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|output| output.name.as_str()).collect()
    }

    /// Runs the graph on `feeds` (input name to tensor) and returns the graph
    /// outputs in declaration order.
    ///
    /// Every declared input must be fed, and nothing else. Fixed axes must
    /// match the declared sizes; named axes are bound to the fed sizes and
    /// must bind consistently across inputs. Each output must have the
    /// declared shape of its graph output under those bindings.
    pub fn run(&self, feeds: &HashMap<String, ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>, ExportError> {
        if let Some(extra) = feeds.keys().find(|name| !self.inputs.iter().any(|input| &input.name == *name)) {
            return Err(execution(format!("'{}' is not an input of the model", extra)));
        }

        let mut bindings: Vec<(String, usize)> = Vec::new();
        let mut tensors: TVec<TValue> = TVec::new();
        for input in &self.inputs {
            let feed = feeds
                .get(&input.name)
                .ok_or_else(|| execution(format!("missing feed for input '{}'", input.name)))?;
            self.bind(input, feed.shape(), &mut bindings)?;

            let contiguous = feed.as_standard_layout();
            let data = contiguous
                .as_slice()
                .ok_or_else(|| execution(format!("feed '{}' is not contiguous", input.name)))?;
            let tensor = Tensor::from_shape(feed.shape(), data)
                .map_err(|e| execution(format!("feed '{}': {:#}", input.name, e)))?;
            tensors.push(tensor.into());
        }
        debug!("Bound dimensions {:?}", bindings);

        let bytes = self.bound_model(&bindings)?;
        let plan = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(bytes))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| execution(format!("failed to plan the model: {:#}", e)))?;

        let outputs = plan
            .run(tensors)
            .map_err(|e| execution(format!("inference failed: {:#}", e)))?;

        if outputs.len() != self.outputs.len() {
            return Err(execution(format!(
                "runtime produced {} outputs, the graph declares {}",
                outputs.len(),
                self.outputs.len()
            )));
        }

        outputs
            .iter()
            .zip(&self.outputs)
            .map(|(value, declared)| {
                check_output(declared, &bindings, value.shape())?;
                let data = value
                    .as_slice::<f32>()
                    .map_err(|e| execution(format!("output is not f32: {:#}", e)))?;
                ArrayD::from_shape_vec(IxDyn(value.shape()), data.to_vec())
                    .map_err(|e| execution(format!("output shape: {}", e)))
            })
            .collect()
    }

    fn bind(&self, input: &SessionValue, shape: &[usize], bindings: &mut Vec<(String, usize)>) -> Result<(), ExportError> {
        if shape.len() != input.dims.len() {
            return Err(execution(format!(
                "input '{}' expects rank {} ({}), got shape {:?}",
                input.name,
                input.dims.len(),
                types::format_shape(&input.dims),
                shape
            )));
        }
        for (axis, (dim, &size)) in input.dims.iter().zip(shape).enumerate() {
            match dim {
                Dim::Fixed(expected) if *expected != size => {
                    return Err(execution(format!(
                        "input '{}' axis {} must be {}, got {}",
                        input.name, axis, expected, size
                    )));
                }
                Dim::Fixed(_) => {}
                Dim::Symbolic(param) => match bindings.iter().find(|(name, _)| name == param) {
                    Some((_, bound)) if *bound != size => {
                        return Err(execution(format!(
                            "'{}' is bound to {} but input '{}' axis {} is {}",
                            param, bound, input.name, axis, size
                        )));
                    }
                    Some(_) => {}
                    None => bindings.push((param.clone(), size)),
                },
            }
        }
        Ok(())
    }

    /// Encodes the model with every bound named axis replaced by its size
    fn bound_model(&self, bindings: &[(String, usize)]) -> Result<Vec<u8>, ExportError> {
        let mut model = self.model.clone();
        if let Some(graph) = model.graph.as_mut() {
            for info in graph
                .input
                .iter_mut()
                .chain(graph.output.iter_mut())
                .chain(graph.value_info.iter_mut())
            {
                types::bind_dims(info, bindings);
            }
        }
        model
            .write_to_bytes()
            .map_err(|e| execution(format!("failed to encode model: {}", e)))
    }
}

/// Compares a produced shape with the declared one. Named axes resolve through
/// `bindings`; a named axis no input bound accepts any size.
fn check_output(declared: &SessionValue, bindings: &[(String, usize)], produced: &[usize]) -> Result<(), ExportError> {
    let expected: Vec<Option<usize>> = declared
        .dims
        .iter()
        .map(|dim| match dim {
            Dim::Fixed(size) => Some(*size),
            Dim::Symbolic(param) => bindings.iter().find(|(name, _)| name == param).map(|(_, size)| *size),
        })
        .collect();

    let matches = expected.len() == produced.len()
        && expected
            .iter()
            .zip(produced)
            .all(|(want, &got)| want.map_or(true, |want| want == got));
    if !matches {
        return Err(execution(format!(
            "output '{}' has shape {:?}, expected {} with {:?}",
            declared.name,
            produced,
            types::format_shape(&declared.dims),
            bindings
        )));
    }
    Ok(())
}

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::operators::{self, Attributes};
use super::protos::{GraphProto, ModelProto};
use super::types::{self, Dim};
use crate::error::ExportError;

/// Highest IR version this checker understands
pub const MAX_IR_VERSION: i64 = 10;

fn invalid(msg: impl Into<String>) -> ExportError {
    ExportError::SchemaValidation(msg.into())
}

/// Validates the structure of a decoded model.
///
/// Checks the IR version and default-domain opset, the graph interface
/// (typed inputs and outputs with valid dims), initializers (unique names,
/// payload sizes), every node against its operator schema at the imported
/// opset, single assignment and topological order of values, and that shapes
/// inferred from the declared inputs agree with every declared shape.
pub fn check_model(model: &ModelProto) -> Result<(), ExportError> {
    if !(3..=MAX_IR_VERSION).contains(&model.ir_version) {
        return Err(invalid(format!("unsupported IR version {}", model.ir_version)));
    }

    let opset = model
        .opset_import
        .iter()
        .find(|import| operators::is_default_domain(&import.domain))
        .map(|import| import.version)
        .ok_or_else(|| invalid("model does not import the default operator set"))?;
    if opset < 1 {
        return Err(invalid(format!("invalid default opset version {}", opset)));
    }

    let graph = model.graph.as_ref().ok_or_else(|| invalid("model has no graph"))?;
    check_graph(graph, opset)
}

fn check_graph(graph: &GraphProto, opset: i64) -> Result<(), ExportError> {
    if graph.name.is_empty() {
        return Err(invalid("graph has no name"));
    }
    if graph.input.is_empty() || graph.output.is_empty() {
        return Err(invalid("graph must declare at least one input and one output"));
    }

    let mut shapes: HashMap<&str, Vec<Dim>> = HashMap::new();

    let mut initializer_names = HashSet::new();
    for tensor in &graph.initializer {
        if tensor.name.is_empty() {
            return Err(invalid("initializer without a name"));
        }
        if !initializer_names.insert(tensor.name.as_str()) {
            return Err(invalid(format!("duplicate initializer '{}'", tensor.name)));
        }
        if tensor.dims.iter().any(|&d| d < 0) {
            return Err(invalid(format!("initializer '{}' has negative dims {:?}", tensor.name, tensor.dims)));
        }
        let count = tensor
            .dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(usize::try_from(d).ok()?))
            .ok_or_else(|| invalid(format!("initializer '{}' dims {:?} overflow", tensor.name, tensor.dims)))?;
        if let Some(size) = types::element_size(tensor.data_type) {
            let stored = if !tensor.raw_data.is_empty() {
                tensor.raw_data.len() / size
            } else {
                tensor.float_data.len() + tensor.int32_data.len() + tensor.int64_data.len() + tensor.double_data.len()
            };
            let exact = tensor.raw_data.is_empty() || tensor.raw_data.len() % size == 0;
            if stored != count || !exact {
                return Err(invalid(format!(
                    "initializer '{}' holds {} values, dims {:?} need {}",
                    tensor.name, stored, tensor.dims, count
                )));
            }
        }
        shapes.insert(tensor.name.as_str(), types::fixed(&tensor.dims.iter().map(|&d| d as usize).collect::<Vec<_>>()));
    }

    for input in &graph.input {
        let (elem_type, dims) = types::declared_shape(input).map_err(invalid)?;
        if elem_type == 0 {
            return Err(invalid(format!("input '{}' has undefined element type", input.name)));
        }
        if !initializer_names.contains(input.name.as_str()) && shapes.insert(input.name.as_str(), dims).is_some() {
            return Err(invalid(format!("input '{}' declared twice", input.name)));
        }
    }

    for (index, node) in graph.node.iter().enumerate() {
        let label = if node.name.is_empty() { format!("node #{}", index) } else { node.name.clone() };
        if !operators::is_default_domain(&node.domain) {
            return Err(invalid(format!("{}: operator domain '{}' is not supported", label, node.domain)));
        }
        let schema = operators::schema(&node.op_type)
            .ok_or_else(|| invalid(format!("{}: unknown operator '{}'", label, node.op_type)))?;
        if schema.since_version > opset {
            return Err(invalid(format!(
                "{}: {} is not available at opset {} (since {})",
                label, node.op_type, opset, schema.since_version
            )));
        }
        if !schema.inputs.contains(&node.input.len()) {
            return Err(invalid(format!("{}: {} inputs, {} takes {:?}", label, node.input.len(), node.op_type, schema.inputs)));
        }
        if !schema.outputs.contains(&node.output.len()) {
            return Err(invalid(format!("{}: {} outputs, {} produces {:?}", label, node.output.len(), node.op_type, schema.outputs)));
        }

        let mut seen_attributes = HashSet::new();
        for attr in &node.attribute {
            let expected = schema
                .attribute_type(&attr.name)
                .ok_or_else(|| invalid(format!("{}: unexpected attribute '{}' on {}", label, attr.name, node.op_type)))?;
            if attr.type_.enum_value() != Ok(expected) {
                return Err(invalid(format!(
                    "{}: attribute '{}' should be {:?}, found {:?}",
                    label, attr.name, expected, attr.type_
                )));
            }
            if !seen_attributes.insert(attr.name.as_str()) {
                return Err(invalid(format!("{}: attribute '{}' repeated", label, attr.name)));
            }
        }

        let input_shapes = node
            .input
            .iter()
            .map(|input| {
                shapes
                    .get(input.as_str())
                    .cloned()
                    .ok_or_else(|| invalid(format!("{}: input '{}' is used before it is defined", label, input)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let inferred = (schema.infer)(&input_shapes, &Attributes::new(&node.attribute))
            .map_err(|e| invalid(format!("{}: {}", label, e)))?;

        for (output, dims) in node.output.iter().zip(inferred) {
            if output.is_empty() {
                continue;
            }
            if shapes.insert(output.as_str(), dims).is_some() {
                return Err(invalid(format!("{}: value '{}' is assigned more than once", label, output)));
            }
        }
    }

    for declared in graph.value_info.iter().chain(&graph.output) {
        let (_, dims) = types::declared_shape(declared).map_err(invalid)?;
        let inferred = shapes
            .get(declared.name.as_str())
            .ok_or_else(|| invalid(format!("value '{}' is declared but never produced", declared.name)))?;
        if !shapes_agree(&dims, inferred) {
            return Err(invalid(format!(
                "value '{}' is declared as {} but inferred as {}",
                declared.name,
                types::format_shape(&dims),
                types::format_shape(inferred)
            )));
        }
    }

    debug!(
        "Checked graph '{}': {} nodes, {} initializers at opset {}",
        graph.name,
        graph.node.len(),
        graph.initializer.len(),
        opset
    );
    Ok(())
}

/// Same rank, and every axis fixed on both sides has the same size
fn shapes_agree(declared: &[Dim], inferred: &[Dim]) -> bool {
    declared.len() == inferred.len()
        && declared.iter().zip(inferred).all(|pair| match pair {
            (Dim::Fixed(a), Dim::Fixed(b)) => a == b,
            _ => true,
        })
}

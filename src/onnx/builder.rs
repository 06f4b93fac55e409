use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use ndarray::ArrayD;
use tracing::debug;

use super::operators::{self, Attributes};
use super::protos::tensor_proto::DataType;
use super::protos::{AttributeProto, GraphProto, NodeProto, TensorProto, ValueInfoProto};
use super::types::{self, Dim};
use crate::error::ExportError;

/// Accumulates nodes, initializers and value types of one graph.
///
/// Every value added through the builder has a known shape; adding a node
/// runs its shape rule, so a graph that builds is shape-consistent.
pub struct GraphBuilder {
    opset_version: i64,
    /// Embed parameters as initializers (true) or declare them as graph inputs
    embed_params: bool,
    inputs: Vec<ValueInfoProto>,
    parameter_inputs: Vec<ValueInfoProto>,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    value_info: Vec<ValueInfoProto>,
    shapes: HashMap<String, Vec<Dim>>,
    /// Number of nodes emitted per name, used to keep names unique
    name_counts: HashMap<String, usize>,
}

impl GraphBuilder {
    pub fn new(opset_version: i64, embed_params: bool) -> Self {
        Self {
            opset_version,
            embed_params,
            inputs: Vec::new(),
            parameter_inputs: Vec::new(),
            nodes: Vec::new(),
            initializers: Vec::new(),
            value_info: Vec::new(),
            shapes: HashMap::new(),
            name_counts: HashMap::new(),
        }
    }

    /// Declares a graph input
    pub fn input(&mut self, name: &str, dims: Vec<Dim>) -> String {
        self.inputs.push(types::value_info(name, &dims));
        self.shapes.insert(name.to_string(), dims);
        name.to_string()
    }

    /// Adds a constant tensor (little-endian f32 in `raw_data`)
    pub fn parameter(&mut self, name: &str, value: &ArrayD<f32>) -> String {
        let dims = types::fixed(value.shape());
        if self.embed_params {
            let values: Vec<f32> = value.iter().copied().collect();
            let mut raw = vec![0u8; values.len() * 4];
            LittleEndian::write_f32_into(&values, &mut raw);

            let mut tensor = TensorProto::new();
            tensor.name = name.to_string();
            tensor.dims = value.shape().iter().map(|&d| d as i64).collect();
            tensor.data_type = DataType::FLOAT as i32;
            tensor.raw_data = raw;
            self.initializers.push(tensor);
        } else {
            self.parameter_inputs.push(types::value_info(name, &dims));
        }
        self.shapes.insert(name.to_string(), dims);
        name.to_string()
    }

    pub fn shape(&self, value: &str) -> Option<&[Dim]> {
        self.shapes.get(value).map(Vec::as_slice)
    }

    /// Appends a node and returns the name of its output.
    ///
    /// The node is named `{scope}/{op_type}`, with a numeric suffix if that
    /// name is taken; its output is `{node_name}_output_0`.
    ///
    /// # Arguments
    /// * `scope` - Module scope of the node, e.g. `/features/features.0/features.0.0`
    /// * `op_type` - Operator of the default domain
    /// * `inputs` - Names of values already in the graph
    /// * `attributes` - Node attributes
    pub fn node(
        &mut self,
        scope: &str,
        op_type: &str,
        inputs: Vec<String>,
        attributes: Vec<AttributeProto>,
    ) -> Result<String, ExportError> {
        let schema = operators::schema(op_type)
            .ok_or_else(|| ExportError::UnsupportedOperator(format!("{} has no ONNX schema", op_type)))?;
        if schema.since_version > self.opset_version {
            return Err(ExportError::UnsupportedOperator(format!(
                "{} requires opset {} but the target opset is {}",
                op_type, schema.since_version, self.opset_version
            )));
        }

        let input_shapes = inputs
            .iter()
            .map(|input| {
                self.shapes
                    .get(input)
                    .cloned()
                    .ok_or_else(|| ExportError::ShapeMismatch(format!("value '{}' is not defined", input)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut name = format!("{}/{}", scope, op_type);
        let count = self.name_counts.entry(name.clone()).or_insert(0);
        if *count > 0 {
            name = format!("{}_{}", name, count);
        }
        *count += 1;

        let output_shape = (schema.infer)(&input_shapes, &Attributes::new(&attributes))
            .map_err(|e| ExportError::ShapeMismatch(format!("{}: {}", name, e)))?
            .remove(0);
        let output = format!("{}_output_0", name);
        debug!("{} -> {} [{}]", name, output, types::format_shape(&output_shape));

        let mut node = NodeProto::new();
        node.name = name;
        node.op_type = op_type.to_string();
        node.input = inputs;
        node.output = vec![output.clone()];
        node.attribute = attributes;
        self.nodes.push(node);

        self.value_info.push(types::value_info(&output, &output_shape));
        self.shapes.insert(output.clone(), output_shape);
        Ok(output)
    }

    /// Finalizes the graph: `result` becomes the graph output under `output_name`.
    pub fn finish(mut self, graph_name: &str, result: &str, output_name: &str) -> Result<GraphProto, ExportError> {
        let dims = self
            .shapes
            .remove(result)
            .ok_or_else(|| ExportError::ShapeMismatch(format!("graph result '{}' is not defined", result)))?;

        for node in self.nodes.iter_mut() {
            for value in node.output.iter_mut().chain(node.input.iter_mut()) {
                if value == result {
                    *value = output_name.to_string();
                }
            }
        }
        self.value_info.retain(|info| info.name != result);

        let mut graph = GraphProto::new();
        graph.name = graph_name.to_string();
        graph.node = self.nodes;
        graph.initializer = self.initializers;
        graph.input = self.inputs;
        graph.input.extend(self.parameter_inputs);
        graph.output = vec![types::value_info(output_name, &dims)];
        graph.value_info = self.value_info;
        Ok(graph)
    }
}

use std::collections::HashMap;
use std::ops::RangeInclusive;

use once_cell::sync::Lazy;

use super::protos::attribute_proto::AttributeType;
use super::protos::AttributeProto;
use super::types::Dim;

/// Shape rule of an operator: input shapes and attributes in, output shapes out.
pub type InferFn = fn(&[Vec<Dim>], &Attributes) -> Result<Vec<Vec<Dim>>, String>;

/// What this crate knows about one operator of the default ONNX domain
pub struct OpSchema {
    pub op_type: &'static str,
    /// First opset version in which the operator exists in this form
    pub since_version: i64,
    pub inputs: RangeInclusive<usize>,
    pub outputs: RangeInclusive<usize>,
    /// Accepted attributes and their types
    pub attributes: &'static [(&'static str, AttributeType)],
    pub infer: InferFn,
}

impl OpSchema {
    pub fn attribute_type(&self, name: &str) -> Option<AttributeType> {
        self.attributes
            .iter()
            .find(|(attr, _)| *attr == name)
            .map(|(_, ty)| *ty)
    }
}

// When adding an operator:
// 1. Write its shape rule below
// 2. Register it in OPERATORS with its since-version and attributes

static OPERATORS: Lazy<HashMap<&'static str, OpSchema>> = Lazy::new(|| {
    let schemas = vec![
        OpSchema {
            op_type: "Conv",
            since_version: 1,
            inputs: 2..=3,
            outputs: 1..=1,
            attributes: &[
                ("auto_pad", AttributeType::STRING),
                ("dilations", AttributeType::INTS),
                ("group", AttributeType::INT),
                ("kernel_shape", AttributeType::INTS),
                ("pads", AttributeType::INTS),
                ("strides", AttributeType::INTS),
            ],
            infer: infer_conv,
        },
        OpSchema {
            op_type: "BatchNormalization",
            since_version: 9,
            inputs: 5..=5,
            outputs: 1..=5,
            attributes: &[("epsilon", AttributeType::FLOAT), ("momentum", AttributeType::FLOAT)],
            infer: infer_batch_norm,
        },
        unary("Sigmoid", 6),
        binary("Add", 7),
        binary("Mul", 7),
        OpSchema {
            op_type: "GlobalAveragePool",
            since_version: 1,
            inputs: 1..=1,
            outputs: 1..=1,
            attributes: &[],
            infer: infer_global_pool,
        },
        OpSchema {
            op_type: "Flatten",
            since_version: 1,
            inputs: 1..=1,
            outputs: 1..=1,
            attributes: &[("axis", AttributeType::INT)],
            infer: infer_flatten,
        },
        OpSchema {
            op_type: "Gemm",
            since_version: 7,
            inputs: 2..=3,
            outputs: 1..=1,
            attributes: &[
                ("alpha", AttributeType::FLOAT),
                ("beta", AttributeType::FLOAT),
                ("transA", AttributeType::INT),
                ("transB", AttributeType::INT),
            ],
            infer: infer_gemm,
        },
    ];

    schemas.into_iter().map(|schema| (schema.op_type, schema)).collect()
});

/// Looks up an operator of the default domain
pub fn schema(op_type: &str) -> Option<&'static OpSchema> {
    OPERATORS.get(op_type)
}

/// Whether `domain` names the default ONNX operator set
pub fn is_default_domain(domain: &str) -> bool {
    domain.is_empty() || domain == "ai.onnx"
}

fn unary(op_type: &'static str, since_version: i64) -> OpSchema {
    OpSchema {
        op_type,
        since_version,
        inputs: 1..=1,
        outputs: 1..=1,
        attributes: &[],
        infer: |inputs, _| Ok(vec![inputs[0].clone()]),
    }
}

fn binary(op_type: &'static str, since_version: i64) -> OpSchema {
    OpSchema {
        op_type,
        since_version,
        inputs: 2..=2,
        outputs: 1..=1,
        attributes: &[],
        infer: |inputs, _| broadcast(&inputs[0], &inputs[1]).map(|shape| vec![shape]),
    }
}

/// Read access to a node's attributes
pub struct Attributes<'a> {
    attributes: &'a [AttributeProto],
}

impl<'a> Attributes<'a> {
    pub fn new(attributes: &'a [AttributeProto]) -> Self {
        Self { attributes }
    }

    fn find(&self, name: &str) -> Option<&'a AttributeProto> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.find(name).map(|attr| attr.i)
    }

    pub fn ints(&self, name: &str) -> Option<&'a [i64]> {
        self.find(name).map(|attr| attr.ints.as_slice())
    }

    pub fn float(&self, name: &str) -> Option<f32> {
        self.find(name).map(|attr| attr.f)
    }
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    let mut attr = AttributeProto::new();
    attr.name = name.to_string();
    attr.type_ = AttributeType::INT.into();
    attr.i = value;
    attr
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    let mut attr = AttributeProto::new();
    attr.name = name.to_string();
    attr.type_ = AttributeType::INTS.into();
    attr.ints = values.to_vec();
    attr
}

pub fn attr_float(name: &str, value: f32) -> AttributeProto {
    let mut attr = AttributeProto::new();
    attr.name = name.to_string();
    attr.type_ = AttributeType::FLOAT.into();
    attr.f = value;
    attr
}

fn fixed_dim(dim: &Dim, what: &str) -> Result<usize, String> {
    dim.value().ok_or_else(|| format!("{} must be a fixed dimension, got '{}'", what, dim))
}

/// Multidirectional (numpy-style) broadcasting of two shapes
pub fn broadcast(a: &[Dim], b: &[Dim]) -> Result<Vec<Dim>, String> {
    let rank = a.len().max(b.len());
    let one = Dim::Fixed(1);
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i + a.len() >= rank { &a[i + a.len() - rank] } else { &one };
        let db = if i + b.len() >= rank { &b[i + b.len() - rank] } else { &one };
        let dim = match (da, db) {
            (x, y) if x == y => x.clone(),
            (Dim::Fixed(1), other) | (other, Dim::Fixed(1)) => other.clone(),
            (Dim::Fixed(x), Dim::Fixed(y)) => {
                return Err(format!("cannot broadcast axis {} of sizes {} and {}", i, x, y));
            }
            (Dim::Symbolic(_), fixed @ Dim::Fixed(_)) | (fixed @ Dim::Fixed(_), Dim::Symbolic(_)) => fixed.clone(),
            (symbolic, Dim::Symbolic(_)) => symbolic.clone(),
        };
        out.push(dim);
    }
    Ok(out)
}

fn infer_conv(inputs: &[Vec<Dim>], attrs: &Attributes) -> Result<Vec<Vec<Dim>>, String> {
    let x = &inputs[0];
    let w = &inputs[1];
    if x.len() != 4 || w.len() != 4 {
        return Err(format!("Conv expects rank-4 input and weight, got ranks {} and {}", x.len(), w.len()));
    }

    let group = attrs.int("group").unwrap_or(1);
    if group < 1 {
        return Err(format!("Conv group must be positive, got {}", group));
    }
    let channels = fixed_dim(&x[1], "Conv input channels")?;
    let filter_channels = fixed_dim(&w[1], "Conv weight channels")?;
    let grouped = usize::try_from(group)
        .ok()
        .and_then(|group| filter_channels.checked_mul(group))
        .ok_or_else(|| format!("Conv weight channels {} x {} groups overflow", filter_channels, group))?;
    if channels != grouped {
        return Err(format!(
            "Conv input has {} channels but weight expects {} x {} groups",
            channels, filter_channels, group
        ));
    }
    if let Some(bias) = inputs.get(2) {
        if bias.len() != 1 || bias[0] != w[0] {
            return Err(format!("Conv bias shape {:?} does not match {} output channels", bias, w[0]));
        }
    }

    let kernel = [fixed_dim(&w[2], "Conv kernel")?, fixed_dim(&w[3], "Conv kernel")?];
    if kernel.contains(&0) {
        return Err(format!("Conv kernel {:?} has an empty axis", kernel));
    }
    if let Some(shape) = attrs.ints("kernel_shape") {
        if shape != [kernel[0] as i64, kernel[1] as i64] {
            return Err(format!("Conv kernel_shape {:?} disagrees with weight {:?}", shape, kernel));
        }
    }
    let strides = attrs.ints("strides").unwrap_or(&[1, 1]);
    let dilations = attrs.ints("dilations").unwrap_or(&[1, 1]);
    let pads = attrs.ints("pads").unwrap_or(&[0, 0, 0, 0]);
    if strides.len() != 2 || dilations.len() != 2 || pads.len() != 4 {
        return Err("Conv strides, dilations and pads must cover both spatial axes".to_string());
    }
    if strides.iter().chain(dilations).any(|&v| v < 1) || pads.iter().any(|&p| p < 0) {
        return Err(format!(
            "Conv strides {:?} and dilations {:?} must be positive, pads {:?} non-negative",
            strides, dilations, pads
        ));
    }

    let mut out = vec![x[0].clone(), w[0].clone()];
    for axis in 0..2 {
        let size = i64::try_from(fixed_dim(&x[2 + axis], "Conv spatial size")?)
            .map_err(|_| format!("Conv spatial axis {} is too large", axis))?;
        let window = i64::try_from(kernel[axis])
            .ok()
            .and_then(|k| dilations[axis].checked_mul(k - 1))
            .and_then(|span| span.checked_add(1));
        let padded = size
            .checked_add(pads[axis])
            .and_then(|sum| sum.checked_add(pads[axis + 2]));
        let (Some(effective), Some(padded)) = (window, padded) else {
            return Err(format!(
                "Conv spatial axis {} overflows with dilations {:?} and pads {:?}",
                axis, dilations, pads
            ));
        };
        if padded < effective {
            return Err(format!(
                "Conv spatial axis {} of size {} is smaller than the {}-wide kernel window",
                axis, size, effective
            ));
        }
        out.push(Dim::Fixed(((padded - effective) / strides[axis] + 1) as usize));
    }
    Ok(vec![out])
}

fn infer_batch_norm(inputs: &[Vec<Dim>], _attrs: &Attributes) -> Result<Vec<Vec<Dim>>, String> {
    let x = &inputs[0];
    if x.len() < 2 {
        return Err(format!("BatchNormalization expects rank >= 2, got {}", x.len()));
    }
    for (i, stat) in inputs[1..].iter().enumerate() {
        if stat.len() != 1 || stat[0] != x[1] {
            return Err(format!("BatchNormalization input {} has shape {:?}, expected [{}]", i + 1, stat, x[1]));
        }
    }
    Ok(vec![x.clone()])
}

fn infer_global_pool(inputs: &[Vec<Dim>], _attrs: &Attributes) -> Result<Vec<Vec<Dim>>, String> {
    let x = &inputs[0];
    if x.len() < 3 {
        return Err(format!("GlobalAveragePool expects rank >= 3, got {}", x.len()));
    }
    let mut out = x[..2].to_vec();
    out.extend(std::iter::repeat(Dim::Fixed(1)).take(x.len() - 2));
    Ok(vec![out])
}

fn flatten_part(dims: &[Dim]) -> Result<Dim, String> {
    match dims {
        [] => Ok(Dim::Fixed(1)),
        [single] => Ok(single.clone()),
        _ => dims.iter().try_fold(1usize, |acc, dim| {
            acc.checked_mul(fixed_dim(dim, "Flatten axis")?)
                .ok_or_else(|| format!("Flatten of {:?} overflows", dims))
        })
        .map(Dim::Fixed),
    }
}

fn infer_flatten(inputs: &[Vec<Dim>], attrs: &Attributes) -> Result<Vec<Vec<Dim>>, String> {
    let x = &inputs[0];
    let axis = attrs.int("axis").unwrap_or(1);
    let axis = if axis < 0 { axis + x.len() as i64 } else { axis };
    if axis < 0 || axis > x.len() as i64 {
        return Err(format!("Flatten axis {} out of range for rank {}", axis, x.len()));
    }
    let (outer, inner) = x.split_at(axis as usize);
    Ok(vec![vec![flatten_part(outer)?, flatten_part(inner)?]])
}

fn infer_gemm(inputs: &[Vec<Dim>], attrs: &Attributes) -> Result<Vec<Vec<Dim>>, String> {
    let (a, b) = (&inputs[0], &inputs[1]);
    if a.len() != 2 || b.len() != 2 {
        return Err(format!("Gemm expects rank-2 operands, got ranks {} and {}", a.len(), b.len()));
    }
    let (m, ka) = if attrs.int("transA").unwrap_or(0) != 0 { (&a[1], &a[0]) } else { (&a[0], &a[1]) };
    let (kb, n) = if attrs.int("transB").unwrap_or(0) != 0 { (&b[1], &b[0]) } else { (&b[0], &b[1]) };
    if let (Dim::Fixed(x), Dim::Fixed(y)) = (ka, kb) {
        if x != y {
            return Err(format!("Gemm inner dimensions differ: {} vs {}", x, y));
        }
    }
    let out = vec![m.clone(), n.clone()];
    if let Some(c) = inputs.get(2) {
        // C must be unidirectionally broadcastable to the output
        if broadcast(&out, c)? != out {
            return Err(format!("Gemm bias {:?} does not broadcast to {:?}", c, out));
        }
    }
    Ok(vec![out])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::types::fixed;

    fn batch(rest: &[usize]) -> Vec<Dim> {
        let mut dims = vec![Dim::Symbolic("batch_size".into())];
        dims.extend(fixed(rest));
        dims
    }

    fn infer(op: &str, inputs: &[Vec<Dim>], attrs: &[AttributeProto]) -> Result<Vec<Dim>, String> {
        let schema = schema(op).expect("registered operator");
        (schema.infer)(inputs, &Attributes::new(attrs)).map(|mut outs| outs.remove(0))
    }

    #[test]
    fn test_conv_stride_and_padding() {
        let attrs = [
            attr_ints("kernel_shape", &[3, 3]),
            attr_ints("pads", &[1, 1, 1, 1]),
            attr_ints("strides", &[2, 2]),
        ];
        let out = infer("Conv", &[batch(&[3, 512, 512]), fixed(&[32, 3, 3, 3])], &attrs).unwrap();
        assert_eq!(out, batch(&[32, 256, 256]));
    }

    #[test]
    fn test_depthwise_conv_groups() {
        let attrs = [attr_int("group", 96), attr_ints("pads", &[1, 1, 1, 1])];
        let out = infer("Conv", &[batch(&[96, 8, 8]), fixed(&[96, 1, 3, 3])], &attrs).unwrap();
        assert_eq!(out, batch(&[96, 8, 8]));
        let err = infer("Conv", &[batch(&[48, 8, 8]), fixed(&[96, 1, 3, 3])], &attrs).unwrap_err();
        assert!(err.contains("channels"));
    }

    #[test]
    fn test_conv_rejects_window_larger_than_input() {
        let err = infer("Conv", &[batch(&[3, 2, 2]), fixed(&[8, 3, 5, 5])], &[]).unwrap_err();
        assert!(err.contains("kernel window"));
    }

    #[test]
    fn test_conv_overflowing_attributes_are_errors() {
        let huge_pads = [attr_ints("pads", &[i64::MAX; 4])];
        let err = infer("Conv", &[batch(&[3, 32, 32]), fixed(&[8, 3, 3, 3])], &huge_pads).unwrap_err();
        assert!(err.contains("overflows"), "{}", err);

        let huge_dilations = [attr_ints("dilations", &[i64::MAX, 1])];
        let err = infer("Conv", &[batch(&[3, 32, 32]), fixed(&[8, 3, 3, 3])], &huge_dilations).unwrap_err();
        assert!(err.contains("overflows"), "{}", err);

        let negative_pads = [attr_ints("pads", &[-1, 0, 0, 0])];
        let err = infer("Conv", &[batch(&[3, 32, 32]), fixed(&[8, 3, 3, 3])], &negative_pads).unwrap_err();
        assert!(err.contains("non-negative"), "{}", err);

        let huge_group = [attr_int("group", i64::MAX)];
        let err = infer("Conv", &[batch(&[3, 32, 32]), fixed(&[8, 3, 3, 3])], &huge_group).unwrap_err();
        assert!(err.contains("overflow"), "{}", err);
    }

    #[test]
    fn test_flatten_overflow_is_an_error() {
        let wide = fixed(&[1, 1 << 40, 1 << 40]);
        let err = infer("Flatten", &[wide], &[attr_int("axis", 1)]).unwrap_err();
        assert!(err.contains("overflows"), "{}", err);
    }

    #[test]
    fn test_broadcast() {
        assert_eq!(broadcast(&batch(&[16, 8, 8]), &batch(&[16, 1, 1])).unwrap(), batch(&[16, 8, 8]));
        assert_eq!(broadcast(&fixed(&[4, 1]), &fixed(&[3])).unwrap(), fixed(&[4, 3]));
        assert!(broadcast(&fixed(&[4]), &fixed(&[3])).is_err());
    }

    #[test]
    fn test_pool_flatten_gemm_chain() {
        let pooled = infer("GlobalAveragePool", &[batch(&[1280, 16, 16])], &[]).unwrap();
        assert_eq!(pooled, batch(&[1280, 1, 1]));
        let flat = infer("Flatten", &[pooled], &[attr_int("axis", 1)]).unwrap();
        assert_eq!(flat, batch(&[1280]));
        let logits = infer("Gemm", &[flat, fixed(&[1000, 1280]), fixed(&[1000])], &[attr_int("transB", 1)]).unwrap();
        assert_eq!(logits, batch(&[1000]));
    }

    #[test]
    fn test_registry() {
        let conv = schema("Conv").unwrap();
        assert_eq!(conv.attribute_type("group"), Some(AttributeType::INT));
        assert_eq!(conv.attribute_type("alpha"), None);
        assert_eq!(schema("BatchNormalization").map(|s| s.since_version), Some(9));
        assert!(schema("Resize").is_none());
        assert!(is_default_domain("") && is_default_domain("ai.onnx"));
    }
}

use std::fmt;

use protobuf::MessageField;

use super::protos::tensor_proto::DataType;
use super::protos::tensor_shape_proto::{dimension, Dimension};
use super::protos::type_proto::{self, Tensor as TensorTypeProto};
use super::protos::{TensorShapeProto, TypeProto, ValueInfoProto};

/// One axis of a tensor shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Known at export time
    Fixed(usize),
    /// Bound only when the graph runs (e.g. `batch_size`)
    Symbolic(String),
}

impl Dim {
    pub fn value(&self) -> Option<usize> {
        match self {
            Dim::Fixed(value) => Some(*value),
            Dim::Symbolic(_) => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(value) => write!(f, "{}", value),
            Dim::Symbolic(name) => write!(f, "{}", name),
        }
    }
}

/// Fixed dims for a concrete shape
pub fn fixed(shape: &[usize]) -> Vec<Dim> {
    shape.iter().map(|&d| Dim::Fixed(d)).collect()
}

/// Renders a shape as `batch_size × 3 × 512 × 512`; scalars render as `scalar`.
pub fn format_shape(dims: &[Dim]) -> String {
    if dims.is_empty() {
        return "scalar".to_string();
    }
    dims.iter().map(Dim::to_string).collect::<Vec<_>>().join(" × ")
}

/// A float tensor type with the given shape
pub fn tensor_type(dims: &[Dim]) -> TypeProto {
    let mut shape = TensorShapeProto::new();
    shape.dim = dims
        .iter()
        .map(|dim| {
            let mut proto = Dimension::new();
            proto.value = Some(match dim {
                Dim::Fixed(value) => dimension::Value::DimValue(*value as i64),
                Dim::Symbolic(name) => dimension::Value::DimParam(name.clone()),
            });
            proto
        })
        .collect();

    let mut tensor = TensorTypeProto::new();
    tensor.elem_type = DataType::FLOAT as i32;
    tensor.shape = MessageField::some(shape);

    let mut ty = TypeProto::new();
    ty.value = Some(type_proto::Value::TensorType(tensor));
    ty
}

pub fn value_info(name: &str, dims: &[Dim]) -> ValueInfoProto {
    let mut info = ValueInfoProto::new();
    info.name = name.to_string();
    info.type_ = MessageField::some(tensor_type(dims));
    info
}

/// Element type and shape declared by a value info.
///
/// Fails when the value is untyped, not a tensor, or declares a dimension
/// that is neither a positive size nor a named parameter.
pub fn declared_shape(info: &ValueInfoProto) -> Result<(i32, Vec<Dim>), String> {
    let tensor = match info.type_.as_ref().and_then(|ty| ty.value.as_ref()) {
        Some(type_proto::Value::TensorType(tensor)) => tensor,
        None => return Err(format!("value '{}' has no tensor type", info.name)),
    };
    let shape = tensor
        .shape
        .as_ref()
        .ok_or_else(|| format!("value '{}' has no shape", info.name))?;

    let dims = shape
        .dim
        .iter()
        .enumerate()
        .map(|(axis, dim)| match &dim.value {
            Some(dimension::Value::DimValue(value)) if *value > 0 => Ok(Dim::Fixed(*value as usize)),
            Some(dimension::Value::DimParam(name)) if !name.is_empty() => Ok(Dim::Symbolic(name.clone())),
            other => Err(format!("value '{}' axis {} has invalid dimension {:?}", info.name, axis, other)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((tensor.elem_type, dims))
}

/// Replaces every named dimension of `info` that appears in `bindings` with its value.
pub fn bind_dims(info: &mut ValueInfoProto, bindings: &[(String, usize)]) {
    let shape = match info.type_.as_mut().and_then(|ty| ty.value.as_mut()) {
        Some(type_proto::Value::TensorType(tensor)) => tensor.shape.as_mut(),
        None => None,
    };
    let Some(shape) = shape else { return };

    for dim in shape.dim.iter_mut() {
        if let Some(dimension::Value::DimParam(name)) = &dim.value {
            if let Some((_, value)) = bindings.iter().find(|(param, _)| param == name) {
                dim.value = Some(dimension::Value::DimValue(*value as i64));
            }
        }
    }
}

/// Size in bytes of one element of an ONNX data type, for the types this crate can size.
pub fn element_size(data_type: i32) -> Option<usize> {
    match data_type {
        t if t == DataType::FLOAT as i32 || t == DataType::INT32 as i32 => Some(4),
        t if t == DataType::INT64 as i32 || t == DataType::DOUBLE as i32 => Some(8),
        t if t == DataType::UINT8 as i32 || t == DataType::INT8 as i32 || t == DataType::BOOL as i32 => Some(1),
        t if t == DataType::FLOAT16 as i32 || t == DataType::BFLOAT16 as i32 => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batched() -> Vec<Dim> {
        vec![Dim::Symbolic("batch_size".into()), Dim::Fixed(3), Dim::Fixed(512), Dim::Fixed(512)]
    }

    #[test]
    fn test_format_shape() {
        assert_eq!(format_shape(&batched()), "batch_size × 3 × 512 × 512");
        assert_eq!(format_shape(&[]), "scalar");
    }

    #[test]
    fn test_value_info_declares_shape() {
        let info = value_info("input", &batched());
        let (elem_type, dims) = declared_shape(&info).unwrap();
        assert_eq!(elem_type, DataType::FLOAT as i32);
        assert_eq!(dims, batched());
    }

    #[test]
    fn test_untyped_value_is_rejected() {
        let mut info = ValueInfoProto::new();
        info.name = "x".into();
        assert!(declared_shape(&info).is_err());

        let zero = value_info("y", &fixed(&[0, 3]));
        assert!(declared_shape(&zero).is_err());
    }

    #[test]
    fn test_bind_dims() {
        let mut info = value_info("input", &batched());
        bind_dims(&mut info, &[("batch_size".to_string(), 4)]);
        let (_, dims) = declared_shape(&info).unwrap();
        assert_eq!(dims, fixed(&[4, 3, 512, 512]));
    }
}

use std::fs;
use std::path::Path;

use protobuf::Message;
use tracing::debug;

use super::protos::ModelProto;
use crate::error::ExportError;

/// Reads and decodes an ONNX artifact from disk.
pub fn read_artifact(path: &Path) -> Result<ModelProto, ExportError> {
    let bytes = fs::read(path)?;
    debug!("Read {} bytes from {}", bytes.len(), path.display());
    decode_artifact(&bytes)
}

/// Decodes artifact bytes into a model.
///
/// Bytes that do not parse, or parse into a model without a graph or opset
/// imports (what a truncated file decodes to), are reported as corrupt.
pub fn decode_artifact(bytes: &[u8]) -> Result<ModelProto, ExportError> {
    if bytes.is_empty() {
        return Err(ExportError::CorruptArtifact("artifact is empty".to_string()));
    }
    let model = ModelProto::parse_from_bytes(bytes)
        .map_err(|e| ExportError::CorruptArtifact(format!("not an ONNX model: {}", e)))?;
    if model.graph.is_none() {
        return Err(ExportError::CorruptArtifact("model has no graph".to_string()));
    }
    if model.opset_import.is_empty() {
        return Err(ExportError::CorruptArtifact("model has no opset imports".to_string()));
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EfficientNetConfig, Model};
    use crate::onnx::export::{to_model_proto, ExportOptions};

    fn encoded() -> Vec<u8> {
        let config = EfficientNetConfig {
            width_mult: 0.25,
            depth_mult: 0.25,
            num_classes: 10,
            ..EfficientNetConfig::b0()
        };
        let model = Model::from_config("tiny", &config, 9).eval();
        to_model_proto(&model, &[1, 3, 32, 32], &ExportOptions::default())
            .unwrap()
            .write_to_bytes()
            .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let bytes = encoded();
        let model = decode_artifact(&bytes).unwrap();
        assert_eq!(model.graph.as_ref().map(|g| g.name.as_str()), Some("main_graph"));
    }

    #[test]
    fn test_every_truncation_is_corrupt() {
        let bytes = encoded();
        let step = (bytes.len() / 97).max(1);
        for len in (0..bytes.len()).step_by(step) {
            let result = decode_artifact(&bytes[..len]);
            assert!(matches!(result, Err(ExportError::CorruptArtifact(_))), "prefix of {} bytes decoded", len);
        }
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = decode_artifact(b"\xff\xfe this is not protobuf").unwrap_err();
        assert!(matches!(err, ExportError::CorruptArtifact(_)));
    }

    #[test]
    fn test_missing_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_artifact(&dir.path().join("absent.onnx")).unwrap_err();
        assert!(matches!(err, ExportError::Io(_)));
    }
}

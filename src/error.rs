use std::error::Error;
use std::fmt;

/// Failures of the export and verification pipeline.
#[derive(Debug)]
pub enum ExportError {
    /// The representative input does not fit the model
    ShapeMismatch(String),
    /// A layer or operator has no lowering at the target opset
    UnsupportedOperator(String),
    /// Reading or writing the artifact failed
    Io(std::io::Error),
    /// The artifact bytes do not decode to a complete model
    CorruptArtifact(String),
    /// The decoded model violates the ONNX structural rules
    SchemaValidation(String),
    /// The inference runtime refused to load or run the model
    SessionExecution(String),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExportError::ShapeMismatch(msg) => write!(f, "Input shape mismatch: {}", msg),
            ExportError::UnsupportedOperator(msg) => write!(f, "Unsupported operator: {}", msg),
            ExportError::Io(e) => write!(f, "I/O error: {}", e),
            ExportError::CorruptArtifact(msg) => write!(f, "Corrupt artifact: {}", msg),
            ExportError::SchemaValidation(msg) => write!(f, "Schema validation failed: {}", msg),
            ExportError::SessionExecution(msg) => write!(f, "Session execution failed: {}", msg),
        }
    }
}

impl Error for ExportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::Io(err)
    }
}

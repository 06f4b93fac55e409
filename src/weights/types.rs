use std::error::Error;
use std::fmt;

/// Failures while acquiring or applying pretrained weights
#[derive(Debug)]
pub enum WeightsError {
    /// Download failed (network unreachable, HTTP error status)
    Fetch(String),
    /// Wraps std::io::Error for cache and file operations
    Io(std::io::Error),
    /// The checkpoint is not a valid safetensors file
    Format(String),
    /// Checkpoint tensor with no counterpart in the model
    UnknownKey(String),
    /// Model tensors the checkpoint did not provide
    MissingKeys(Vec<String>),
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    UnsupportedDtype {
        name: String,
        dtype: String,
    },
}

impl fmt::Display for WeightsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WeightsError::Fetch(msg) => write!(f, "Failed to fetch weights: {}", msg),
            WeightsError::Io(e) => write!(f, "I/O error: {}", e),
            WeightsError::Format(msg) => write!(f, "Invalid checkpoint: {}", msg),
            WeightsError::UnknownKey(key) => write!(f, "Checkpoint tensor not present in model: {}", key),
            WeightsError::MissingKeys(keys) => {
                write!(f, "Checkpoint is missing {} tensor(s): {}", keys.len(), keys.join(", "))
            }
            WeightsError::ShapeMismatch { name, expected, found } => write!(
                f,
                "Shape mismatch for {}: model expects {:?}, checkpoint has {:?}",
                name, expected, found
            ),
            WeightsError::UnsupportedDtype { name, dtype } => {
                write!(f, "Tensor {} has unsupported dtype {} (only F32 is accepted)", name, dtype)
            }
        }
    }
}

impl Error for WeightsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WeightsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WeightsError {
    fn from(err: std::io::Error) -> Self {
        WeightsError::Io(err)
    }
}

impl From<safetensors::SafeTensorError> for WeightsError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        WeightsError::Format(err.to_string())
    }
}

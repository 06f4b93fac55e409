pub mod config;
pub mod display;
pub mod error;
pub mod logging;
pub mod model;
pub mod onnx;
pub mod pipeline;
pub mod session;
pub mod weights;

pub use error::ExportError;
pub use weights::WeightsError;

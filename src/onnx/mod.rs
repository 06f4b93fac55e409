pub mod artifact;
pub mod builder;
pub mod checker;
pub mod export;
pub mod operators;
pub mod protos;
pub mod types;

pub use artifact::{decode_artifact, read_artifact};
pub use checker::check_model;
pub use export::{export, to_model_proto, ExportOptions, ExportReport, BATCH_AXIS, INPUT_NAME, OUTPUT_NAME};
pub use types::{format_shape, Dim};

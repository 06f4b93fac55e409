use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::info;

use crate::config::Settings;
use crate::error::ExportError;
use crate::model::{Eval, Mode, Model};
use crate::onnx::{self, ExportOptions, ExportReport};
use crate::session::InferenceSession;
use crate::weights::{self, WeightsError};

/// Where the export stage writes the artifact, relative to the working directory
pub const EXPORT_PATH: &str = "../models/model.onnx";
/// Shape the model is traced at: one 3-channel 512x512 image
pub const REPRESENTATIVE_INPUT_SHAPE: [usize; 4] = [1, 3, 512, 512];
/// Seed of the representative input
pub const INPUT_SEED: u64 = 0;

/// Outcome of the verification stage
#[derive(Debug, Clone)]
pub struct Verification {
    pub output_name: String,
    pub output_shape: Vec<usize>,
    /// Time spent planning and running the session
    pub elapsed: Duration,
}

/// Standard-normal input of the given shape, reproducible from `seed`.
pub fn representative_input(shape: &[usize], seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.sample(StandardNormal))
}

/// Stage 1: the pretrained network, in evaluation mode.
pub fn acquire_model(settings: &Settings) -> Result<Model<Eval>, WeightsError> {
    let model = weights::load_pretrained(&settings.weights)?;
    info!("Acquired {} with {} parameters", model.name(), model.num_parameters());
    Ok(model.eval())
}

/// Stage 2: trace `model` at the shape of `sample` and write the artifact to `path`.
pub fn export_stage(model: &Model<Eval>, sample: &ArrayD<f32>, path: &Path) -> Result<ExportReport, ExportError> {
    onnx::export(model, sample, path, &ExportOptions::default())
}

/// Stage 3: reload the artifact, check it, and run it on `sample`.
///
/// The session rejects an output whose shape differs from the declared one
/// with `batch_size` bound to the batch of `sample`.
pub fn verify_stage(path: &Path, sample: &ArrayD<f32>) -> Result<Verification, ExportError> {
    let model = onnx::read_artifact(path)?;
    onnx::check_model(&model)?;
    info!("Artifact {} passed the structural check", path.display());

    let started = Instant::now();
    let session = InferenceSession::new(model)?;
    let input_name = match session.input_names().as_slice() {
        [name] => name.to_string(),
        names => {
            return Err(ExportError::SessionExecution(format!(
                "expected a single graph input, found {:?}",
                names
            )))
        }
    };
    let feeds = HashMap::from([(input_name, sample.clone())]);
    let outputs = session.run(&feeds)?;

    let output = outputs
        .first()
        .ok_or_else(|| ExportError::SessionExecution("session produced no outputs".to_string()))?;
    let verification = Verification {
        output_name: session.output_names().first().map(|name| name.to_string()).unwrap_or_default(),
        output_shape: output.shape().to_vec(),
        elapsed: started.elapsed(),
    };
    info!(
        "Verified {}: output {} has shape {:?} ({:.2?})",
        path.display(),
        verification.output_name,
        verification.output_shape,
        verification.elapsed
    );
    Ok(verification)
}

/// Renders a shape the way a Python tuple prints: `(1, 1000)`, `(5,)`, `()`.
pub fn format_tuple(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [single] => format!("({},)", single),
        _ => format!("({})", shape.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")),
    }
}

/// The introspection view of a model: its classifier head removed.
pub fn without_classifier(model: Model<Eval>) -> Model<Eval> {
    model.without_last_child()
}

/// One `name: descriptor` line per module, root first, in declaration order.
pub fn layer_listing<M: Mode>(model: &Model<M>) -> impl Iterator<Item = String> + '_ {
    model
        .named_modules()
        .map(|(name, module)| format!("{}: {}", name, module.descriptor()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EfficientNetConfig;

    #[test]
    fn test_format_tuple() {
        assert_eq!(format_tuple(&[1, 1000]), "(1, 1000)");
        assert_eq!(format_tuple(&[5]), "(5,)");
        assert_eq!(format_tuple(&[]), "()");
    }

    #[test]
    fn test_representative_input_is_reproducible() {
        let a = representative_input(&[1, 3, 4, 4], INPUT_SEED);
        let b = representative_input(&[1, 3, 4, 4], INPUT_SEED);
        assert_eq!(a, b);
        assert_eq!(a.shape(), &[1, 3, 4, 4]);
        assert!(a.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_layer_listing_starts_at_root() {
        let model = Model::from_config("b0", &EfficientNetConfig::b0(), 0).eval();
        let full: Vec<String> = layer_listing(&model).collect();
        assert_eq!(full[0], ": EfficientNet(3 children)");
        assert_eq!(full[1], "features: Sequential(9 children)");

        let truncated = without_classifier(model);
        let lines: Vec<String> = layer_listing(&truncated).collect();
        assert_eq!(lines[0], ": Sequential(2 children)");
        assert_eq!(lines[1], "0: Sequential(9 children)");
        assert_eq!(lines.last().map(String::as_str), Some("1: AdaptiveAvgPool2d(output_size=1)"));
        assert!(lines.iter().all(|line| !line.contains("Linear")));
    }
}

use std::collections::HashMap;
use std::fs;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use effnet_export::model::{EfficientNetConfig, Eval, Model};
use effnet_export::onnx::{self, format_shape, Dim, ExportOptions};
use effnet_export::pipeline::{self, INPUT_SEED};
use effnet_export::session::InferenceSession;
use effnet_export::ExportError;

fn tiny_model(seed: u64) -> Model<Eval> {
    let config = EfficientNetConfig {
        width_mult: 0.25,
        depth_mult: 0.5,
        num_classes: 10,
        ..EfficientNetConfig::b0()
    };
    Model::from_config("tiny", &config, seed).eval()
}

#[test]
fn test_export_then_verify() {
    let dir = tempfile::tempdir().unwrap();
    // Parent directories are created on demand
    let path = dir.path().join("models").join("model.onnx");
    let sample = pipeline::representative_input(&[1, 3, 32, 32], INPUT_SEED);

    let model = tiny_model(1);
    let report = pipeline::export_stage(&model, &sample, &path).unwrap();
    assert!(path.is_file());
    assert_eq!(report.model_loaded_at, model.loaded_at());
    assert!(report.exported_at >= report.model_loaded_at);
    assert_eq!(report.bytes as u64, fs::metadata(&path).unwrap().len());
    assert_eq!(report.inputs.len(), 1);
    assert_eq!(report.outputs[0].0, "output");

    let verification = pipeline::verify_stage(&path, &sample).unwrap();
    assert_eq!(verification.output_name, "output");
    assert_eq!(pipeline::format_tuple(&verification.output_shape), "(1, 10)");
}

#[test]
fn test_batch_axis_is_dynamic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.onnx");
    let sample = pipeline::representative_input(&[1, 3, 32, 32], INPUT_SEED);
    pipeline::export_stage(&tiny_model(2), &sample, &path).unwrap();

    let session = InferenceSession::new(onnx::read_artifact(&path).unwrap()).unwrap();
    for batch in 1..=3 {
        let input = pipeline::representative_input(&[batch, 3, 32, 32], batch as u64);
        let feeds = HashMap::from([("input".to_string(), input)]);
        let outputs = session.run(&feeds).unwrap();
        assert_eq!(outputs[0].shape(), &[batch, 10]);
    }
}

#[test]
fn test_rerun_overwrites_with_identical_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.onnx");
    let sample = pipeline::representative_input(&[1, 3, 32, 32], INPUT_SEED);
    let model = tiny_model(3);

    pipeline::export_stage(&model, &sample, &path).unwrap();
    let first = fs::read(&path).unwrap();
    let first_shape = pipeline::verify_stage(&path, &sample).unwrap().output_shape;

    pipeline::export_stage(&model, &sample, &path).unwrap();
    assert_eq!(fs::read(&path).unwrap(), first);
    assert_eq!(pipeline::verify_stage(&path, &sample).unwrap().output_shape, first_shape);
}

#[test]
fn test_damaged_artifacts_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.onnx");
    let sample = pipeline::representative_input(&[1, 3, 32, 32], INPUT_SEED);
    pipeline::export_stage(&tiny_model(4), &sample, &path).unwrap();
    let bytes = fs::read(&path).unwrap();

    let truncated = dir.path().join("truncated.onnx");
    fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();
    assert!(matches!(pipeline::verify_stage(&truncated, &sample), Err(ExportError::CorruptArtifact(_))));

    let garbage = dir.path().join("garbage.onnx");
    fs::write(&garbage, b"\x08\x96\x01\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff").unwrap();
    assert!(matches!(pipeline::verify_stage(&garbage, &sample), Err(ExportError::CorruptArtifact(_))));

    let empty = dir.path().join("empty.onnx");
    fs::write(&empty, b"").unwrap();
    assert!(matches!(pipeline::verify_stage(&empty, &sample), Err(ExportError::CorruptArtifact(_))));

    let missing = dir.path().join("missing.onnx");
    assert!(matches!(pipeline::verify_stage(&missing, &sample), Err(ExportError::Io(_))));
}

#[test]
fn test_random_byte_flips_never_panic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.onnx");
    let sample = pipeline::representative_input(&[1, 3, 32, 32], INPUT_SEED);
    pipeline::export_stage(&tiny_model(8), &sample, &path).unwrap();
    let pristine = fs::read(&path).unwrap();

    let damaged = dir.path().join("damaged.onnx");
    let mut rng = StdRng::seed_from_u64(2024);
    for trial in 0..48 {
        let mut bytes = pristine.clone();
        for _ in 0..4 {
            let at = rng.random_range(0..bytes.len());
            bytes[at] ^= rng.random_range(1..=255u8);
        }
        fs::write(&damaged, &bytes).unwrap();

        match pipeline::verify_stage(&damaged, &sample) {
            Ok(verification) => assert_eq!(verification.output_shape, vec![1, 10], "trial {}", trial),
            Err(ExportError::CorruptArtifact(_))
            | Err(ExportError::SchemaValidation(_))
            | Err(ExportError::SessionExecution(_)) => {}
            Err(other) => panic!("trial {}: unexpected error {:?}", trial, other),
        }
    }
}

#[test]
fn test_unwritable_destination_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-directory");
    fs::write(&blocker, b"file").unwrap();
    let sample = pipeline::representative_input(&[1, 3, 32, 32], INPUT_SEED);
    let err = pipeline::export_stage(&tiny_model(5), &sample, &blocker.join("model.onnx")).unwrap_err();
    assert!(matches!(err, ExportError::Io(_)));
}

#[test]
fn test_wrong_channel_count_is_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let sample = pipeline::representative_input(&[1, 1, 32, 32], INPUT_SEED);
    let err = pipeline::export_stage(&tiny_model(6), &sample, &dir.path().join("model.onnx")).unwrap_err();
    assert!(matches!(err, ExportError::ShapeMismatch(_)));
}

#[test]
fn test_folding_preserves_outputs() {
    let model = tiny_model(7);
    let input = pipeline::representative_input(&[2, 3, 32, 32], 99);
    let feeds = HashMap::from([("input".to_string(), input)]);

    let run = |options: &ExportOptions| {
        let proto = onnx::to_model_proto(&model, &[1, 3, 32, 32], options).unwrap();
        onnx::check_model(&proto).unwrap();
        InferenceSession::new(proto).unwrap().run(&feeds).unwrap().remove(0)
    };
    let folded = run(&ExportOptions::default());
    let unfolded = run(&ExportOptions { do_constant_folding: false, ..ExportOptions::default() });

    let scale = unfolded.iter().fold(1.0f32, |acc, v| acc.max(v.abs()));
    let diff = folded
        .iter()
        .zip(unfolded.iter())
        .fold(0.0f32, |acc, (a, b)| acc.max((a - b).abs()));
    assert!(diff <= 1e-3 * scale, "max difference {} at scale {}", diff, scale);
}

#[test]
fn test_b0_export_interface() {
    let model = Model::from_config("efficientnet_b0", &EfficientNetConfig::b0(), 0).eval();
    let proto = onnx::to_model_proto(&model, &pipeline::REPRESENTATIVE_INPUT_SHAPE, &ExportOptions::default()).unwrap();
    onnx::check_model(&proto).unwrap();

    let graph = proto.graph.as_ref().unwrap();
    let (_, input) = onnx::types::declared_shape(&graph.input[0]).unwrap();
    let (_, output) = onnx::types::declared_shape(&graph.output[0]).unwrap();
    assert_eq!(format_shape(&input), "batch_size × 3 × 512 × 512");
    assert_eq!(output, vec![Dim::Symbolic("batch_size".into()), Dim::Fixed(1000)]);
}

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info, warn};

use super::remap::{KeyMapper, KeyMapping};
use super::types::WeightsError;
use crate::model::{Mode, Model, Train};

/// Summary of a checkpoint load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    /// Tensors copied into the model
    pub loaded: usize,
    /// Bookkeeping entries skipped
    pub ignored: usize,
}

/// Copies every tensor of a safetensors checkpoint into `model`.
///
/// The load is strict: every checkpoint tensor must land on a model tensor of
/// the same shape, and every model tensor must be provided.
///
/// # Arguments
/// * `model` - Target model; weights are only loaded in training mode, before `eval()`
/// * `path` - Checkpoint file, memory-mapped while loading
/// * `mapper` - Translation from checkpoint keys to module-tree names
pub fn load_safetensors(model: &mut Model<Train>, path: &Path, mapper: &KeyMapper) -> Result<LoadReport, WeightsError> {
    let file = File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let tensors = SafeTensors::deserialize(&mmap)?;

    let expected: Vec<String> = model.named_tensors().map(|t| t.name).collect();
    let mut seen = HashSet::with_capacity(expected.len());
    let mut report = LoadReport { loaded: 0, ignored: 0 };

    for (key, view) in tensors.tensors() {
        let target = match mapper.map(&key) {
            KeyMapping::Tensor(target) => target,
            KeyMapping::Ignored => {
                report.ignored += 1;
                continue;
            }
        };

        if view.dtype() != Dtype::F32 {
            return Err(WeightsError::UnsupportedDtype {
                name: key,
                dtype: format!("{:?}", view.dtype()),
            });
        }

        let dest = model
            .tensor_mut(&target)
            .ok_or_else(|| WeightsError::UnknownKey(key.clone()))?;

        if dest.shape() != view.shape() {
            return Err(WeightsError::ShapeMismatch {
                name: target,
                expected: dest.shape().to_vec(),
                found: view.shape().to_vec(),
            });
        }

        let data = view.data();
        if data.len() != dest.len() * 4 {
            return Err(WeightsError::Format(format!(
                "{} holds {} bytes, expected {}",
                key,
                data.len(),
                dest.len() * 4
            )));
        }
        let slice = dest
            .as_slice_mut()
            .ok_or_else(|| WeightsError::Format(format!("{} is not contiguous in the model", target)))?;
        LittleEndian::read_f32_into(data, slice);

        debug!("Loaded {} -> {} {:?}", key, target, view.shape());
        seen.insert(target);
        report.loaded += 1;
    }

    let missing: Vec<String> = expected.into_iter().filter(|name| !seen.contains(name)).collect();
    if !missing.is_empty() {
        return Err(WeightsError::MissingKeys(missing));
    }

    if report.ignored > 0 {
        warn!("Ignored {} bookkeeping entries in {}", report.ignored, path.display());
    }
    info!("Loaded {} tensors from {}", report.loaded, path.display());
    Ok(report)
}

/// Writes every tensor of `model` to a safetensors file under its module-tree name.
pub fn save_safetensors<M: Mode>(model: &Model<M>, path: &Path) -> Result<(), WeightsError> {
    let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = model
        .named_tensors()
        .map(|tensor| {
            let values: Vec<f32> = tensor.value.iter().copied().collect();
            let mut bytes = vec![0u8; values.len() * 4];
            LittleEndian::write_f32_into(&values, &mut bytes);
            (tensor.name, tensor.value.shape().to_vec(), bytes)
        })
        .collect();

    let mut views = HashMap::with_capacity(encoded.len());
    for (name, shape, bytes) in &encoded {
        views.insert(name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    metadata.insert("model".to_string(), model.name().to_string());
    let serialized = safetensors::serialize(views, &Some(metadata))?;
    std::fs::write(path, serialized)?;
    Ok(())
}

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::efficientnet::EfficientNetConfig;
use super::layers::Layer;
use super::module::{Module, NamedModules, NamedTensor};

mod sealed {
    pub trait Sealed {}
}

/// Execution mode of a model handle, fixed at the type level.
pub trait Mode: sealed::Sealed {
    const TRAINING: bool;
    const NAME: &'static str;
}

/// Training mode: dropout and stochastic depth active, batch statistics updated.
#[derive(Debug, Clone, Copy)]
pub struct Train;

/// Evaluation mode: inference-only behavior, the only mode that can be exported.
#[derive(Debug, Clone, Copy)]
pub struct Eval;

impl sealed::Sealed for Train {}
impl sealed::Sealed for Eval {}

impl Mode for Train {
    const TRAINING: bool = true;
    const NAME: &'static str = "train";
}

impl Mode for Eval {
    const TRAINING: bool = false;
    const NAME: &'static str = "eval";
}

/// A model handle: the module tree of a network in a given mode.
///
/// Switching modes consumes the handle, so a training-mode model can never be
/// handed to code that expects inference behavior.
#[derive(Debug, Clone)]
pub struct Model<M: Mode> {
    /// Human-readable name of the network (e.g. "efficientnet_b0")
    name: String,
    root: Module,
    /// When the handle was created
    loaded_at: DateTime<Utc>,
    _mode: PhantomData<M>,
}

impl Model<Train> {
    /// Wraps a freshly constructed module tree; new models start in training mode.
    pub fn new(name: impl Into<String>, root: Module) -> Self {
        Self {
            name: name.into(),
            root,
            loaded_at: Utc::now(),
            _mode: PhantomData,
        }
    }

    /// Builds a network from `config` with weights drawn from a seeded generator.
    pub fn from_config(name: impl Into<String>, config: &EfficientNetConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new(name, config.build(&mut rng))
    }

    pub fn eval(self) -> Model<Eval> {
        tracing::debug!("Switching {} to evaluation mode", self.name);
        self.into_mode()
    }

    /// Mutable access to a parameter or buffer by qualified name, used for loading weights.
    pub fn tensor_mut(&mut self, qualified: &str) -> Option<&mut ArrayD<f32>> {
        self.root.tensor_mut(qualified)
    }
}

impl Model<Eval> {
    pub fn train(self) -> Model<Train> {
        tracing::debug!("Switching {} to training mode", self.name);
        self.into_mode()
    }
}

impl<M: Mode> Model<M> {
    fn into_mode<N: Mode>(self) -> Model<N> {
        Model {
            name: self.name,
            root: self.root,
            loaded_at: self.loaded_at,
            _mode: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Module {
        &self.root
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn is_training(&self) -> bool {
        M::TRAINING
    }

    pub fn mode_name(&self) -> &'static str {
        M::NAME
    }

    pub fn named_modules(&self) -> NamedModules<'_> {
        self.root.named_modules()
    }

    pub fn named_tensors(&self) -> impl Iterator<Item = NamedTensor<'_>> + '_ {
        self.root.named_tensors()
    }

    pub fn named_parameters(&self) -> impl Iterator<Item = NamedTensor<'_>> + '_ {
        self.root.named_parameters()
    }

    pub fn num_parameters(&self) -> usize {
        self.root.num_parameters()
    }

    /// Number of channels the first convolution expects, if the model has one.
    pub fn input_channels(&self) -> Option<usize> {
        self.named_modules().find_map(|(_, module)| match module.layer() {
            Layer::Conv2d(conv) => Some(conv.in_channels),
            _ => None,
        })
    }

    /// Drops the last top-level child and re-wraps the remaining ones in a
    /// `Sequential`, re-indexed from "0". Used to strip the classification head.
    pub fn without_last_child(self) -> Self {
        let mut children: Vec<Module> = self
            .root
            .into_children()
            .into_iter()
            .map(|(_, child)| child)
            .collect();
        children.pop();

        Model {
            name: self.name,
            root: Module::sequential(children),
            loaded_at: self.loaded_at,
            _mode: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::layers::ParamKind;

    fn tiny() -> EfficientNetConfig {
        EfficientNetConfig {
            width_mult: 0.25,
            depth_mult: 0.5,
            num_classes: 10,
            ..EfficientNetConfig::b0()
        }
    }

    #[test]
    fn test_mode_switching() {
        let model = Model::from_config("tiny", &tiny(), 0);
        assert!(model.is_training());
        let model = model.eval();
        assert!(!model.is_training());
        assert_eq!(model.mode_name(), "eval");
        assert!(model.train().is_training());
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = Model::from_config("a", &tiny(), 42);
        let b = Model::from_config("b", &tiny(), 42);
        let c = Model::from_config("c", &tiny(), 43);
        let first = |m: &Model<Train>| m.named_tensors().next().map(|t| t.value.clone());
        assert_eq!(first(&a), first(&b));
        assert_ne!(first(&a), first(&c));
    }

    #[test]
    fn test_without_last_child_drops_classifier() {
        let full = Model::from_config("tiny", &tiny(), 0).eval();
        let full_children = full.root().children().count();
        let full_params = full.num_parameters();
        let full_param_count = full.named_parameters().count();

        let truncated = full.without_last_child();
        assert_eq!(truncated.root().children().count(), full_children - 1);
        assert!(matches!(truncated.root().layer(), Layer::Sequential));
        assert!(truncated.root().get("0.0.0").is_some());
        assert!(truncated.root().get("2").is_none());

        // classifier.1 was 80 * 4 -> 320 features into 10 classes
        assert_eq!(full_params - truncated.num_parameters(), 320 * 10 + 10);
        assert_eq!(
            full_param_count - truncated.named_parameters().count(),
            2,
            "only the classifier weight and bias go away"
        );
        assert!(truncated.named_tensors().all(|t| t.kind == ParamKind::Buffer || t.name.starts_with("0.")));
    }

    #[test]
    fn test_input_channels() {
        let model = Model::from_config("tiny", &tiny(), 0);
        assert_eq!(model.input_channels(), Some(3));
    }
}

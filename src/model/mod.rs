pub mod efficientnet;
pub mod layers;
pub mod model;
pub mod module;

pub use efficientnet::{make_divisible, EfficientNetConfig, MBConvConfig};
pub use layers::{BatchNorm2d, Conv2d, Layer, Linear, ParamKind};
pub use model::{Eval, Mode, Model, Train};
pub use module::{Module, NamedModules, NamedTensor};

//! ResNet backbones with pretrained-weight loading.
//!
//! Provides the ResNet-18/34/50/101/152 family as burn modules together
//! with the plumbing needed to stand one up from a torchvision-style
//! checkpoint: a reader for safetensors and PyTorch pickle archives, a
//! name-and-shape-checked weight applier, and a download-and-cache
//! registry keyed by architecture.
//!
//! # Key types
//!
//! - [`ResNet`] / [`ResNetConfig`]: the backbone module and its config
//! - [`Backbone`]: capability trait exposing the feature map and its width
//! - [`WeightRegistry`]: architecture → URL table with a local cache
//! - [`WeightsError`]: typed failures of the weight pipeline

pub mod norm;
pub mod registry;
pub mod resnet;
pub mod weights;

pub use norm::{BatchNorm2d, BatchNorm2dConfig};
pub use registry::WeightRegistry;
pub use resnet::{Backbone, ResNet, ResNetArch, ResNetConfig, ResNetTrunk, ResidualBlock};
pub use weights::{read_checkpoint, strip_key_prefix, WeightMap, WeightTensor, WeightsError};

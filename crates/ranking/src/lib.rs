//! Deep-ranking triplet network over pretrained ResNet backbones.
//!
//! A backbone is truncated to an embedding network and shared across the
//! three legs of an (anchor, positive, negative) triple; an auxiliary
//! linear head turns each embedding into class probabilities. The
//! factory stands the whole thing up from random weights, a local
//! checkpoint, or a download-and-cache weight registry.
//!
//! # Key types
//!
//! - [`EmbeddingNet`]: truncated backbone mapping images to embeddings
//! - [`TripletNet`] / [`TripletNetConfig`]: shared-weight triplet wrapper
//! - [`TripletOutput`]: the six tensors of one triplet forward pass
//! - [`PretrainedSource`] / [`build_embedding_net`]: backbone factory

pub mod factory;
pub mod model;

pub use backbone::{ResNetArch, WeightRegistry};
pub use factory::{build_embedding_net, PretrainedSource};
pub use model::bridge::{embeddings_to_rows, images_to_tensor};
pub use model::embedding::EmbeddingNet;
pub use model::triplet::{TripletNet, TripletNetConfig, TripletOutput};

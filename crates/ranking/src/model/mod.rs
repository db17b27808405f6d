//! Model components: embedding network, triplet wrapper, tensor bridge.

pub mod bridge;
pub mod embedding;
pub mod triplet;

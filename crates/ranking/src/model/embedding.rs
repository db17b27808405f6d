//! Embedding network: a classification backbone truncated to its
//! feature extractor.

use backbone::{Backbone, ResNet, ResNetTrunk};
use burn::prelude::*;

/// A backbone with the classification head cut off, exposed as a
/// fixed-width embedding function.
///
/// Construction records the backbone's feature width as the embedding
/// dimension and drops the head entirely. With `freeze` set, every
/// remaining parameter is detached from gradient tracking, so optimizer
/// steps leave the backbone bit-identical.
///
/// ```text
/// images (batch, 3, h, w)
///   -> trunk features (batch, embedding_dim, 1, 1)
///   -> flatten        (batch, embedding_dim)
/// ```
#[derive(Module, Debug)]
pub struct EmbeddingNet<B: Backend> {
    /// Truncated backbone supplying the feature volume.
    pub features: ResNetTrunk<B>,
    embedding_dim: usize,
}

impl<B: Backend> EmbeddingNet<B> {
    /// Truncates `backbone` before its final linear layer.
    pub fn new(backbone: ResNet<B>, freeze: bool) -> Self {
        let trunk = backbone.trunk;
        let embedding_dim = trunk.feature_dim();
        let features = if freeze { trunk.no_grad() } else { trunk };

        tracing::info!(
            num_features = embedding_dim,
            frozen = freeze,
            "built embedding network"
        );
        EmbeddingNet {
            features,
            embedding_dim,
        }
    }

    /// Embeds a batch of images.
    ///
    /// Input shape: `(batch, 3, height, width)`
    /// Output shape: `(batch, embedding_dim)`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.features.forward_features(images);
        features.flatten::<2>(1, 3)
    }

    /// Width of the embedding vectors this network produces.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

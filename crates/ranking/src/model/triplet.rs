//! Triplet wrapper: one shared embedding network applied to each leg of
//! an (anchor, positive, negative) triple, plus an auxiliary classifier.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::model::embedding::EmbeddingNet;

/// Configuration for [`TripletNet`].
///
/// ```text
/// anchor / positive / negative (batch, 3, h, w)
///   -> shared embedding net -> embeddings  (batch, embedding_dim)
///   -> linear + softmax     -> class probs (batch, num_classes)
/// ```
///
/// Defaults target a 2048-wide backbone (ResNet-50 and deeper) and a
/// 201-class auxiliary vocabulary.
#[derive(Config, Debug)]
pub struct TripletNetConfig {
    /// Embedding width the classification head expects.
    #[config(default = 2048)]
    pub embedding_dim: usize,
    /// Output width of the auxiliary classification head.
    #[config(default = 201)]
    pub num_classes: usize,
}

/// Shared-weight triplet network with an auxiliary classification head.
///
/// All three legs run through the same [`EmbeddingNet`], so relative
/// distances between the outputs are meaningful; the head adds a
/// classification signal on top of each embedding.
#[derive(Module, Debug)]
pub struct TripletNet<B: Backend> {
    pub embedding_net: EmbeddingNet<B>,
    pub classifier: Linear<B>,
}

/// Output of one triplet forward pass.
///
/// Embeddings come straight off the shared embedding network; class
/// probabilities are softmax rows from the head applied to each
/// embedding.
#[derive(Debug, Clone)]
pub struct TripletOutput<B: Backend> {
    pub embedded_anchor: Tensor<B, 2>,
    pub embedded_positive: Tensor<B, 2>,
    pub embedded_negative: Tensor<B, 2>,
    pub class_probs_anchor: Tensor<B, 2>,
    pub class_probs_positive: Tensor<B, 2>,
    pub class_probs_negative: Tensor<B, 2>,
}

impl TripletNetConfig {
    /// Wraps an embedding network and a fresh classification head.
    ///
    /// The head is sized for `embedding_dim` inputs regardless of what
    /// `embedding_net` produces; a disagreement surfaces as a shape
    /// panic on the first forward pass.
    pub fn init<B: Backend>(
        &self,
        embedding_net: EmbeddingNet<B>,
        device: &B::Device,
    ) -> TripletNet<B> {
        if embedding_net.embedding_dim() != self.embedding_dim {
            tracing::warn!(
                embedding_dim = embedding_net.embedding_dim(),
                classifier_dim = self.embedding_dim,
                "embedding width does not match the classifier; forward passes will fail"
            );
        }

        TripletNet {
            embedding_net,
            classifier: LinearConfig::new(self.embedding_dim, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> TripletNet<B> {
    /// Embeds all three legs with the shared network and classifies each
    /// embedding.
    ///
    /// Input shapes: three of `(batch, 3, height, width)`. The three
    /// batch sizes are independent of each other.
    pub fn forward(
        &self,
        anchor: Tensor<B, 4>,
        positive: Tensor<B, 4>,
        negative: Tensor<B, 4>,
    ) -> TripletOutput<B> {
        let embedded_anchor = self.embedding_net.forward(anchor);
        let embedded_positive = self.embedding_net.forward(positive);
        let embedded_negative = self.embedding_net.forward(negative);

        let class_probs_anchor = self.classify(embedded_anchor.clone());
        let class_probs_positive = self.classify(embedded_positive.clone());
        let class_probs_negative = self.classify(embedded_negative.clone());

        TripletOutput {
            embedded_anchor,
            embedded_positive,
            embedded_negative,
            class_probs_anchor,
            class_probs_positive,
            class_probs_negative,
        }
    }

    /// Class probabilities for a batch of embeddings.
    ///
    /// Input shape: `(batch, embedding_dim)`
    /// Output shape: `(batch, num_classes)`, rows summing to one
    pub fn classify(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.classifier.forward(embeddings), 1)
    }
}

//! Backbone factory: stands up an embedding network from one of three
//! weight sources.

use std::path::PathBuf;

use anyhow::Context;
use backbone::{
    read_checkpoint, strip_key_prefix, ResNet, ResNetArch, ResNetConfig, WeightRegistry,
};
use burn::prelude::*;

use crate::model::embedding::EmbeddingNet;

/// Key prefix written by distributed-training wrappers.
const DISTRIBUTED_PREFIX: &str = "module.";

/// Where a backbone's parameters come from.
#[derive(Debug, Clone)]
pub enum PretrainedSource {
    /// Randomly initialized parameters.
    Random,
    /// Download (and cache) the architecture's published weights.
    Registry(WeightRegistry),
    /// A local checkpoint. `num_classes` is the width of the
    /// classification head the checkpoint was trained with; it must
    /// match for the head weights to apply before truncation.
    Checkpoint { path: PathBuf, num_classes: usize },
}

/// Builds an [`EmbeddingNet`] for `arch` with weights drawn from
/// `source`, optionally freezing the backbone.
pub fn build_embedding_net<B: Backend>(
    arch: ResNetArch,
    source: &PretrainedSource,
    freeze: bool,
    device: &B::Device,
) -> anyhow::Result<EmbeddingNet<B>> {
    let backbone = build_backbone(arch, source, device)?;
    Ok(EmbeddingNet::new(backbone, freeze))
}

fn build_backbone<B: Backend>(
    arch: ResNetArch,
    source: &PretrainedSource,
    device: &B::Device,
) -> anyhow::Result<ResNet<B>> {
    match source {
        PretrainedSource::Random => {
            tracing::info!(%arch, "building randomly initialized backbone");
            Ok(ResNetConfig::new(arch).init(device))
        }
        PretrainedSource::Registry(registry) => {
            let path = registry
                .fetch(arch)
                .with_context(|| format!("fetching pretrained weights for {arch}"))?;
            let map = read_checkpoint(&path)
                .with_context(|| format!("decoding checkpoint {}", path.display()))?;
            tracing::info!(%arch, tensors = map.len(), "loaded registry weights");
            ResNetConfig::new(arch)
                .init(device)
                .load_weight_map(&map, device)
                .with_context(|| format!("applying registry weights for {arch}"))
        }
        PretrainedSource::Checkpoint { path, num_classes } => {
            let map = read_checkpoint(path)
                .with_context(|| format!("decoding checkpoint {}", path.display()))?;
            let map = strip_key_prefix(map, DISTRIBUTED_PREFIX);
            tracing::info!(
                %arch,
                num_classes = *num_classes,
                tensors = map.len(),
                "loaded local checkpoint"
            );
            ResNetConfig::new(arch)
                .with_num_classes(*num_classes)
                .init(device)
                .load_weight_map(&map, device)
                .with_context(|| format!("applying checkpoint {}", path.display()))
        }
    }
}

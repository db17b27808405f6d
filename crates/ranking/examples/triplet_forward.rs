//! Build a triplet network and run one forward pass on random images.
//!
//! Usage:
//!   cargo run -p ranking --example triplet_forward -- --arch resnet18
//!   cargo run -p ranking --example triplet_forward -- --arch resnet50 --freeze \
//!       --weights-cache ~/.cache/ranking-weights
//!
//! With `--weights-cache` set, pretrained torchvision weights are
//! downloaded (once) and applied; otherwise the backbone is random.

use std::path::PathBuf;

use burn::backend::ndarray::NdArray;
use burn::prelude::*;
use burn::tensor::Distribution;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ranking::{
    build_embedding_net, PretrainedSource, ResNetArch, TripletNetConfig, WeightRegistry,
};

type B = NdArray<f32>;

#[derive(Parser)]
struct Args {
    /// Backbone architecture (resnet18 | resnet34 | resnet50 | resnet101 | resnet152).
    #[arg(long, default_value = "resnet50")]
    arch: ResNetArch,
    /// Freeze the backbone after construction.
    #[arg(long)]
    freeze: bool,
    /// Cache directory for pretrained weights; enables downloading.
    #[arg(long)]
    weights_cache: Option<PathBuf>,
    /// Batch size of the demo triplet.
    #[arg(long, default_value_t = 2)]
    batch: usize,
    /// Height and width of the demo images.
    #[arg(long, default_value_t = 224)]
    image_size: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device = Default::default();

    let source = match &args.weights_cache {
        Some(cache) => PretrainedSource::Registry(WeightRegistry::new(cache)),
        None => PretrainedSource::Random,
    };
    let embedding = build_embedding_net::<B>(args.arch, &source, args.freeze, &device)?;
    let embedding_dim = embedding.embedding_dim();

    let model = TripletNetConfig::new()
        .with_embedding_dim(embedding_dim)
        .init(embedding, &device);

    let images = || {
        Tensor::<B, 4>::random(
            [args.batch, 3, args.image_size, args.image_size],
            Distribution::Normal(0.0, 1.0),
            &device,
        )
    };
    let output = model.forward(images(), images(), images());

    println!("arch:            {}", args.arch);
    println!("embedding dim:   {embedding_dim}");
    println!("embedded anchor: {:?}", output.embedded_anchor.dims());
    println!("class probs:     {:?}", output.class_probs_anchor.dims());

    let row_sums = output
        .class_probs_anchor
        .sum_dim(1)
        .reshape([args.batch])
        .into_data()
        .to_vec::<f32>()
        .unwrap();
    println!("prob row sums:   {row_sums:?}");

    Ok(())
}

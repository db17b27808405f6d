//! Integration tests for the checkpoint pipeline: export, serialize,
//! read back, apply, and fetch through the registry cache.

use std::path::Path;

use burn::backend::ndarray::NdArray;
use burn::prelude::*;
use burn::tensor::Distribution;
use safetensors::tensor::{Dtype, TensorView};
use tempfile::TempDir;

use backbone::{
    read_checkpoint, strip_key_prefix, Backbone, ResNetArch, ResNetConfig, WeightMap,
    WeightRegistry, WeightsError,
};

type TestBackend = NdArray<f32>;

// ---- Helpers ----

fn resnet18(num_classes: usize) -> backbone::ResNet<TestBackend> {
    ResNetConfig::new(ResNetArch::ResNet18)
        .with_num_classes(num_classes)
        .init(&Default::default())
}

fn random_images(batch: usize) -> Tensor<TestBackend, 4> {
    Tensor::random(
        [batch, 3, 32, 32],
        Distribution::Normal(0.0, 1.0),
        &Default::default(),
    )
}

fn write_safetensors(path: &Path, map: &WeightMap) {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = map
        .iter()
        .map(|(name, tensor)| {
            let bytes = tensor.data.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.clone(), tensor.shape.clone(), bytes)
        })
        .collect();
    let views: Vec<(&str, TensorView)> = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            (
                name.as_str(),
                TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
            )
        })
        .collect();
    safetensors::serialize_to_file(views, &None, path).unwrap();
}

fn max_abs_diff(a: Tensor<TestBackend, 2>, b: Tensor<TestBackend, 2>) -> f32 {
    (a - b).abs().max().into_scalar()
}

// ---- Test 1: weights survive a file round trip ----

#[test]
fn test_checkpoint_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("resnet18.safetensors");

    let model = resnet18(1000);
    write_safetensors(&path, &model.to_weight_map());

    let map = read_checkpoint(&path).unwrap();
    let loaded = resnet18(1000)
        .load_weight_map(&map, &Default::default())
        .unwrap();

    let images = random_images(2);
    let diff = max_abs_diff(model.forward(images.clone()), loaded.forward(images));
    assert!(diff < 1e-5, "outputs diverged after round trip: {}", diff);
}

// ---- Test 2: head-size mismatch is reported, not papered over ----

#[test]
fn test_load_rejects_wrong_head_width() {
    let map = resnet18(1000).to_weight_map();

    let err = resnet18(365)
        .load_weight_map(&map, &Default::default())
        .unwrap_err();

    match err {
        WeightsError::ShapeMismatch { name, .. } => {
            assert!(name.starts_with("fc."), "mismatch should be in the head, got {name}");
        }
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
}

// ---- Test 2b: garbage bytes are a decode error, not a panic ----

#[test]
fn test_undecodable_checkpoint_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("weights.pth");
    std::fs::write(&path, b"not a pickle archive").unwrap();

    let err = read_checkpoint(&path).unwrap_err();

    assert!(matches!(err, WeightsError::Checkpoint { .. }), "got {err:?}");
}

// ---- Test 3: distributed-training prefixes strip cleanly ----

#[test]
fn test_module_prefix_round_trip() {
    let map = resnet18(1000).to_weight_map();
    let prefixed: WeightMap = map
        .iter()
        .map(|(key, tensor)| (format!("module.{key}"), tensor.clone()))
        .collect();

    let stripped = strip_key_prefix(prefixed, "module.");

    assert_eq!(stripped.len(), map.len());
    assert!(stripped.keys().eq(map.keys()));
}

// ---- Test 4: registry fetch + decode + apply, fully offline ----

#[test]
fn test_registry_cache_feeds_loader() {
    let dir = TempDir::new().unwrap();
    let model = resnet18(1000);

    // Seed the cache slot by hand; the URL host never resolves, so a
    // hit proves fetch went through the cache.
    let cached_dir = dir.path().join("resnet18");
    std::fs::create_dir_all(&cached_dir).unwrap();
    write_safetensors(
        &cached_dir.join("resnet18.safetensors"),
        &model.to_weight_map(),
    );

    let registry = WeightRegistry::empty(dir.path()).with_url(
        ResNetArch::ResNet18,
        "https://weights.invalid/files/resnet18.safetensors",
    );

    let path = registry.fetch(ResNetArch::ResNet18).unwrap();
    let map = read_checkpoint(&path).unwrap();
    let loaded = resnet18(1000)
        .load_weight_map(&map, &Default::default())
        .unwrap();

    assert_eq!(loaded.feature_dim(), 512);
    let images = random_images(1);
    let diff = max_abs_diff(model.forward(images.clone()), loaded.forward(images));
    assert!(diff < 1e-5, "cached weights diverged: {}", diff);
}

// ---- Test 5: live torchvision download (network) ----

#[test]
#[ignore = "downloads ~45 MB from download.pytorch.org"]
fn test_fetch_torchvision_resnet18() {
    let dir = TempDir::new().unwrap();
    let registry = WeightRegistry::new(dir.path());

    let path = registry.fetch(ResNetArch::ResNet18).unwrap();
    assert!(path.is_file());

    let map = read_checkpoint(&path).unwrap();
    let model = resnet18(1000)
        .load_weight_map(&map, &Default::default())
        .unwrap();

    // A real pretrained model should produce finite logits.
    let logits = model.forward(random_images(1));
    let mean = logits.mean().into_scalar();
    assert!(mean.is_finite(), "logits mean is {}", mean);
}

//! The torchvision ResNet family as burn modules.
//!
//! Architecture, layer naming and parameter shapes mirror the reference
//! models exactly so that published checkpoints apply without remapping:
//! a 7x7 stem, four stages of residual blocks, global average pooling and
//! a linear classification head.
//!
//! ```text
//! images (batch, 3, h, w)
//!   -> conv1 7x7/2 -> bn1 -> relu -> maxpool 3x3/2
//!   -> layer1 .. layer4          (residual stages)
//!   -> avgpool                   (batch, feature_dim, 1, 1)
//!   -> flatten -> fc             (batch, num_classes)
//! ```

use std::fmt;
use std::str::FromStr;

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{
    AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig,
};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

use crate::norm::{BatchNorm2d, BatchNorm2dConfig};
use crate::weights::WeightsError;

/// Capability trait for image backbones that expose a pooled feature map.
///
/// Implemented by [`ResNet`]; anything embedding-shaped downstream talks
/// to this trait rather than to a concrete architecture.
pub trait Backbone<B: Backend> {
    /// Feature volume for a batch of images, pooled to 1x1 spatial size.
    ///
    /// Input shape: `(batch, 3, height, width)`
    /// Output shape: `(batch, feature_dim, 1, 1)`
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Channel width of the [`forward_features`](Backbone::forward_features) output.
    fn feature_dim(&self) -> usize;
}

/// The five torchvision ResNet depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResNetArch {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
}

impl ResNetArch {
    pub const ALL: [ResNetArch; 5] = [
        ResNetArch::ResNet18,
        ResNetArch::ResNet34,
        ResNetArch::ResNet50,
        ResNetArch::ResNet101,
        ResNetArch::ResNet152,
    ];

    /// Canonical lowercase name, e.g. `"resnet50"`.
    pub fn name(&self) -> &'static str {
        match self {
            ResNetArch::ResNet18 => "resnet18",
            ResNetArch::ResNet34 => "resnet34",
            ResNetArch::ResNet50 => "resnet50",
            ResNetArch::ResNet101 => "resnet101",
            ResNetArch::ResNet152 => "resnet152",
        }
    }

    /// Blocks per stage, `[layer1, layer2, layer3, layer4]`.
    pub fn block_counts(&self) -> [usize; 4] {
        match self {
            ResNetArch::ResNet18 => [2, 2, 2, 2],
            ResNetArch::ResNet34 => [3, 4, 6, 3],
            ResNetArch::ResNet50 => [3, 4, 6, 3],
            ResNetArch::ResNet101 => [3, 4, 23, 3],
            ResNetArch::ResNet152 => [3, 8, 36, 3],
        }
    }

    /// Whether stages use the three-conv bottleneck block (depth >= 50).
    pub fn is_bottleneck(&self) -> bool {
        matches!(
            self,
            ResNetArch::ResNet50 | ResNetArch::ResNet101 | ResNetArch::ResNet152
        )
    }

    /// Channel expansion of a block's output over its base width.
    pub fn expansion(&self) -> usize {
        if self.is_bottleneck() {
            4
        } else {
            1
        }
    }

    /// Width of the final feature map: 512 for basic-block depths,
    /// 2048 for bottleneck depths.
    pub fn feature_dim(&self) -> usize {
        512 * self.expansion()
    }
}

impl fmt::Display for ResNetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResNetArch {
    type Err = WeightsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resnet18" => Ok(ResNetArch::ResNet18),
            "resnet34" => Ok(ResNetArch::ResNet34),
            "resnet50" => Ok(ResNetArch::ResNet50),
            "resnet101" => Ok(ResNetArch::ResNet101),
            "resnet152" => Ok(ResNetArch::ResNet152),
            other => Err(WeightsError::UnknownArch(other.to_string())),
        }
    }
}

/// Configuration for [`ResNet`].
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Which depth to build.
    pub arch: ResNetArch,
    /// Output width of the classification head.
    #[config(default = 1000)]
    pub num_classes: usize,
}

/// 1x1 strided projection that matches the skip connection to a block's
/// output shape. Checkpoint keys `downsample.0` (conv) and `downsample.1`
/// (norm).
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm2d<B>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Downsample {
            conv: conv2d(in_channels, out_channels, 1, stride, 0, device),
            bn: BatchNorm2dConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(input))
    }
}

/// One residual block, basic or bottleneck.
///
/// Basic blocks (ResNet-18/34) run `conv1 3x3 -> conv2 3x3`; bottleneck
/// blocks (ResNet-50 and deeper) run `conv1 1x1 -> conv2 3x3 -> conv3 1x1`
/// with the stride on the 3x3 conv. `conv3`/`bn3` are `None` exactly when
/// the block is basic.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm2d<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm2d<B>,
    pub conv3: Option<Conv2d<B>>,
    pub bn3: Option<BatchNorm2d<B>>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn basic(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        ResidualBlock {
            conv1: conv2d(in_channels, width, 3, stride, 1, device),
            bn1: BatchNorm2dConfig::new(width).init(device),
            conv2: conv2d(width, width, 3, 1, 1, device),
            bn2: BatchNorm2dConfig::new(width).init(device),
            conv3: None,
            bn3: None,
            downsample: projection(in_channels, width, stride, device),
        }
    }

    fn bottleneck(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = width * 4;
        ResidualBlock {
            conv1: conv2d(in_channels, width, 1, 1, 0, device),
            bn1: BatchNorm2dConfig::new(width).init(device),
            conv2: conv2d(width, width, 3, stride, 1, device),
            bn2: BatchNorm2dConfig::new(width).init(device),
            conv3: Some(conv2d(width, out_channels, 1, 1, 0, device)),
            bn3: Some(BatchNorm2dConfig::new(out_channels).init(device)),
            downsample: projection(in_channels, out_channels, stride, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(input.clone()),
            None => input.clone(),
        };

        let x = relu(self.bn1.forward(self.conv1.forward(input)));
        let x = self.bn2.forward(self.conv2.forward(x));
        let x = match (&self.conv3, &self.bn3) {
            (Some(conv3), Some(bn3)) => bn3.forward(conv3.forward(relu(x))),
            _ => x,
        };

        relu(x + identity)
    }
}

/// Everything before the classification head: stem, residual stages and
/// global pooling. This is the piece embedding models keep when they
/// truncate a classifier.
#[derive(Module, Debug)]
pub struct ResNetTrunk<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm2d<B>,
    pub maxpool: MaxPool2d,
    pub layer1: Vec<ResidualBlock<B>>,
    pub layer2: Vec<ResidualBlock<B>>,
    pub layer3: Vec<ResidualBlock<B>>,
    pub layer4: Vec<ResidualBlock<B>>,
    pub avgpool: AdaptiveAvgPool2d,
    feature_dim: usize,
}

/// Residual ResNet backbone: trunk plus classification head.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub trunk: ResNetTrunk<B>,
    pub fc: Linear<B>,
}

impl ResNetConfig {
    /// Initialize with randomly initialized parameters.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let counts = self.arch.block_counts();
        let bottleneck = self.arch.is_bottleneck();

        let mut in_channels = 64;
        let mut stage = |width: usize, blocks: usize, stride: usize| {
            let (layer, out_channels) =
                make_layer(bottleneck, in_channels, width, blocks, stride, device);
            in_channels = out_channels;
            layer
        };

        let layer1 = stage(64, counts[0], 1);
        let layer2 = stage(128, counts[1], 2);
        let layer3 = stage(256, counts[2], 2);
        let layer4 = stage(512, counts[3], 2);

        let trunk = ResNetTrunk {
            conv1: conv2d(3, 64, 7, 2, 3, device),
            bn1: BatchNorm2dConfig::new(64).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            feature_dim: self.arch.feature_dim(),
        };

        ResNet {
            trunk,
            fc: LinearConfig::new(self.arch.feature_dim(), self.num_classes).init(device),
        }
    }
}

impl<B: Backend> ResNet<B> {
    /// Class logits for a batch of images.
    ///
    /// Input shape: `(batch, 3, height, width)`
    /// Output shape: `(batch, num_classes)`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.trunk.forward_features(images);
        let flat = features.flatten::<2>(1, 3);
        self.fc.forward(flat)
    }
}

impl<B: Backend> Backbone<B> for ResNetTrunk<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let x = self.maxpool.forward(x);

        let x = forward_stage(&self.layer1, x);
        let x = forward_stage(&self.layer2, x);
        let x = forward_stage(&self.layer3, x);
        let x = forward_stage(&self.layer4, x);

        self.avgpool.forward(x)
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

impl<B: Backend> Backbone<B> for ResNet<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.trunk.forward_features(images)
    }

    fn feature_dim(&self) -> usize {
        self.trunk.feature_dim
    }
}

/// One stage of residual blocks. The first block carries the stride and
/// (when shapes change) the downsample projection; the rest are identity.
fn make_layer<B: Backend>(
    bottleneck: bool,
    in_channels: usize,
    width: usize,
    blocks: usize,
    stride: usize,
    device: &B::Device,
) -> (Vec<ResidualBlock<B>>, usize) {
    let expansion = if bottleneck { 4 } else { 1 };
    let out_channels = width * expansion;

    let block = |in_c: usize, stride: usize| {
        if bottleneck {
            ResidualBlock::bottleneck(in_c, width, stride, device)
        } else {
            ResidualBlock::basic(in_c, width, stride, device)
        }
    };

    let mut layer = Vec::with_capacity(blocks);
    layer.push(block(in_channels, stride));
    for _ in 1..blocks {
        layer.push(block(out_channels, 1));
    }

    (layer, out_channels)
}

fn forward_stage<B: Backend>(blocks: &[ResidualBlock<B>], input: Tensor<B, 4>) -> Tensor<B, 4> {
    blocks.iter().fold(input, |x, block| block.forward(x))
}

fn conv2d<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

fn projection<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> Option<Downsample<B>> {
    if stride != 1 || in_channels != out_channels {
        Some(Downsample::new(in_channels, out_channels, stride, device))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn random_images(batch: usize, size: usize) -> Tensor<TestBackend, 4> {
        Tensor::random(
            [batch, 3, size, size],
            Distribution::Normal(0.0, 1.0),
            &Default::default(),
        )
    }

    #[test]
    fn test_arch_table() {
        for arch in ResNetArch::ALL {
            let parsed: ResNetArch = arch.name().parse().unwrap();
            assert_eq!(parsed, arch, "name round-trip failed for {}", arch);
        }

        assert_eq!(ResNetArch::ResNet18.block_counts(), [2, 2, 2, 2]);
        assert_eq!(ResNetArch::ResNet34.block_counts(), [3, 4, 6, 3]);
        assert_eq!(ResNetArch::ResNet101.block_counts(), [3, 4, 23, 3]);
        assert_eq!(ResNetArch::ResNet152.block_counts(), [3, 8, 36, 3]);

        assert_eq!(ResNetArch::ResNet34.feature_dim(), 512);
        assert_eq!(ResNetArch::ResNet50.feature_dim(), 2048);
        assert!(!ResNetArch::ResNet34.is_bottleneck());
        assert!(ResNetArch::ResNet152.is_bottleneck());

        assert!("resnet20".parse::<ResNetArch>().is_err());
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetArch::ResNet18).init::<TestBackend>(&device);

        let logits = model.forward(random_images(2, 64));

        assert_eq!(logits.dims(), [2, 1000]);
    }

    #[test]
    fn test_forward_features_shape() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetArch::ResNet18).init::<TestBackend>(&device);

        let features = model.forward_features(random_images(2, 64));

        assert_eq!(features.dims(), [2, 512, 1, 1]);
        assert_eq!(model.feature_dim(), 512);
    }

    #[test]
    fn test_custom_num_classes() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetArch::ResNet18)
            .with_num_classes(365)
            .init::<TestBackend>(&device);

        let logits = model.forward(random_images(1, 64));

        assert_eq!(logits.dims(), [1, 365]);
    }

    #[test]
    fn test_parameter_count_resnet18() {
        // Reference torchvision count, classification head included.
        let device = Default::default();
        let model = ResNetConfig::new(ResNetArch::ResNet18).init::<TestBackend>(&device);

        assert_eq!(model.num_params(), 11_689_512);
        // Head is 512 * 1000 weights + 1000 biases.
        assert_eq!(model.trunk.num_params(), 11_689_512 - 513_000);
    }

    #[test]
    fn test_parameter_count_resnet50() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetArch::ResNet50).init::<TestBackend>(&device);

        assert_eq!(model.num_params(), 25_557_032);
    }

    #[test]
    fn test_downsample_placement() {
        let device = Default::default();

        // Basic depths: layer1 keeps 64 channels at stride 1, so no
        // projection; every later stage starts with one.
        let model = ResNetConfig::new(ResNetArch::ResNet18).init::<TestBackend>(&device);
        assert!(model.trunk.layer1[0].downsample.is_none());
        assert!(model.trunk.layer2[0].downsample.is_some());
        assert!(model.trunk.layer2[1].downsample.is_none());

        // Bottleneck depths widen 64 -> 256 already in layer1.
        let model = ResNetConfig::new(ResNetArch::ResNet50).init::<TestBackend>(&device);
        assert!(model.trunk.layer1[0].downsample.is_some());
        assert!(model.trunk.layer1[0].conv3.is_some());
    }
}

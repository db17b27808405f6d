//! Inference-mode 2D batch normalization.
//!
//! Pretrained backbones here are feature extractors, not recipients of
//! further norm-statistic updates, so this layer always normalizes with
//! the stored running statistics. The statistics are module constants:
//! they never receive gradients and survive `no_grad` untouched, which
//! keeps the forward pass a pure function of (input, stored state).

use burn::module::Param;
use burn::prelude::*;

/// Configuration for [`BatchNorm2d`].
#[derive(Config, Debug)]
pub struct BatchNorm2dConfig {
    /// Number of channels normalized independently.
    pub num_channels: usize,
    /// Added to the running variance for numerical stability.
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

/// Per-channel affine normalization over `(batch, channel, height, width)`
/// input using frozen running statistics.
#[derive(Module, Debug)]
pub struct BatchNorm2d<B: Backend> {
    /// Learned per-channel scale, shape `(num_channels,)`.
    pub gamma: Param<Tensor<B, 1>>,
    /// Learned per-channel shift, shape `(num_channels,)`.
    pub beta: Param<Tensor<B, 1>>,
    /// Running mean captured during the original training, shape `(num_channels,)`.
    pub running_mean: Tensor<B, 1>,
    /// Running variance captured during the original training, shape `(num_channels,)`.
    pub running_var: Tensor<B, 1>,
    epsilon: f64,
}

impl BatchNorm2dConfig {
    /// Initialize to the identity transform: unit scale, zero shift,
    /// zero mean, unit variance.
    pub fn init<B: Backend>(&self, device: &B::Device) -> BatchNorm2d<B> {
        let c = self.num_channels;
        BatchNorm2d {
            gamma: Param::from_tensor(Tensor::ones([c], device)),
            beta: Param::from_tensor(Tensor::zeros([c], device)),
            running_mean: Tensor::zeros([c], device),
            running_var: Tensor::ones([c], device),
            epsilon: self.epsilon,
        }
    }
}

impl<B: Backend> BatchNorm2d<B> {
    /// Applies `gamma * (x - mean) / sqrt(var + epsilon) + beta` per channel.
    ///
    /// Input shape: `(batch, num_channels, height, width)`
    /// Output shape: `(batch, num_channels, height, width)`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = input.dims();

        // (c,) -> (1, c, 1, 1) so the per-channel terms broadcast over
        // batch and spatial dims.
        let shape = [1, channels, 1, 1];
        let mean = self.running_mean.clone().reshape(shape);
        let var = self.running_var.clone().reshape(shape);
        let gamma = self.gamma.val().reshape(shape);
        let beta = self.beta.val().reshape(shape);

        let normalized = (input - mean) / (var + self.epsilon).sqrt();
        normalized * gamma + beta
    }

    /// Number of channels this layer normalizes.
    pub fn num_channels(&self) -> usize {
        self.gamma.val().dims()[0]
    }
}

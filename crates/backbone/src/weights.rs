//! Checkpoint decoding and weight application.
//!
//! Checkpoints arrive either as safetensors files or as PyTorch pickle
//! archives (`.pth`, `.pth.tar`). Both are decoded into a flat
//! [`WeightMap`] of f32 tensors keyed by torchvision parameter names,
//! then applied onto a freshly built [`ResNet`] with every name and
//! shape checked before any parameter is replaced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::TensorData;

use crate::norm::BatchNorm2d;
use crate::resnet::{ResNet, ResNetArch, ResidualBlock};

/// Flat parameter-name → tensor view of a checkpoint.
pub type WeightMap = BTreeMap<String, WeightTensor>;

/// Raw tensor lifted out of a checkpoint: shape plus row-major f32 data.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Failures of the pretrained-weight pipeline, from download to
/// parameter application.
#[derive(Debug, thiserror::Error)]
pub enum WeightsError {
    #[error("unknown resnet architecture '{0}'")]
    UnknownArch(String),
    #[error("no pretrained weights url registered for {0}")]
    UnregisteredArch(ResNetArch),
    #[error("invalid weights url '{0}'")]
    InvalidUrl(String),
    #[error("failed to read registry table {path:?}: {message}")]
    RegistryTable { path: PathBuf, message: String },
    #[error("failed to download weights from {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("weights download from {url} failed with http status {status}")]
    Http { url: String, status: u16 },
    #[error("failed to decode checkpoint {path:?}: {message}")]
    Checkpoint { path: PathBuf, message: String },
    #[error("checkpoint has no parameter '{0}'")]
    MissingParam(String),
    #[error("checkpoint parameter '{name}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads a checkpoint file into a [`WeightMap`].
///
/// The format is picked from the extension: `.safetensors` for
/// safetensors, `.pth`/`.pt`/`.tar`/`.bin` for PyTorch pickle archives.
/// Tensors of any dtype are converted to f32. Training checkpoints that
/// wrap their parameters in a `state_dict` entry are unwrapped.
pub fn read_checkpoint(path: &Path) -> Result<WeightMap, WeightsError> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let tensors: Vec<(String, candle_core::Tensor)> = match extension {
        "safetensors" => candle_core::safetensors::load(path, &candle_core::Device::Cpu)
            .map_err(|e| decode_error(path, &e))?
            .into_iter()
            .collect(),
        "pth" | "pt" | "tar" | "bin" => {
            candle_core::pickle::read_all(path).map_err(|e| decode_error(path, &e))?
        }
        other => {
            return Err(WeightsError::Checkpoint {
                path: path.to_path_buf(),
                message: format!("unsupported checkpoint extension {other:?}"),
            })
        }
    };

    if tensors.is_empty() {
        return Err(WeightsError::Checkpoint {
            path: path.to_path_buf(),
            message: "no tensors found".to_string(),
        });
    }

    let mut map = WeightMap::new();
    for (name, tensor) in tensors {
        let shape = tensor.dims().to_vec();
        let data = tensor
            .to_dtype(candle_core::DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| decode_error(path, &e))?;
        map.insert(name, WeightTensor { shape, data });
    }

    let map = strip_key_prefix(map, "state_dict.");
    tracing::debug!(path = %path.display(), tensors = map.len(), "read checkpoint");
    Ok(map)
}

fn decode_error(path: &Path, err: &candle_core::Error) -> WeightsError {
    WeightsError::Checkpoint {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Removes `prefix` from every key that carries it; other keys pass
/// through unchanged. Used to undo the `"module."` prefix written by
/// distributed-training wrappers.
pub fn strip_key_prefix(map: WeightMap, prefix: &str) -> WeightMap {
    let mut stripped = 0usize;
    let map: WeightMap = map
        .into_iter()
        .map(|(key, tensor)| {
            let key = match key.strip_prefix(prefix) {
                Some(rest) => {
                    stripped += 1;
                    rest.to_string()
                }
                None => key,
            };
            (key, tensor)
        })
        .collect();

    if stripped > 0 {
        tracing::debug!(prefix, stripped, "stripped checkpoint key prefix");
    }
    map
}

impl<B: Backend> ResNet<B> {
    /// Replaces every parameter and running statistic with the matching
    /// checkpoint entry.
    ///
    /// Keys follow torchvision naming (`conv1.weight`, `layer3.1.bn2.bias`,
    /// `layer1.0.downsample.0.weight`, ...). Linear weights are stored
    /// `(out, in)` in checkpoints and transposed on the way in. Checkpoint
    /// entries with no matching parameter, such as `num_batches_tracked`
    /// counters, are ignored.
    pub fn load_weight_map(
        mut self,
        map: &WeightMap,
        device: &B::Device,
    ) -> Result<Self, WeightsError> {
        let mut loader = MapLoader {
            map,
            device,
            used: 0,
        };

        self.trunk.conv1 = loader.conv(self.trunk.conv1, "conv1")?;
        self.trunk.bn1 = loader.norm(self.trunk.bn1, "bn1")?;
        self.trunk.layer1 = loader.stage(self.trunk.layer1, "layer1")?;
        self.trunk.layer2 = loader.stage(self.trunk.layer2, "layer2")?;
        self.trunk.layer3 = loader.stage(self.trunk.layer3, "layer3")?;
        self.trunk.layer4 = loader.stage(self.trunk.layer4, "layer4")?;
        self.fc = loader.linear(self.fc, "fc")?;

        let unused = map.len().saturating_sub(loader.used);
        if unused > 0 {
            tracing::debug!(unused, "ignored checkpoint entries with no matching parameter");
        }
        tracing::debug!(applied = loader.used, "applied checkpoint weights");
        Ok(self)
    }

    /// Inverse of [`load_weight_map`](ResNet::load_weight_map): exports
    /// parameters and running statistics under torchvision names, linear
    /// weights transposed back to `(out, in)`.
    pub fn to_weight_map(&self) -> WeightMap {
        let mut map = WeightMap::new();

        put_conv(&mut map, "conv1", &self.trunk.conv1);
        put_norm(&mut map, "bn1", &self.trunk.bn1);
        put_stage(&mut map, "layer1", &self.trunk.layer1);
        put_stage(&mut map, "layer2", &self.trunk.layer2);
        put_stage(&mut map, "layer3", &self.trunk.layer3);
        put_stage(&mut map, "layer4", &self.trunk.layer4);
        put_entry(&mut map, "fc.weight", self.fc.weight.val().transpose());
        if let Some(bias) = &self.fc.bias {
            put_entry(&mut map, "fc.bias", bias.val());
        }

        map
    }
}

/// Applies [`WeightMap`] entries onto module parameters, tracking how
/// many entries were consumed.
struct MapLoader<'a, B: Backend> {
    map: &'a WeightMap,
    device: &'a B::Device,
    used: usize,
}

impl<B: Backend> MapLoader<'_, B> {
    fn tensor<const D: usize>(
        &mut self,
        name: &str,
        expected: &[usize],
    ) -> Result<Tensor<B, D>, WeightsError> {
        let entry = self
            .map
            .get(name)
            .ok_or_else(|| WeightsError::MissingParam(name.to_string()))?;
        if entry.shape != expected {
            return Err(WeightsError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                found: entry.shape.clone(),
            });
        }

        self.used += 1;
        let data = TensorData::new(entry.data.clone(), entry.shape.clone());
        Ok(Tensor::from_data(data, self.device))
    }

    fn conv(&mut self, mut conv: Conv2d<B>, name: &str) -> Result<Conv2d<B>, WeightsError> {
        let dims = conv.weight.val().dims();
        conv.weight = Param::from_tensor(self.tensor(&format!("{name}.weight"), &dims)?);
        if let Some(bias) = conv.bias.take() {
            let dims = bias.val().dims();
            conv.bias = Some(Param::from_tensor(
                self.tensor(&format!("{name}.bias"), &dims)?,
            ));
        }
        Ok(conv)
    }

    fn norm(
        &mut self,
        mut norm: BatchNorm2d<B>,
        name: &str,
    ) -> Result<BatchNorm2d<B>, WeightsError> {
        let dims = [norm.num_channels()];
        norm.gamma = Param::from_tensor(self.tensor(&format!("{name}.weight"), &dims)?);
        norm.beta = Param::from_tensor(self.tensor(&format!("{name}.bias"), &dims)?);
        norm.running_mean = self.tensor(&format!("{name}.running_mean"), &dims)?;
        norm.running_var = self.tensor(&format!("{name}.running_var"), &dims)?;
        Ok(norm)
    }

    fn linear(&mut self, mut linear: Linear<B>, name: &str) -> Result<Linear<B>, WeightsError> {
        let [d_input, d_output] = linear.weight.val().dims();
        // Checkpoints store (out, in); burn stores (in, out).
        let weight: Tensor<B, 2> = self.tensor(&format!("{name}.weight"), &[d_output, d_input])?;
        linear.weight = Param::from_tensor(weight.transpose());
        if let Some(bias) = linear.bias.take() {
            let dims = bias.val().dims();
            linear.bias = Some(Param::from_tensor(
                self.tensor(&format!("{name}.bias"), &dims)?,
            ));
        }
        Ok(linear)
    }

    fn block(
        &mut self,
        mut block: ResidualBlock<B>,
        prefix: &str,
    ) -> Result<ResidualBlock<B>, WeightsError> {
        block.conv1 = self.conv(block.conv1, &format!("{prefix}.conv1"))?;
        block.bn1 = self.norm(block.bn1, &format!("{prefix}.bn1"))?;
        block.conv2 = self.conv(block.conv2, &format!("{prefix}.conv2"))?;
        block.bn2 = self.norm(block.bn2, &format!("{prefix}.bn2"))?;
        if let Some(conv3) = block.conv3.take() {
            block.conv3 = Some(self.conv(conv3, &format!("{prefix}.conv3"))?);
        }
        if let Some(bn3) = block.bn3.take() {
            block.bn3 = Some(self.norm(bn3, &format!("{prefix}.bn3"))?);
        }
        if let Some(mut downsample) = block.downsample.take() {
            downsample.conv = self.conv(downsample.conv, &format!("{prefix}.downsample.0"))?;
            downsample.bn = self.norm(downsample.bn, &format!("{prefix}.downsample.1"))?;
            block.downsample = Some(downsample);
        }
        Ok(block)
    }

    fn stage(
        &mut self,
        blocks: Vec<ResidualBlock<B>>,
        name: &str,
    ) -> Result<Vec<ResidualBlock<B>>, WeightsError> {
        blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| self.block(block, &format!("{name}.{i}")))
            .collect()
    }
}

fn put_entry<B: Backend, const D: usize>(map: &mut WeightMap, name: &str, tensor: Tensor<B, D>) {
    let shape = tensor.dims().to_vec();
    let data = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap();
    map.insert(name.to_string(), WeightTensor { shape, data });
}

fn put_conv<B: Backend>(map: &mut WeightMap, name: &str, conv: &Conv2d<B>) {
    put_entry(map, &format!("{name}.weight"), conv.weight.val());
    if let Some(bias) = &conv.bias {
        put_entry(map, &format!("{name}.bias"), bias.val());
    }
}

fn put_norm<B: Backend>(map: &mut WeightMap, name: &str, norm: &BatchNorm2d<B>) {
    put_entry(map, &format!("{name}.weight"), norm.gamma.val());
    put_entry(map, &format!("{name}.bias"), norm.beta.val());
    put_entry(map, &format!("{name}.running_mean"), norm.running_mean.clone());
    put_entry(map, &format!("{name}.running_var"), norm.running_var.clone());
}

fn put_stage<B: Backend>(map: &mut WeightMap, name: &str, blocks: &[ResidualBlock<B>]) {
    for (i, block) in blocks.iter().enumerate() {
        let prefix = format!("{name}.{i}");
        put_conv(map, &format!("{prefix}.conv1"), &block.conv1);
        put_norm(map, &format!("{prefix}.bn1"), &block.bn1);
        put_conv(map, &format!("{prefix}.conv2"), &block.conv2);
        put_norm(map, &format!("{prefix}.bn2"), &block.bn2);
        if let Some(conv3) = &block.conv3 {
            put_conv(map, &format!("{prefix}.conv3"), conv3);
        }
        if let Some(bn3) = &block.bn3 {
            put_norm(map, &format!("{prefix}.bn3"), bn3);
        }
        if let Some(downsample) = &block.downsample {
            put_conv(map, &format!("{prefix}.downsample.0"), &downsample.conv);
            put_norm(map, &format!("{prefix}.downsample.1"), &downsample.bn);
        }
    }
}

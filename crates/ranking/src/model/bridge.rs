//! Conversion between plain f32 buffers and burn tensors.
//!
//! Image decoding and augmentation live outside the model crates and
//! hand over flat row-major buffers. These helpers move those buffers
//! onto the backend and bring embeddings back out as plain rows for
//! ranking and serialization.

use burn::prelude::*;
use burn::tensor::TensorData;

/// Stacks flat row-major image buffers into a
/// `(batch, channels, height, width)` tensor.
///
/// # Panics
///
/// Panics if `images` is empty or any buffer's length is not
/// `channels * height * width`.
pub fn images_to_tensor<B: Backend>(
    images: &[Vec<f32>],
    channels: usize,
    height: usize,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    assert!(!images.is_empty(), "cannot build a tensor from zero images");
    let expected = channels * height * width;

    let mut flat = Vec::with_capacity(images.len() * expected);
    for (i, image) in images.iter().enumerate() {
        assert_eq!(
            image.len(),
            expected,
            "image {} has {} values, expected {}",
            i,
            image.len(),
            expected
        );
        flat.extend_from_slice(image);
    }

    let data = TensorData::new(flat, [images.len(), channels, height, width]);
    Tensor::from_data(data, device)
}

/// Splits a `(batch, dim)` embedding tensor into one `Vec<f32>` per row.
pub fn embeddings_to_rows<B: Backend>(embeddings: Tensor<B, 2>) -> Vec<Vec<f32>> {
    let dim = embeddings.dims()[1];
    let values = embeddings.into_data().to_vec::<f32>().unwrap();
    values.chunks(dim).map(|chunk| chunk.to_vec()).collect()
}

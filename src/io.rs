//! Model weights as text files and MNIST images in idx format.
//!
//! A model directory holds one file per tensor, `conv1.weight.txt`,
//! `conv1.bias.txt`, ..., `fc3.bias.txt`, each a whitespace-separated list
//! of decimal values in row-major order.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{FheCnnError, Result};
use crate::linear::pool;
use crate::model::{
    CnnModel, ConvLayer, DenseLayer, TensorShape, CONV1_OUT, CONV2_OUT, FC1_IN, FC1_OUT, FC2_OUT, IMAGE_SIDE,
    KERNEL, NUM_CLASSES,
};
use crate::packing::normalize_pixels;

pub const MNIST_IMAGE_MAGIC: u32 = 2051;
pub const MNIST_LABEL_MAGIC: u32 = 2049;

/// Parse whitespace-separated values, requiring exactly `expected` of them.
pub fn parse_weights(text: &str, expected: usize) -> Result<Vec<f64>> {
    let values = text
        .split_whitespace()
        .map(|tok| tok.parse::<f64>().map_err(|_| FheCnnError::Parse(format!("not a number: {:?}", tok))))
        .collect::<Result<Vec<f64>>>()?;
    if values.len() != expected {
        return Err(FheCnnError::DimensionMismatch { expected, got: values.len() });
    }
    Ok(values)
}

pub fn load_weights_txt(path: &Path, expected: usize) -> Result<Vec<f64>> {
    let text = fs::read_to_string(path)?;
    let values = parse_weights(&text, expected)?;
    debug!(path = %path.display(), count = values.len(), "loaded weights");
    Ok(values)
}

fn tensor_path(dir: &Path, layer: &str, kind: &str) -> std::path::PathBuf {
    dir.join(format!("{}.{}.txt", layer, kind))
}

fn load_conv(dir: &Path, name: &str, input: TensorShape, out_channels: usize) -> Result<ConvLayer> {
    let weight = load_weights_txt(
        &tensor_path(dir, name, "weight"),
        out_channels * input.channels * KERNEL * KERNEL,
    )?;
    let bias = load_weights_txt(&tensor_path(dir, name, "bias"), out_channels)?;
    ConvLayer::new(input, out_channels, KERNEL, weight, bias)
}

fn load_dense(dir: &Path, name: &str, in_features: usize, out_features: usize) -> Result<DenseLayer> {
    let weight = load_weights_txt(&tensor_path(dir, name, "weight"), in_features * out_features)?;
    let bias = load_weights_txt(&tensor_path(dir, name, "bias"), out_features)?;
    DenseLayer::new(in_features, out_features, weight, bias)
}

/// Read the five layers of the fixed architecture from `dir`.
pub fn load_model(dir: &Path) -> Result<CnnModel> {
    let conv1 = load_conv(dir, "conv1", TensorShape::new(1, IMAGE_SIDE, IMAGE_SIDE), CONV1_OUT)?;
    let conv2 = load_conv(dir, "conv2", pool::output_shape(conv1.output()), CONV2_OUT)?;
    let fc1 = load_dense(dir, "fc1", FC1_IN, FC1_OUT)?;
    let fc2 = load_dense(dir, "fc2", FC1_OUT, FC2_OUT)?;
    let fc3 = load_dense(dir, "fc3", FC2_OUT, NUM_CLASSES)?;
    CnnModel::new(conv1, conv2, fc1, fc2, fc3)
}

fn format_values(values: &[f64]) -> String {
    let mut out = String::with_capacity(values.len() * 12);
    for v in values {
        // Infallible for String.
        let _ = writeln!(out, "{:e}", v);
    }
    out
}

/// Write `model` in the layout [`load_model`] reads.
pub fn save_model(dir: &Path, model: &CnnModel) -> Result<()> {
    fs::create_dir_all(dir)?;
    let tensors: [(&str, &[f64], &[f64]); 5] = [
        ("conv1", model.conv1.weight.as_slice(), model.conv1.bias.as_slice()),
        ("conv2", model.conv2.weight.as_slice(), model.conv2.bias.as_slice()),
        ("fc1", model.fc1.weight.as_slice(), model.fc1.bias.as_slice()),
        ("fc2", model.fc2.weight.as_slice(), model.fc2.bias.as_slice()),
        ("fc3", model.fc3.weight.as_slice(), model.fc3.bias.as_slice()),
    ];
    for (name, weight, bias) in tensors {
        fs::write(tensor_path(dir, name, "weight"), format_values(weight))?;
        fs::write(tensor_path(dir, name, "bias"), format_values(bias))?;
    }
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| FheCnnError::Parse(format!("idx header truncated at byte {}", offset)))
}

fn check_magic(bytes: &[u8], expected: u32) -> Result<()> {
    let magic = read_u32(bytes, 0)?;
    if magic != expected {
        return Err(FheCnnError::Parse(format!("bad idx magic {}, expected {}", magic, expected)));
    }
    Ok(())
}

/// Decode an idx3 image file into normalized images of `rows·cols` values.
pub fn parse_mnist_images(bytes: &[u8]) -> Result<Vec<Vec<f64>>> {
    check_magic(bytes, MNIST_IMAGE_MAGIC)?;
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    let size = rows
        .checked_mul(cols)
        .filter(|&size| size > 0)
        .ok_or_else(|| FheCnnError::Parse(format!("bad idx image size {}x{}", rows, cols)))?;
    let total = count
        .checked_mul(size)
        .ok_or_else(|| FheCnnError::Parse(format!("idx header promises {} images of {} bytes", count, size)))?;
    let body = &bytes[16..];
    if body.len() < total {
        return Err(FheCnnError::Parse(format!(
            "idx image file holds {} bytes, header promises {}", body.len(), total
        )));
    }
    Ok(body.chunks_exact(size).take(count).map(normalize_pixels).collect())
}

pub fn parse_mnist_labels(bytes: &[u8]) -> Result<Vec<u8>> {
    check_magic(bytes, MNIST_LABEL_MAGIC)?;
    let count = read_u32(bytes, 4)? as usize;
    let body = &bytes[8..];
    if body.len() < count {
        return Err(FheCnnError::Parse(format!(
            "idx label file holds {} labels, header promises {}", body.len(), count
        )));
    }
    Ok(body[..count].to_vec())
}

pub fn load_mnist_images(path: &Path) -> Result<Vec<Vec<f64>>> {
    let images = parse_mnist_images(&fs::read(path)?)?;
    debug!(path = %path.display(), count = images.len(), "loaded mnist images");
    Ok(images)
}

pub fn load_mnist_labels(path: &Path) -> Result<Vec<u8>> {
    parse_mnist_labels(&fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [MNIST_IMAGE_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    #[test]
    fn test_parse_weights() {
        assert_eq!(parse_weights("1.5 -2\n3e-1\t4", 4).unwrap(), vec![1.5, -2.0, 0.3, 4.0]);
        assert!(matches!(
            parse_weights("1 2 3", 4),
            Err(FheCnnError::DimensionMismatch { expected: 4, got: 3 })
        ));
        assert!(matches!(parse_weights("1 x", 2), Err(FheCnnError::Parse(_))));
    }

    #[test]
    fn test_parse_mnist_images() {
        let bytes = idx_images(2, 2, 2, &[0, 255, 51, 102, 255, 0, 0, 0]);
        let images = parse_mnist_images(&bytes).unwrap();
        assert_eq!(images.len(), 2);
        for (got, want) in images[0].iter().zip([0.0, 1.0, 0.2, 0.4]) {
            assert!((got - want).abs() < 1e-12);
        }
        assert_eq!(images[1][0], 1.0);
    }

    #[test]
    fn test_reject_malformed_idx() {
        let mut bytes = idx_images(2, 2, 2, &[0; 8]);
        bytes[3] = 0x04;
        assert!(matches!(parse_mnist_images(&bytes), Err(FheCnnError::Parse(_))));
        assert!(parse_mnist_images(&idx_images(3, 2, 2, &[0; 8])).is_err());
        assert!(parse_mnist_images(&[0, 0, 8]).is_err());
        for (count, rows, cols) in [(u32::MAX, u32::MAX, u32::MAX), (1, 0, 28), (2, 28, 0), (u32::MAX, 1 << 16, 1 << 16)] {
            assert!(matches!(parse_mnist_images(&idx_images(count, rows, cols, &[0; 8])), Err(FheCnnError::Parse(_))));
        }

        let mut labels = Vec::new();
        labels.extend_from_slice(&MNIST_LABEL_MAGIC.to_be_bytes());
        labels.extend_from_slice(&3u32.to_be_bytes());
        labels.extend_from_slice(&[7, 2]);
        assert!(parse_mnist_labels(&labels).is_err());
        labels.push(1);
        assert_eq!(parse_mnist_labels(&labels).unwrap(), vec![7, 2, 1]);
    }

    #[test]
    fn test_model_files_round_trip() {
        let dir = std::env::temp_dir().join(format!("fhecnn-io-{}", std::process::id()));
        let model = CnnModel::random(21).unwrap();
        save_model(&dir, &model).unwrap();
        let loaded = load_model(&dir).unwrap();
        for (a, b) in loaded.fc2.weight.iter().zip(&model.fc2.weight) {
            assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0));
        }
        assert_eq!(loaded.conv2.input, model.conv2.input);

        fs::write(tensor_path(&dir, "fc3", "bias"), "0.1 0.2").unwrap();
        assert!(matches!(load_model(&dir), Err(FheCnnError::DimensionMismatch { expected: 10, got: 2 })));
        fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(load_model(&dir), Err(FheCnnError::Io(_))));
    }
}

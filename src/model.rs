//! Layer weights and the fixed MNIST architecture.
//!
//! ```text
//! 1×28×28 ─conv 5×5→ 8×24×24 ─relu─ pool → 8×12×12
//!         ─conv 5×5→ 16×8×8  ─relu─ pool → 16×4×4 = 256
//!         ─fc→ 128 ─relu─ fc→ 64 ─relu─ fc→ 10
//! ```

use std::collections::BTreeSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::{FheCnnError, Result};
use crate::linear::{conv, fc, pool};
use crate::nonlinear::compare;

pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_LEN: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const KERNEL: usize = 5;
pub const CONV1_OUT: usize = 8;
pub const CONV2_OUT: usize = 16;
pub const FC1_IN: usize = 256;
pub const FC1_OUT: usize = 128;
pub const FC2_OUT: usize = 64;
pub const NUM_CLASSES: usize = 10;

/// `[C,H,W]` extent of a packed tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width }
    }

    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unpadded stride-1 convolution.
#[derive(Clone, Debug)]
pub struct ConvLayer {
    pub input: TensorShape,
    pub out_channels: usize,
    pub kernel: usize,
    /// `[out_channels][in_channels][kernel][kernel]`, row-major.
    pub weight: Vec<f64>,
    pub bias: Vec<f64>,
}

impl ConvLayer {
    pub fn new(input: TensorShape, out_channels: usize, kernel: usize, weight: Vec<f64>, bias: Vec<f64>) -> Result<Self> {
        if kernel == 0 || kernel > input.height || kernel > input.width {
            return Err(FheCnnError::InvalidParam(format!(
                "kernel {} does not fit a {}x{} input", kernel, input.height, input.width
            )));
        }
        if out_channels == 0 || input.channels == 0 {
            return Err(FheCnnError::InvalidParam("channel counts must be positive".into()));
        }
        let expected = out_channels * input.channels * kernel * kernel;
        if weight.len() != expected {
            return Err(FheCnnError::DimensionMismatch { expected, got: weight.len() });
        }
        if bias.len() != out_channels {
            return Err(FheCnnError::DimensionMismatch { expected: out_channels, got: bias.len() });
        }
        Ok(Self { input, out_channels, kernel, weight, bias })
    }

    pub fn output(&self) -> TensorShape {
        TensorShape::new(
            self.out_channels,
            self.input.height - self.kernel + 1,
            self.input.width - self.kernel + 1,
        )
    }

    pub fn weight_at(&self, oc: usize, ic: usize, kh: usize, kw: usize) -> f64 {
        let k = self.kernel;
        self.weight[((oc * self.input.channels + ic) * k + kh) * k + kw]
    }
}

/// `y = W·x + b` with `W` stored `[out][in]`, row-major.
#[derive(Clone, Debug)]
pub struct DenseLayer {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Vec<f64>,
    pub bias: Vec<f64>,
}

impl DenseLayer {
    pub fn new(in_features: usize, out_features: usize, weight: Vec<f64>, bias: Vec<f64>) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(FheCnnError::InvalidParam("layer sizes must be positive".into()));
        }
        let expected = in_features * out_features;
        if weight.len() != expected {
            return Err(FheCnnError::DimensionMismatch { expected, got: weight.len() });
        }
        if bias.len() != out_features {
            return Err(FheCnnError::DimensionMismatch { expected: out_features, got: bias.len() });
        }
        Ok(Self { in_features, out_features, weight, bias })
    }

    pub fn weight_at(&self, row: usize, col: usize) -> f64 {
        self.weight[row * self.in_features + col]
    }
}

/// The five weighted layers of the classifier.
#[derive(Clone, Debug)]
pub struct CnnModel {
    pub conv1: ConvLayer,
    pub conv2: ConvLayer,
    pub fc1: DenseLayer,
    pub fc2: DenseLayer,
    pub fc3: DenseLayer,
}

impl CnnModel {
    /// Assemble a model, checking that the layers chain into the fixed architecture.
    pub fn new(conv1: ConvLayer, conv2: ConvLayer, fc1: DenseLayer, fc2: DenseLayer, fc3: DenseLayer) -> Result<Self> {
        let expect = |what: &str, expected: usize, got: usize| -> Result<()> {
            if expected != got {
                return Err(FheCnnError::InvalidParam(format!(
                    "{}: expected {}, got {}", what, expected, got
                )));
            }
            Ok(())
        };
        expect("conv1 input", IMAGE_LEN, conv1.input.len())?;
        expect("conv1 channels", CONV1_OUT, conv1.out_channels)?;
        expect("conv1 kernel", KERNEL, conv1.kernel)?;
        expect("conv2 input", conv1.output().len() / 4, conv2.input.len())?;
        expect("conv2 channels", CONV2_OUT, conv2.out_channels)?;
        expect("conv2 kernel", KERNEL, conv2.kernel)?;
        expect("fc1 input", conv2.output().len() / 4, fc1.in_features)?;
        expect("fc1 output", FC1_OUT, fc1.out_features)?;
        expect("fc2 input", fc1.out_features, fc2.in_features)?;
        expect("fc2 output", FC2_OUT, fc2.out_features)?;
        expect("fc3 input", fc2.out_features, fc3.in_features)?;
        expect("fc3 output", NUM_CLASSES, fc3.out_features)?;
        Ok(Self { conv1, conv2, fc1, fc2, fc3 })
    }

    /// Model with uniform weights in ±1/sqrt(fan_in), for demos and tests.
    pub fn random(seed: u64) -> Result<Self> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        Self::random_with_rng(&mut rng)
    }

    pub fn random_with_rng<R: Rng>(rng: &mut R) -> Result<Self> {
        let mut uniform = |n: usize, fan_in: usize| -> Vec<f64> {
            let bound = 1.0 / (fan_in as f64).sqrt();
            (0..n).map(|_| (rng.random::<f64>() * 2.0 - 1.0) * bound).collect()
        };
        let c1_in = TensorShape::new(1, IMAGE_SIDE, IMAGE_SIDE);
        let c1_fan = KERNEL * KERNEL;
        let conv1 = ConvLayer::new(
            c1_in,
            CONV1_OUT,
            KERNEL,
            uniform(CONV1_OUT * c1_fan, c1_fan),
            uniform(CONV1_OUT, c1_fan),
        )?;
        let c2_in = pool::output_shape(conv1.output());
        let c2_fan = CONV1_OUT * KERNEL * KERNEL;
        let conv2 = ConvLayer::new(
            c2_in,
            CONV2_OUT,
            KERNEL,
            uniform(CONV2_OUT * c2_fan, c2_fan),
            uniform(CONV2_OUT, c2_fan),
        )?;
        let fc1 = DenseLayer::new(FC1_IN, FC1_OUT, uniform(FC1_OUT * FC1_IN, FC1_IN), uniform(FC1_OUT, FC1_IN))?;
        let fc2 = DenseLayer::new(FC1_OUT, FC2_OUT, uniform(FC2_OUT * FC1_OUT, FC1_OUT), uniform(FC2_OUT, FC1_OUT))?;
        let fc3 = DenseLayer::new(FC2_OUT, NUM_CLASSES, uniform(NUM_CLASSES * FC2_OUT, FC2_OUT), uniform(NUM_CLASSES, FC2_OUT))?;
        Self::new(conv1, conv2, fc1, fc2, fc3)
    }

    pub fn pool1_input(&self) -> TensorShape {
        self.conv1.output()
    }

    pub fn pool2_input(&self) -> TensorShape {
        self.conv2.output()
    }

    /// Every rotation any stage of the network will request.
    pub fn rotation_shifts(&self, one_hot: bool) -> BTreeSet<isize> {
        let mut shifts = BTreeSet::new();
        shifts.extend(conv::rotations(&self.conv1));
        shifts.extend(pool::rotations(self.pool1_input()));
        shifts.extend(conv::rotations(&self.conv2));
        shifts.extend(pool::rotations(self.pool2_input()));
        shifts.extend(fc::rotations(&self.fc1));
        shifts.extend(fc::rotations(&self.fc2));
        shifts.extend(fc::rotations(&self.fc3));
        if one_hot {
            shifts.extend(compare::one_hot_rotations(NUM_CLASSES));
        }
        shifts.remove(&0);
        shifts
    }

    /// Largest number of local slots any stage touches for one sample.
    pub fn max_footprint(&self) -> usize {
        [
            conv::footprint(&self.conv1),
            pool::footprint(self.pool1_input()),
            conv::footprint(&self.conv2),
            pool::footprint(self.pool2_input()),
            fc::footprint(&self.fc1),
            fc::footprint(&self.fc2),
            fc::footprint(&self.fc3),
            compare::one_hot_footprint(NUM_CLASSES),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// Per-sample stride for batched evaluation: the footprint rounded up to a power of two.
    pub fn required_stride(&self) -> usize {
        self.max_footprint().next_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_model_shapes() {
        let model = CnnModel::random(1).unwrap();
        assert_eq!(model.conv1.output(), TensorShape::new(8, 24, 24));
        assert_eq!(model.conv2.input, TensorShape::new(8, 12, 12));
        assert_eq!(model.conv2.output(), TensorShape::new(16, 8, 8));
        assert_eq!(model.fc1.in_features, 256);
    }

    #[test]
    fn test_stride_fits_four_samples() {
        let model = CnnModel::random(2).unwrap();
        assert_eq!(model.max_footprint(), 8 * 24 * 24);
        assert_eq!(model.required_stride(), 8192);
        assert!(4 * model.required_stride() <= 1 << 15);
    }

    #[test]
    fn test_rotation_plan_contains_layer_shifts() {
        let model = CnnModel::random(3).unwrap();
        let shifts = model.rotation_shifts(true);
        assert!(shifts.contains(&1));
        assert!(shifts.contains(&28));
        assert!(shifts.contains(&-256));
        assert!(!shifts.contains(&0));
    }

    #[test]
    fn test_layer_validation() {
        let input = TensorShape::new(1, 4, 4);
        assert!(ConvLayer::new(input, 1, 5, vec![0.0; 25], vec![0.0]).is_err());
        assert!(matches!(
            ConvLayer::new(input, 2, 3, vec![0.0; 9], vec![0.0; 2]),
            Err(FheCnnError::DimensionMismatch { expected: 18, got: 9 })
        ));
        assert!(DenseLayer::new(3, 2, vec![0.0; 6], vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_weight_indexing() {
        let w: Vec<f64> = (0..2 * 3 * 2 * 2).map(|v| v as f64).collect();
        let layer = ConvLayer::new(TensorShape::new(3, 4, 4), 2, 2, w, vec![0.0; 2]).unwrap();
        assert_eq!(layer.weight_at(1, 2, 1, 0), 22.0);
    }
}

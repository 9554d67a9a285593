//! Cleartext forward pass used to check encrypted results.

use crate::error::{FheCnnError, Result};
use crate::linear::pool::output_shape;
use crate::model::{CnnModel, ConvLayer, DenseLayer, TensorShape, IMAGE_LEN};
use crate::nonlinear::relu::ReluConfig;

/// Activation used by [`forward`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Activation {
    Exact,
    Polynomial(ReluConfig),
}

pub fn conv2d(input: &[f64], layer: &ConvLayer) -> Vec<f64> {
    let (h, w) = (layer.input.height, layer.input.width);
    let out = layer.output();
    let k = layer.kernel;
    let mut y = vec![0.0; out.len()];
    for oc in 0..out.channels {
        for oh in 0..out.height {
            for ow in 0..out.width {
                let mut sum = layer.bias[oc];
                for ic in 0..layer.input.channels {
                    for kh in 0..k {
                        for kw in 0..k {
                            sum += layer.weight_at(oc, ic, kh, kw) * input[(ic * h + oh + kh) * w + ow + kw];
                        }
                    }
                }
                y[(oc * out.height + oh) * out.width + ow] = sum;
            }
        }
    }
    y
}

pub fn avg_pool_2x2(input: &[f64], shape: TensorShape) -> Vec<f64> {
    let out = output_shape(shape);
    let w = shape.width;
    let mut y = vec![0.0; out.len()];
    for c in 0..out.channels {
        for i in 0..out.height {
            for j in 0..out.width {
                let base = (c * shape.height + 2 * i) * w + 2 * j;
                y[(c * out.height + i) * out.width + j] =
                    (input[base] + input[base + 1] + input[base + w] + input[base + w + 1]) / 4.0;
            }
        }
    }
    y
}

pub fn dense(x: &[f64], layer: &DenseLayer) -> Vec<f64> {
    (0..layer.out_features)
        .map(|r| layer.bias[r] + (0..layer.in_features).map(|c| layer.weight_at(r, c) * x[c]).sum::<f64>())
        .collect()
}

/// `scale·p(x/scale)` for the configured ReLU polynomial.
pub fn poly_relu(x: f64, config: ReluConfig) -> f64 {
    let t = x / config.scale;
    let p = config.degree.coefficients().iter().rev().fold(0.0, |acc, c| acc * t + c);
    config.scale * p
}

fn activate(values: &mut [f64], activation: Activation) {
    for v in values.iter_mut() {
        *v = match activation {
            Activation::Exact => v.max(0.0),
            Activation::Polynomial(config) => poly_relu(*v, config),
        };
    }
}

/// Logits of the network on one normalized image.
///
/// `activations` gives the four ReLU stages in order.
pub fn forward(model: &CnnModel, image: &[f64], activations: [Activation; 4]) -> Result<Vec<f64>> {
    if image.len() != IMAGE_LEN {
        return Err(FheCnnError::DimensionMismatch { expected: IMAGE_LEN, got: image.len() });
    }
    let mut x = conv2d(image, &model.conv1);
    activate(&mut x, activations[0]);
    let x = avg_pool_2x2(&x, model.pool1_input());
    let mut x = conv2d(&x, &model.conv2);
    activate(&mut x, activations[1]);
    let x = avg_pool_2x2(&x, model.pool2_input());
    let mut x = dense(&x, &model.fc1);
    activate(&mut x, activations[2]);
    let mut x = dense(&x, &model.fc2);
    activate(&mut x, activations[3]);
    Ok(dense(&x, &model.fc3))
}

/// Index of the largest value; the first one wins ties. Empty input gives 0.
pub fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

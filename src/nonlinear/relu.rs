use tracing::instrument;

use crate::error::{FheCnnError, Result};
use crate::he::HomEval;
use crate::packing::SlotLayout;
use crate::session::Session;

/// Coefficients `c_0..c_5` of the degree-5 ReLU approximation on `[-1,1]`.
pub const RELU5_COEFFS: [f64; 6] = [0.125, 0.5, 0.375, 0.125, 0.0625, 0.0625];
/// Coefficients `c_0..c_3` of the degree-3 approximation.
pub const RELU3_COEFFS: [f64; 4] = [0.2978, 0.5, 0.0, 0.2978];

/// Largest error of the degree-5 polynomial against `max(0,x)` on `[-0.8, 0.7]`
/// with scale 1. The maximum sits at 0, where the constant term alone is 0.125.
pub const RELU5_ERROR_BOUND: f64 = 0.13;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReluDegree {
    Three,
    Five,
}

impl ReluDegree {
    pub fn coefficients(&self) -> &'static [f64] {
        match self {
            ReluDegree::Three => &RELU3_COEFFS,
            ReluDegree::Five => &RELU5_COEFFS,
        }
    }

    pub fn depth(&self) -> u32 {
        poly_depth(self.coefficients())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReluConfig {
    pub degree: ReluDegree,
    /// Inputs are assumed to lie in `[-scale, scale]`.
    pub scale: f64,
}

impl Default for ReluConfig {
    fn default() -> Self {
        Self { degree: ReluDegree::Five, scale: 2.0 }
    }
}

/// A scale that covers every observed activation with a small margin.
pub fn suggest_scale(values: &[f64]) -> f64 {
    values.iter().fold(0.0f64, |m, v| m.max(v.abs())) + 0.1
}

/// Levels consumed by [`eval_poly`] for these coefficients.
pub fn poly_depth(coeffs: &[f64]) -> u32 {
    const TERM_DEPTH: [u32; 6] = [0, 1, 2, 2, 3, 3];
    coeffs
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, c)| **c != 0.0)
        .map(|(k, _)| TERM_DEPTH[k.min(5)])
        .max()
        .unwrap_or(0)
}

/// `Σ coeffs[k]·x^k` for degree at most 5 in depth 3.
///
/// Powers are `x²` and `x⁴ = (x²)²`; odd terms multiply the scaled linear term
/// by an even power, so `c_5·x⁵ = (c_5·x)·x⁴`. The constant term is added on
/// the first `active_len` slots of every block only.
pub fn eval_poly<E: HomEval>(
    s: Session<'_, E>,
    ct: &E::Ciphertext,
    coeffs: &[f64],
    active_len: usize,
    layout: SlotLayout,
) -> Result<E::Ciphertext> {
    if coeffs.len() < 2 || coeffs.len() > 6 {
        return Err(FheCnnError::InvalidParam(format!(
            "polynomial degree {} outside 1..=5", coeffs.len().saturating_sub(1)
        )));
    }
    let c = |k: usize| coeffs.get(k).copied().unwrap_or(0.0);
    let x2 = if c(2) != 0.0 || c(3) != 0.0 || c(4) != 0.0 || c(5) != 0.0 {
        Some(s.square(ct)?)
    } else {
        None
    };
    let x4 = match &x2 {
        Some(x2) if c(4) != 0.0 || c(5) != 0.0 => Some(s.square(x2)?),
        _ => None,
    };

    let mut acc = None;
    if c(1) != 0.0 {
        acc = s.accumulate(acc, s.mul_scalar(ct, c(1))?)?;
    }
    if let Some(x2) = &x2 {
        if c(2) != 0.0 {
            acc = s.accumulate(acc, s.mul_scalar(x2, c(2))?)?;
        }
        if c(3) != 0.0 {
            acc = s.accumulate(acc, s.mul(&s.mul_scalar(ct, c(3))?, x2)?)?;
        }
    }
    if let Some(x4) = &x4 {
        if c(4) != 0.0 {
            acc = s.accumulate(acc, s.mul_scalar(x4, c(4))?)?;
        }
        if c(5) != 0.0 {
            acc = s.accumulate(acc, s.mul(&s.mul_scalar(ct, c(5))?, x4)?)?;
        }
    }
    let acc = acc.ok_or_else(|| FheCnnError::InvalidParam("constant polynomial".into()))?;

    if c(0) == 0.0 {
        return Ok(acc);
    }
    let constant = layout.tile_with(active_len, |_| c(0))?;
    s.add_plain(&acc, &constant)
}

/// Polynomial ReLU: `scale·p(x/scale)`.
///
/// The two scalings are folded into the coefficients (`c_k·scale^(1-k)`),
/// so no level is spent on them. Only the first `active_len` slots of each
/// block carry data; the rest stay zero.
#[instrument(skip_all, fields(degree = ?config.degree, scale = config.scale, active_len = active_len))]
pub fn relu<E: HomEval>(
    s: Session<'_, E>,
    ct: E::Ciphertext,
    active_len: usize,
    config: ReluConfig,
    layout: SlotLayout,
) -> Result<E::Ciphertext> {
    if config.scale <= 0.0 || !config.scale.is_finite() {
        return Err(FheCnnError::InvalidParam(format!("relu scale must be positive, got {}", config.scale)));
    }
    let folded: Vec<f64> = config
        .degree
        .coefficients()
        .iter()
        .enumerate()
        .map(|(k, c)| c * config.scale.powi(1 - k as i32))
        .collect();
    eval_poly(s, &ct, &folded, active_len, layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::{EvalKeys, KeyGen, SlotSimulator};
    use crate::packing::{decode_single, encode_single};
    use crate::params::presets::compact_test;
    use crate::plain;

    fn run(inputs: &[f64], config: ReluConfig) -> (Vec<f64>, u32) {
        let he = SlotSimulator::new(compact_test().unwrap(), 51);
        let sk = he.gen_secret_key().unwrap();
        let keys = EvalKeys::generate(&he, &sk, [1]).unwrap();
        let s = Session::new(&he, &keys);
        let ct = encode_single(&he, &sk, inputs).unwrap();
        let out = relu(s, ct, inputs.len(), config, SlotLayout::single(he.num_slots())).unwrap();
        let used = he.max_level() - he.level(&out).unwrap();
        (decode_single(&he, &sk, &out, inputs.len() + 4).unwrap(), used)
    }

    #[test]
    fn test_relu5_error_bound() {
        let inputs: Vec<f64> = (0..16).map(|i| -0.8 + i as f64 * 0.1).collect();
        let config = ReluConfig { degree: ReluDegree::Five, scale: 1.0 };
        let (got, used) = run(&inputs, config);
        assert_eq!(used, 3);
        for (x, y) in inputs.iter().zip(&got) {
            assert!((y - x.max(0.0)).abs() < RELU5_ERROR_BOUND, "relu({}) = {}", x, y);
        }
        assert!(got[16..].iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_relu_matches_plain_polynomial() {
        let inputs: Vec<f64> = (0..40).map(|i| -1.9 + i as f64 * 0.095).collect();
        for degree in [ReluDegree::Three, ReluDegree::Five] {
            let config = ReluConfig { degree, scale: 2.0 };
            let (got, used) = run(&inputs, config);
            assert_eq!(used, degree.depth());
            for (x, y) in inputs.iter().zip(&got) {
                assert!((y - plain::poly_relu(*x, config)).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_depths() {
        assert_eq!(ReluDegree::Five.depth(), 3);
        assert_eq!(ReluDegree::Three.depth(), 2);
        assert_eq!(poly_depth(&[0.0, 1.0]), 1);
    }

    #[test]
    fn test_suggest_scale() {
        assert!((suggest_scale(&[0.3, -1.2, 0.9]) - 1.3).abs() < 1e-12);
    }
}

use rand::Rng;

/// Sample from N(0, σ²) using Box-Muller (NOT constant time).
/// Only used to model approximation error on slot values, never for key material.
pub fn sample_gaussian<R: Rng>(sigma: f64, rng: &mut R) -> f64 {
    // 1 - u keeps the argument of ln in (0, 1].
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    z * sigma
}

/// Add independent Gaussian error of standard deviation `sigma` to every slot.
/// A zero sigma leaves the values untouched and draws nothing from `rng`.
pub fn add_gaussian_noise<R: Rng>(values: &mut [f64], sigma: f64, rng: &mut R) {
    if sigma == 0.0 {
        return;
    }
    for v in values.iter_mut() {
        *v += sample_gaussian(sigma, rng);
    }
}

/// Round every value to the nearest multiple of 2^-bits, the precision
/// kept by encoding at scale Δ = 2^bits.
pub fn quantize(values: &mut [f64], bits: u32) {
    let delta = (bits as f64).exp2();
    for v in values.iter_mut() {
        *v = (*v * delta).round() / delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_gaussian_moments() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let sigma = 3.2;
        let n = 10000;
        let samples: Vec<f64> = (0..n).map(|_| sample_gaussian(sigma, &mut rng)).collect();
        let mean: f64 = samples.iter().sum::<f64>() / n as f64;
        let var: f64 = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.2, "mean {} too far from 0", mean);
        assert!((var.sqrt() - sigma).abs() < 0.2, "std {} too far from {}", var.sqrt(), sigma);
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let mut values = vec![1.5, -2.0, 0.25];
        add_gaussian_noise(&mut values, 0.0, &mut rng);
        assert_eq!(values, vec![1.5, -2.0, 0.25]);
    }

    #[test]
    fn test_quantize() {
        let mut values = vec![0.1, -0.3];
        quantize(&mut values, 40);
        assert!((values[0] - 0.1).abs() < 1e-12);
        assert!((values[1] + 0.3).abs() < 1e-12);
    }
}

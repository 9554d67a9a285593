pub mod security;
pub mod presets;

use std::sync::Arc;
use crate::error::{FheCnnError, Result};

/// Parameters of the CKKS-style slot scheme the evaluator runs on.
#[derive(Clone, Debug)]
pub struct CkksParams {
    /// log2 of the ring degree N.
    pub log_degree: u32,
    /// log2 of the number of SIMD slots (at most N/2).
    pub log_slots: u32,
    /// Level of a freshly encrypted ciphertext.
    pub max_level: u32,
    /// Level a ciphertext is restored to by bootstrapping.
    pub bootstrap_level: u32,
    /// Bits of the encoding scale Δ; also the size of every rescaling prime.
    pub scale_bits: u32,
    /// Bits of the base prime q_0 that survives at level 0.
    pub base_modulus_bits: u32,
    /// Bits of the key-switching special modulus P.
    pub special_modulus_bits: u32,
    /// Gaussian error standard deviation.
    pub sigma: f64,
    /// Precision (in bits) of a bootstrapped ciphertext.
    pub bootstrap_precision_bits: u32,
}

impl CkksParams {
    pub fn ring_degree(&self) -> usize {
        1usize << self.log_degree
    }

    pub fn num_slots(&self) -> usize {
        1usize << self.log_slots
    }

    /// Total modulus size log2(Q·P) of a fresh key-switching key.
    pub fn log2_modulus(&self) -> u32 {
        self.base_modulus_bits + self.max_level * self.scale_bits + self.special_modulus_bits
    }

    /// Standard deviation of the error added by encryption, key switching and rescaling,
    /// measured in slot units.
    pub fn fresh_noise_std(&self) -> f64 {
        self.sigma * (-(self.scale_bits as f64)).exp2()
    }

    pub fn bootstrap_noise_std(&self) -> f64 {
        (-(self.bootstrap_precision_bits as f64)).exp2()
    }
}

/// Builder for CkksParams.
pub struct CkksParamsBuilder {
    log_degree: u32,
    log_slots: Option<u32>,
    max_level: u32,
    bootstrap_level: Option<u32>,
    scale_bits: u32,
    base_modulus_bits: u32,
    special_modulus_bits: u32,
    sigma: f64,
    bootstrap_precision_bits: u32,
}

impl CkksParamsBuilder {
    pub fn new() -> Self {
        Self {
            log_degree: 16,
            log_slots: None, // full packing: N/2
            max_level: 14,
            bootstrap_level: None,
            scale_bits: 42,
            base_modulus_bits: 58,
            special_modulus_bits: 60,
            sigma: 3.2,
            bootstrap_precision_bits: 24,
        }
    }

    pub fn log_degree(mut self, log_n: u32) -> Self {
        self.log_degree = log_n;
        self
    }

    pub fn log_slots(mut self, log_slots: u32) -> Self {
        self.log_slots = Some(log_slots);
        self
    }

    pub fn max_level(mut self, level: u32) -> Self {
        self.max_level = level;
        self
    }

    pub fn bootstrap_level(mut self, level: u32) -> Self {
        self.bootstrap_level = Some(level);
        self
    }

    pub fn scale_bits(mut self, bits: u32) -> Self {
        self.scale_bits = bits;
        self
    }

    pub fn base_modulus_bits(mut self, bits: u32) -> Self {
        self.base_modulus_bits = bits;
        self
    }

    pub fn special_modulus_bits(mut self, bits: u32) -> Self {
        self.special_modulus_bits = bits;
        self
    }

    pub fn sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    pub fn bootstrap_precision_bits(mut self, bits: u32) -> Self {
        self.bootstrap_precision_bits = bits;
        self
    }

    pub fn build(self) -> Result<Arc<CkksParams>> {
        if !(4..=17).contains(&self.log_degree) {
            return Err(FheCnnError::InvalidParam(
                format!("log ring degree must be in 4..=17, got {}", self.log_degree)
            ));
        }
        let log_slots = self.log_slots.unwrap_or(self.log_degree - 1);
        if log_slots == 0 || log_slots >= self.log_degree {
            return Err(FheCnnError::InvalidParam(
                format!("log slots must be in 1..{}, got {}", self.log_degree, log_slots)
            ));
        }
        if self.max_level == 0 {
            return Err(FheCnnError::InvalidParam("max level must be >= 1".into()));
        }
        // Bootstrapping eats a few levels of its own, so the refreshed level sits below the fresh one.
        let bootstrap_level = self.bootstrap_level.unwrap_or(self.max_level.saturating_sub(2).max(1));
        if bootstrap_level == 0 || bootstrap_level > self.max_level {
            return Err(FheCnnError::InvalidParam(
                format!("bootstrap level must be in 1..={}, got {}", self.max_level, bootstrap_level)
            ));
        }
        if !(20..=60).contains(&self.scale_bits) {
            return Err(FheCnnError::InvalidParam(
                format!("scale bits must be in 20..=60, got {}", self.scale_bits)
            ));
        }
        if self.base_modulus_bits < self.scale_bits {
            return Err(FheCnnError::InvalidParam("base modulus must be at least as large as the scale".into()));
        }
        if self.sigma <= 0.0 || !self.sigma.is_finite() {
            return Err(FheCnnError::InvalidParam("sigma must be positive".into()));
        }
        if self.bootstrap_precision_bits == 0 || self.bootstrap_precision_bits > self.scale_bits {
            return Err(FheCnnError::InvalidParam(
                format!("bootstrap precision must be in 1..={} bits", self.scale_bits)
            ));
        }

        Ok(Arc::new(CkksParams {
            log_degree: self.log_degree,
            log_slots,
            max_level: self.max_level,
            bootstrap_level,
            scale_bits: self.scale_bits,
            base_modulus_bits: self.base_modulus_bits,
            special_modulus_bits: self.special_modulus_bits,
            sigma: self.sigma,
            bootstrap_precision_bits: self.bootstrap_precision_bits,
        }))
    }
}

impl Default for CkksParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

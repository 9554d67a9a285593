//! Reference CKKS backend that models slot semantics in the clear.
//!
//! Slot values are carried as `f64` alongside everything a real CKKS
//! ciphertext tracks: level, whether a product is waiting to be rescaled,
//! the number of components, and which secret key it belongs to. Every
//! precondition a lattice backend relies on is checked and reported as a
//! typed error, and approximation error is injected where CKKS would
//! introduce it (encoding, encryption, key switching, rescaling,
//! bootstrapping). It provides no confidentiality.

use std::cell::RefCell;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::error::{FheCnnError, Result};
use crate::he::{Bootstrapper, HomEval, KeyGen};
use crate::params::CkksParams;
use crate::sampling::{add_gaussian_noise, quantize};

/// Secret key. Only its identity matters to the simulator.
pub struct SimSecretKey {
    id: u64,
}

impl Drop for SimSecretKey {
    fn drop(&mut self) {
        self.id.zeroize();
    }
}

#[derive(Clone, Debug)]
pub struct SimRotationKey {
    shift: usize,
    /// Galois element 5^shift mod 2N of the slot automorphism.
    pub galois_element: usize,
    key_id: u64,
}

#[derive(Clone, Debug)]
pub struct SimRelinKey {
    key_id: u64,
}

#[derive(Clone, Debug)]
pub struct SimBootstrapKey {
    key_id: u64,
}

#[derive(Clone, Debug)]
pub struct SimPlaintext {
    values: Vec<f64>,
    level: u32,
}

#[derive(Clone, Debug)]
pub struct SimCiphertext {
    values: Vec<f64>,
    level: u32,
    /// A product was taken and the scale is Δ² until `rescale`.
    pending_rescale: bool,
    /// 2 normally, 3 after a ciphertext product until relinearized.
    size: u8,
    key_id: u64,
}

/// In-process evaluator with a seeded noise stream.
pub struct SlotSimulator {
    params: Arc<CkksParams>,
    rng: RefCell<ChaCha20Rng>,
    noisy: bool,
}

impl SlotSimulator {
    /// Simulator that injects CKKS-sized noise drawn from a seeded stream.
    pub fn new(params: Arc<CkksParams>, seed: u64) -> Self {
        Self {
            params,
            rng: RefCell::new(ChaCha20Rng::seed_from_u64(seed)),
            noisy: true,
        }
    }

    /// Simulator whose only error source is encoding precision.
    pub fn noiseless(params: Arc<CkksParams>) -> Self {
        Self {
            params,
            rng: RefCell::new(ChaCha20Rng::seed_from_u64(0)),
            noisy: false,
        }
    }

    fn perturb(&self, values: &mut [f64], sigma: f64) {
        if self.noisy {
            add_gaussian_noise(values, sigma, &mut *self.rng.borrow_mut());
        }
    }

    fn fresh_id(&self) -> u64 {
        self.rng.borrow_mut().random::<u64>()
    }

    /// Refresh `ct` to the bootstrap level. Called by [`SimBootstrapper`].
    fn refresh(&self, ct: &SimCiphertext) -> Result<SimCiphertext> {
        if ct.size != 2 {
            return Err(FheCnnError::NotRelinearized);
        }
        if ct.pending_rescale {
            return Err(FheCnnError::ScaleMismatch);
        }
        // The message must fit below q_0/Δ or modular reduction wraps it.
        let bound = ((self.params.base_modulus_bits - self.params.scale_bits) as f64).exp2() / 2.0;
        if let Some(v) = ct.values.iter().find(|v| v.abs() >= bound) {
            return Err(FheCnnError::InvalidParam(format!(
                "bootstrap input {} exceeds message bound {}", v, bound
            )));
        }
        let mut values = ct.values.clone();
        self.perturb(&mut values, self.params.bootstrap_noise_std());
        Ok(SimCiphertext {
            values,
            level: self.params.bootstrap_level,
            pending_rescale: false,
            size: 2,
            key_id: ct.key_id,
        })
    }

    fn check_pair(&self, a: &SimCiphertext, b: &SimCiphertext) -> Result<()> {
        if a.key_id != b.key_id {
            return Err(FheCnnError::KeyMismatch);
        }
        if a.level != b.level {
            return Err(FheCnnError::LevelMismatch { left: a.level, right: b.level });
        }
        if a.pending_rescale != b.pending_rescale {
            return Err(FheCnnError::ScaleMismatch);
        }
        Ok(())
    }

    fn check_plain(&self, ct: &SimCiphertext, pt: &SimPlaintext) -> Result<()> {
        if ct.level != pt.level {
            return Err(FheCnnError::LevelMismatch { left: ct.level, right: pt.level });
        }
        if ct.pending_rescale {
            return Err(FheCnnError::ScaleMismatch);
        }
        Ok(())
    }

    fn check_multiplicand(&self, ct: &SimCiphertext) -> Result<()> {
        if ct.level == 0 {
            return Err(FheCnnError::LevelExhausted { level: 0 });
        }
        if ct.size != 2 {
            return Err(FheCnnError::NotRelinearized);
        }
        if ct.pending_rescale {
            return Err(FheCnnError::ScaleMismatch);
        }
        Ok(())
    }

    fn zip_with(
        a: &SimCiphertext,
        b: &[f64],
        f: impl Fn(f64, f64) -> f64,
    ) -> Vec<f64> {
        a.values.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
    }
}

impl HomEval for SlotSimulator {
    type Ciphertext = SimCiphertext;
    type Plaintext = SimPlaintext;
    type SecretKey = SimSecretKey;
    type RotationKey = SimRotationKey;
    type RelinKey = SimRelinKey;

    fn params(&self) -> &Arc<CkksParams> {
        &self.params
    }

    fn encode(&self, values: &[f64], level: u32) -> Result<SimPlaintext> {
        let num_slots = self.num_slots();
        if values.len() > num_slots {
            return Err(FheCnnError::CapacityExceeded { needed: values.len(), available: num_slots });
        }
        if level > self.params.max_level {
            return Err(FheCnnError::InvalidParam(
                format!("encoding level {} above max level {}", level, self.params.max_level)
            ));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FheCnnError::InvalidParam("cannot encode non-finite value".into()));
        }
        let mut slots = vec![0.0; num_slots];
        slots[..values.len()].copy_from_slice(values);
        quantize(&mut slots, self.params.scale_bits);
        Ok(SimPlaintext { values: slots, level })
    }

    fn decode(&self, pt: &SimPlaintext) -> Result<Vec<f64>> {
        Ok(pt.values.clone())
    }

    fn encrypt(&self, pt: &SimPlaintext, sk: &SimSecretKey) -> Result<SimCiphertext> {
        let mut values = pt.values.clone();
        self.perturb(&mut values, self.params.fresh_noise_std());
        Ok(SimCiphertext {
            values,
            level: pt.level,
            pending_rescale: false,
            size: 2,
            key_id: sk.id,
        })
    }

    fn decrypt(&self, ct: &SimCiphertext, sk: &SimSecretKey) -> Result<SimPlaintext> {
        if ct.key_id != sk.id {
            return Err(FheCnnError::KeyMismatch);
        }
        Ok(SimPlaintext { values: ct.values.clone(), level: ct.level })
    }

    fn add(&self, a: &SimCiphertext, b: &SimCiphertext) -> Result<SimCiphertext> {
        self.check_pair(a, b)?;
        Ok(SimCiphertext {
            values: Self::zip_with(a, &b.values, |x, y| x + y),
            size: a.size.max(b.size),
            ..a.clone()
        })
    }

    fn sub(&self, a: &SimCiphertext, b: &SimCiphertext) -> Result<SimCiphertext> {
        self.check_pair(a, b)?;
        Ok(SimCiphertext {
            values: Self::zip_with(a, &b.values, |x, y| x - y),
            size: a.size.max(b.size),
            ..a.clone()
        })
    }

    fn add_plain(&self, ct: &SimCiphertext, pt: &SimPlaintext) -> Result<SimCiphertext> {
        self.check_plain(ct, pt)?;
        Ok(SimCiphertext { values: Self::zip_with(ct, &pt.values, |x, y| x + y), ..ct.clone() })
    }

    fn sub_plain(&self, ct: &SimCiphertext, pt: &SimPlaintext) -> Result<SimCiphertext> {
        self.check_plain(ct, pt)?;
        Ok(SimCiphertext { values: Self::zip_with(ct, &pt.values, |x, y| x - y), ..ct.clone() })
    }

    fn add_scalar(&self, ct: &SimCiphertext, c: f64) -> Result<SimCiphertext> {
        Ok(SimCiphertext { values: ct.values.iter().map(|x| x + c).collect(), ..ct.clone() })
    }

    fn mul(&self, a: &SimCiphertext, b: &SimCiphertext) -> Result<SimCiphertext> {
        self.check_multiplicand(a)?;
        self.check_multiplicand(b)?;
        self.check_pair(a, b)?;
        Ok(SimCiphertext {
            values: Self::zip_with(a, &b.values, |x, y| x * y),
            pending_rescale: true,
            size: 3,
            ..a.clone()
        })
    }

    fn mul_plain(&self, ct: &SimCiphertext, pt: &SimPlaintext) -> Result<SimCiphertext> {
        self.check_multiplicand(ct)?;
        self.check_plain(ct, pt)?;
        Ok(SimCiphertext {
            values: Self::zip_with(ct, &pt.values, |x, y| x * y),
            pending_rescale: true,
            ..ct.clone()
        })
    }

    fn mul_scalar(&self, ct: &SimCiphertext, c: f64) -> Result<SimCiphertext> {
        self.check_multiplicand(ct)?;
        let mut c = [c];
        quantize(&mut c, self.params.scale_bits);
        Ok(SimCiphertext {
            values: ct.values.iter().map(|x| x * c[0]).collect(),
            pending_rescale: true,
            ..ct.clone()
        })
    }

    fn relinearize(&self, ct: &SimCiphertext, rlk: &SimRelinKey) -> Result<SimCiphertext> {
        if rlk.key_id != ct.key_id {
            return Err(FheCnnError::KeyMismatch);
        }
        if ct.size == 2 {
            return Ok(ct.clone());
        }
        let mut values = ct.values.clone();
        self.perturb(&mut values, self.params.fresh_noise_std());
        Ok(SimCiphertext { values, size: 2, ..ct.clone() })
    }

    fn rescale(&self, ct: &SimCiphertext) -> Result<SimCiphertext> {
        if !ct.pending_rescale || ct.level == 0 {
            return Err(FheCnnError::ScaleMismatch);
        }
        let mut values = ct.values.clone();
        self.perturb(&mut values, self.params.fresh_noise_std());
        trace!(from = ct.level, to = ct.level - 1, "rescale");
        Ok(SimCiphertext {
            values,
            level: ct.level - 1,
            pending_rescale: false,
            ..ct.clone()
        })
    }

    fn rotate(&self, ct: &SimCiphertext, shift: usize, key: &SimRotationKey) -> Result<SimCiphertext> {
        let num_slots = self.num_slots();
        if shift >= num_slots {
            return Err(FheCnnError::InvalidParam(
                format!("rotation {} not normalized to {} slots", shift, num_slots)
            ));
        }
        if key.shift != shift || key.key_id != ct.key_id {
            return Err(FheCnnError::KeyMismatch);
        }
        if ct.size != 2 {
            return Err(FheCnnError::NotRelinearized);
        }
        let mut values = Vec::with_capacity(num_slots);
        values.extend_from_slice(&ct.values[shift..]);
        values.extend_from_slice(&ct.values[..shift]);
        self.perturb(&mut values, self.params.fresh_noise_std());
        Ok(SimCiphertext { values, ..ct.clone() })
    }

    fn level(&self, ct: &SimCiphertext) -> Result<u32> {
        Ok(ct.level)
    }

    fn plain_level(&self, pt: &SimPlaintext) -> u32 {
        pt.level
    }

    fn level_down(&self, ct: &SimCiphertext, target: u32) -> Result<SimCiphertext> {
        if target > ct.level {
            return Err(FheCnnError::InvalidParam(
                format!("cannot raise level {} to {} without bootstrapping", ct.level, target)
            ));
        }
        if ct.pending_rescale {
            return Err(FheCnnError::ScaleMismatch);
        }
        Ok(SimCiphertext { level: target, ..ct.clone() })
    }

    fn level_down_plain(&self, pt: &SimPlaintext, target: u32) -> Result<SimPlaintext> {
        if target > pt.level {
            return Err(FheCnnError::InvalidParam(
                format!("cannot raise plaintext level {} to {}", pt.level, target)
            ));
        }
        Ok(SimPlaintext { values: pt.values.clone(), level: target })
    }
}

impl KeyGen for SlotSimulator {
    type BootstrapKey = SimBootstrapKey;

    fn gen_secret_key(&self) -> Result<SimSecretKey> {
        Ok(SimSecretKey { id: self.fresh_id() })
    }

    fn gen_rotation_key(&self, sk: &SimSecretKey, shift: usize) -> Result<SimRotationKey> {
        if shift == 0 || shift >= self.num_slots() {
            return Err(FheCnnError::InvalidParam(format!("no rotation key for shift {}", shift)));
        }
        Ok(SimRotationKey {
            shift,
            galois_element: galois_element(shift, self.params.ring_degree()),
            key_id: sk.id,
        })
    }

    fn gen_relin_key(&self, sk: &SimSecretKey) -> Result<SimRelinKey> {
        Ok(SimRelinKey { key_id: sk.id })
    }

    fn gen_bootstrap_key(&self, sk: &SimSecretKey) -> Result<SimBootstrapKey> {
        Ok(SimBootstrapKey { key_id: sk.id })
    }
}

/// Galois element 5^shift mod 2N for a left slot rotation.
fn galois_element(shift: usize, ring_degree: usize) -> usize {
    let m = (2 * ring_degree) as u64;
    let mut result = 1u64;
    let mut base = 5u64 % m;
    let mut e = shift as u64;
    while e > 0 {
        if e & 1 == 1 {
            result = result * base % m;
        }
        base = base * base % m;
        e >>= 1;
    }
    result as usize
}

/// Bootstrapper bound to one secret key.
#[derive(Clone, Debug)]
pub struct SimBootstrapper {
    key: SimBootstrapKey,
    warm: bool,
}

impl SimBootstrapper {
    pub fn new(key: SimBootstrapKey) -> Self {
        Self { key, warm: false }
    }
}

impl Bootstrapper<SlotSimulator> for SimBootstrapper {
    fn warmup(&mut self) -> Result<()> {
        if !self.warm {
            debug!("bootstrapper warmup");
            self.warm = true;
        }
        Ok(())
    }

    fn is_warm(&self) -> bool {
        self.warm
    }

    fn bootstrap(&self, he: &SlotSimulator, ct: &SimCiphertext) -> Result<SimCiphertext> {
        if !self.warm {
            return Err(FheCnnError::BootstrapNotReady);
        }
        if self.key.key_id != ct.key_id {
            return Err(FheCnnError::KeyMismatch);
        }
        he.refresh(ct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::presets::compact_test;

    fn setup() -> (SlotSimulator, SimSecretKey) {
        let he = SlotSimulator::new(compact_test().unwrap(), 42);
        let sk = he.gen_secret_key().unwrap();
        (he, sk)
    }

    fn enc(he: &SlotSimulator, sk: &SimSecretKey, values: &[f64]) -> SimCiphertext {
        let pt = he.encode(values, he.max_level()).unwrap();
        he.encrypt(&pt, sk).unwrap()
    }

    fn dec(he: &SlotSimulator, sk: &SimSecretKey, ct: &SimCiphertext) -> Vec<f64> {
        he.decode(&he.decrypt(ct, sk).unwrap()).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (he, sk) = setup();
        let ct = enc(&he, &sk, &[1.0, -2.5, 3.25]);
        let out = dec(&he, &sk, &ct);
        assert!((out[0] - 1.0).abs() < 1e-9);
        assert!((out[1] + 2.5).abs() < 1e-9);
        assert!((out[2] - 3.25).abs() < 1e-9);
        assert!(out[3].abs() < 1e-9);
    }

    #[test]
    fn test_mul_rescale_consumes_level() {
        let (he, sk) = setup();
        let ct = enc(&he, &sk, &[2.0, 3.0]);
        let prod = he.mul_scalar(&ct, 0.5).unwrap();
        assert!(he.add_plain(&prod, &he.encode(&[1.0], he.max_level()).unwrap()).is_err());
        let prod = he.rescale(&prod).unwrap();
        assert_eq!(he.level(&prod).unwrap(), he.max_level() - 1);
        let out = dec(&he, &sk, &prod);
        assert!((out[0] - 1.0).abs() < 1e-9);
        assert!((out[1] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_ct_mul_needs_relin() {
        let (he, sk) = setup();
        let rlk = he.gen_relin_key(&sk).unwrap();
        let rk = he.gen_rotation_key(&sk, 1).unwrap();
        let ct = enc(&he, &sk, &[3.0, 4.0]);
        let sq = he.mul(&ct, &ct).unwrap();
        assert!(matches!(he.rotate(&sq, 1, &rk), Err(FheCnnError::NotRelinearized)));
        let sq = he.rescale(&he.relinearize(&sq, &rlk).unwrap()).unwrap();
        let rot = he.rotate(&sq, 1, &rk).unwrap();
        let out = dec(&he, &sk, &rot);
        assert!((out[0] - 16.0).abs() < 1e-8);
    }

    #[test]
    fn test_level_exhaustion() {
        let (he, sk) = setup();
        let ct = enc(&he, &sk, &[1.0]);
        let ct = he.level_down(&ct, 0).unwrap();
        assert!(matches!(he.mul_scalar(&ct, 2.0), Err(FheCnnError::LevelExhausted { level: 0 })));
    }

    #[test]
    fn test_add_level_mismatch() {
        let (he, sk) = setup();
        let a = enc(&he, &sk, &[1.0]);
        let b = he.level_down(&a, 3).unwrap();
        assert!(matches!(he.add(&a, &b), Err(FheCnnError::LevelMismatch { .. })));
    }

    #[test]
    fn test_rotate_left() {
        let (he, sk) = setup();
        let n = he.num_slots();
        let key = he.gen_rotation_key(&sk, n - 1).unwrap();
        let ct = enc(&he, &sk, &[1.0, 2.0, 3.0]);
        let out = dec(&he, &sk, &he.rotate(&ct, n - 1, &key).unwrap());
        assert!(out[0].abs() < 1e-9);
        assert!((out[1] - 1.0).abs() < 1e-9);
        assert!((out[3] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_rotation_key() {
        let (he, sk) = setup();
        let key = he.gen_rotation_key(&sk, 2).unwrap();
        let ct = enc(&he, &sk, &[1.0]);
        assert!(matches!(he.rotate(&ct, 3, &key), Err(FheCnnError::KeyMismatch)));
    }

    #[test]
    fn test_bootstrap_requires_warmup() {
        let (he, sk) = setup();
        let mut bts = SimBootstrapper::new(he.gen_bootstrap_key(&sk).unwrap());
        let ct = he.level_down(&enc(&he, &sk, &[0.5]), 1).unwrap();
        assert!(matches!(bts.bootstrap(&he, &ct), Err(FheCnnError::BootstrapNotReady)));
        bts.warmup().unwrap();
        let fresh = bts.bootstrap(&he, &ct).unwrap();
        assert_eq!(he.level(&fresh).unwrap(), he.params().bootstrap_level);
        let out = dec(&he, &sk, &fresh);
        assert!((out[0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_galois_element() {
        assert_eq!(galois_element(0, 8), 1);
        assert_eq!(galois_element(1, 8), 5);
        assert_eq!(galois_element(2, 8), 25 % 16);
    }
}

//! The homomorphic evaluation capability the layer algorithms run on.
//!
//! Layer code is written against [`HomEval`] only, so any CKKS backend that
//! provides packed slots, rescaling, rotations and bootstrapping can be
//! plugged in. [`sim::SlotSimulator`] is the in-process reference backend.

pub mod keys;
pub mod sim;

pub use keys::{EvalKeys, RotationKeyTable, normalize_shift};
pub use sim::{SimBootstrapKey, SimBootstrapper, SimCiphertext, SimPlaintext, SimSecretKey, SlotSimulator};

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;
use crate::params::CkksParams;

/// Packed-slot leveled HE evaluator.
///
/// Every operation returns a new value; inputs are never modified.
/// Binary operations require both operands at the same level and scale.
pub trait HomEval {
    type Ciphertext: Clone + Debug;
    type Plaintext: Clone + Debug;
    type SecretKey;
    type RotationKey: Clone;
    type RelinKey: Clone;

    fn params(&self) -> &Arc<CkksParams>;

    fn num_slots(&self) -> usize {
        self.params().num_slots()
    }

    fn max_level(&self) -> u32 {
        self.params().max_level
    }

    /// Encode up to `num_slots` values at `level`; missing slots are zero.
    fn encode(&self, values: &[f64], level: u32) -> Result<Self::Plaintext>;
    fn decode(&self, pt: &Self::Plaintext) -> Result<Vec<f64>>;

    fn encrypt(&self, pt: &Self::Plaintext, sk: &Self::SecretKey) -> Result<Self::Ciphertext>;
    fn decrypt(&self, ct: &Self::Ciphertext, sk: &Self::SecretKey) -> Result<Self::Plaintext>;

    fn add(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> Result<Self::Ciphertext>;
    fn sub(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> Result<Self::Ciphertext>;
    fn add_plain(&self, ct: &Self::Ciphertext, pt: &Self::Plaintext) -> Result<Self::Ciphertext>;
    fn sub_plain(&self, ct: &Self::Ciphertext, pt: &Self::Plaintext) -> Result<Self::Ciphertext>;
    fn add_scalar(&self, ct: &Self::Ciphertext, c: f64) -> Result<Self::Ciphertext>;

    /// Tensor product; the result has three components until relinearized.
    fn mul(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> Result<Self::Ciphertext>;
    fn mul_plain(&self, ct: &Self::Ciphertext, pt: &Self::Plaintext) -> Result<Self::Ciphertext>;
    fn mul_scalar(&self, ct: &Self::Ciphertext, c: f64) -> Result<Self::Ciphertext>;

    fn relinearize(&self, ct: &Self::Ciphertext, rlk: &Self::RelinKey) -> Result<Self::Ciphertext>;
    /// Divide out one scale factor, consuming one level.
    fn rescale(&self, ct: &Self::Ciphertext) -> Result<Self::Ciphertext>;

    /// Left rotation: output slot i holds input slot (i + shift) mod num_slots.
    /// `shift` must already be normalized to `0..num_slots`.
    fn rotate(
        &self,
        ct: &Self::Ciphertext,
        shift: usize,
        key: &Self::RotationKey,
    ) -> Result<Self::Ciphertext>;

    fn level(&self, ct: &Self::Ciphertext) -> Result<u32>;
    fn plain_level(&self, pt: &Self::Plaintext) -> u32;
    fn level_down(&self, ct: &Self::Ciphertext, target: u32) -> Result<Self::Ciphertext>;
    fn level_down_plain(&self, pt: &Self::Plaintext, target: u32) -> Result<Self::Plaintext>;
}

/// Key-generation collaborators.
pub trait KeyGen: HomEval {
    type BootstrapKey;

    fn gen_secret_key(&self) -> Result<Self::SecretKey>;
    /// Key for a left rotation by `shift` (normalized to `0..num_slots`).
    fn gen_rotation_key(&self, sk: &Self::SecretKey, shift: usize) -> Result<Self::RotationKey>;
    fn gen_relin_key(&self, sk: &Self::SecretKey) -> Result<Self::RelinKey>;
    fn gen_bootstrap_key(&self, sk: &Self::SecretKey) -> Result<Self::BootstrapKey>;
}

/// Level refresh primitive.
pub trait Bootstrapper<E: HomEval> {
    /// One-time setup; must run before the first `bootstrap`.
    fn warmup(&mut self) -> Result<()>;
    fn is_warm(&self) -> bool;
    fn bootstrap(&self, he: &E, ct: &E::Ciphertext) -> Result<E::Ciphertext>;
}

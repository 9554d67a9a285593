use std::cmp::Ordering;

use crate::error::{FheCnnError, Result};
use crate::he::{EvalKeys, HomEval, normalize_shift};

/// Evaluation capability handed to every layer: the backend plus the
/// read-only evaluation keys generated for this run.
///
/// Composite helpers here keep the bookkeeping rules in one place:
/// binary operations level-align their operands first, products are
/// rescaled immediately, and a rotation without a key is an error.
pub struct Session<'a, E: HomEval> {
    he: &'a E,
    keys: &'a EvalKeys<E>,
}

impl<E: HomEval> Clone for Session<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: HomEval> Copy for Session<'_, E> {}

impl<'a, E: HomEval> Session<'a, E> {
    pub fn new(he: &'a E, keys: &'a EvalKeys<E>) -> Self {
        Self { he, keys }
    }

    pub fn he(&self) -> &'a E {
        self.he
    }

    pub fn keys(&self) -> &'a EvalKeys<E> {
        self.keys
    }

    pub fn num_slots(&self) -> usize {
        self.he.num_slots()
    }

    pub fn level(&self, ct: &E::Ciphertext) -> Result<u32> {
        self.he.level(ct)
    }

    /// Rotate left by `shift` slots (negative rotates right).
    pub fn rotate(&self, ct: &E::Ciphertext, shift: isize) -> Result<E::Ciphertext> {
        let shift = normalize_shift(shift, self.num_slots());
        if shift == 0 {
            return Ok(ct.clone());
        }
        let key = self.keys.rotations.get(shift)?;
        self.he.rotate(ct, shift, key)
    }

    /// Level of `ct`, refusing to go on if no multiplicative depth is left.
    fn multiplicable_level(&self, ct: &E::Ciphertext) -> Result<u32> {
        match self.he.level(ct)? {
            0 => Err(FheCnnError::LevelExhausted { level: 0 }),
            level => Ok(level),
        }
    }

    /// `ct ⊙ values`, rescaled. Values are encoded at the ciphertext's level.
    pub fn mul_plain(&self, ct: &E::Ciphertext, values: &[f64]) -> Result<E::Ciphertext> {
        let level = self.multiplicable_level(ct)?;
        let pt = self.he.encode(values, level)?;
        self.he.rescale(&self.he.mul_plain(ct, &pt)?)
    }

    pub fn mul_scalar(&self, ct: &E::Ciphertext, c: f64) -> Result<E::Ciphertext> {
        self.multiplicable_level(ct)?;
        self.he.rescale(&self.he.mul_scalar(ct, c)?)
    }

    /// Ciphertext product: align, multiply, relinearize, rescale.
    pub fn mul(&self, a: &E::Ciphertext, b: &E::Ciphertext) -> Result<E::Ciphertext> {
        self.aligned(a, b, |x, y| {
            self.multiplicable_level(x)?;
            let prod = self.he.mul(x, y)?;
            let prod = self.he.relinearize(&prod, &self.keys.relin)?;
            self.he.rescale(&prod)
        })
    }

    pub fn square(&self, ct: &E::Ciphertext) -> Result<E::Ciphertext> {
        self.mul(ct, ct)
    }

    pub fn add(&self, a: &E::Ciphertext, b: &E::Ciphertext) -> Result<E::Ciphertext> {
        self.aligned(a, b, |x, y| self.he.add(x, y))
    }

    pub fn sub(&self, a: &E::Ciphertext, b: &E::Ciphertext) -> Result<E::Ciphertext> {
        self.aligned(a, b, |x, y| self.he.sub(x, y))
    }

    /// Add a cleartext vector encoded at the ciphertext's level.
    pub fn add_plain(&self, ct: &E::Ciphertext, values: &[f64]) -> Result<E::Ciphertext> {
        let pt = self.he.encode(values, self.he.level(ct)?)?;
        self.he.add_plain(ct, &pt)
    }

    pub fn add_scalar(&self, ct: &E::Ciphertext, c: f64) -> Result<E::Ciphertext> {
        self.he.add_scalar(ct, c)
    }

    /// `Σ cts[i] ⊙ values(i)` with a single rescale at the end.
    ///
    /// All products are taken at the lowest level among `cts`. A term whose
    /// `values` returns `None` is skipped; if every term is skipped the
    /// result is `None`.
    pub fn dot_plain<F>(&self, cts: &[E::Ciphertext], mut values: F) -> Result<Option<E::Ciphertext>>
    where
        F: FnMut(usize) -> Result<Option<Vec<f64>>>,
    {
        let mut level = u32::MAX;
        for ct in cts {
            level = level.min(self.he.level(ct)?);
        }
        if level == 0 {
            return Err(FheCnnError::LevelExhausted { level });
        }

        let mut acc: Option<E::Ciphertext> = None;
        for (i, ct) in cts.iter().enumerate() {
            let Some(v) = values(i)? else { continue };
            let pt = self.he.encode(&v, level)?;
            let prod = if self.he.level(ct)? == level {
                self.he.mul_plain(ct, &pt)?
            } else {
                self.he.mul_plain(&self.he.level_down(ct, level)?, &pt)?
            };
            acc = Some(match acc {
                None => prod,
                Some(a) => self.he.add(&a, &prod)?,
            });
        }
        acc.map(|a| self.he.rescale(&a)).transpose()
    }

    /// Running sum that tolerates an empty accumulator.
    pub fn accumulate(&self, acc: Option<E::Ciphertext>, term: E::Ciphertext) -> Result<Option<E::Ciphertext>> {
        match acc {
            None => Ok(Some(term)),
            Some(acc) => self.add(&acc, &term).map(Some),
        }
    }

    /// Apply `op` after bringing the higher-level operand down to the lower level.
    fn aligned<F>(&self, a: &E::Ciphertext, b: &E::Ciphertext, op: F) -> Result<E::Ciphertext>
    where
        F: FnOnce(&E::Ciphertext, &E::Ciphertext) -> Result<E::Ciphertext>,
    {
        let (la, lb) = (self.he.level(a)?, self.he.level(b)?);
        match la.cmp(&lb) {
            Ordering::Equal => op(a, b),
            Ordering::Greater => op(&self.he.level_down(a, lb)?, b),
            Ordering::Less => op(a, &self.he.level_down(b, la)?),
        }
    }
}

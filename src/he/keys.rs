use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::error::{FheCnnError, Result};
use crate::he::{HomEval, KeyGen};

/// Map a signed rotation (positive = left) onto `0..num_slots`.
pub fn normalize_shift(shift: isize, num_slots: usize) -> usize {
    shift.rem_euclid(num_slots as isize) as usize
}

/// Rotation keys indexed by normalized left shift.
///
/// Built once from the secret key and read-only afterwards. A lookup for a
/// shift that was never generated is a configuration error.
#[derive(Clone, Debug)]
pub struct RotationKeyTable<K> {
    keys: BTreeMap<usize, K>,
    num_slots: usize,
}

impl<K: Clone> RotationKeyTable<K> {
    /// Generate one key per distinct shift. Shift 0 needs no key and is skipped.
    pub fn generate<E>(he: &E, sk: &E::SecretKey, shifts: impl IntoIterator<Item = isize>) -> Result<Self>
    where
        E: KeyGen<RotationKey = K>,
    {
        let num_slots = he.num_slots();
        let wanted: BTreeSet<usize> = shifts
            .into_iter()
            .map(|s| normalize_shift(s, num_slots))
            .filter(|&s| s != 0)
            .collect();

        let mut keys = BTreeMap::new();
        for shift in wanted {
            keys.insert(shift, he.gen_rotation_key(sk, shift)?);
        }
        info!(count = keys.len(), num_slots, "rotation key table generated");
        Ok(Self { keys, num_slots })
    }

    pub fn get(&self, shift: usize) -> Result<&K> {
        self.keys.get(&shift).ok_or_else(|| {
            debug!(shift, "rotation key lookup failed");
            FheCnnError::MissingRotationKey(shift)
        })
    }

    pub fn contains(&self, shift: isize) -> bool {
        self.keys.contains_key(&normalize_shift(shift, self.num_slots))
    }

    /// Drop the key for one shift. Only useful to exercise failure paths.
    pub fn remove(&mut self, shift: isize) -> Option<K> {
        self.keys.remove(&normalize_shift(shift, self.num_slots))
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Evaluation keys a server needs: rotations and relinearization.
pub struct EvalKeys<E: HomEval> {
    pub rotations: RotationKeyTable<E::RotationKey>,
    pub relin: E::RelinKey,
}

impl<E: KeyGen> EvalKeys<E> {
    pub fn generate(he: &E, sk: &E::SecretKey, shifts: impl IntoIterator<Item = isize>) -> Result<Self> {
        Ok(Self {
            rotations: RotationKeyTable::generate(he, sk, shifts)?,
            relin: he.gen_relin_key(sk)?,
        })
    }
}

impl<E: HomEval> Clone for EvalKeys<E> {
    fn clone(&self) -> Self {
        Self {
            rotations: self.rotations.clone(),
            relin: self.relin.clone(),
        }
    }
}

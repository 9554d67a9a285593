//! Slot layout and the encode/decode boundary.
//!
//! Every layer boundary uses the same layout: sample `b` of a batch occupies
//! the block of `stride` slots starting at `b·stride`, and inside a block a
//! `[C,H,W]` tensor is stored in raster order from local slot 0. Slots past
//! a sample's tensor are zero, and layers keep them zero.
//!
//! Values pass through unchanged: decoding returns exactly what was encoded
//! (up to scheme noise). The only normalization in the crate, pixel bytes to
//! `[0,1]`, happens in [`normalize_pixels`].

use crate::error::{FheCnnError, Result};
use crate::he::HomEval;

/// Divisor that maps 8-bit pixel intensities onto `[0,1]`.
pub const PIXEL_SCALE: f64 = 255.0;

pub fn normalize_pixels(bytes: &[u8]) -> Vec<f64> {
    bytes.iter().map(|&b| b as f64 / PIXEL_SCALE).collect()
}

/// Placement of `batch` samples of `stride` slots each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotLayout {
    batch: usize,
    stride: usize,
    num_slots: usize,
}

impl SlotLayout {
    /// One sample owning the whole ciphertext.
    pub fn single(num_slots: usize) -> Self {
        Self { batch: 1, stride: num_slots, num_slots }
    }

    pub fn batched(batch: usize, stride: usize, num_slots: usize) -> Result<Self> {
        if batch == 0 || stride == 0 {
            return Err(FheCnnError::InvalidParam("batch and stride must be positive".into()));
        }
        let needed = batch * stride;
        if needed > num_slots {
            return Err(FheCnnError::CapacityExceeded { needed, available: num_slots });
        }
        Ok(Self { batch, stride, num_slots })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn offset(&self, sample: usize) -> usize {
        sample * self.stride
    }

    /// Fail if a layer needs more local slots than one block provides.
    pub fn check_footprint(&self, footprint: usize) -> Result<()> {
        if footprint > self.stride {
            return Err(FheCnnError::CapacityExceeded { needed: footprint, available: self.stride });
        }
        Ok(())
    }

    /// Full slot vector with `local` repeated at the start of every block.
    pub fn tile(&self, local: &[f64]) -> Result<Vec<f64>> {
        self.check_footprint(local.len())?;
        let mut slots = vec![0.0; self.batch * self.stride];
        for b in 0..self.batch {
            let off = self.offset(b);
            slots[off..off + local.len()].copy_from_slice(local);
        }
        Ok(slots)
    }

    /// Like [`tile`](Self::tile), with the local pattern given by a function of the local slot.
    pub fn tile_with(&self, len: usize, f: impl Fn(usize) -> f64) -> Result<Vec<f64>> {
        let local: Vec<f64> = (0..len).map(f).collect();
        self.tile(&local)
    }

    /// Raster-pack one tensor per block.
    pub fn pack<T: AsRef<[f64]>>(&self, tensors: &[T]) -> Result<Vec<f64>> {
        if tensors.len() != self.batch {
            return Err(FheCnnError::DimensionMismatch { expected: self.batch, got: tensors.len() });
        }
        let mut slots = vec![0.0; self.batch * self.stride];
        for (b, tensor) in tensors.iter().enumerate() {
            let tensor = tensor.as_ref();
            self.check_footprint(tensor.len())?;
            let off = self.offset(b);
            slots[off..off + tensor.len()].copy_from_slice(tensor);
        }
        Ok(slots)
    }

    /// Inverse of [`pack`](Self::pack): the first `out_size` slots of every block.
    pub fn unpack(&self, slots: &[f64], out_size: usize) -> Result<Vec<Vec<f64>>> {
        self.check_footprint(out_size)?;
        if slots.len() < self.batch * self.stride {
            return Err(FheCnnError::DimensionMismatch { expected: self.batch * self.stride, got: slots.len() });
        }
        Ok((0..self.batch)
            .map(|b| {
                let off = self.offset(b);
                slots[off..off + out_size].to_vec()
            })
            .collect())
    }
}

/// Encrypt one flattened tensor into slots `0..len`.
pub fn encode_single<E: HomEval>(he: &E, sk: &E::SecretKey, tensor: &[f64]) -> Result<E::Ciphertext> {
    encode_batch(he, sk, &[tensor], SlotLayout::single(he.num_slots()))
}

/// Encrypt a batch, sample `b` at slot offset `b·stride`.
pub fn encode_batch<E: HomEval, T: AsRef<[f64]>>(
    he: &E,
    sk: &E::SecretKey,
    tensors: &[T],
    layout: SlotLayout,
) -> Result<E::Ciphertext> {
    if layout.num_slots() != he.num_slots() {
        return Err(FheCnnError::DimensionMismatch { expected: he.num_slots(), got: layout.num_slots() });
    }
    let slots = layout.pack(tensors)?;
    let pt = he.encode(&slots, he.max_level())?;
    he.encrypt(&pt, sk)
}

/// Decrypt and split into `batch` vectors of `out_size` values.
pub fn decode_batch<E: HomEval>(
    he: &E,
    sk: &E::SecretKey,
    ct: &E::Ciphertext,
    layout: SlotLayout,
    out_size: usize,
) -> Result<Vec<Vec<f64>>> {
    let slots = he.decode(&he.decrypt(ct, sk)?)?;
    layout.unpack(&slots, out_size)
}

pub fn decode_single<E: HomEval>(
    he: &E,
    sk: &E::SecretKey,
    ct: &E::Ciphertext,
    out_size: usize,
) -> Result<Vec<f64>> {
    let mut out = decode_batch(he, sk, ct, SlotLayout::single(he.num_slots()), out_size)?;
    out.pop().ok_or(FheCnnError::DimensionMismatch { expected: 1, got: 0 })
}

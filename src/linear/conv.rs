//! Convolution by rotation.
//!
//! Each kernel tap `(ic,kh,kw)` is one left rotation of the input by
//! `ic·H·W + kh·W + kw`: afterwards local slot `oh·W + ow` holds
//! `input[ic, oh+kh, ow+kw]`. For an output channel the taps are weighted
//! with plaintexts carrying `weight[oc,ic,kh,kw]` on the valid window
//! (`oh < OH`, `ow < OW`) and summed, which leaves the channel in a "wide"
//! raster of row length `W`. Every output row is then masked out and rotated
//! to its compact position `oc·OH·OW + oh·OW`.

use tracing::instrument;

use crate::error::{FheCnnError, Result};
use crate::he::HomEval;
use crate::model::ConvLayer;
use crate::packing::SlotLayout;
use crate::session::Session;

/// Multiplicative depth: tap products, then row compaction.
pub const DEPTH: u32 = 2;

fn tap_shift(layer: &ConvLayer, ic: usize, kh: usize, kw: usize) -> isize {
    let (h, w) = (layer.input.height, layer.input.width);
    (ic * h * w + kh * w + kw) as isize
}

fn compaction_shift(layer: &ConvLayer, oc: usize, row: usize) -> isize {
    let out = layer.output();
    (row * (layer.input.width - out.width)) as isize - (oc * out.height * out.width) as isize
}

/// Rotations requested by [`conv2d`].
pub fn rotations(layer: &ConvLayer) -> Vec<isize> {
    let out = layer.output();
    let k = layer.kernel;
    let mut shifts = Vec::with_capacity(layer.input.channels * k * k + out.channels * out.height);
    for ic in 0..layer.input.channels {
        for kh in 0..k {
            for kw in 0..k {
                shifts.push(tap_shift(layer, ic, kh, kw));
            }
        }
    }
    for oc in 0..out.channels {
        for row in 0..out.height {
            shifts.push(compaction_shift(layer, oc, row));
        }
    }
    shifts
}

/// Local slots touched per sample: input, wide accumulator and compact output.
pub fn footprint(layer: &ConvLayer) -> usize {
    let out = layer.output();
    layer.input.len().max(out.len()).max(out.height * layer.input.width)
}

/// Homomorphic `conv2d`: output slot `(oc,oh,ow)` =
/// `bias[oc] + Σ weight[oc,ic,kh,kw]·input[ic,oh+kh,ow+kw]`, compact raster order.
#[instrument(skip_all, fields(in_c = layer.input.channels, out_c = layer.out_channels, k = layer.kernel))]
pub fn conv2d<E: HomEval>(
    s: Session<'_, E>,
    ct: E::Ciphertext,
    layer: &ConvLayer,
    layout: SlotLayout,
) -> Result<E::Ciphertext> {
    layout.check_footprint(footprint(layer))?;
    let k = layer.kernel;
    let w = layer.input.width;
    let out = layer.output();
    let wide = out.height * w;

    let mut taps = Vec::with_capacity(layer.input.channels * k * k);
    for ic in 0..layer.input.channels {
        for kh in 0..k {
            for kw in 0..k {
                taps.push(s.rotate(&ct, tap_shift(layer, ic, kh, kw))?);
            }
        }
    }
    drop(ct);

    let mut result = None;
    for oc in 0..out.channels {
        let channel = s.dot_plain(&taps, |t| {
            let (ic, kh, kw) = (t / (k * k), (t / k) % k, t % k);
            let wv = layer.weight_at(oc, ic, kh, kw);
            layout.tile_with(wide, |p| if p % w < out.width { wv } else { 0.0 }).map(Some)
        })?;
        let channel = channel.ok_or_else(|| FheCnnError::InvalidParam("convolution without taps".into()))?;

        for row in 0..out.height {
            let mask = layout.tile_with(wide, |p| {
                if p / w == row && p % w < out.width { 1.0 } else { 0.0 }
            })?;
            let picked = s.mul_plain(&channel, &mask)?;
            let moved = s.rotate(&picked, compaction_shift(layer, oc, row))?;
            result = s.accumulate(result, moved)?;
        }
    }
    let result = result.ok_or_else(|| FheCnnError::InvalidParam("convolution without outputs".into()))?;

    let plane = out.height * out.width;
    let bias = layout.tile_with(out.len(), |p| layer.bias[p / plane])?;
    s.add_plain(&result, &bias)
}

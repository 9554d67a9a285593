//! 2×2 average pooling with stride 2.

use tracing::instrument;

use crate::error::{FheCnnError, Result};
use crate::he::HomEval;
use crate::linear::fc::{self, rotate_and_sum};
use crate::model::TensorShape;
use crate::packing::SlotLayout;
use crate::session::Session;

/// Column compaction, then row/channel compaction.
pub const DEPTH: u32 = 2;

pub fn output_shape(input: TensorShape) -> TensorShape {
    TensorShape::new(input.channels, input.height / 2, input.width / 2)
}

fn row_shift(input: TensorShape, c: usize, i: usize) -> isize {
    let out = output_shape(input);
    let from = (c * input.height + 2 * i) * input.width;
    let to = (c * out.height + i) * out.width;
    (from - to) as isize
}

/// Rotations requested by [`avg_pool_2x2`].
pub fn rotations(input: TensorShape) -> Vec<isize> {
    let out = output_shape(input);
    let mut shifts = fc::rotate_and_sum_rotations(2);
    shifts.push(input.width as isize);
    shifts.extend((1..out.width).map(|j| j as isize));
    for c in 0..input.channels {
        for i in 0..out.height {
            shifts.push(row_shift(input, c, i));
        }
    }
    shifts
}

pub fn footprint(input: TensorShape) -> usize {
    input.len()
}

/// Homomorphic 2×2 average pool of a compact `[C,H,W]` tensor into compact `[C,H/2,W/2]`.
///
/// The window sum `x + rot(x,1) + rot(x,W) + rot(x,W+1)`, taken as a pair sum
/// plus its copy one row down, lands on the even anchors `(c,2i,2j)`. The anchors of column `2j` are scaled by 1/4 and
/// moved to column `j`, then every row `(c,2i)` is moved to `(c,i)`.
#[instrument(skip_all, fields(c = input.channels, h = input.height, w = input.width))]
pub fn avg_pool_2x2<E: HomEval>(
    s: Session<'_, E>,
    ct: E::Ciphertext,
    input: TensorShape,
    layout: SlotLayout,
) -> Result<E::Ciphertext> {
    if input.height % 2 != 0 || input.width % 2 != 0 || input.is_empty() {
        return Err(FheCnnError::InvalidParam(format!(
            "pooling needs even height and width, got {}x{}", input.height, input.width
        )));
    }
    layout.check_footprint(footprint(input))?;
    let (h, w) = (input.height, input.width);
    let out = output_shape(input);
    let len = input.len();

    let pairs = rotate_and_sum(s, ct, 2)?;
    let sum = s.add(&pairs, &s.rotate(&pairs, w as isize)?)?;
    drop(pairs);

    let mut columns = None;
    for j in 0..out.width {
        let mask = layout.tile_with(len, |p| {
            let (row, col) = ((p / w) % h, p % w);
            if row % 2 == 0 && col == 2 * j { 0.25 } else { 0.0 }
        })?;
        let picked = s.mul_plain(&sum, &mask)?;
        columns = s.accumulate(columns, s.rotate(&picked, j as isize)?)?;
    }
    let columns = columns.ok_or_else(|| FheCnnError::InvalidParam("empty pooling input".into()))?;

    let mut rows = None;
    for c in 0..input.channels {
        for i in 0..out.height {
            let start = (c * h + 2 * i) * w;
            let mask = layout.tile_with(len, |p| {
                if p >= start && p < start + out.width { 1.0 } else { 0.0 }
            })?;
            let picked = s.mul_plain(&columns, &mask)?;
            rows = s.accumulate(rows, s.rotate(&picked, row_shift(input, c, i))?)?;
        }
    }
    rows.ok_or_else(|| FheCnnError::InvalidParam("empty pooling input".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::{EvalKeys, KeyGen, SlotSimulator};
    use crate::packing::{decode_single, encode_single};
    use crate::params::presets::compact_test;
    use crate::plain;

    #[test]
    fn test_avg_pool_matches_plain() {
        let shape = TensorShape::new(2, 4, 4);
        let input: Vec<f64> = (1..=32).map(|v| v as f64).collect();

        let he = SlotSimulator::new(compact_test().unwrap(), 21);
        let sk = he.gen_secret_key().unwrap();
        let keys = EvalKeys::generate(&he, &sk, rotations(shape)).unwrap();
        let s = Session::new(&he, &keys);

        let ct = encode_single(&he, &sk, &input).unwrap();
        let out = avg_pool_2x2(s, ct, shape, SlotLayout::single(he.num_slots())).unwrap();
        assert_eq!(he.level(&out).unwrap(), he.max_level() - DEPTH);

        let got = decode_single(&he, &sk, &out, 12).unwrap();
        let expected = plain::avg_pool_2x2(&input, shape);
        assert_eq!(expected, vec![3.5, 5.5, 11.5, 13.5, 19.5, 21.5, 27.5, 29.5]);
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-5, "{} vs {}", g, e);
        }
        assert!(got[8..].iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_odd_input_rejected() {
        let he = SlotSimulator::new(compact_test().unwrap(), 22);
        let sk = he.gen_secret_key().unwrap();
        let keys = EvalKeys::generate(&he, &sk, [1]).unwrap();
        let s = Session::new(&he, &keys);
        let ct = encode_single(&he, &sk, &[0.0; 9]).unwrap();
        let res = avg_pool_2x2(s, ct, TensorShape::new(1, 3, 3), SlotLayout::single(he.num_slots()));
        assert!(matches!(res, Err(FheCnnError::InvalidParam(_))));
    }
}

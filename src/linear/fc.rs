//! Fully-connected layer by the diagonal method with baby-step giant-step.
//!
//! With `n = max(in, out)` and `n = n1·n2` (rounded up), the generalized
//! diagonal `k = j·n2 + i` of the padded `n×n` matrix is applied as
//!
//! ```text
//! y = Σ_j rot( Σ_i rot(x, i) ⊙ D_{j,i} , j·n2 )
//! D_{j,i}[t] = W[(t - j·n2) mod n][(t + i) mod n]   for t ∈ [j·n2, j·n2 + n)
//! ```
//!
//! so only `n2 - 1` baby-step and `n1 - 1` giant-step rotations are needed.
//! Reading `x` at `(t + i) mod n` for `t + i` up to `2n - 2` needs a second
//! copy of `x` right after the first, which one rotation by `-n` provides
//! because the slots past `x` are zero.

use tracing::{debug, instrument};

use crate::error::{FheCnnError, Result};
use crate::he::HomEval;
use crate::model::DenseLayer;
use crate::packing::SlotLayout;
use crate::session::Session;

/// One plaintext product per diagonal.
pub const DEPTH: u32 = 1;

/// Split `n` into `(n1, n2)` with `n1 = floor(sqrt(n))` and the smallest `n2` such that `n1·n2 ≥ n`.
pub fn bsgs_split(n: usize) -> (usize, usize) {
    if n <= 1 {
        return (1, n.max(1));
    }
    let mut n1 = (n as f64).sqrt() as usize;
    // Guard against rounding in the float square root.
    while n1 * n1 > n {
        n1 -= 1;
    }
    while (n1 + 1) * (n1 + 1) <= n {
        n1 += 1;
    }
    let n2 = n.div_ceil(n1);
    (n1, n2)
}

fn padded_dim(layer: &DenseLayer) -> usize {
    layer.in_features.max(layer.out_features)
}

/// Rotations requested by [`fc`].
pub fn rotations(layer: &DenseLayer) -> Vec<isize> {
    let n = padded_dim(layer);
    let (n1, n2) = bsgs_split(n);
    let mut shifts = vec![-(n as isize)];
    shifts.extend((1..n2).map(|i| i as isize));
    shifts.extend((1..n1).map(|j| j * n2).filter(|&g| g < n).map(|g| g as isize));
    shifts
}

/// Input plus its replica.
pub fn footprint(layer: &DenseLayer) -> usize {
    2 * padded_dim(layer)
}

/// Diagonal `(j, i)` as a local pattern of `j·n2 + n` slots, or `None` if it is all zero.
fn diagonal(layer: &DenseLayer, n: usize, n2: usize, j: usize, i: usize) -> Option<Vec<f64>> {
    let start = j * n2;
    let mut d = vec![0.0; start + n];
    let mut any = false;
    for (row, slot) in d[start..].iter_mut().enumerate() {
        let col = (start + row + i) % n;
        if row < layer.out_features && col < layer.in_features {
            *slot = layer.weight_at(row, col);
            any |= *slot != 0.0;
        }
    }
    any.then_some(d)
}

/// Homomorphic `W·x + b`: input in local slots `[0, in)`, output in `[0, out)`, zeros after.
#[instrument(skip_all, fields(in_features = layer.in_features, out_features = layer.out_features))]
pub fn fc<E: HomEval>(
    s: Session<'_, E>,
    ct: E::Ciphertext,
    layer: &DenseLayer,
    layout: SlotLayout,
) -> Result<E::Ciphertext> {
    let n = padded_dim(layer);
    layout.check_footprint(footprint(layer))?;
    let (n1, n2) = bsgs_split(n);
    debug!(n, n1, n2, "bsgs split");

    let replicated = s.add(&ct, &s.rotate(&ct, -(n as isize))?)?;
    drop(ct);

    let mut baby = Vec::with_capacity(n2);
    for i in 1..n2 {
        baby.push(s.rotate(&replicated, i as isize)?);
    }
    baby.insert(0, replicated);

    let mut result = None;
    for j in 0..n1 {
        let giant = j * n2;
        if giant >= n {
            break;
        }
        let terms = (n - giant).min(n2);
        let inner = s.dot_plain(&baby[..terms], |i| match diagonal(layer, n, n2, j, i) {
            Some(d) => layout.tile(&d).map(Some),
            None => Ok(None),
        })?;
        let Some(inner) = inner else { continue };
        result = s.accumulate(result, s.rotate(&inner, giant as isize)?)?;
    }

    // All-zero weights still spend one level so the output sits at the usual depth.
    let product = match result {
        Some(r) => r,
        None => s.mul_scalar(&baby[0], 0.0)?,
    };
    s.add_plain(&product, &layout.tile(&layer.bias)?)
}

/// Sum `width` consecutive slots into the first one: `log2(width)` rotate-and-add doublings.
///
/// Slot `t` of the result holds `Σ_{r<width} x[t + r]`; `width` must be a power of two.
pub fn rotate_and_sum<E: HomEval>(s: Session<'_, E>, ct: E::Ciphertext, width: usize) -> Result<E::Ciphertext> {
    if !width.is_power_of_two() {
        return Err(FheCnnError::InvalidParam(format!("rotate-and-sum width {} is not a power of two", width)));
    }
    let mut acc = ct;
    let mut step = 1;
    while step < width {
        acc = s.add(&acc, &s.rotate(&acc, step as isize)?)?;
        step *= 2;
    }
    Ok(acc)
}

/// Rotations requested by [`rotate_and_sum`].
pub fn rotate_and_sum_rotations(width: usize) -> Vec<isize> {
    (0..width.trailing_zeros()).map(|b| 1isize << b).collect()
}

//! Soft comparison, tournament max and one-hot extraction over class logits.

use tracing::instrument;

use crate::error::Result;
use crate::he::{Bootstrapper, HomEval};
use crate::level::{level_align, LevelManager};
use crate::packing::SlotLayout;
use crate::session::Session;

/// Levels consumed by [`gt`].
pub const GT_DEPTH: u32 = 2;
/// Levels consumed by one soft-max round: `gt`, then the blend product.
pub const MAX_ROUND_DEPTH: u32 = GT_DEPTH + 1;
/// Default floor below which the tournament result is refreshed before broadcasting.
pub const ONE_HOT_FLOOR: u32 = 4;

/// Number of slots the tournament reduces over: `count` rounded up to a power of two.
pub fn tournament_width(count: usize) -> usize {
    count.max(1).next_power_of_two()
}

/// Copies of the logits laid side by side so the first `tournament_width` slots all hold real logits.
fn replica_count(count: usize) -> usize {
    tournament_width(count).div_ceil(count.max(1))
}

/// Rotations requested by [`tournament_max`] and [`one_hot`].
pub fn one_hot_rotations(count: usize) -> Vec<isize> {
    let width = tournament_width(count);
    let mut shifts: Vec<isize> = (1..replica_count(count)).map(|c| -((c * count) as isize)).collect();
    let mut step = 1;
    while step < width {
        shifts.push(step as isize);
        shifts.push(-(step as isize));
        step *= 2;
    }
    shifts
}

pub fn one_hot_footprint(count: usize) -> usize {
    (replica_count(count) * count).max(2 * tournament_width(count))
}

/// Soft `x > y`: with `d = (x - y)/2`, `0.5 + 0.5·d - 0.125·d³`.
///
/// Graded near ties; meaningful while `|x - y| ≲ 2`. Slots outside the data
/// evaluate to 0.5.
pub fn gt<E: HomEval>(s: Session<'_, E>, x: &E::Ciphertext, y: &E::Ciphertext) -> Result<E::Ciphertext> {
    // In terms of δ = x - y: 0.5 + 0.25·δ - 0.015625·δ³.
    let delta = s.sub(x, y)?;
    let linear = s.mul_scalar(&delta, 0.25)?;
    let square = s.square(&delta)?;
    let cubic = s.mul(&s.mul_scalar(&delta, -0.015625)?, &square)?;
    s.add_scalar(&s.add(&linear, &cubic)?, 0.5)
}

/// Approximate maximum of the first `count` slots of each block, left in local slot 0.
///
/// The logits are first repeated past slot `count` so that every slot the
/// `{1,2,4,..}` reduction reads holds a real logit; each round then blends
/// `cur + (rot(cur,k) - cur)·gt(rot(cur,k), cur)`.
#[instrument(skip_all, fields(count = count))]
pub fn tournament_max<E, B>(
    s: Session<'_, E>,
    levels: &mut LevelManager<E, B>,
    ct: E::Ciphertext,
    count: usize,
    layout: SlotLayout,
) -> Result<E::Ciphertext>
where
    E: HomEval,
    B: Bootstrapper<E>,
{
    layout.check_footprint(one_hot_footprint(count))?;
    let mut cur = ct.clone();
    for c in 1..replica_count(count) {
        cur = s.add(&cur, &s.rotate(&ct, -((c * count) as isize))?)?;
    }
    drop(ct);

    let width = tournament_width(count);
    let mut step = 1;
    while step < width {
        cur = levels.stage(s.he(), cur, "max_round", MAX_ROUND_DEPTH, |cur| {
            let rotated = s.rotate(&cur, step as isize)?;
            let weight = gt(s, &rotated, &cur)?;
            let blend = s.mul(&s.sub(&rotated, &cur)?, &weight)?;
            s.add(&cur, &blend)
        })?;
        step *= 2;
    }
    Ok(cur)
}

/// Soft one-hot of the logits: slot `i < count` holds `gt(logit_i, max)`, other slots zero.
///
/// The argmax of the result matches the argmax of the logits whenever the
/// largest logit is not tied, since `gt` is increasing in its first argument
/// over the working range.
#[instrument(skip_all, fields(count = count, floor = floor))]
pub fn one_hot<E, B>(
    s: Session<'_, E>,
    levels: &mut LevelManager<E, B>,
    logits: E::Ciphertext,
    count: usize,
    floor: u32,
    layout: SlotLayout,
) -> Result<E::Ciphertext>
where
    E: HomEval,
    B: Bootstrapper<E>,
{
    let he = s.he();
    let max = tournament_max(s, levels, logits.clone(), count, layout)?;
    let max = levels.ensure_depth(he, max, floor, "one_hot_floor")?;

    let width = tournament_width(count);
    let head = layout.tile_with(1, |_| 1.0)?;
    let broadcast = levels.stage(he, max, "max_broadcast", 1, |max| {
        let mut b = s.mul_plain(&max, &head)?;
        let mut step = 1;
        while step < width {
            b = s.add(&b, &s.rotate(&b, -(step as isize))?)?;
            step *= 2;
        }
        Ok(b)
    })?;

    let broadcast = levels.ensure_depth(he, broadcast, GT_DEPTH + 1, "one_hot_broadcast")?;
    let logits = levels.ensure_depth(he, logits, GT_DEPTH + 1, "one_hot_logits")?;
    let (logits, broadcast) = level_align(he, logits, broadcast)?;
    let classes = layout.tile_with(count, |_| 1.0)?;
    levels.stage(he, logits, "one_hot_compare", GT_DEPTH + 1, |logits| {
        let indicator = gt(s, &logits, &broadcast)?;
        s.mul_plain(&indicator, &classes)
    })
}

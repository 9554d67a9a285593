//! Level budget tracking and bootstrap policy.

use std::marker::PhantomData;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::{FheCnnError, Result};
use crate::he::{Bootstrapper, HomEval};

/// Where a ciphertext's remaining depth came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelState {
    Fresh(u32),
    Consumed(u32),
    Refreshed(u32),
}

impl LevelState {
    pub fn level(&self) -> u32 {
        match *self {
            LevelState::Fresh(l) | LevelState::Consumed(l) | LevelState::Refreshed(l) => l,
        }
    }
}

/// One entry of the level trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelEvent {
    pub stage: &'static str,
    /// Levels the stage was declared to consume (0 for encryption and bootstrap).
    pub depth: u32,
    pub before: u32,
    pub after: LevelState,
}

/// Bring the higher-level operand down to the lower one.
pub fn level_align<E: HomEval>(
    he: &E,
    a: E::Ciphertext,
    b: E::Ciphertext,
) -> Result<(E::Ciphertext, E::Ciphertext)> {
    let (la, lb) = (he.level(&a)?, he.level(&b)?);
    if la > lb {
        Ok((he.level_down(&a, lb)?, b))
    } else if lb > la {
        Ok((a, he.level_down(&b, la)?))
    } else {
        Ok((a, b))
    }
}

/// Owns the bootstrapper and decides when to refresh.
pub struct LevelManager<E: HomEval, B: Bootstrapper<E>> {
    bootstrapper: B,
    events: Vec<LevelEvent>,
    bootstraps: usize,
    _eval: PhantomData<fn(&E)>,
}

impl<E: HomEval, B: Bootstrapper<E>> LevelManager<E, B> {
    pub fn new(bootstrapper: B) -> Self {
        Self {
            bootstrapper,
            events: Vec::new(),
            bootstraps: 0,
            _eval: PhantomData,
        }
    }

    /// One-time bootstrapper setup. Repeated calls are no-ops.
    pub fn warmup(&mut self) -> Result<()> {
        if self.bootstrapper.is_warm() {
            return Ok(());
        }
        let start = Instant::now();
        self.bootstrapper.warmup()?;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "bootstrapper warmed up");
        Ok(())
    }

    pub fn is_warm(&self) -> bool {
        self.bootstrapper.is_warm()
    }

    /// True when the level is at or below `threshold`, or cannot be read.
    pub fn need_bootstrap(&self, he: &E, ct: &E::Ciphertext, threshold: u32) -> bool {
        match he.level(ct) {
            Ok(level) => level <= threshold,
            Err(e) => {
                warn!(error = %e, "level query failed, assuming bootstrap is needed");
                true
            }
        }
    }

    /// Refresh `ct`; the level afterwards must be strictly higher.
    pub fn bootstrap(&mut self, he: &E, ct: E::Ciphertext, stage: &'static str) -> Result<E::Ciphertext> {
        let before = he.level(&ct)?;
        let start = Instant::now();
        let fresh = self.bootstrapper.bootstrap(he, &ct)?;
        let after = he.level(&fresh)?;
        if after <= before {
            return Err(FheCnnError::BootstrapIneffective { before, after });
        }
        self.bootstraps += 1;
        info!(
            stage,
            before,
            after,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "bootstrap"
        );
        self.events.push(LevelEvent { stage, depth: 0, before, after: LevelState::Refreshed(after) });
        Ok(fresh)
    }

    /// Bootstrap if `ct` sits at or below `threshold`.
    pub fn checkpoint(
        &mut self,
        he: &E,
        ct: E::Ciphertext,
        threshold: u32,
        stage: &'static str,
    ) -> Result<E::Ciphertext> {
        if self.need_bootstrap(he, &ct, threshold) {
            self.bootstrap(he, ct, stage)
        } else {
            Ok(ct)
        }
    }

    /// Make sure `ct` can absorb `depth` more multiplications.
    pub fn ensure_depth(
        &mut self,
        he: &E,
        ct: E::Ciphertext,
        depth: u32,
        stage: &'static str,
    ) -> Result<E::Ciphertext> {
        if depth == 0 {
            return Ok(ct);
        }
        let ct = self.checkpoint(he, ct, depth - 1, stage)?;
        let available = he.level(&ct)?;
        if available < depth {
            return Err(FheCnnError::InsufficientDepth { needed: depth, available });
        }
        Ok(ct)
    }

    /// Record a freshly encrypted ciphertext.
    pub fn begin(&mut self, he: &E, ct: &E::Ciphertext) -> Result<()> {
        let level = he.level(ct)?;
        self.events.push(LevelEvent { stage: "encrypt", depth: 0, before: level, after: LevelState::Fresh(level) });
        Ok(())
    }

    /// Run a level-consuming stage: refresh first if needed, then log the level change.
    pub fn stage<F>(
        &mut self,
        he: &E,
        ct: E::Ciphertext,
        stage: &'static str,
        depth: u32,
        f: F,
    ) -> Result<E::Ciphertext>
    where
        F: FnOnce(E::Ciphertext) -> Result<E::Ciphertext>,
    {
        let ct = self.ensure_depth(he, ct, depth, stage)?;
        let before = he.level(&ct)?;
        let out = f(ct)?;
        let after = he.level(&out)?;
        debug!(stage, before, after, "stage done");
        self.events.push(LevelEvent { stage, depth, before, after: LevelState::Consumed(after) });
        Ok(out)
    }

    pub fn events(&self) -> &[LevelEvent] {
        &self.events
    }

    pub fn bootstrap_count(&self) -> usize {
        self.bootstraps
    }
}

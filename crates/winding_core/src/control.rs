//! Composable convergence controls.
//!
//! Four roles govern a run: iteration (produce the next sampling
//! density), state (expose/restore a serializable snapshot), data
//! (consume newly computed results), and convergence (report a boolean
//! or per-neighbor-pair booleans). A concrete control may implement
//! several roles at once; [`PosCheck`] implements three.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::line::LineData;
use crate::math::{cyclic_dist, max_move};
use crate::refine::{RefineSample, SampleEntry};

/// Convergence outcome: one flag for a line, one flag per neighbor pair
/// for a surface or volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Convergence {
    Single(bool),
    PerPair(Vec<bool>),
}

impl Convergence {
    /// True when every reported flag is true.
    pub fn all(&self) -> bool {
        match self {
            Convergence::Single(flag) => *flag,
            Convergence::PerPair(flags) => flags.iter().all(|&f| f),
        }
    }
}

/// Snapshot of one stateful control, as a closed tagged variant so that
/// restore goes through an explicit match rather than a runtime registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", content = "state")]
pub enum ControlState {
    StepRange { last_emitted: Option<usize> },
    PosCheck { max_move: Option<f64>, wcc: Option<Vec<f64>> },
}

/// Snapshot maps keyed by control tag, as persisted on every result.
pub type StateMap = BTreeMap<String, ControlState>;
pub type ConvergenceMap = BTreeMap<String, Convergence>;

/// Iteration role: yields the next sampling density, `None` on
/// exhaustion.
pub trait IterationControl {
    fn next_density(&mut self) -> Option<usize>;
}

/// State role: the minimal serializable data needed to reproduce this
/// control's future decisions exactly from a given point.
pub trait StatefulControl {
    fn tag(&self) -> &'static str;
    fn state(&self) -> ControlState;
    fn restore(&mut self, state: &ControlState) -> Result<()>;
}

/// Data role: folds a newly computed data object into internal counters.
pub trait DataControl<D: ?Sized> {
    fn update(&mut self, data: &D);
}

/// Convergence role: must report non-convergence before any update.
pub trait ConvergenceControl {
    fn converged(&self) -> Convergence;
}

// ---------------------------------------------------------------------
// StepRange: iteration + state
// ---------------------------------------------------------------------

/// Walks a fixed sequence of increasing k-point densities, never
/// re-emitting a density at or below the last one handed out. Restoring
/// its state fast-forwards past densities a previous run already used.
#[derive(Debug, Clone)]
pub struct StepRange {
    densities: Vec<usize>,
    last_emitted: Option<usize>,
}

impl StepRange {
    pub fn new(densities: &[usize]) -> Self {
        Self {
            densities: densities.to_vec(),
            last_emitted: None,
        }
    }

    /// The density the next call to [`IterationControl::next_density`]
    /// would return, without consuming it.
    pub fn peek(&self) -> Option<usize> {
        self.densities
            .iter()
            .copied()
            .find(|&n| self.last_emitted.map_or(true, |last| n > last))
    }
}

impl IterationControl for StepRange {
    fn next_density(&mut self) -> Option<usize> {
        let next = self.peek()?;
        self.last_emitted = Some(next);
        Some(next)
    }
}

impl StatefulControl for StepRange {
    fn tag(&self) -> &'static str {
        "StepRange"
    }

    fn state(&self) -> ControlState {
        ControlState::StepRange {
            last_emitted: self.last_emitted,
        }
    }

    fn restore(&mut self, state: &ControlState) -> Result<()> {
        match state {
            ControlState::StepRange { last_emitted } => {
                self.last_emitted = *last_emitted;
                Ok(())
            }
            other => Err(Error::Config(format!(
                "cannot restore StepRange from {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------
// PosCheck: state + data + convergence
// ---------------------------------------------------------------------

/// Line-level position convergence: the maximum cyclic movement between
/// the two most recent WCC lists must fall below `tol`.
#[derive(Debug, Clone)]
pub struct PosCheck {
    tol: f64,
    max_move: Option<f64>,
    wcc: Option<Vec<f64>>,
}

impl PosCheck {
    pub fn new(tol: f64) -> Self {
        Self {
            tol,
            max_move: None,
            wcc: None,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.max_move.is_some_and(|m| m < self.tol)
    }
}

impl DataControl<LineData> for PosCheck {
    fn update(&mut self, data: &LineData) {
        if let Some(prev) = &self.wcc {
            self.max_move = Some(max_move(prev, &data.wcc));
        }
        self.wcc = Some(data.wcc.clone());
    }
}

impl ConvergenceControl for PosCheck {
    fn converged(&self) -> Convergence {
        Convergence::Single(self.is_converged())
    }
}

impl StatefulControl for PosCheck {
    fn tag(&self) -> &'static str {
        "PosCheck"
    }

    fn state(&self) -> ControlState {
        ControlState::PosCheck {
            max_move: self.max_move,
            wcc: self.wcc.clone(),
        }
    }

    fn restore(&mut self, state: &ControlState) -> Result<()> {
        match state {
            ControlState::PosCheck { max_move, wcc } => {
                self.max_move = *max_move;
                self.wcc = wcc.clone();
                Ok(())
            }
            other => Err(Error::Config(format!(
                "cannot restore PosCheck from {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------
// GapCheck / MoveCheck: data + convergence, per neighbor pair
// ---------------------------------------------------------------------

/// Neighbor-pair gap proximity: no WCC of the right sample may lie
/// within `tol * min(gap sizes)` of the left sample's largest gap.
#[derive(Debug, Clone)]
pub struct GapCheck {
    tol: f64,
    converged: Option<Vec<bool>>,
}

impl GapCheck {
    pub fn new(tol: f64) -> Self {
        Self {
            tol,
            converged: None,
        }
    }

    fn pair_ok<E: RefineSample>(&self, left: &E, right: &E) -> bool {
        let threshold = self.tol * left.gap_width().min(right.gap_width());
        // a degenerate gap leaves nothing to scale against
        if threshold <= 0.0 {
            return true;
        }
        let gap_pos = left.gap_position();
        right
            .wcc_list()
            .iter()
            .all(|&w| cyclic_dist(w, gap_pos) > threshold)
    }
}

impl<E: RefineSample> DataControl<[SampleEntry<E>]> for GapCheck {
    fn update(&mut self, entries: &[SampleEntry<E>]) {
        let flags = entries
            .windows(2)
            .map(|pair| self.pair_ok(&pair[0].value, &pair[1].value))
            .collect();
        self.converged = Some(flags);
    }
}

impl ConvergenceControl for GapCheck {
    /// Unconverged until the first update; no data is never convergence.
    fn converged(&self) -> Convergence {
        self.converged
            .as_ref()
            .map_or(Convergence::Single(false), |flags| {
                Convergence::PerPair(flags.clone())
            })
    }
}

/// Neighbor-pair movement: the gap-aware movement metric between the two
/// samples' WCC lists must stay below `tol * min(gap sizes)`.
#[derive(Debug, Clone)]
pub struct MoveCheck {
    tol: f64,
    converged: Option<Vec<bool>>,
}

impl MoveCheck {
    pub fn new(tol: f64) -> Self {
        Self {
            tol,
            converged: None,
        }
    }

    fn pair_ok<E: RefineSample>(&self, left: &E, right: &E) -> bool {
        let threshold = self.tol * left.gap_width().min(right.gap_width());
        if threshold <= 0.0 {
            return true;
        }
        max_move(&left.wcc_list(), &right.wcc_list()) < threshold
    }
}

impl<E: RefineSample> DataControl<[SampleEntry<E>]> for MoveCheck {
    fn update(&mut self, entries: &[SampleEntry<E>]) {
        let flags = entries
            .windows(2)
            .map(|pair| self.pair_ok(&pair[0].value, &pair[1].value))
            .collect();
        self.converged = Some(flags);
    }
}

impl ConvergenceControl for MoveCheck {
    /// Unconverged until the first update; no data is never convergence.
    fn converged(&self) -> Convergence {
        self.converged
            .as_ref()
            .map_or(Convergence::Single(false), |flags| {
                Convergence::PerPair(flags.clone())
            })
    }
}

/// Tags under which the pair checks appear in convergence snapshots.
pub const GAP_CHECK_TAG: &str = "GapCheck";
pub const MOVE_CHECK_TAG: &str = "MoveCheck";

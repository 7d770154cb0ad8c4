//! Adaptive refinement of an ordered family of samples.
//!
//! The surface engine refines lines over `t`; the volume engine refines
//! surfaces over `s`. Both are the same state machine: seed evenly,
//! evaluate per-neighbor-pair convergence, bisect every failing pair
//! down to a minimum-spacing floor, repeat until nothing new is
//! inserted. This module implements that machine once, parametrized
//! over the element type.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::control::{
    Convergence, ConvergenceControl, ConvergenceMap, DataControl, GapCheck, MoveCheck,
    GAP_CHECK_TAG, MOVE_CHECK_TAG,
};
use crate::error::{Error, Result};

/// Aggregated view of a sample exposed to the neighbor-pair checks.
///
/// A line reports its own WCC list and gap; a surface reports the pooled
/// WCC list of its lines and the gap of its worst-separated line.
pub trait RefineSample {
    fn wcc_list(&self) -> Vec<f64>;
    fn gap_position(&self) -> f64;
    fn gap_width(&self) -> f64;
}

/// One element of the ordered family, pinned at a parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEntry<E> {
    /// Parameter value in `[0, 1]` (`t` for surfaces, `s` for volumes).
    pub pos: f64,
    pub value: E,
}

/// An append-only collection of samples with strictly increasing
/// parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedSamples<E> {
    entries: Vec<SampleEntry<E>>,
}

impl<E> Default for OrderedSamples<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<E> OrderedSamples<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[SampleEntry<E>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parameter values, in order.
    pub fn positions(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.pos).collect()
    }

    pub fn get(&self, pos: f64) -> Option<&E> {
        self.entries
            .iter()
            .find(|e| e.pos == pos)
            .map(|e| &e.value)
    }

    /// Inserts a sample at `pos`, replacing any sample already pinned
    /// there; requesting the same position twice never creates two
    /// entries. Ordering by position is preserved.
    pub fn insert(&mut self, pos: f64, value: E) {
        match self
            .entries
            .binary_search_by(|e| e.pos.total_cmp(&pos))
        {
            Ok(idx) => self.entries[idx].value = value,
            Err(idx) => self.entries.insert(idx, SampleEntry { pos, value }),
        }
    }
}

/// Options governing one refinement run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefineSettings {
    /// Initial uniform seeding count, at least 2.
    pub num_samples: usize,
    /// Gap-proximity tolerance; `None` disables the check.
    pub gap_tol: Option<f64>,
    /// Neighbor-movement tolerance; `None` disables the check.
    pub move_tol: Option<f64>,
    /// Bisection floor: pairs closer than this give up instead of
    /// splitting further, which guarantees termination.
    pub min_neighbour_dist: f64,
}

impl RefineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.num_samples < 2 {
            return Err(Error::Config(format!(
                "need at least 2 samples to refine, got {}",
                self.num_samples
            )));
        }
        if !(self.min_neighbour_dist > 0.0 && self.min_neighbour_dist < 1.0) {
            return Err(Error::Config(format!(
                "min_neighbour_dist must lie in (0, 1), got {}",
                self.min_neighbour_dist
            )));
        }
        if let Some(tol) = self.gap_tol {
            if tol <= 0.0 {
                return Err(Error::Config(format!("gap_tol must be positive, got {tol}")));
            }
        }
        if let Some(tol) = self.move_tol {
            if tol <= 0.0 {
                return Err(Error::Config(format!(
                    "move_tol must be positive, got {tol}"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a refinement run: the final samples plus the last
/// convergence snapshot of every enabled pair check.
#[derive(Debug, Clone)]
pub struct Refinement<E> {
    pub samples: OrderedSamples<E>,
    pub convergence: ConvergenceMap,
}

struct PairChecks {
    gap: Option<GapCheck>,
    mov: Option<MoveCheck>,
}

impl PairChecks {
    fn new(settings: &RefineSettings) -> Self {
        Self {
            gap: settings.gap_tol.map(GapCheck::new),
            mov: settings.move_tol.map(MoveCheck::new),
        }
    }

    fn update<E: RefineSample>(&mut self, entries: &[SampleEntry<E>]) {
        if let Some(gap) = self.gap.as_mut() {
            gap.update(entries);
        }
        if let Some(mov) = self.mov.as_mut() {
            mov.update(entries);
        }
    }

    fn snapshot(&self) -> ConvergenceMap {
        let mut map = ConvergenceMap::new();
        if let Some(gap) = &self.gap {
            map.insert(GAP_CHECK_TAG.to_string(), gap.converged());
        }
        if let Some(mov) = &self.mov {
            map.insert(MOVE_CHECK_TAG.to_string(), mov.converged());
        }
        map
    }

    /// Per-pair AND of every enabled check; all-true when both are
    /// disabled.
    fn pairs_ok(&self, num_pairs: usize) -> Vec<bool> {
        let mut flags = vec![true; num_pairs];
        for check in self.snapshot().values() {
            if let Convergence::PerPair(list) = check {
                for (flag, &ok) in flags.iter_mut().zip(list.iter()) {
                    *flag &= ok;
                }
            }
        }
        flags
    }
}

/// Identifies a neighbor pair by the bit patterns of its two parameter
/// values, which never change once inserted.
fn pair_key<E>(left: &SampleEntry<E>, right: &SampleEntry<E>) -> (u64, u64) {
    (left.pos.to_bits(), right.pos.to_bits())
}

/// Runs the seed/converge/bisect state machine.
///
/// `compute` produces the element at a parameter value, receiving the
/// previously stored element (if any) so an engine can resume from its
/// persisted control state. `progress` sees a consistent snapshot after
/// every insertion or recomputation, for incremental checkpointing.
pub fn refine_samples<E, F, P>(
    settings: &RefineSettings,
    init: Option<OrderedSamples<E>>,
    mut compute: F,
    mut progress: P,
) -> Result<Refinement<E>>
where
    E: RefineSample,
    F: FnMut(f64, Option<&E>) -> Result<E>,
    P: FnMut(&OrderedSamples<E>, &ConvergenceMap) -> Result<()>,
{
    settings.validate()?;

    let mut samples = init.unwrap_or_default();
    let mut checks = PairChecks::new(settings);

    // Seed: the uniform grid, plus every position a loaded result
    // already holds. Existing samples are recomputed through their own
    // persisted state, which is a fast no-op once converged.
    let mut seed_positions: Vec<f64> = (0..settings.num_samples)
        .map(|i| i as f64 / (settings.num_samples - 1) as f64)
        .collect();
    for pos in samples.positions() {
        if !seed_positions.contains(&pos) {
            seed_positions.push(pos);
        }
    }
    seed_positions.sort_by(|a, b| a.total_cmp(b));

    log::info!("seeding {} samples", seed_positions.len());
    for pos in seed_positions {
        let value = compute(pos, samples.get(pos))?;
        samples.insert(pos, value);
        checks.update(samples.entries());
        progress(&samples, &checks.snapshot())?;
    }

    // Converge/bisect until every pair passes or gives up.
    let mut gave_up: HashSet<(u64, u64)> = HashSet::new();
    loop {
        checks.update(samples.entries());
        let pair_ok = checks.pairs_ok(samples.len() - 1);

        let mut midpoints = Vec::new();
        for (pair, &ok) in samples.entries().windows(2).zip(pair_ok.iter()) {
            if ok || gave_up.contains(&pair_key(&pair[0], &pair[1])) {
                continue;
            }
            let spacing = pair[1].pos - pair[0].pos;
            if spacing <= settings.min_neighbour_dist {
                log::warn!(
                    "pair [{:.6}, {:.6}] below spacing floor {}, giving up",
                    pair[0].pos,
                    pair[1].pos,
                    settings.min_neighbour_dist
                );
                gave_up.insert(pair_key(&pair[0], &pair[1]));
                continue;
            }
            midpoints.push(0.5 * (pair[0].pos + pair[1].pos));
        }

        if midpoints.is_empty() {
            break;
        }

        log::info!("bisecting {} non-converged pairs", midpoints.len());
        for pos in midpoints {
            let value = compute(pos, None)?;
            samples.insert(pos, value);
            checks.update(samples.entries());
            progress(&samples, &checks.snapshot())?;
        }
    }

    Ok(Refinement {
        convergence: checks.snapshot(),
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal element: one WCC at a fixed position.
    #[derive(Debug, Clone, PartialEq)]
    struct Flat(f64);

    impl RefineSample for Flat {
        fn wcc_list(&self) -> Vec<f64> {
            vec![self.0]
        }
        fn gap_position(&self) -> f64 {
            crate::math::frac(self.0 + 0.5)
        }
        fn gap_width(&self) -> f64 {
            1.0
        }
    }

    fn settings(num: usize) -> RefineSettings {
        RefineSettings {
            num_samples: num,
            gap_tol: None,
            move_tol: None,
            min_neighbour_dist: 0.01,
        }
    }

    #[test]
    fn ordered_samples_insertion_keeps_strict_order() {
        let mut samples = OrderedSamples::new();
        for pos in [0.5, 0.0, 1.0, 0.25, 0.75] {
            samples.insert(pos, Flat(pos));
        }
        let positions = samples.positions();
        assert!(positions.windows(2).all(|p| p[0] < p[1]));
        assert_eq!(positions.len(), 5);
    }

    #[test]
    fn inserting_the_same_position_twice_is_idempotent() {
        let mut samples = OrderedSamples::new();
        samples.insert(0.5, Flat(0.1));
        samples.insert(0.5, Flat(0.2));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples.get(0.5), Some(&Flat(0.2)));
    }

    #[test]
    fn disabled_checks_keep_the_seed_grid() {
        let refinement = refine_samples(
            &settings(5),
            None,
            |pos, _| Ok(Flat(pos * 0.0)),
            |_, _| Ok(()),
        )
        .expect("refinement should succeed");
        assert_eq!(refinement.samples.len(), 5);
        assert!(refinement.convergence.is_empty());
    }

    #[test]
    fn failing_move_check_bisects_down_to_the_floor_and_terminates() {
        // WCC jumps with t, so the move check keeps failing; the floor
        // must stop the bisection in finite time with pairs reported
        // unconverged.
        let opts = RefineSettings {
            num_samples: 2,
            gap_tol: None,
            move_tol: Some(0.001),
            min_neighbour_dist: 0.05,
        };
        let refinement = refine_samples(
            &opts,
            None,
            |pos, _| Ok(Flat(crate::math::frac(0.4 * pos))),
            |_, _| Ok(()),
        )
        .expect("refinement should terminate");

        let positions = refinement.samples.positions();
        assert!(positions.windows(2).all(|p| p[0] < p[1]));
        assert!(positions
            .windows(2)
            .all(|p| p[1] - p[0] >= 0.05 / 2.0 - 1e-12));
        let conv = refinement
            .convergence
            .get(MOVE_CHECK_TAG)
            .expect("move check snapshot present");
        assert!(!conv.all());
    }

    #[test]
    fn converged_pairs_are_not_bisected() {
        let mut calls = 0;
        let opts = RefineSettings {
            num_samples: 3,
            gap_tol: Some(0.3),
            move_tol: Some(0.3),
            min_neighbour_dist: 0.01,
        };
        let refinement = refine_samples(
            &opts,
            None,
            |_, _| {
                calls += 1;
                Ok(Flat(0.0))
            },
            |_, _| Ok(()),
        )
        .expect("refinement should succeed");
        assert_eq!(refinement.samples.len(), 3);
        assert_eq!(calls, 3);
        assert!(refinement.convergence.values().all(Convergence::all));
    }

    #[test]
    fn seeding_reuses_loaded_samples() {
        let mut init = OrderedSamples::new();
        init.insert(0.0, Flat(0.0));
        init.insert(0.5, Flat(0.0));
        init.insert(1.0, Flat(0.0));

        let mut fresh_computes = 0;
        refine_samples(
            &settings(3),
            Some(init),
            |_, prev| {
                if prev.is_none() {
                    fresh_computes += 1;
                }
                Ok(Flat(0.0))
            },
            |_, _| Ok(()),
        )
        .expect("refinement should succeed");
        assert_eq!(fresh_computes, 0, "all three seeds had prior samples");
    }

    #[test]
    fn too_few_samples_is_a_configuration_error() {
        let err = refine_samples(
            &settings(1),
            None,
            |pos, _: Option<&Flat>| Ok(Flat(pos)),
            |_, _| Ok(()),
        )
        .expect_err("must fail");
        assert!(matches!(err, Error::Config(_)));
    }
}

//! The surface engine: an adaptively refined family of lines.
//!
//! A surface is a loop family parametrized by `t` in `[0, 1]`. Lines are
//! seeded uniformly and bisected wherever a neighbor pair fails the gap
//! or movement check, down to the minimum-spacing floor.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;

use crate::control::{Convergence, ConvergenceMap, StateMap};
use crate::error::Result;
use crate::line::{run_line_impl, LineResult, LineSettings};
use crate::refine::{refine_samples, OrderedSamples, RefineSample, RefineSettings, SampleEntry};
use crate::save::{self, SaveSettings, SavedResult};
use crate::system::{KPoint, KpointSystem};

/// Options for one surface run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceSettings {
    /// Settings applied to every contained line.
    pub line: LineSettings,
    /// Initial uniform seeding count, at least 2.
    pub num_lines: usize,
    /// Gap-proximity tolerance between neighboring lines; `None`
    /// disables the check.
    pub gap_tol: Option<f64>,
    /// Movement tolerance between neighboring lines; `None` disables
    /// the check.
    pub move_tol: Option<f64>,
    /// Bisection floor in `t`.
    pub min_neighbour_dist: f64,
}

impl Default for SurfaceSettings {
    fn default() -> Self {
        Self {
            line: LineSettings::default(),
            num_lines: 11,
            gap_tol: Some(0.3),
            move_tol: Some(0.3),
            min_neighbour_dist: 0.01,
        }
    }
}

impl SurfaceSettings {
    pub(crate) fn refine(&self) -> RefineSettings {
        RefineSettings {
            num_samples: self.num_lines,
            gap_tol: self.gap_tol,
            move_tol: self.move_tol,
            min_neighbour_dist: self.min_neighbour_dist,
        }
    }
}

/// A completed surface: the ordered `(t, line)` collection plus the
/// surface-level control snapshots taken when it was assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceResult {
    pub data: OrderedSamples<LineResult>,
    pub states: StateMap,
    pub convergence: ConvergenceMap,
}

impl SurfaceResult {
    pub(crate) fn assemble(data: OrderedSamples<LineResult>, convergence: ConvergenceMap) -> Self {
        Self {
            data,
            states: StateMap::new(),
            convergence,
        }
    }

    /// The `(t, line)` entries, ordered by `t`.
    pub fn lines(&self) -> &[SampleEntry<LineResult>] {
        self.data.entries()
    }

    /// All line parameter values, strictly increasing.
    pub fn t(&self) -> Vec<f64> {
        self.data.positions()
    }

    /// WCC list of every line.
    pub fn wcc(&self) -> Vec<Vec<f64>> {
        self.lines().iter().map(|e| e.value.data.wcc.clone()).collect()
    }

    /// Total polarization of every line, modulo 1.
    pub fn pol(&self) -> Vec<f64> {
        self.lines().iter().map(|e| e.value.pol()).collect()
    }

    /// Largest-gap midpoint of every line.
    pub fn gap_pos(&self) -> Vec<f64> {
        self.lines().iter().map(|e| e.value.data.gap_pos).collect()
    }

    /// Largest-gap width of every line.
    pub fn gap_size(&self) -> Vec<f64> {
        self.lines().iter().map(|e| e.value.data.gap_size).collect()
    }

    /// True when every surface-level pair check and every contained
    /// line reported convergence.
    pub fn converged(&self) -> bool {
        self.convergence.values().all(Convergence::all)
            && self.lines().iter().all(|e| e.value.converged())
    }
}

impl RefineSample for SurfaceResult {
    /// Pooled WCC list over all lines, for volume-level comparisons.
    fn wcc_list(&self) -> Vec<f64> {
        let mut wcc: Vec<f64> = self
            .lines()
            .iter()
            .flat_map(|e| e.value.data.wcc.iter().copied())
            .collect();
        wcc.sort_by(|a, b| a.total_cmp(b));
        wcc
    }

    /// Gap of the worst-separated line.
    fn gap_position(&self) -> f64 {
        self.worst_gap().map_or(0.5, |line| line.data.gap_pos)
    }

    fn gap_width(&self) -> f64 {
        self.worst_gap().map_or(1.0, |line| line.data.gap_size)
    }
}

impl SurfaceResult {
    fn worst_gap(&self) -> Option<&LineResult> {
        self.lines()
            .iter()
            .map(|e| &e.value)
            .min_by(|a, b| a.data.gap_size.total_cmp(&b.data.gap_size))
    }
}

/// Computes a converged surface, checkpointing according to `save`.
pub fn run_surface<S, F>(
    system: &S,
    surface: F,
    settings: &SurfaceSettings,
    save: &SaveSettings,
    init_result: Option<&SurfaceResult>,
) -> Result<SurfaceResult>
where
    S: KpointSystem,
    F: Fn(f64, f64) -> KPoint,
{
    let loaded = save::resolve_init(save, init_result, save::expect_surface)?;
    let worker = save.spawn_worker()?;
    // a caller-held init result must never be retroactively altered
    let init = loaded.or_else(|| init_result.cloned());

    let result = run_surface_impl(system, surface, settings, init, |snapshot| {
        if let Some(worker) = &worker {
            worker.dispatch(SavedResult::Surface(snapshot.clone()));
        }
        Ok(())
    })?;

    if let Some(worker) = worker {
        worker.dispatch(SavedResult::Surface(result.clone()));
        worker.close()?;
    }
    Ok(result)
}

/// The surface algorithm proper, shared with the volume engine (which
/// handles persistence at its own level). `progress` sees a full surface
/// snapshot after every completed line density, not just after every
/// line, so an interruption loses at most one density of one line.
pub(crate) fn run_surface_impl<S, F, P>(
    system: &S,
    surface: F,
    settings: &SurfaceSettings,
    init: Option<SurfaceResult>,
    progress: P,
) -> Result<SurfaceResult>
where
    S: KpointSystem,
    F: Fn(f64, f64) -> KPoint,
    P: FnMut(&SurfaceResult) -> Result<()>,
{
    // mirror of the refine engine's state, so per-density line snapshots
    // can be lifted into complete surface checkpoints mid-computation
    let completed = RefCell::new((
        init.as_ref().map(|r| r.data.clone()).unwrap_or_default(),
        ConvergenceMap::new(),
    ));
    let progress = RefCell::new(progress);

    let refinement = refine_samples(
        &settings.refine(),
        init.map(|r| r.data),
        |t, prev| {
            run_line_impl(system, |k| surface(t, k), &settings.line, prev, |partial| {
                let (mut samples, convergence) = completed.borrow().clone();
                samples.insert(t, partial.clone());
                (&mut *progress.borrow_mut())(&SurfaceResult::assemble(samples, convergence))
            })
        },
        |samples, convergence| {
            *completed.borrow_mut() = (samples.clone(), convergence.clone());
            (&mut *progress.borrow_mut())(&SurfaceResult::assemble(
                samples.clone(),
                convergence.clone(),
            ))
        },
    )?;

    Ok(SurfaceResult::assemble(
        refinement.samples,
        refinement.convergence,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::OverlapSystem;
    use crate::wilson::OverlapMatrix;
    use std::cell::Cell;

    fn identity_system() -> impl KpointSystem {
        OverlapSystem(|kpts: &[KPoint]| {
            Ok(vec![OverlapMatrix::identity(2, 2); kpts.len() - 1])
        })
    }

    fn plane(t: f64, k: f64) -> KPoint {
        KPoint::new(k, t, 0.0)
    }

    #[test]
    fn identity_surface_keeps_exactly_the_seed_lines() {
        let settings = SurfaceSettings {
            num_lines: 5,
            gap_tol: None,
            move_tol: None,
            ..SurfaceSettings::default()
        };
        let result = run_surface_impl(&identity_system(), plane, &settings, None, |_| Ok(()))
            .expect("surface should converge");

        assert_eq!(result.lines().len(), 5);
        for entry in result.lines() {
            assert_eq!(entry.value.data.wcc, vec![0.0, 0.0]);
            assert_eq!(entry.value.data.gap_size, 1.0);
            assert_eq!(entry.value.data.gap_pos, 0.5);
        }
        assert!(result.converged());
    }

    #[test]
    fn t_values_are_strictly_increasing() {
        let result = run_surface_impl(
            &identity_system(),
            plane,
            &SurfaceSettings::default(),
            None,
            |_| Ok(()),
        )
        .expect("surface should converge");
        let t = result.t();
        assert!(t.windows(2).all(|p| p[0] < p[1]));
        assert_eq!(t.first().copied(), Some(0.0));
        assert_eq!(t.last().copied(), Some(1.0));
    }

    #[test]
    fn resuming_from_a_converged_result_recomputes_nothing() {
        let calls = Cell::new(0usize);
        let system = OverlapSystem(|kpts: &[KPoint]| {
            calls.set(calls.get() + 1);
            Ok(vec![OverlapMatrix::identity(2, 2); kpts.len() - 1])
        });

        let settings = SurfaceSettings::default();
        let first = run_surface_impl(&system, plane, &settings, None, |_| Ok(()))
            .expect("surface should converge");
        let calls_after_first = calls.get();

        let resumed =
            run_surface_impl(&system, plane, &settings, Some(first.clone()), |_| Ok(()))
                .expect("resume should succeed");
        assert_eq!(calls.get(), calls_after_first, "no line was recomputed");
        assert_eq!(resumed, first);
    }

    #[test]
    fn projections_are_consistent_with_lines() {
        let result = run_surface_impl(
            &identity_system(),
            plane,
            &SurfaceSettings::default(),
            None,
            |_| Ok(()),
        )
        .expect("surface should converge");

        assert_eq!(result.pol().len(), result.lines().len());
        assert_eq!(result.gap_pos().len(), result.lines().len());
        assert!(result.pol().iter().all(|&p| p == 0.0));
        assert_eq!(result.wcc()[0], vec![0.0, 0.0]);
    }
}

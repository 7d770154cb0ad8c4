//! The line engine: Wannier charge centers along one closed k-space
//! loop.
//!
//! A line is converged by repeatedly raising the k-point density until
//! the position check is satisfied or the iteration control runs out of
//! densities. Non-convergence is recorded in the result, never raised.

use serde::{Deserialize, Serialize};

use crate::control::{
    Convergence, ConvergenceControl, ConvergenceMap, DataControl, IterationControl, PosCheck,
    StateMap, StatefulControl, StepRange,
};
use crate::error::{Error, Result};
use crate::math::{frac, largest_gap};
use crate::refine::RefineSample;
use crate::save::{self, SaveSettings, SaveWorker, SavedResult};
use crate::system::{check_closed, check_samples, sample_loop, EigenstateSet, KPoint, KpointSystem};
use crate::wilson::{
    complex_eigenvalues, wcc_from_eigenvalues, wilson_eigenvectors, wilson_loop, OverlapMatrix,
};

/// WCCs of one loop at one sampling density, derived from the Wilson
/// loop and immutable once computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineData {
    /// Sorted WCC values in `[0, 1)`.
    pub wcc: Vec<f64>,
    /// Midpoint of the largest cyclic gap between consecutive WCCs.
    pub gap_pos: f64,
    /// Width of that gap.
    pub gap_size: f64,
    /// Density `N` this line was computed at (`N + 1` sampled k-points).
    pub num_kpoints: usize,
    /// Wilson-loop eigenvectors, present when the collaborator supplied
    /// eigenstates. Columns correspond to `wcc` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wilson_eigenvectors: Option<OverlapMatrix>,
    /// The constituent eigenstates themselves, for symmetry projections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eigenstates: Option<Vec<EigenstateSet>>,
}

impl LineData {
    /// Builds line data from a Wilson loop. Eigenvectors are only
    /// extracted when eigenstates are available, matching what the
    /// overlap-only collaborator variant can support.
    pub fn from_wilson(
        w: &OverlapMatrix,
        num_kpoints: usize,
        eigenstates: Option<Vec<EigenstateSet>>,
    ) -> Result<Self> {
        let mut eigenvalues = complex_eigenvalues(w)?;
        // keep eigenvalue (and later eigenvector) order aligned with the
        // sorted WCC list
        eigenvalues.sort_by(|a, b| {
            frac(a.arg() / std::f64::consts::TAU).total_cmp(&frac(b.arg() / std::f64::consts::TAU))
        });
        let wcc = wcc_from_eigenvalues(&eigenvalues);
        let gap = largest_gap(&wcc);

        let wilson_eigenvectors = if eigenstates.is_some() {
            Some(wilson_eigenvectors(w, &eigenvalues)?)
        } else {
            None
        };

        Ok(Self {
            wcc,
            gap_pos: gap.pos,
            gap_size: gap.size,
            num_kpoints,
            wilson_eigenvectors,
            eigenstates,
        })
    }

    /// Line data from bare WCC values, with no Wilson-loop extras.
    pub fn from_wcc(mut wcc: Vec<f64>, num_kpoints: usize) -> Self {
        wcc.sort_by(|a, b| a.total_cmp(b));
        let gap = largest_gap(&wcc);
        Self {
            wcc,
            gap_pos: gap.pos,
            gap_size: gap.size,
            num_kpoints,
            wilson_eigenvectors: None,
            eigenstates: None,
        }
    }

    /// Total polarization: sum of the WCCs, modulo 1.
    pub fn pol(&self) -> f64 {
        frac(self.wcc.iter().sum::<f64>())
    }
}

/// A converged (or given-up) line: its data plus a snapshot of every
/// stateful control's state and every convergence outcome at the moment
/// it was produced. Superseded, never mutated, on recomputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineResult {
    pub data: LineData,
    pub states: StateMap,
    pub convergence: ConvergenceMap,
}

impl LineResult {
    /// True when every convergence control reported success.
    pub fn converged(&self) -> bool {
        self.convergence.values().all(Convergence::all)
    }

    pub fn pol(&self) -> f64 {
        self.data.pol()
    }
}

impl RefineSample for LineResult {
    fn wcc_list(&self) -> Vec<f64> {
        self.data.wcc.clone()
    }

    fn gap_position(&self) -> f64 {
        self.data.gap_pos
    }

    fn gap_width(&self) -> f64 {
        self.data.gap_size
    }
}

/// Options for one line run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSettings {
    /// Position-convergence tolerance; `None` computes at the first
    /// density only.
    pub pos_tol: Option<f64>,
    /// Increasing k-point densities to walk through.
    pub densities: Vec<usize>,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            pos_tol: Some(1e-2),
            densities: (8..27).step_by(2).collect(),
        }
    }
}

impl LineSettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(tol) = self.pos_tol {
            if tol <= 0.0 {
                return Err(Error::Config(format!("pos_tol must be positive, got {tol}")));
            }
        }
        if self.densities.windows(2).any(|d| d[1] <= d[0]) {
            return Err(Error::Config(
                "k-point densities must be strictly increasing".into(),
            ));
        }
        if self.densities.first() == Some(&0) {
            return Err(Error::Config("k-point density 0 is not samplable".into()));
        }
        Ok(())
    }
}

/// Computes a converged line, checkpointing according to `save`.
pub fn run_line<S: KpointSystem>(
    system: &S,
    path: impl Fn(f64) -> KPoint,
    settings: &LineSettings,
    save: &SaveSettings,
    init_result: Option<&LineResult>,
) -> Result<LineResult> {
    let init = save::resolve_init(save, init_result, save::expect_line)?;
    let worker = save.spawn_worker()?;

    let result = run_line_impl(
        system,
        path,
        settings,
        init.as_ref().or(init_result),
        |snapshot| {
            if let Some(worker) = &worker {
                worker.dispatch(SavedResult::Line(snapshot.clone()));
            }
            Ok(())
        },
    )?;

    if let Some(worker) = worker {
        worker.dispatch(SavedResult::Line(result.clone()));
        worker.close()?;
    }
    Ok(result)
}

/// Full result snapshot at the current control state, so an interrupted
/// run can resume from the last completed density.
fn line_snapshot(data: &LineData, steps: &StepRange, pos_check: Option<&PosCheck>) -> LineResult {
    let mut states = StateMap::new();
    states.insert(steps.tag().to_string(), steps.state());
    let mut convergence = ConvergenceMap::new();
    if let Some(check) = pos_check {
        states.insert(check.tag().to_string(), check.state());
        convergence.insert(check.tag().to_string(), check.converged());
    }
    LineResult {
        data: data.clone(),
        states,
        convergence,
    }
}

/// The line algorithm proper, shared with the surface engine (which
/// handles persistence itself). `progress` sees a resumable snapshot
/// after every computed density.
pub(crate) fn run_line_impl<S: KpointSystem>(
    system: &S,
    path: impl Fn(f64) -> KPoint,
    settings: &LineSettings,
    init: Option<&LineResult>,
    mut progress: impl FnMut(&LineResult) -> Result<()>,
) -> Result<LineResult> {
    settings.validate()?;
    check_closed(&path)?;

    let mut steps = StepRange::new(&settings.densities);
    let mut pos_check = settings.pos_tol.map(PosCheck::new);
    let mut last_data: Option<LineData> = None;

    if let Some(prev) = init {
        match pos_check.as_mut() {
            Some(check) => {
                // exact resume: both controls pick up where the stored
                // line left off, with no recomputation of past densities
                if let Some(state) = prev.states.get(check.tag()) {
                    check.restore(state)?;
                }
                if let Some(state) = prev.states.get(steps.tag()) {
                    steps.restore(state)?;
                }
                if check.is_converged() {
                    return Ok(prev.clone());
                }
                last_data = Some(prev.data.clone());
            }
            None => {
                // without a tolerance the only question is whether the
                // requested density matches the stored one
                if steps.peek() == Some(prev.data.num_kpoints) {
                    return Ok(prev.clone());
                }
            }
        }
    }

    while let Some(n) = steps.next_density() {
        let kpts = sample_loop(&path, n);
        let samples = system.sample(&kpts)?;
        check_samples(&samples, kpts.len())?;

        let w = wilson_loop(&samples.overlaps)?;
        let data = LineData::from_wilson(&w, n, samples.eigenstates)?;
        log::debug!(
            "line at density {n}: {} WCCs, gap size {:.4}",
            data.wcc.len(),
            data.gap_size
        );

        if let Some(check) = pos_check.as_mut() {
            check.update(&data);
        }
        progress(&line_snapshot(&data, &steps, pos_check.as_ref()))?;
        last_data = Some(data);

        if pos_check.as_ref().map_or(true, PosCheck::is_converged) {
            break;
        }
    }

    let data = last_data.ok_or(Error::NoData)?;
    if let Some(check) = &pos_check {
        if !check.is_converged() {
            log::warn!(
                "line did not converge within the iteration budget (last density {})",
                data.num_kpoints
            );
        }
    }

    Ok(line_snapshot(&data, &steps, pos_check.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::OverlapSystem;
    use crate::wilson::OverlapMatrix;
    use num_complex::Complex;
    use std::cell::Cell;
    use std::f64::consts::TAU;

    fn identity_system() -> impl KpointSystem {
        OverlapSystem(|kpts: &[KPoint]| {
            Ok(vec![OverlapMatrix::identity(2, 2); kpts.len() - 1])
        })
    }

    fn straight_loop(t: f64) -> KPoint {
        KPoint::new(t, 0.0, 0.0)
    }

    #[test]
    fn identity_overlaps_give_zero_wcc_and_full_gap() {
        let result = run_line_impl(
            &identity_system(),
            straight_loop,
            &LineSettings::default(),
            None,
            |_| Ok(()),
        )
        .expect("line should converge");

        assert_eq!(result.data.wcc, vec![0.0, 0.0]);
        assert_eq!(result.data.gap_size, 1.0);
        assert_eq!(result.data.gap_pos, 0.5);
        assert!(result.converged());
        // identical WCCs on the second density already satisfy pos_tol
        assert_eq!(result.data.num_kpoints, 10);
    }

    #[test]
    fn open_path_is_rejected_before_sampling() {
        let err = run_line_impl(
            &identity_system(),
            |t| KPoint::new(0.5 * t, 0.0, 0.0),
            &LineSettings::default(),
            None,
            |_| Ok(()),
        )
        .expect_err("open loop must fail");
        assert!(matches!(err, Error::OpenLoop { .. }));
    }

    #[test]
    fn empty_density_list_propagates_as_no_data() {
        let settings = LineSettings {
            pos_tol: Some(1e-2),
            densities: Vec::new(),
        };
        let err = run_line_impl(&identity_system(), straight_loop, &settings, None, |_| Ok(()))
            .expect_err("no density means no result");
        assert!(matches!(err, Error::NoData));
    }

    #[test]
    fn exhausted_iterator_records_non_convergence() {
        // one single density can never satisfy a movement tolerance
        let settings = LineSettings {
            pos_tol: Some(1e-2),
            densities: vec![8],
        };
        let result = run_line_impl(&identity_system(), straight_loop, &settings, None, |_| Ok(()))
            .expect("best-effort result is still produced");
        assert!(!result.converged());
    }

    #[test]
    fn progress_sees_a_resumable_snapshot_after_every_density() {
        let mut snapshots: Vec<LineResult> = Vec::new();
        let result = run_line_impl(
            &identity_system(),
            straight_loop,
            &LineSettings::default(),
            None,
            |snap| {
                snapshots.push(snap.clone());
                Ok(())
            },
        )
        .expect("line should converge");

        assert_eq!(snapshots.len(), 2, "one snapshot per computed density");
        assert_eq!(snapshots[0].data.num_kpoints, 8);
        assert!(!snapshots[0].converged());
        assert_eq!(snapshots[1], result);

        // the intermediate snapshot carries enough state to finish the
        // run exactly as the uninterrupted one did
        let resumed = run_line_impl(
            &identity_system(),
            straight_loop,
            &LineSettings::default(),
            Some(&snapshots[0]),
            |_| Ok(()),
        )
        .expect("resume should succeed");
        assert_eq!(resumed, result);
    }

    #[test]
    fn resuming_a_converged_line_skips_recomputation() {
        let calls = Cell::new(0usize);
        let system = OverlapSystem(|kpts: &[KPoint]| {
            calls.set(calls.get() + 1);
            Ok(vec![OverlapMatrix::identity(2, 2); kpts.len() - 1])
        });

        let settings = LineSettings::default();
        let first = run_line_impl(&system, straight_loop, &settings, None, |_| Ok(()))
            .expect("line should converge");
        let calls_before_resume = calls.get();

        let resumed = run_line_impl(&system, straight_loop, &settings, Some(&first), |_| Ok(()))
            .expect("resume should succeed");
        assert_eq!(calls.get(), calls_before_resume, "no extra system calls");
        assert_eq!(resumed, first);
    }

    #[test]
    fn disabled_pos_tol_skips_matching_density() {
        let calls = Cell::new(0usize);
        let system = OverlapSystem(|kpts: &[KPoint]| {
            calls.set(calls.get() + 1);
            Ok(vec![OverlapMatrix::identity(2, 2); kpts.len() - 1])
        });

        let settings = LineSettings {
            pos_tol: None,
            densities: vec![8],
        };
        let first = run_line_impl(&system, straight_loop, &settings, None, |_| Ok(()))
            .expect("single-density line");
        assert_eq!(first.data.num_kpoints, 8);
        assert_eq!(calls.get(), 1);

        let resumed = run_line_impl(&system, straight_loop, &settings, Some(&first), |_| Ok(()))
            .expect("resume should succeed");
        assert_eq!(calls.get(), 1, "matching density is not recomputed");
        assert_eq!(resumed, first);
    }

    #[test]
    fn phase_overlap_system_recovers_the_phase() {
        // 1x1 overlaps e^{i 2 pi x / N} multiply around the loop to a
        // Wilson loop with WCC exactly x
        let x = 0.3;
        let system = OverlapSystem(move |kpts: &[KPoint]| {
            let n = kpts.len() - 1;
            let phase = Complex::from_polar(1.0, TAU * x / n as f64);
            Ok(vec![OverlapMatrix::from_element(1, 1, phase); n])
        });

        let result = run_line_impl(&system, straight_loop, &LineSettings::default(), None, |_| Ok(()))
            .expect("line should converge");
        assert_eq!(result.data.wcc.len(), 1);
        assert!((result.data.wcc[0] - x).abs() < 1e-10);
        assert!((result.pol() - x).abs() < 1e-10);
    }
}

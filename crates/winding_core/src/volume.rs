//! The volume engine: an adaptively refined family of surfaces.
//!
//! Structurally the surface algorithm one level up: surfaces are seeded
//! along `s` in `[0, 1]` and bisected wherever a neighbor pair fails a
//! check on its aggregated quantities. Each inserted or recomputed
//! surface re-runs its own lines through the surface engine.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;

use crate::control::{Convergence, ConvergenceMap, StateMap};
use crate::error::Result;
use crate::refine::{refine_samples, OrderedSamples, RefineSettings, SampleEntry};
use crate::save::{self, SaveSettings, SavedResult};
use crate::surface::{run_surface_impl, SurfaceResult, SurfaceSettings};
use crate::system::{KPoint, KpointSystem};

/// Options for one volume run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSettings {
    /// Settings applied to every contained surface.
    pub surface: SurfaceSettings,
    /// Initial uniform seeding count along `s`, at least 2.
    pub num_surfaces: usize,
    /// Gap-proximity tolerance between neighboring surfaces; `None`
    /// disables the check.
    pub gap_tol: Option<f64>,
    /// Movement tolerance between neighboring surfaces; `None` disables
    /// the check.
    pub move_tol: Option<f64>,
    /// Bisection floor in `s`.
    pub min_neighbour_dist: f64,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            surface: SurfaceSettings::default(),
            num_surfaces: 11,
            gap_tol: Some(0.3),
            move_tol: Some(0.3),
            min_neighbour_dist: 0.01,
        }
    }
}

impl VolumeSettings {
    fn refine(&self) -> RefineSettings {
        RefineSettings {
            num_samples: self.num_surfaces,
            gap_tol: self.gap_tol,
            move_tol: self.move_tol,
            min_neighbour_dist: self.min_neighbour_dist,
        }
    }
}

/// A completed volume: the ordered `(s, surface)` collection plus the
/// volume-level control snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeResult {
    pub data: OrderedSamples<SurfaceResult>,
    pub states: StateMap,
    pub convergence: ConvergenceMap,
}

impl VolumeResult {
    fn assemble(data: OrderedSamples<SurfaceResult>, convergence: ConvergenceMap) -> Self {
        Self {
            data,
            states: StateMap::new(),
            convergence,
        }
    }

    /// The `(s, surface)` entries, ordered by `s`.
    pub fn surfaces(&self) -> &[SampleEntry<SurfaceResult>] {
        self.data.entries()
    }

    /// All surface parameter values, strictly increasing.
    pub fn s(&self) -> Vec<f64> {
        self.data.positions()
    }

    /// True when every volume-level pair check and every contained
    /// surface reported convergence.
    pub fn converged(&self) -> bool {
        self.convergence.values().all(Convergence::all)
            && self.surfaces().iter().all(|e| e.value.converged())
    }
}

/// Computes a converged volume, checkpointing according to `save`.
pub fn run_volume<S, F>(
    system: &S,
    volume: F,
    settings: &VolumeSettings,
    save: &SaveSettings,
    init_result: Option<&VolumeResult>,
) -> Result<VolumeResult>
where
    S: KpointSystem,
    F: Fn(f64, f64, f64) -> KPoint,
{
    let loaded = save::resolve_init(save, init_result, save::expect_volume)?;
    let worker = save.spawn_worker()?;
    let init = loaded.or_else(|| init_result.cloned());

    // mirror of the refine engine's state, so partial surfaces can be
    // lifted into complete volume checkpoints mid-computation
    let completed = RefCell::new((
        init.as_ref().map(|r| r.data.clone()).unwrap_or_default(),
        ConvergenceMap::new(),
    ));

    let refinement = refine_samples(
        &settings.refine(),
        init.map(|r| r.data),
        |s, prev| {
            run_surface_impl(
                system,
                |t, k| volume(s, t, k),
                &settings.surface,
                prev.cloned(),
                |partial| {
                    if let Some(worker) = &worker {
                        let (mut samples, convergence) = completed.borrow().clone();
                        samples.insert(s, partial.clone());
                        worker.dispatch(SavedResult::Volume(VolumeResult::assemble(
                            samples,
                            convergence,
                        )));
                    }
                    Ok(())
                },
            )
        },
        |samples, convergence| {
            *completed.borrow_mut() = (samples.clone(), convergence.clone());
            if let Some(worker) = &worker {
                worker.dispatch(SavedResult::Volume(VolumeResult::assemble(
                    samples.clone(),
                    convergence.clone(),
                )));
            }
            Ok(())
        },
    )?;

    let result = VolumeResult::assemble(refinement.samples, refinement.convergence);
    if let Some(worker) = worker {
        worker.dispatch(SavedResult::Volume(result.clone()));
        worker.close()?;
    }
    Ok(result)
}

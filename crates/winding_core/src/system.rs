//! The capability contract between the engine and the external k-point
//! collaborator.
//!
//! A collaborator exposes exactly one of two capabilities: produce
//! periodic eigenstates for a k-point list, or produce overlap matrices
//! between consecutive k-points. Both are consumed through the single
//! [`KpointSystem`] trait; [`OverlapSystem`] and [`EigenstateSystem`]
//! adapt plain closures to it. Everything a collaborator returns is
//! validated immediately after the call.

use nalgebra::Vector3;

use crate::error::{Error, Result};
use crate::wilson::OverlapMatrix;

/// A k-point in reduced reciprocal-space coordinates.
pub type KPoint = Vector3<f64>;

/// Eigenstates at one k-point: one row per tracked band, one column per
/// basis component.
pub type EigenstateSet = OverlapMatrix;

/// Tolerance for the integer-displacement loop-closure check.
const CLOSURE_TOL: f64 = 1e-8;

/// What a collaborator produced for one closed loop of k-points.
#[derive(Debug, Clone)]
pub struct LoopSamples {
    /// One overlap matrix per consecutive k-point pair.
    pub overlaps: Vec<OverlapMatrix>,
    /// One eigenstate set per k-point, when the collaborator supplies
    /// eigenstates rather than overlaps directly.
    pub eigenstates: Option<Vec<EigenstateSet>>,
}

/// A black box that turns a closed loop of k-points into overlap data.
pub trait KpointSystem {
    /// Evaluates the loop. `kpts` always contains a trailing point whose
    /// displacement from the first is an integer reciprocal lattice
    /// vector; output is validated by the engine via [`check_samples`].
    fn sample(&self, kpts: &[KPoint]) -> Result<LoopSamples>;
}

/// Adapts a closure returning overlap matrices between consecutive
/// k-points.
pub struct OverlapSystem<F>(pub F);

impl<F> KpointSystem for OverlapSystem<F>
where
    F: Fn(&[KPoint]) -> Result<Vec<OverlapMatrix>>,
{
    fn sample(&self, kpts: &[KPoint]) -> Result<LoopSamples> {
        Ok(LoopSamples {
            overlaps: (self.0)(kpts)?,
            eigenstates: None,
        })
    }
}

/// Adapts a closure returning phase-normalized periodic eigenstates, one
/// set per k-point. Overlaps are assembled as `M_i = conj(V_i) V_{i+1}^T`.
pub struct EigenstateSystem<F>(pub F);

impl<F> KpointSystem for EigenstateSystem<F>
where
    F: Fn(&[KPoint]) -> Result<Vec<EigenstateSet>>,
{
    fn sample(&self, kpts: &[KPoint]) -> Result<LoopSamples> {
        let states = (self.0)(kpts)?;
        if states.len() != kpts.len() {
            return Err(Error::SystemContract(format!(
                "system returned {} eigenstate sets for {} k-points",
                states.len(),
                kpts.len()
            )));
        }
        for pair in states.windows(2) {
            if pair[1].shape() != pair[0].shape() {
                return Err(Error::SystemContract(format!(
                    "eigenstate sets change shape along the loop: {:?} vs {:?}",
                    pair[0].shape(),
                    pair[1].shape()
                )));
            }
        }

        let overlaps = states
            .windows(2)
            .map(|pair| pair[0].conjugate() * pair[1].transpose())
            .collect();
        Ok(LoopSamples {
            overlaps,
            eigenstates: Some(states),
        })
    }
}

/// Samples `n + 1` parameter values in `[0, 1]` along a loop
/// parametrization, endpoints included.
pub fn sample_loop(path: impl Fn(f64) -> KPoint, n: usize) -> Vec<KPoint> {
    (0..=n).map(|i| path(i as f64 / n as f64)).collect()
}

/// Checks that the parametrization closes onto itself up to an integer
/// reciprocal lattice vector. Runs eagerly, before any expensive
/// sampling.
pub fn check_closed(path: impl Fn(f64) -> KPoint) -> Result<()> {
    let d = path(1.0) - path(0.0);
    if d.iter().any(|c| (c - c.round()).abs() > CLOSURE_TOL) {
        return Err(Error::OpenLoop {
            displacement: [d.x, d.y, d.z],
        });
    }
    Ok(())
}

/// Validates collaborator output against the k-point list it was asked
/// about: one overlap matrix per consecutive pair, all square and of
/// uniform size.
pub fn check_samples(samples: &LoopSamples, num_kpts: usize) -> Result<()> {
    if samples.overlaps.len() + 1 != num_kpts {
        return Err(Error::SystemContract(format!(
            "system returned {} overlap matrices for {} k-points (expected {})",
            samples.overlaps.len(),
            num_kpts,
            num_kpts - 1
        )));
    }
    let size = samples.overlaps.first().map_or(0, |m| m.nrows());
    for (i, m) in samples.overlaps.iter().enumerate() {
        if m.nrows() != size || m.ncols() != size {
            return Err(Error::SystemContract(format!(
                "overlap matrix {i} has shape {}x{}, expected {size}x{size}",
                m.nrows(),
                m.ncols()
            )));
        }
    }
    Ok(())
}

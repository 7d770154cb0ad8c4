//! Topological invariants read off a converged surface.
//!
//! The Chern number follows the winding of the total polarization as
//! the line parameter sweeps the surface; the Z2 invariant counts, mod
//! 2, the WCC crossings of the largest-gap line between neighbors.

use crate::math::frac;
use crate::surface::SurfaceResult;

/// Chern number of a surface.
///
/// Sums the polarization change between consecutive lines, with each
/// step wrapped to `(-0.5, 0.5]`. The sum is close to an integer for a
/// well-converged surface; the caller rounds.
pub fn chern(surface: &SurfaceResult) -> f64 {
    surface
        .pol()
        .windows(2)
        .map(|p| {
            let mut d = frac(p[1] - p[0]);
            if d > 0.5 {
                d -= 1.0;
            }
            d
        })
        .sum()
}

/// Z2 invariant of a surface spanning half the Brillouin zone.
///
/// For each consecutive line pair, every WCC of the later line lying
/// strictly between the two gap midpoints flips the sign. Returns 0
/// for the trivial phase and 1 for the nontrivial one.
pub fn z2(surface: &SurfaceResult) -> u8 {
    let gap_pos = surface.gap_pos();
    let wcc = surface.wcc();
    let mut sign = 1i32;
    for i in 0..gap_pos.len().saturating_sub(1) {
        let lo = gap_pos[i].min(gap_pos[i + 1]);
        let hi = gap_pos[i].max(gap_pos[i + 1]);
        for &w in &wcc[i + 1] {
            if lo < w && w < hi {
                sign = -sign;
            }
        }
    }
    u8::from(sign < 0)
}

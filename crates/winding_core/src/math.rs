//! Cyclic (modulo-1) arithmetic for Wannier charge centers.
//!
//! WCC values live on a circle of circumference 1, so naive comparisons
//! across the 0/1 wrap point produce spurious large distances. Everything
//! here works modulo 1: the fractional-part map, the cyclic point
//! distance, the largest-gap finder, and the gap-aware maximum-movement
//! metric between two WCC lists.

use serde::{Deserialize, Serialize};

/// Fractional part of `x`, mapped into `[0, 1)`. Handles negative input.
pub fn frac(x: f64) -> f64 {
    let f = x - x.floor();
    // x slightly below an integer can round to exactly 1.0
    if f >= 1.0 {
        0.0
    } else {
        f
    }
}

/// Distance between two points on the unit circle, in `[0, 0.5]`.
pub fn cyclic_dist(a: f64, b: f64) -> f64 {
    let d = frac(a - b);
    d.min(1.0 - d)
}

/// The largest cyclic interval between consecutive sorted WCC values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    /// Midpoint of the interval, in `[0, 1)`.
    pub pos: f64,
    /// Width of the interval, in `[0, 1]`.
    pub size: f64,
}

/// Finds the largest gap in a sorted list of WCC values in `[0, 1)`.
///
/// An empty list has no bands to separate; the whole circle counts as the
/// gap (`size = 1`, `pos = 0.5`). A single value likewise leaves the full
/// complement as the gap, centered opposite the value.
pub fn largest_gap(sorted_wcc: &[f64]) -> Gap {
    if sorted_wcc.is_empty() {
        return Gap { pos: 0.5, size: 1.0 };
    }

    let n = sorted_wcc.len();
    let mut best = Gap { pos: 0.0, size: -1.0 };
    for i in 0..n {
        let lower = sorted_wcc[i];
        // wrap the last interval back around to the first value
        let upper = if i + 1 < n {
            sorted_wcc[i + 1]
        } else {
            sorted_wcc[0] + 1.0
        };
        let size = upper - lower;
        if size > best.size {
            best = Gap {
                pos: frac(0.5 * (lower + upper)),
                size,
            };
        }
    }
    best
}

/// Maximum movement between two WCC lists of equal length.
///
/// Both lists are re-centered on the largest gap of their union before
/// sorting, so that corresponding entries pair up consistently and the
/// 0/1 wrap point falls inside the gap rather than inside the spectrum.
/// Lists of different lengths are maximally distant (`0.5`, the largest
/// possible cyclic distance).
pub fn max_move(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.5;
    }
    if a.is_empty() {
        return 0.0;
    }

    let mut union: Vec<f64> = a.iter().chain(b.iter()).map(|&x| frac(x)).collect();
    union.sort_by(|x, y| x.total_cmp(y));
    let gap = largest_gap(&union);

    let recenter = |list: &[f64]| -> Vec<f64> {
        let mut shifted: Vec<f64> = list.iter().map(|&x| frac(x - gap.pos)).collect();
        shifted.sort_by(|x, y| x.total_cmp(y));
        shifted
    };

    let ra = recenter(a);
    let rb = recenter(b);
    ra.iter()
        .zip(rb.iter())
        .map(|(&x, &y)| cyclic_dist(x, y))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frac_maps_into_unit_interval() {
        assert_eq!(frac(0.25), 0.25);
        assert_eq!(frac(1.0), 0.0);
        assert_eq!(frac(-0.25), 0.75);
        assert!((frac(3.75) - 0.75).abs() < 1e-14);
        assert!(frac(-1e-18) < 1.0);
    }

    #[test]
    fn cyclic_dist_wraps_around() {
        assert!((cyclic_dist(0.1, 0.9) - 0.2).abs() < 1e-14);
        assert!((cyclic_dist(0.9, 0.1) - 0.2).abs() < 1e-14);
        assert!((cyclic_dist(0.0, 0.5) - 0.5).abs() < 1e-14);
        assert_eq!(cyclic_dist(0.3, 0.3), 0.0);
    }

    #[test]
    fn largest_gap_of_empty_list_is_full_circle() {
        let gap = largest_gap(&[]);
        assert_eq!(gap.size, 1.0);
        assert_eq!(gap.pos, 0.5);
    }

    #[test]
    fn largest_gap_of_single_value_is_complement() {
        let gap = largest_gap(&[0.2]);
        assert!((gap.size - 1.0).abs() < 1e-14);
        assert!((gap.pos - 0.7).abs() < 1e-14);
    }

    #[test]
    fn largest_gap_of_degenerate_pair() {
        let gap = largest_gap(&[0.0, 0.0]);
        assert!((gap.size - 1.0).abs() < 1e-14);
        assert!((gap.pos - 0.5).abs() < 1e-14);
    }

    #[test]
    fn largest_gap_finds_interior_interval() {
        let gap = largest_gap(&[0.1, 0.2, 0.8]);
        // largest interval is 0.2 -> 0.8
        assert!((gap.size - 0.6).abs() < 1e-14);
        assert!((gap.pos - 0.5).abs() < 1e-14);
    }

    #[test]
    fn largest_gap_can_cross_the_wrap_point() {
        let gap = largest_gap(&[0.4, 0.5, 0.6]);
        // largest interval is 0.6 -> 1.4, centered at 1.0 == 0.0
        assert!((gap.size - 0.8).abs() < 1e-14);
        assert!(gap.pos.min(1.0 - gap.pos) < 1e-14);
    }

    #[test]
    fn max_move_of_identical_lists_is_zero() {
        let wcc = [0.1, 0.4, 0.95];
        assert_eq!(max_move(&wcc, &wcc), 0.0);
        assert_eq!(max_move(&[], &[]), 0.0);
    }

    #[test]
    fn max_move_is_invariant_under_wrap_relabeling() {
        let a = [0.05, 0.45, 0.9];
        let b = [0.1, 0.4, 0.95];
        let base = max_move(&a, &b);
        for shift in [0.13, 0.5, 0.77] {
            let sa: Vec<f64> = a.iter().map(|&x| frac(x + shift)).collect();
            let sb: Vec<f64> = b.iter().map(|&x| frac(x + shift)).collect();
            assert!(
                (max_move(&sa, &sb) - base).abs() < 1e-12,
                "metric changed under shift {shift}"
            );
        }
    }

    #[test]
    fn max_move_pairs_entries_across_the_wrap() {
        // 0.98 and 0.02 are the same WCC moving by 0.04, not by 0.96
        let moved = max_move(&[0.5, 0.98], &[0.5, 0.02]);
        assert!((moved - 0.04).abs() < 1e-12);
    }

    #[test]
    fn max_move_of_mismatched_lengths_is_maximal() {
        assert_eq!(max_move(&[0.1], &[0.1, 0.2]), 0.5);
    }
}

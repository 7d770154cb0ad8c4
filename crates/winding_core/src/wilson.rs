//! Wilson-loop assembly and eigen-phase extraction.
//!
//! The Wilson loop is the ordered product of the overlap matrices around a
//! closed k-space loop. Its eigenvalues `exp(2*pi*i*x)` define the Wannier
//! charge centers `x` in `[0, 1)`.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use std::f64::consts::TAU;

use crate::error::{Error, Result};
use crate::math::frac;

/// Complex square matrix relating occupied subspaces of adjacent k-points.
pub type OverlapMatrix = DMatrix<Complex<f64>>;

/// Ordered product of the overlap matrices around a closed loop.
///
/// Fails with a contract violation when the list is empty or the matrices
/// are not square and of uniform size.
pub fn wilson_loop(overlaps: &[OverlapMatrix]) -> Result<OverlapMatrix> {
    let first = overlaps.first().ok_or_else(|| {
        Error::SystemContract("no overlap matrices supplied for Wilson loop".into())
    })?;
    let size = first.nrows();

    for (i, m) in overlaps.iter().enumerate() {
        if m.nrows() != size || m.ncols() != size {
            return Err(Error::SystemContract(format!(
                "overlap matrix {i} has shape {}x{}, expected {size}x{size}",
                m.nrows(),
                m.ncols()
            )));
        }
    }

    let mut w = OverlapMatrix::identity(size, size);
    for m in overlaps {
        w = &w * m;
    }
    Ok(w)
}

/// Eigen-phases of a Wilson loop, divided by `2*pi` and sorted ascending.
pub fn wcc_from_eigenvalues(eigenvalues: &[Complex<f64>]) -> Vec<f64> {
    let mut wcc: Vec<f64> = eigenvalues.iter().map(|e| frac(e.arg() / TAU)).collect();
    wcc.sort_by(|x, y| x.total_cmp(y));
    wcc
}

/// Eigenvalues of a complex square matrix via Schur decomposition.
pub fn complex_eigenvalues(w: &OverlapMatrix) -> Result<Vec<Complex<f64>>> {
    if w.nrows() == 0 {
        return Ok(Vec::new());
    }
    let eigen = w
        .eigenvalues()
        .ok_or_else(|| Error::Numerics("Wilson loop eigendecomposition did not converge".into()))?;
    Ok(eigen.iter().cloned().collect())
}

/// Eigenvectors of `w` for the given eigenvalues, one column per value.
///
/// Uses shifted inverse iteration: this close to an exact eigenvalue two
/// or three sweeps are enough, and the explicit shift regularizes the
/// nearly-singular solve.
pub fn wilson_eigenvectors(
    w: &OverlapMatrix,
    eigenvalues: &[Complex<f64>],
) -> Result<OverlapMatrix> {
    let n = w.nrows();
    if eigenvalues.len() != n {
        return Err(Error::Numerics(format!(
            "expected {n} eigenvalues for a {n}x{n} Wilson loop, got {}",
            eigenvalues.len()
        )));
    }

    let mut vectors = OverlapMatrix::zeros(n, n);
    for (col, &lambda) in eigenvalues.iter().enumerate() {
        let shift = lambda + Complex::new(1e-10, 1e-10);
        let shifted = w - OverlapMatrix::from_diagonal_element(n, n, shift);
        let lu = shifted.lu();

        let mut v = DVector::<Complex<f64>>::from_element(n, Complex::new(1.0, 0.0));
        let mut ok = false;
        for _ in 0..3 {
            let next = match lu.solve(&v) {
                Some(next) => next,
                None => break,
            };
            let norm = next.norm();
            if !norm.is_finite() || norm == 0.0 {
                break;
            }
            v = next.unscale(norm);
            ok = true;
        }
        if !ok {
            return Err(Error::Numerics(format!(
                "inverse iteration failed for Wilson eigenvalue {lambda}"
            )));
        }
        vectors.set_column(col, &v);
    }
    Ok(vectors)
}

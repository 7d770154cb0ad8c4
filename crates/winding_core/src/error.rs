//! Typed errors for the winding engine.
//!
//! Callers can pattern-match on failure modes (bad option combinations,
//! open loops, collaborator contract violations, checkpoint I/O) rather
//! than parsing opaque strings. Non-convergence is deliberately absent:
//! an exhausted iteration budget is recorded in the result's convergence
//! snapshot, never raised.

use thiserror::Error;

/// Errors arising from configuration, geometry, collaborator output, or
/// checkpoint persistence.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid option value or combination, detected before any sampling.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The loop parametrization is not closed by an integer reciprocal
    /// lattice vector.
    #[error(
        "loop is not closed: endpoint displacement [{:.6}, {:.6}, {:.6}] \
         is not an integer reciprocal lattice vector",
        displacement[0],
        displacement[1],
        displacement[2]
    )]
    OpenLoop { displacement: [f64; 3] },

    /// The k-point system returned the wrong number or shape of overlap
    /// matrices or eigenstate sets.
    #[error("k-point system contract violation: {0}")]
    SystemContract(String),

    /// A numerical routine failed (eigendecomposition, singular solve).
    #[error("numerical failure: {0}")]
    Numerics(String),

    /// The iteration control was exhausted before a single sample could
    /// be computed, so no result can be formed.
    #[error("iteration control produced no sampling density")]
    NoData,

    /// Checkpoint file could not be read or written.
    #[error("checkpoint I/O failed: {0}")]
    Persist(#[from] std::io::Error),

    /// Checkpoint file exists but could not be decoded.
    #[error("checkpoint decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Common result type used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

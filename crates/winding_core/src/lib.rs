//! The `winding_core` crate computes Wannier charge centers from Wilson
//! loops and tracks them adaptively over lines, surfaces and volumes in
//! reciprocal space, yielding Chern and Z2 invariants.
//!
//! Key components:
//! - **System**: the `KpointSystem` trait plus overlap- and
//!   eigenstate-based adapters supplying data along a k-point loop.
//! - **Engines**: `run_line`, `run_surface`, `run_volume`, each refining
//!   until its convergence controls pass.
//! - **Controls**: density iteration, position, gap and movement
//!   checks, with serializable state for restarts.
//! - **Persistence**: atomic checkpoints written by a background
//!   worker, resumable without recomputation.

pub mod control;
pub mod error;
pub mod invariant;
pub mod line;
pub mod math;
pub mod refine;
pub mod save;
pub mod surface;
pub mod system;
pub mod volume;
pub mod wilson;

pub use control::Convergence;
pub use error::{Error, Result};
pub use invariant::{chern, z2};
pub use line::{run_line, LineData, LineResult, LineSettings};
pub use save::{SaveSettings, SavedResult};
pub use surface::{run_surface, SurfaceResult, SurfaceSettings};
pub use system::{EigenstateSystem, KPoint, KpointSystem, LoopSamples, OverlapSystem};
pub use volume::{run_volume, VolumeResult, VolumeSettings};
pub use wilson::OverlapMatrix;

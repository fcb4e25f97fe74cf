//! # tri-core
//!
//! Distributed parallel sparse triangular solver: given the LU
//! factorization of a large sparse matrix distributed over a 2D process
//! mesh, solve A * X = B by a dependency-driven forward substitution with
//! L followed by a back substitution with U.
//!
//! The solve is *self-scheduled and message-driven*: block contributions
//! arrive over per-column broadcast trees and per-row reduction trees,
//! accumulate into partial sums, trigger dense sub-solves the moment a
//! supernode's dependency counter hits zero, and flow onward down the
//! dependency graph. Communication overlaps computation; each rank's
//! receive loop terminates after a precomputed exact message count, with
//! no barrier inside a phase.
//!
//! ## Pieces
//!
//! - [`grid`] / [`supernode`]: the Pr x Pc mesh and the block ownership
//!   index.
//! - [`factors`] / [`distribute`]: per-rank block-column factor storage
//!   and the carving of a global factored pair into it.
//! - [`diag_inv`]: explicit inverses of the diagonal blocks, turning the
//!   innermost triangular solves into GEMMs.
//! - [`plan`] / [`tree`]: the setup products: broadcast/reduction trees,
//!   dependency counters, message totals, all-to-all counts.
//! - [`transport`] / [`mesh`]: two-sided (tagged channels) and one-sided
//!   (counter-fronted windows) delivery between thread-ranks.
//! - `lsolve` / `usolve` / [`solve`]: the two engines and the entry
//!   point that drives them.
//!
//! ## Example
//!
//! ```ignore
//! use tri_core::prelude::*;
//!
//! let grid = ProcessGrid::new(2, 2);
//! let results = run_mesh(&grid, |rank, mut comm| {
//!     let factors = distribute_factors(&gf, &grid, rank);
//!     let plan = build_rank_plan(&gf, &grid, rank, &rows, &perms, 2);
//!     let mut stats = SolveStat::default();
//!     solve(n, &factors, &gf.part, &perms, &grid, &mut b_local,
//!           m_loc, fst_row, ldb, nrhs, &plan, &mut comm,
//!           &SolveOptions::default(), &mut stats)?;
//!     Ok(b_local)
//! });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dense;
pub mod diag_inv;
pub mod distribute;
pub mod error;
pub mod factors;
pub mod grid;
pub mod mesh;
pub mod options;
pub mod plan;
pub mod redistribute;
pub mod solve;
pub mod stats;
pub mod supernode;
pub mod transport;
pub mod tree;

mod lsolve;
mod pool;
mod usolve;

/// Convenience re-exports of the public surface.
pub mod prelude {
    pub use crate::diag_inv::compute_diag_inverses;
    pub use crate::distribute::{distribute_factors, GlobalFactors};
    pub use crate::error::{Result, SolveError};
    pub use crate::factors::LocalFactors;
    pub use crate::grid::ProcessGrid;
    pub use crate::mesh::run_mesh;
    pub use crate::options::SolveOptions;
    pub use crate::plan::{build_rank_plan, Permutations, RankPlan, RowDist};
    pub use crate::solve::solve;
    pub use crate::stats::SolveStat;
    pub use crate::supernode::SupernodePartition;
    pub use crate::transport::{MeshComm, TransportKind};
}

//! The solve entry point.
//!
//! Drives one complete A * X = B solve against previously computed and
//! distributed L/U factors: argument validation, buffer lifecycle,
//! B -> X redistribution, the forward and backward message-driven solves,
//! and the X -> B gather. On exit B holds the solution of the permuted
//! system (the same convention as the setup: no trailing inverse column
//! permutation is applied).
//!
//! `x`, `lsum`, the dependency counters and the transport windows live
//! exactly as long as one call; the factors, the plan and the trees are
//! read-only throughout.

use std::time::Instant;

use crate::error::{Result, SolveError};
use crate::factors::{LocalFactors, LSUM_H, XK_H};
use crate::grid::ProcessGrid;
use crate::lsolve::l_solve;
use crate::options::SolveOptions;
use crate::plan::{Permutations, RankPlan};
use crate::redistribute::{redistribute_b_to_x, redistribute_x_to_b};
use crate::stats::SolveStat;
use crate::supernode::SupernodePartition;
use crate::transport::MeshComm;
use crate::usolve::u_solve;

/// Solve A * X = B on this rank's share of the mesh.
///
/// `b` holds this rank's `m_loc` rows of the right-hand side (leading
/// dimension `ldb`, `nrhs` columns) and is overwritten with the solution
/// of the permuted system. Collective: every rank of the mesh must call
/// with consistent global arguments.
///
/// Argument validation failures are reported as
/// [`SolveError::InvalidArgument`] with the 1-based argument index; all
/// in-flight faults (malformed headers, counts disagreeing with the plan)
/// are fatal panics.
#[allow(clippy::too_many_arguments)]
pub fn solve(
    n: usize,
    factors: &LocalFactors,
    part: &SupernodePartition,
    perms: &Permutations,
    grid: &ProcessGrid,
    b: &mut [f64],
    m_loc: usize,
    fst_row: usize,
    ldb: usize,
    nrhs: usize,
    plan: &RankPlan,
    comm: &mut MeshComm,
    options: &SolveOptions,
    stats: &mut SolveStat,
) -> Result<()> {
    let t_start = Instant::now();
    *stats = SolveStat::default();

    if n == 0 || nrhs == 0 {
        return Ok(());
    }
    if part.n() != n {
        return Err(SolveError::invalid(
            3,
            "part",
            format!("partition covers {} columns, matrix order is {n}", part.n()),
        ));
    }
    if perms.perm_r.len() != n || perms.perm_c.len() != n {
        return Err(SolveError::invalid(
            4,
            "perms",
            format!(
                "permutation lengths ({}, {}) do not match the matrix order {n}",
                perms.perm_r.len(),
                perms.perm_c.len()
            ),
        ));
    }
    if fst_row + m_loc > n {
        return Err(SolveError::invalid(
            7,
            "m_loc",
            format!("local rows [{fst_row}, {}) exceed the matrix order {n}", fst_row + m_loc),
        ));
    }
    if ldb < m_loc.max(1) {
        return Err(SolveError::invalid(
            9,
            "ldb",
            format!("leading dimension {ldb} is below the local row count {m_loc}"),
        ));
    }
    if m_loc > 0 && b.len() < ldb * (nrhs - 1) + m_loc {
        return Err(SolveError::invalid(
            6,
            "b",
            format!(
                "buffer holds {} values, {} required for {m_loc} rows x {nrhs} rhs",
                b.len(),
                ldb * (nrhs - 1) + m_loc
            ),
        ));
    }

    let nthreads = options.num_threads();
    let myrow = grid.my_row(comm.rank());
    // XK_H == LSUM_H, so one bound covers both message kinds.
    let maxrecvsz = plan.max_super * nrhs + XK_H;

    comm.barrier();
    comm.begin_solve(options.transport, &plan.window_sizing, maxrecvsz);

    let mut x = vec![0.0; factors.x_len(nrhs)];
    let sizelsum = factors.lsum_slab_len(nrhs);
    let mut lsum = vec![0.0; sizelsum * nthreads];

    // ------------------------------------------------------------------
    // Forward solve L * y = Pc * Pr * b.
    // ------------------------------------------------------------------
    let t = Instant::now();
    redistribute_b_to_x(
        b, m_loc, nrhs, ldb, fst_row, factors, &mut x, perms, part, grid, plan, comm,
    );
    stats.t_redist += t.elapsed();
    // No solve message may reach a rank still inside the all-to-all.
    comm.barrier();

    stamp_lsum_headers(factors, part, grid, myrow, &mut lsum, nrhs);
    let t = Instant::now();
    let (ops, sent, recv) = l_solve(
        part,
        grid,
        factors,
        plan,
        nrhs,
        options.use_inverse_diagonals,
        nthreads,
        &mut x,
        &mut lsum,
        sizelsum,
        comm,
    );
    stats.solve_ops += ops;
    stats.msgs_sent += sent;
    stats.msgs_recv += recv;
    stats.t_lsolve = t.elapsed();
    comm.barrier();

    // ------------------------------------------------------------------
    // Back solve U * x = y. The Y components sit in x already; lsum is
    // re-zeroed with the headers re-stamped.
    // ------------------------------------------------------------------
    lsum.fill(0.0);
    stamp_lsum_headers(factors, part, grid, myrow, &mut lsum, nrhs);
    let t = Instant::now();
    let (ops, sent, recv) = u_solve(
        part,
        grid,
        factors,
        plan,
        nrhs,
        options.use_inverse_diagonals,
        nthreads,
        &mut x,
        &mut lsum,
        sizelsum,
        comm,
    );
    stats.solve_ops += ops;
    stats.msgs_sent += sent;
    stats.msgs_recv += recv;
    stats.t_usolve = t.elapsed();
    comm.barrier();

    let t = Instant::now();
    redistribute_x_to_b(
        b, m_loc, nrhs, ldb, fst_row, factors, &x, part, grid, plan, comm,
    );
    stats.t_redist += t.elapsed();

    comm.end_solve();
    stats.t_total = t_start.elapsed();
    log::debug!(
        "rank {}: solve done in {:.4}s ({} msgs in, {} msgs out)",
        comm.rank(),
        stats.t_total.as_secs_f64(),
        stats.msgs_recv,
        stats.msgs_sent
    );
    Ok(())
}

/// Write each local block's global supernode id into its header slot of
/// slab 0.
fn stamp_lsum_headers(
    factors: &LocalFactors,
    part: &SupernodePartition,
    grid: &ProcessGrid,
    myrow: usize,
    lsum: &mut [f64],
    nrhs: usize,
) {
    for lk in 0..factors.nlb {
        let gb = myrow + lk * grid.nprow;
        if gb < part.nsupers() {
            let il = factors.lsum_blk(lk, nrhs);
            lsum[il - LSUM_H] = gb as f64;
        }
    }
}

#![allow(dead_code)]

//! Shared helpers for the solver integration tests: factored-system
//! builders and an end-to-end mesh driver.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tri_core::prelude::*;

/// Random factored pair with unit-lower L and upper U. Off-diagonal
/// magnitudes are kept small relative to the diagonal so the assembled
/// A = L * U stays well conditioned.
pub fn random_factors(part: SupernodePartition, seed: u64, density: f64) -> GlobalFactors {
    let n = part.n();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut l = vec![0.0; n * n];
    let mut u = vec![0.0; n * n];
    let scale = 1.0 / n as f64;
    for j in 0..n {
        l[j + j * n] = 1.0;
        u[j + j * n] = 2.0 + rng.gen::<f64>();
        for i in j + 1..n {
            if rng.gen::<f64>() < density {
                l[i + j * n] = rng.gen_range(-1.0..1.0) * scale;
            }
        }
        for i in 0..j {
            if rng.gen::<f64>() < density {
                u[i + j * n] = rng.gen_range(-1.0..1.0) * scale;
            }
        }
    }
    GlobalFactors { part, l, u }
}

/// Identity factors: L = U = I.
pub fn identity_factors(part: SupernodePartition) -> GlobalFactors {
    let n = part.n();
    let mut l = vec![0.0; n * n];
    let mut u = vec![0.0; n * n];
    for i in 0..n {
        l[i + i * n] = 1.0;
        u[i + i * n] = 1.0;
    }
    GlobalFactors { part, l, u }
}

/// Block-tridiagonal factors: each supernode couples only to its
/// neighbor, giving a chain-shaped dependency DAG.
pub fn block_tridiagonal_factors(part: SupernodePartition, seed: u64) -> GlobalFactors {
    let n = part.n();
    let nsupers = part.nsupers();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut l = vec![0.0; n * n];
    let mut u = vec![0.0; n * n];
    for i in 0..n {
        l[i + i * n] = 1.0;
        u[i + i * n] = 3.0 + rng.gen::<f64>();
    }
    for k in 0..nsupers.saturating_sub(1) {
        // L block (k+1, k) and U block (k, k+1), dense.
        for j in part.xsup[k]..part.xsup[k + 1] {
            for i in part.xsup[k + 1]..part.xsup[k + 2] {
                l[i + j * n] = rng.gen_range(-0.3..0.3);
                u[j + i * n] = rng.gen_range(-0.3..0.3);
            }
        }
    }
    GlobalFactors { part, l, u }
}

/// y = A * x with A = L * U, for `nrhs` column-major right-hand sides.
pub fn a_times(gf: &GlobalFactors, x: &[f64], nrhs: usize) -> Vec<f64> {
    let n = gf.n();
    let mut ux = vec![0.0; n * nrhs];
    let mut y = vec![0.0; n * nrhs];
    tri_core::dense::gemm(n, nrhs, n, 1.0, &gf.u, n, x, n, 0.0, &mut ux, n);
    tri_core::dense::gemm(n, nrhs, n, 1.0, &gf.l, n, &ux, n, 0.0, &mut y, n);
    y
}

/// Infinity norm of A = L * U.
pub fn a_norm_inf(gf: &GlobalFactors) -> f64 {
    let n = gf.n();
    let mut a = vec![0.0; n * n];
    tri_core::dense::gemm(n, n, n, 1.0, &gf.l, n, &gf.u, n, 0.0, &mut a, n);
    (0..n)
        .map(|i| (0..n).map(|j| a[i + j * n].abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Distribute, plan and solve A * X = B on a mesh of `grid`, returning
/// the reassembled global solution and the per-rank statistics.
///
/// `b_global` is n x nrhs column-major and is interpreted in the block
/// row distribution `RowDist::block`.
pub fn solve_on_mesh(
    gf: &GlobalFactors,
    grid: &ProcessGrid,
    b_global: &[f64],
    nrhs: usize,
    options: &SolveOptions,
) -> (Vec<f64>, Vec<SolveStat>) {
    solve_on_mesh_permuted(
        gf,
        grid,
        b_global,
        nrhs,
        options,
        &Permutations::identity(gf.n()),
    )
}

/// As [`solve_on_mesh`], with explicit permutations.
pub fn solve_on_mesh_permuted(
    gf: &GlobalFactors,
    grid: &ProcessGrid,
    b_global: &[f64],
    nrhs: usize,
    options: &SolveOptions,
    perms: &Permutations,
) -> (Vec<f64>, Vec<SolveStat>) {
    let n = gf.n();
    let rows = RowDist::block(n, grid.nprocs());
    let results = run_mesh(grid, |rank, mut comm| {
        let mut factors = distribute_factors(gf, grid, rank);
        compute_diag_inverses(&mut factors).expect("diagonal inversion failed");
        let plan = build_rank_plan(gf, grid, rank, &rows, perms, options.tree_fanout);
        let m_loc = rows.m_loc(rank);
        let fst = rows.fst_row[rank];
        let ldb = m_loc.max(1);
        let mut b_loc = vec![0.0; ldb * nrhs];
        for j in 0..nrhs {
            for i in 0..m_loc {
                b_loc[i + j * ldb] = b_global[fst + i + j * n];
            }
        }
        let mut stats = SolveStat::default();
        solve(
            n, &factors, &gf.part, perms, grid, &mut b_loc, m_loc, fst, ldb, nrhs, &plan,
            &mut comm, options, &mut stats,
        )
        .expect("solve failed");
        (b_loc, m_loc, fst, stats)
    });

    let mut x_global = vec![0.0; n * nrhs];
    let mut stats = Vec::new();
    for (b_loc, m_loc, fst, st) in results {
        let ldb = m_loc.max(1);
        for j in 0..nrhs {
            for i in 0..m_loc {
                x_global[fst + i + j * n] = b_loc[i + j * ldb];
            }
        }
        stats.push(st);
    }
    (x_global, stats)
}

/// Assert that the computed solution satisfies A * X = B to `tol`
/// relative to the scale of the system.
pub fn check_solution(gf: &GlobalFactors, x: &[f64], b: &[f64], nrhs: usize, tol: f64) {
    let n = gf.n();
    let ax = a_times(gf, x, nrhs);
    let norm = a_norm_inf(gf).max(1.0);
    for j in 0..nrhs {
        for i in 0..n {
            let r = (ax[i + j * n] - b[i + j * n]).abs();
            assert!(
                r <= tol * norm,
                "residual too large at ({i}, {j}): |Ax-b| = {r:.3e} (|A| = {norm:.3e})"
            );
        }
    }
}

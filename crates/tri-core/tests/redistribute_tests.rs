//! Direct tests of the B <-> X redistribution.

mod common;

use common::*;
use tri_core::factors::XK_H;
use tri_core::plan::build_rank_plan;
use tri_core::prelude::*;
use tri_core::redistribute::{redistribute_b_to_x, redistribute_x_to_b};

/// On a single rank with identity permutations, B -> X packs each block
/// with its header and X -> B restores B exactly.
#[test]
fn test_single_rank_roundtrip_and_headers() {
    let part = SupernodePartition::from_sizes(&[2, 3, 1, 2]);
    let gf = identity_factors(part);
    let n = gf.n();
    let nrhs = 2;
    let perms = Permutations::identity(n);
    let grid = ProcessGrid::new(1, 1);
    let rows = RowDist::block(n, 1);
    let b: Vec<f64> = (0..n * nrhs).map(|i| i as f64 + 0.25).collect();

    let out = run_mesh(&grid, |rank, mut comm| {
        let factors = distribute_factors(&gf, &grid, rank);
        let plan = build_rank_plan(&gf, &grid, rank, &rows, &perms, 2);
        let mut x = vec![0.0; factors.x_len(nrhs)];
        redistribute_b_to_x(
            &b, n, nrhs, n, 0, &factors, &mut x, &perms, &gf.part, &grid, &plan, &mut comm,
        );
        // Every diagonal block header carries its global supernode id.
        for lk in 0..factors.nlb {
            let hdr = x[factors.x_blk(lk, nrhs) - XK_H];
            assert_eq!(hdr, lk as f64, "bad header on block {lk}");
        }
        let mut b_back = vec![0.0; n * nrhs];
        redistribute_x_to_b(
            &mut b_back, n, nrhs, n, 0, &factors, &x, &gf.part, &grid, &plan, &mut comm,
        );
        b_back
    });
    assert_eq!(out[0], b);
}

/// Forward redistribution followed by the backward one is the identity on
/// B for any grid (identity permutations; the solve itself is skipped).
#[test]
fn test_mesh_roundtrip() {
    let part = SupernodePartition::uniform(10, 2);
    let gf = identity_factors(part);
    let n = gf.n();
    let nrhs = 3;
    let perms = Permutations::identity(n);
    for (pr, pc) in [(2, 2), (1, 3), (3, 1)] {
        let grid = ProcessGrid::new(pr, pc);
        let rows = RowDist::block(n, grid.nprocs());
        let b_global: Vec<f64> = (0..n * nrhs).map(|i| (i as f64).sqrt()).collect();
        let out = run_mesh(&grid, |rank, mut comm| {
            let factors = distribute_factors(&gf, &grid, rank);
            let plan = build_rank_plan(&gf, &grid, rank, &rows, &perms, 2);
            let m_loc = rows.m_loc(rank);
            let fst = rows.fst_row[rank];
            let ldb = m_loc.max(1);
            let mut b_loc = vec![0.0; ldb * nrhs];
            for j in 0..nrhs {
                for i in 0..m_loc {
                    b_loc[i + j * ldb] = b_global[fst + i + j * n];
                }
            }
            let mut x = vec![0.0; factors.x_len(nrhs)];
            redistribute_b_to_x(
                &b_loc, m_loc, nrhs, ldb, fst, &factors, &mut x, &perms, &gf.part, &grid,
                &plan, &mut comm,
            );
            comm.barrier();
            let mut b_back = vec![0.0; ldb * nrhs];
            redistribute_x_to_b(
                &mut b_back, m_loc, nrhs, ldb, fst, &factors, &x, &gf.part, &grid, &plan,
                &mut comm,
            );
            (b_loc, b_back)
        });
        for (rank, (b_loc, b_back)) in out.iter().enumerate() {
            assert_eq!(b_loc, b_back, "roundtrip broke on rank {rank} of {pr}x{pc}");
        }
    }
}

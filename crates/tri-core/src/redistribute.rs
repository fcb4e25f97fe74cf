//! Redistribution of the right-hand side onto and off of the diagonal
//! processes.
//!
//! Forward (B -> X): each rank routes every local B row `i` to the
//! diagonal process of the supernode containing the permuted row
//! `Pc(Pr(i + fst_row))`, one all-to-all for the row indices and one for
//! the values (row-major per entry). The receiver scatters each entry at
//! its supernode-relative position inside `x` and stamps the block header
//! with the global supernode id.
//!
//! Backward (X -> B): diagonal processes walk their owned supernodes and
//! route each solution row to the rank owning that row of B. The row
//! index travels as-is; no additional column permutation is applied at
//! this stage, so B comes back holding the solution of the permuted
//! system.
//!
//! On a single-process mesh both directions reduce to a permuted copy
//! with zero communication.

use crate::factors::{LocalFactors, XK_H};
use crate::grid::ProcessGrid;
use crate::plan::{Permutations, RankPlan};
use crate::supernode::SupernodePartition;
use crate::transport::MeshComm;

/// Scatter the local rows of B into `x` on the diagonal processes.
#[allow(clippy::too_many_arguments)]
pub fn redistribute_b_to_x(
    b: &[f64],
    m_loc: usize,
    nrhs: usize,
    ldb: usize,
    fst_row: usize,
    factors: &LocalFactors,
    x: &mut [f64],
    perms: &Permutations,
    part: &SupernodePartition,
    grid: &ProcessGrid,
    plan: &RankPlan,
    comm: &mut MeshComm,
) {
    let nprocs = grid.nprocs();
    if nprocs == 1 {
        for i in 0..m_loc {
            let irow = perms.apply(i + fst_row);
            let k = part.block_num(irow);
            let sk = part.super_size(k);
            let l = factors.x_blk(part.lbi(k, grid), nrhs);
            x[l - XK_H] = k as f64;
            let rel = irow - part.fst_block_col(k);
            for j in 0..nrhs {
                x[l + rel + j * sk] = b[i + j * ldb];
            }
        }
        return;
    }

    // Pack one bucket per destination rank; values row-major per entry.
    let mut send_idx: Vec<Vec<usize>> = vec![Vec::new(); nprocs];
    let mut send_vals: Vec<Vec<f64>> = vec![Vec::new(); nprocs];
    for (p, &c) in plan.b_to_x.send_counts.iter().enumerate() {
        send_idx[p].reserve(c);
        send_vals[p].reserve(c * nrhs);
    }
    for i in 0..m_loc {
        let irow = perms.apply(i + fst_row);
        let dest = grid.diag_rank(part.block_num(irow));
        send_idx[dest].push(irow);
        for j in 0..nrhs {
            send_vals[dest].push(b[i + j * ldb]);
        }
    }

    let (recv_idx, recv_vals) = comm.alltoallv(send_idx, send_vals);

    // Only the diagonal processes receive anything.
    for (p, idx) in recv_idx.iter().enumerate() {
        assert_eq!(idx.len(), plan.b_to_x.recv_counts[p], "B->X counts disagree with the plan");
        let vals = &recv_vals[p];
        for (t, &irow) in idx.iter().enumerate() {
            let k = part.block_num(irow);
            let sk = part.super_size(k);
            let l = factors.x_blk(part.lbi(k, grid), nrhs);
            x[l - XK_H] = k as f64;
            let rel = irow - part.fst_block_col(k);
            for j in 0..nrhs {
                x[l + rel + j * sk] = vals[t * nrhs + j];
            }
        }
    }
}

/// Gather the solution blocks from the diagonal processes back into B.
#[allow(clippy::too_many_arguments)]
pub fn redistribute_x_to_b(
    b: &mut [f64],
    m_loc: usize,
    nrhs: usize,
    ldb: usize,
    fst_row: usize,
    factors: &LocalFactors,
    x: &[f64],
    part: &SupernodePartition,
    grid: &ProcessGrid,
    plan: &RankPlan,
    comm: &mut MeshComm,
) {
    let nprocs = grid.nprocs();
    let myrow = grid.my_row(comm.rank());
    let mycol = grid.my_col(comm.rank());

    if nprocs == 1 {
        for lk in 0..factors.nlb {
            let k = lk; // single rank: local block k is supernode k
            let sk = part.super_size(k);
            let irow = part.fst_block_col(k);
            let l = factors.x_blk(lk, nrhs);
            for i in 0..sk {
                for j in 0..nrhs {
                    b[irow - fst_row + i + j * ldb] = x[l + i + j * sk];
                }
            }
        }
        return;
    }

    let mut send_idx: Vec<Vec<usize>> = vec![Vec::new(); nprocs];
    let mut send_vals: Vec<Vec<f64>> = vec![Vec::new(); nprocs];
    for lk in 0..factors.nlb {
        let Some(k) = LocalFactors::global_block(part, grid, myrow, lk) else {
            break;
        };
        if grid.col_owner(k) != mycol {
            continue; // not the diagonal process of k
        }
        let sk = part.super_size(k);
        let l = factors.x_blk(lk, nrhs);
        let fst = part.fst_block_col(k);
        for i in 0..sk {
            let irow = fst + i;
            let dest = plan.row_to_proc[irow];
            send_idx[dest].push(irow);
            for j in 0..nrhs {
                send_vals[dest].push(x[l + i + j * sk]);
            }
        }
    }

    let (recv_idx, recv_vals) = comm.alltoallv(send_idx, send_vals);

    let mut total = 0;
    for (p, idx) in recv_idx.iter().enumerate() {
        assert_eq!(idx.len(), plan.x_to_b.recv_counts[p], "X->B counts disagree with the plan");
        let vals = &recv_vals[p];
        for (t, &irow) in idx.iter().enumerate() {
            let rel = irow - fst_row;
            for j in 0..nrhs {
                b[rel + j * ldb] = vals[t * nrhs + j];
            }
        }
        total += idx.len();
    }
    assert_eq!(total, m_loc, "X->B must deliver every local B row exactly once");
}

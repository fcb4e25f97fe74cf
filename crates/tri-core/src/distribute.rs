//! Carving a global factored pair into the per-rank block layout.
//!
//! The numeric factorization itself is an external collaborator; what the
//! solver needs from it is the block-cyclic layout of §factors. This module
//! consumes a *global* view of the factors (dense n x n storage for L and
//! U plus the supernode partition) and extracts, for one rank, exactly the
//! blocks that rank owns. Blocks that are entirely zero are dropped, which
//! is what gives the trees and dependency counters their sparsity.

use crate::factors::{build_ilsum, BlockColumn, LocalBlock, LocalFactors};
use crate::grid::ProcessGrid;
use crate::supernode::SupernodePartition;

/// A factored pair A = L * U in global dense storage.
///
/// `l` holds the unit lower triangular factor (unit diagonal stored
/// explicitly, strict upper triangle zero), `u` the upper triangular
/// factor, both n x n column-major.
#[derive(Debug, Clone)]
pub struct GlobalFactors {
    /// Supernode partition of the n columns.
    pub part: SupernodePartition,
    /// Unit lower triangular factor, n x n column-major.
    pub l: Vec<f64>,
    /// Upper triangular factor, n x n column-major.
    pub u: Vec<f64>,
}

impl GlobalFactors {
    /// Matrix order.
    pub fn n(&self) -> usize {
        self.part.n()
    }

    /// Copy block (bi, bj) of `mat` (n x n column-major) into dense
    /// s_bi x s_bj column-major storage.
    fn extract_block(&self, mat: &[f64], bi: usize, bj: usize) -> Vec<f64> {
        let n = self.n();
        let r0 = self.part.fst_block_col(bi);
        let c0 = self.part.fst_block_col(bj);
        let si = self.part.super_size(bi);
        let sj = self.part.super_size(bj);
        let mut out = vec![0.0; si * sj];
        for j in 0..sj {
            let src = &mat[(c0 + j) * n + r0..(c0 + j) * n + r0 + si];
            out[j * si..(j + 1) * si].copy_from_slice(src);
        }
        out
    }

    /// Whether block (bi, bj) of `mat` has any nonzero entry.
    pub(crate) fn block_nonzero(&self, mat: &[f64], bi: usize, bj: usize) -> bool {
        let n = self.n();
        let r0 = self.part.fst_block_col(bi);
        let c0 = self.part.fst_block_col(bj);
        let si = self.part.super_size(bi);
        let sj = self.part.super_size(bj);
        for j in 0..sj {
            let col = &mat[(c0 + j) * n + r0..(c0 + j) * n + r0 + si];
            if col.iter().any(|&v| v != 0.0) {
                return true;
            }
        }
        false
    }

    /// True when L(bi, bj) is structurally present (bi > bj).
    pub fn l_block_present(&self, bi: usize, bj: usize) -> bool {
        bi > bj && self.block_nonzero(&self.l, bi, bj)
    }

    /// True when U(bi, bj) is structurally present (bi < bj).
    pub fn u_block_present(&self, bi: usize, bj: usize) -> bool {
        bi < bj && self.block_nonzero(&self.u, bi, bj)
    }
}

/// Extract the factor blocks owned by `rank`.
pub fn distribute_factors(
    gf: &GlobalFactors,
    grid: &ProcessGrid,
    rank: usize,
) -> LocalFactors {
    let part = &gf.part;
    let nsupers = part.nsupers();
    let myrow = grid.my_row(rank);
    let mycol = grid.my_col(rank);

    let nlbc = part.n_local_block_cols(grid);
    let mut l_cols: Vec<Option<BlockColumn>> = vec![None; nlbc];
    let mut u_cols: Vec<Option<BlockColumn>> = vec![None; nlbc];

    for k in 0..nsupers {
        if grid.col_owner(k) != mycol {
            continue;
        }
        let lj = part.lbj(k, grid);
        let on_diag = grid.row_owner(k) == myrow;

        // L: diagonal plus below-diagonal blocks in column k.
        let mut l_blocks = Vec::new();
        for i in k + 1..nsupers {
            if grid.row_owner(i) == myrow && gf.l_block_present(i, k) {
                l_blocks.push(LocalBlock {
                    block_row: i,
                    values: gf.extract_block(&gf.l, i, k),
                });
            }
        }
        if on_diag || !l_blocks.is_empty() {
            l_cols[lj] = Some(BlockColumn {
                block_col: k,
                diag: on_diag.then(|| gf.extract_block(&gf.l, k, k)),
                inv: None,
                blocks: l_blocks,
            });
        }

        // U: diagonal plus above-diagonal blocks in column k.
        let mut u_blocks = Vec::new();
        for i in 0..k {
            if grid.row_owner(i) == myrow && gf.u_block_present(i, k) {
                u_blocks.push(LocalBlock {
                    block_row: i,
                    values: gf.extract_block(&gf.u, i, k),
                });
            }
        }
        if on_diag || !u_blocks.is_empty() {
            u_cols[lj] = Some(BlockColumn {
                block_col: k,
                diag: on_diag.then(|| gf.extract_block(&gf.u, k, k)),
                inv: None,
                blocks: u_blocks,
            });
        }
    }

    let (ilsum, ldalsum, nlb) = build_ilsum(part, grid, myrow);
    LocalFactors {
        l_cols,
        u_cols,
        ilsum,
        ldalsum,
        nlb,
    }
}

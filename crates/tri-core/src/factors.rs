//! Per-rank storage of the distributed L and U factors.
//!
//! Both factors are stored by block column on the owning process column.
//! A block column holds the diagonal block (on the diagonal process only),
//! its precomputed inverse once [`crate::diag_inv`] has run, and the list
//! of off-diagonal blocks owned by this process row: below the diagonal
//! for L, above it for U. Each block is dense, column-major, with its
//! global block row recorded alongside (the row-index array of the
//! supernodal layout).
//!
//! The solution and partial-sum arrays share one layout: the blocks of all
//! locally owned block rows concatenated, each prefixed by a one-word
//! header holding the global supernode id. `ilsum` gives the row offset of
//! each local block, so for local block `lk` the data starts at
//! `ilsum[lk] * nrhs + (lk + 1) * XK_H` and the header sits one word
//! before it.

use crate::grid::ProcessGrid;
use crate::supernode::SupernodePartition;

/// Header length (words) of an X block and of every broadcast payload.
pub const XK_H: usize = 1;
/// Header length (words) of an lsum block and of every reduce payload.
pub const LSUM_H: usize = 1;

/// One dense off-diagonal block of L or U.
#[derive(Debug, Clone)]
pub struct LocalBlock {
    /// Global block row I of this block (I, J).
    pub block_row: usize,
    /// Dense values, s_I x s_J column-major.
    pub values: Vec<f64>,
}

/// One local block column of L or U.
#[derive(Debug, Clone)]
pub struct BlockColumn {
    /// Global supernode id K of this column.
    pub block_col: usize,
    /// Diagonal block (K, K), s_K x s_K column-major. Present only on the
    /// diagonal process of K. For L the diagonal entries are unit and the
    /// strict upper triangle is zero; for U the strict lower triangle is
    /// zero.
    pub diag: Option<Vec<f64>>,
    /// Explicit inverse of the diagonal block, filled by
    /// [`crate::diag_inv::compute_diag_inverses`].
    pub inv: Option<Vec<f64>>,
    /// Off-diagonal blocks owned by this process, sorted by block row.
    pub blocks: Vec<LocalBlock>,
}

/// All factor data owned by one rank.
#[derive(Debug, Clone)]
pub struct LocalFactors {
    /// L block columns, indexed by local block column (lbj). `None` when
    /// this rank owns nothing in that column.
    pub l_cols: Vec<Option<BlockColumn>>,
    /// U block columns, indexed by lbj.
    pub u_cols: Vec<Option<BlockColumn>>,
    /// Row offset of each local block row within `x`/`lsum`, length
    /// `nlb + 1` (exclusive prefix sum of local block sizes).
    pub ilsum: Vec<usize>,
    /// Total locally owned rows, `ilsum[nlb]`.
    pub ldalsum: usize,
    /// Number of local block rows with a backing supernode.
    pub nlb: usize,
}

impl LocalFactors {
    /// Offset of local block `lk`'s data within `x` for `nrhs` right-hand
    /// sides. The header word sits at `x_blk(..) - XK_H`.
    pub fn x_blk(&self, lk: usize, nrhs: usize) -> usize {
        self.ilsum[lk] * nrhs + (lk + 1) * XK_H
    }

    /// Offset of local block `lk`'s data within one `lsum` slab.
    pub fn lsum_blk(&self, lk: usize, nrhs: usize) -> usize {
        self.ilsum[lk] * nrhs + (lk + 1) * LSUM_H
    }

    /// Length of the `x` array for `nrhs` right-hand sides.
    pub fn x_len(&self, nrhs: usize) -> usize {
        self.ldalsum * nrhs + self.nlb * XK_H
    }

    /// Length of one `lsum` slab.
    pub fn lsum_slab_len(&self, nrhs: usize) -> usize {
        self.ldalsum * nrhs + self.nlb * LSUM_H
    }

    /// Global supernode id of local block row `lk` on process row `myrow`,
    /// or `None` past the end of the partition.
    pub fn global_block(
        part: &SupernodePartition,
        grid: &ProcessGrid,
        myrow: usize,
        lk: usize,
    ) -> Option<usize> {
        let gb = myrow + lk * grid.nprow;
        (gb < part.nsupers()).then_some(gb)
    }
}

/// Build the `ilsum` table for a process row: offsets of every local block
/// row of `myrow` in the concatenated block layout.
pub fn build_ilsum(
    part: &SupernodePartition,
    grid: &ProcessGrid,
    myrow: usize,
) -> (Vec<usize>, usize, usize) {
    let mut ilsum = vec![0];
    let mut lk = 0;
    loop {
        let gb = myrow + lk * grid.nprow;
        if gb >= part.nsupers() {
            break;
        }
        ilsum.push(ilsum[lk] + part.super_size(gb));
        lk += 1;
    }
    let nlb = lk;
    let ldalsum = *ilsum.last().unwrap();
    (ilsum, ldalsum, nlb)
}

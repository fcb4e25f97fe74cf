//! Supernode partition and ownership index.
//!
//! A supernode is a maximal run of consecutive columns with identical
//! below-diagonal nonzero structure. The partition is described by `xsup`
//! (first column of each supernode, length nsupers + 1) and `supno`
//! (supernode id of each column, length n), the same pair of tables a
//! symbolic factorization produces.
//!
//! Local block indices follow the block-cyclic layout: the block row `k`
//! owned by process row `k mod Pr` has local index `k / Pr` on that row,
//! and symmetrically for block columns.

use crate::grid::ProcessGrid;

/// Supernode partition of an n x n matrix.
#[derive(Debug, Clone)]
pub struct SupernodePartition {
    /// First column of each supernode; `xsup[nsupers] == n`.
    pub xsup: Vec<usize>,
    /// Supernode id of each column.
    pub supno: Vec<usize>,
}

impl SupernodePartition {
    /// Build a partition from a list of supernode sizes.
    pub fn from_sizes(sizes: &[usize]) -> Self {
        assert!(sizes.iter().all(|&s| s > 0), "empty supernode");
        let mut xsup = Vec::with_capacity(sizes.len() + 1);
        let mut supno = Vec::new();
        xsup.push(0);
        for (k, &s) in sizes.iter().enumerate() {
            supno.extend(std::iter::repeat(k).take(s));
            xsup.push(xsup[k] + s);
        }
        SupernodePartition { xsup, supno }
    }

    /// Partition of order `n` into supernodes of size `block`, the last
    /// one possibly smaller.
    pub fn uniform(n: usize, block: usize) -> Self {
        assert!(block > 0);
        let mut sizes = Vec::new();
        let mut rem = n;
        while rem > 0 {
            let s = rem.min(block);
            sizes.push(s);
            rem -= s;
        }
        SupernodePartition::from_sizes(&sizes)
    }

    /// Matrix order.
    pub fn n(&self) -> usize {
        *self.xsup.last().unwrap()
    }

    /// Number of supernodes.
    pub fn nsupers(&self) -> usize {
        self.xsup.len() - 1
    }

    /// Number of columns of supernode `k`.
    pub fn super_size(&self, k: usize) -> usize {
        self.xsup[k + 1] - self.xsup[k]
    }

    /// Largest supernode size; bounds the per-message payload.
    pub fn max_super_size(&self) -> usize {
        (0..self.nsupers())
            .map(|k| self.super_size(k))
            .max()
            .unwrap_or(0)
    }

    /// First global row/column of supernode `k`.
    pub fn fst_block_col(&self, k: usize) -> usize {
        self.xsup[k]
    }

    /// Supernode containing global row/column `i`.
    pub fn block_num(&self, i: usize) -> usize {
        self.supno[i]
    }

    /// Local block-row index of supernode `k` on its owning process row.
    pub fn lbi(&self, k: usize, grid: &ProcessGrid) -> usize {
        k / grid.nprow
    }

    /// Local block-column index of supernode `k` on its owning process column.
    pub fn lbj(&self, k: usize, grid: &ProcessGrid) -> usize {
        k / grid.npcol
    }

    /// Number of local block rows on a process row (ceiling division).
    pub fn n_local_block_rows(&self, grid: &ProcessGrid) -> usize {
        self.nsupers().div_ceil(grid.nprow)
    }

    /// Number of local block columns on a process column.
    pub fn n_local_block_cols(&self, grid: &ProcessGrid) -> usize {
        self.nsupers().div_ceil(grid.npcol)
    }
}

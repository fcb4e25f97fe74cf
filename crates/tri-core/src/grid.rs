//! 2D process mesh.
//!
//! P = Pr x Pc ranks are arranged row-major: rank = row * Pc + col.
//! Block (I, J) of the distributed factors lives on the rank at mesh
//! coordinates (I mod Pr, J mod Pc); the (K, K) block lives on the
//! *diagonal process* of supernode K.

/// A Pr x Pc process mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGrid {
    /// Number of process rows (Pr).
    pub nprow: usize,
    /// Number of process columns (Pc).
    pub npcol: usize,
}

impl ProcessGrid {
    /// Create a Pr x Pc mesh. Both dimensions must be nonzero.
    pub fn new(nprow: usize, npcol: usize) -> Self {
        assert!(nprow > 0 && npcol > 0, "process grid must be non-empty");
        ProcessGrid { nprow, npcol }
    }

    /// Total number of ranks.
    pub fn nprocs(&self) -> usize {
        self.nprow * self.npcol
    }

    /// Mesh row of `rank`.
    pub fn my_row(&self, rank: usize) -> usize {
        rank / self.npcol
    }

    /// Mesh column of `rank`.
    pub fn my_col(&self, rank: usize) -> usize {
        rank % self.npcol
    }

    /// Rank at mesh coordinates (row, col).
    pub fn rank_of(&self, row: usize, col: usize) -> usize {
        row * self.npcol + col
    }

    /// Process row owning block row `k`.
    pub fn row_owner(&self, k: usize) -> usize {
        k % self.nprow
    }

    /// Process column owning block column `k`.
    pub fn col_owner(&self, k: usize) -> usize {
        k % self.npcol
    }

    /// Rank of the diagonal process of supernode `k`, the owner of the
    /// (k, k) block.
    pub fn diag_rank(&self, k: usize) -> usize {
        self.rank_of(self.row_owner(k), self.col_owner(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_coords_roundtrip() {
        let grid = ProcessGrid::new(2, 3);
        for rank in 0..grid.nprocs() {
            let r = grid.my_row(rank);
            let c = grid.my_col(rank);
            assert_eq!(grid.rank_of(r, c), rank);
        }
    }

    #[test]
    fn test_block_cyclic_ownership() {
        let grid = ProcessGrid::new(2, 2);
        // Block (3, 5) -> (3 mod 2, 5 mod 2) = (1, 1) -> rank 3
        assert_eq!(grid.row_owner(3), 1);
        assert_eq!(grid.col_owner(5), 1);
        assert_eq!(grid.rank_of(1, 1), 3);
        // Diagonal of supernode 4 -> (0, 0) -> rank 0
        assert_eq!(grid.diag_rank(4), 0);
    }

    #[test]
    fn test_single_process_grid() {
        let grid = ProcessGrid::new(1, 1);
        for k in 0..10 {
            assert_eq!(grid.diag_rank(k), 0);
        }
    }
}

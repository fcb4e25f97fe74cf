//! The per-rank solve plan.
//!
//! Everything the engines consume but never compute lives here: the
//! broadcast and reduction trees for both factors, the initial dependency
//! counters (`fmod`/`bmod`), the reduce-children counts (`frecv`/`brecv`),
//! the per-rank message totals that terminate the receive loops, the
//! all-to-all counts for the B <-> X redistribution, and the exact
//! per-edge message counts that size the one-sided window stripes.
//!
//! Every rank builds its own plan from the same global view of the factor
//! structure, so the plans agree by construction: each broadcast-tree edge
//! appears as one expected receive on exactly one rank, and the receive
//! totals `nfrecvx + nfrecvmod` / `nbrecvx + nbrecvmod` are exact. The
//! solve relies on that exactness for termination.

use crate::distribute::GlobalFactors;
use crate::grid::ProcessGrid;
use crate::transport::WindowSizing;
use crate::tree::CommTree;

/// 1D block distribution of the right-hand side rows over the ranks.
#[derive(Debug, Clone)]
pub struct RowDist {
    /// First global row of each rank; `fst_row[nprocs] == n`.
    pub fst_row: Vec<usize>,
}

impl RowDist {
    /// Contiguous block distribution of `n` rows over `nprocs` ranks,
    /// remainder spread over the leading ranks.
    pub fn block(n: usize, nprocs: usize) -> RowDist {
        let base = n / nprocs;
        let rem = n % nprocs;
        let mut fst_row = Vec::with_capacity(nprocs + 1);
        let mut row = 0;
        for p in 0..nprocs {
            fst_row.push(row);
            row += base + usize::from(p < rem);
        }
        fst_row.push(n);
        RowDist { fst_row }
    }

    /// Local row count of `rank`.
    pub fn m_loc(&self, rank: usize) -> usize {
        self.fst_row[rank + 1] - self.fst_row[rank]
    }

    /// Rank owning global row `i`.
    pub fn owner_of_row(&self, i: usize) -> usize {
        // fst_row is sorted; partition_point gives the first rank whose
        // start exceeds i.
        self.fst_row.partition_point(|&f| f <= i) - 1
    }
}

/// Row and column permutations applied to the right-hand side on the way
/// in (B is permuted by Pc o Pr before the L-solve). Scaling is an
/// equilibration concern and stays outside the solver.
#[derive(Debug, Clone)]
pub struct Permutations {
    /// Row permutation Pr.
    pub perm_r: Vec<usize>,
    /// Column permutation Pc.
    pub perm_c: Vec<usize>,
}

impl Permutations {
    /// Identity permutations of order `n`.
    pub fn identity(n: usize) -> Permutations {
        Permutations {
            perm_r: (0..n).collect(),
            perm_c: (0..n).collect(),
        }
    }

    /// The permuted row `Pc(Pr(i))`.
    pub fn apply(&self, i: usize) -> usize {
        self.perm_c[self.perm_r[i]]
    }
}

/// Send/receive row counts of one all-to-all exchange, indexed by peer
/// rank. Value counts are these times `nrhs`.
#[derive(Debug, Clone)]
pub struct AlltoallPlan {
    /// Rows this rank sends to each peer.
    pub send_counts: Vec<usize>,
    /// Rows this rank receives from each peer.
    pub recv_counts: Vec<usize>,
}

/// The complete solve plan of one rank.
#[derive(Debug)]
pub struct RankPlan {
    /// L broadcast trees, by local block column.
    pub l_bcast: Vec<Option<CommTree>>,
    /// L reduction trees, by local block row.
    pub l_reduce: Vec<Option<CommTree>>,
    /// U broadcast trees, by local block column.
    pub u_bcast: Vec<Option<CommTree>>,
    /// U reduction trees, by local block row.
    pub u_reduce: Vec<Option<CommTree>>,
    /// Local L-update counts per local block row (reduce children *not*
    /// included; the engine folds `frecv` in at solve entry).
    pub fmod: Vec<i64>,
    /// Local U-update counts per local block row.
    pub bmod: Vec<i64>,
    /// L reduce-tree children per local block row.
    pub frecv: Vec<i64>,
    /// U reduce-tree children per local block row.
    pub brecv: Vec<i64>,
    /// Broadcast messages expected during the L-solve.
    pub nfrecvx: usize,
    /// Reduce messages expected during the L-solve.
    pub nfrecvmod: usize,
    /// Broadcast messages expected during the U-solve.
    pub nbrecvx: usize,
    /// Reduce messages expected during the U-solve.
    pub nbrecvmod: usize,
    /// All-to-all counts for B -> X.
    pub b_to_x: AlltoallPlan,
    /// All-to-all counts for X -> B.
    pub x_to_b: AlltoallPlan,
    /// Owner rank of each global row under the B distribution.
    pub row_to_proc: Vec<usize>,
    /// Exact per-edge receive counts, for the one-sided windows.
    pub window_sizing: WindowSizing,
    /// Largest supernode size; bounds the message payload.
    pub max_super: usize,
}

/// Build the solve plan of `rank` from the global factor structure, the
/// B row distribution, and the permutations.
pub fn build_rank_plan(
    gf: &GlobalFactors,
    grid: &ProcessGrid,
    rank: usize,
    rows: &RowDist,
    perms: &Permutations,
    fanout: usize,
) -> RankPlan {
    let part = &gf.part;
    let nsupers = part.nsupers();
    let myrow = grid.my_row(rank);
    let mycol = grid.my_col(rank);
    let nlb = (0..)
        .take_while(|lk| myrow + lk * grid.nprow < nsupers)
        .count();
    let nlbc = part.n_local_block_cols(grid);

    let mut plan = RankPlan {
        l_bcast: vec![None; nlbc],
        l_reduce: vec![None; nlb],
        u_bcast: vec![None; nlbc],
        u_reduce: vec![None; nlb],
        fmod: vec![0; nlb],
        bmod: vec![0; nlb],
        frecv: vec![0; nlb],
        brecv: vec![0; nlb],
        nfrecvx: 0,
        nfrecvmod: 0,
        nbrecvx: 0,
        nbrecvmod: 0,
        b_to_x: AlltoallPlan {
            send_counts: vec![0; grid.nprocs()],
            recv_counts: vec![0; grid.nprocs()],
        },
        x_to_b: AlltoallPlan {
            send_counts: vec![0; grid.nprocs()],
            recv_counts: vec![0; grid.nprocs()],
        },
        row_to_proc: (0..gf.n()).map(|i| rows.owner_of_row(i)).collect(),
        window_sizing: WindowSizing {
            l_bc: vec![0; grid.nprow],
            l_rd: vec![0; grid.npcol],
            u_bc: vec![0; grid.nprow],
            u_rd: vec![0; grid.npcol],
        },
        max_super: part.max_super_size(),
    };

    for k in 0..nsupers {
        let krow = grid.row_owner(k);
        let kcol = grid.col_owner(k);
        let sk = part.super_size(k);

        // --- L broadcast tree of column k: root is the diagonal process
        // row; participants are the rows owning below-diagonal blocks.
        let rows_l = participant_rows(gf, grid, k, krow, true);
        if mycol == kcol {
            let ranks = tree_ranks_by_row(grid, krow, kcol, &rows_l);
            if let Some(tree) = CommTree::build(&ranks, rank, fanout, sk) {
                if !tree.is_root() {
                    plan.nfrecvx += 1;
                    let src = tree.parent().expect("non-root node has a parent");
                    plan.window_sizing.l_bc[grid.my_row(src)] += 1;
                }
                plan.l_bcast[part.lbj(k, grid)] = Some(tree);
            }
        }

        // --- U broadcast tree of column k: rows owning above-diagonal
        // blocks.
        let rows_u = participant_rows(gf, grid, k, krow, false);
        if mycol == kcol {
            let ranks = tree_ranks_by_row(grid, krow, kcol, &rows_u);
            if let Some(tree) = CommTree::build(&ranks, rank, fanout, sk) {
                if !tree.is_root() {
                    plan.nbrecvx += 1;
                    let src = tree.parent().expect("non-root node has a parent");
                    plan.window_sizing.u_bc[grid.my_row(src)] += 1;
                }
                plan.u_bcast[part.lbj(k, grid)] = Some(tree);
            }
        }

        // --- Reduction trees and dependency counters of block row k.
        if myrow == krow {
            let lk = part.lbi(k, grid);

            let cols_l = contributor_cols(gf, grid, k, kcol, true);
            plan.fmod[lk] = (0..k)
                .filter(|&j| grid.col_owner(j) == mycol && gf.l_block_present(k, j))
                .count() as i64;
            let ranks = tree_ranks_by_col(grid, krow, kcol, &cols_l);
            if let Some(tree) = CommTree::build(&ranks, rank, fanout, sk) {
                plan.frecv[lk] = tree.children().len() as i64;
                plan.nfrecvmod += tree.children().len();
                for &c in tree.children() {
                    plan.window_sizing.l_rd[grid.my_col(c)] += 1;
                }
                plan.l_reduce[lk] = Some(tree);
            }

            let cols_u = contributor_cols(gf, grid, k, kcol, false);
            plan.bmod[lk] = (k + 1..nsupers)
                .filter(|&j| grid.col_owner(j) == mycol && gf.u_block_present(k, j))
                .count() as i64;
            let ranks = tree_ranks_by_col(grid, krow, kcol, &cols_u);
            if let Some(tree) = CommTree::build(&ranks, rank, fanout, sk) {
                plan.brecv[lk] = tree.children().len() as i64;
                plan.nbrecvmod += tree.children().len();
                for &c in tree.children() {
                    plan.window_sizing.u_rd[grid.my_col(c)] += 1;
                }
                plan.u_reduce[lk] = Some(tree);
            }
        }
    }

    // --- B -> X all-to-all counts: every rank routes each of its local B
    // rows to the diagonal process of the row's supernode.
    for p in 0..grid.nprocs() {
        for i in rows.fst_row[p]..rows.fst_row[p + 1] {
            let irow = perms.apply(i);
            let dest = grid.diag_rank(part.block_num(irow));
            if p == rank {
                plan.b_to_x.send_counts[dest] += 1;
            }
            if dest == rank {
                plan.b_to_x.recv_counts[p] += 1;
            }
        }
    }

    // --- X -> B: diagonal processes route each owned solution row back to
    // the rank owning that row of B. No extra column permutation here.
    for k in 0..nsupers {
        let src = grid.diag_rank(k);
        for irow in part.xsup[k]..part.xsup[k + 1] {
            let dest = plan.row_to_proc[irow];
            if src == rank {
                plan.x_to_b.send_counts[dest] += 1;
            }
            if dest == rank {
                plan.x_to_b.recv_counts[src] += 1;
            }
        }
    }

    log::debug!(
        "rank {rank}: plan built, nfrecvx={} nfrecvmod={} nbrecvx={} nbrecvmod={}",
        plan.nfrecvx,
        plan.nfrecvmod,
        plan.nbrecvx,
        plan.nbrecvmod
    );
    plan
}

/// Process rows owning off-diagonal blocks of column `k` (below the
/// diagonal for L, above it for U), excluding the root row.
fn participant_rows(
    gf: &GlobalFactors,
    grid: &ProcessGrid,
    k: usize,
    krow: usize,
    lower: bool,
) -> Vec<usize> {
    let nsupers = gf.part.nsupers();
    let range: Box<dyn Iterator<Item = usize>> = if lower {
        Box::new(k + 1..nsupers)
    } else {
        Box::new(0..k)
    };
    let mut out = Vec::new();
    for i in range {
        let present = if lower {
            gf.l_block_present(i, k)
        } else {
            gf.u_block_present(i, k)
        };
        if present {
            let r = grid.row_owner(i);
            if r != krow && !out.contains(&r) {
                out.push(r);
            }
        }
    }
    out.sort_unstable();
    out
}

/// Process columns contributing partial sums to block row `k` (from the
/// left of the diagonal for L, from the right for U), excluding the root
/// column.
fn contributor_cols(
    gf: &GlobalFactors,
    grid: &ProcessGrid,
    k: usize,
    kcol: usize,
    lower: bool,
) -> Vec<usize> {
    let nsupers = gf.part.nsupers();
    let range: Box<dyn Iterator<Item = usize>> = if lower {
        Box::new(0..k)
    } else {
        Box::new(k + 1..nsupers)
    };
    let mut out = Vec::new();
    for j in range {
        let present = if lower {
            gf.l_block_present(k, j)
        } else {
            gf.u_block_present(k, j)
        };
        if present {
            let c = grid.col_owner(j);
            if c != kcol && !out.contains(&c) {
                out.push(c);
            }
        }
    }
    out.sort_unstable();
    out
}

fn tree_ranks_by_row(
    grid: &ProcessGrid,
    root_row: usize,
    col: usize,
    rows: &[usize],
) -> Vec<usize> {
    let mut ranks = Vec::with_capacity(rows.len() + 1);
    ranks.push(grid.rank_of(root_row, col));
    ranks.extend(rows.iter().map(|&r| grid.rank_of(r, col)));
    ranks
}

fn tree_ranks_by_col(
    grid: &ProcessGrid,
    row: usize,
    root_col: usize,
    cols: &[usize],
) -> Vec<usize> {
    let mut ranks = Vec::with_capacity(cols.len() + 1);
    ranks.push(grid.rank_of(row, root_col));
    ranks.extend(cols.iter().map(|&c| grid.rank_of(row, c)));
    ranks
}

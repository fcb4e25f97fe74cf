//! Precomputed inverses of the diagonal blocks.
//!
//! With the inverse of L(K,K) and U(K,K) in hand, the innermost triangular
//! solve of each supernode becomes a single dense multiply against a
//! precomputed matrix: one GEMM of shape (s_K x nrhs) instead of one TRSM
//! per solved block. Both paths produce the same result up to
//! floating-point associativity; the engines pick one based on
//! [`crate::options::SolveOptions::use_inverse_diagonals`].

use crate::dense::{invert_lower_unit, invert_upper};
use crate::error::Result;
use crate::factors::LocalFactors;

/// Invert every locally owned diagonal block, storing the inverses next to
/// the blocks themselves. Idempotent; blocks without a diagonal (owned by
/// a different process row) are skipped.
pub fn compute_diag_inverses(factors: &mut LocalFactors) -> Result<()> {
    for col in factors.l_cols.iter_mut().flatten() {
        if let Some(diag) = &col.diag {
            let s = isqrt(diag.len());
            let mut inv = vec![0.0; s * s];
            invert_lower_unit(s, diag, s, &mut inv);
            col.inv = Some(inv);
        }
    }
    for col in factors.u_cols.iter_mut().flatten() {
        if let Some(diag) = &col.diag {
            let s = isqrt(diag.len());
            let mut inv = vec![0.0; s * s];
            invert_upper(s, diag, s, &mut inv, col.block_col)?;
            col.inv = Some(inv);
        }
    }
    Ok(())
}

/// Integer square root of a perfect square (block buffers are s x s).
fn isqrt(len: usize) -> usize {
    let s = (len as f64).sqrt().round() as usize;
    debug_assert_eq!(s * s, len);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::gemm;
    use crate::distribute::{distribute_factors, GlobalFactors};
    use crate::grid::ProcessGrid;
    use crate::supernode::SupernodePartition;

    #[test]
    fn test_inverses_multiply_to_identity() {
        let n = 6;
        let part = SupernodePartition::uniform(n, 3);
        let mut l = vec![0.0; n * n];
        let mut u = vec![0.0; n * n];
        for i in 0..n {
            l[i + i * n] = 1.0;
            u[i + i * n] = (i + 2) as f64;
        }
        l[1] = 0.5;
        l[2 + n] = -0.25;
        u[n] = 0.125;
        u[1 + 2 * n] = -0.5;
        let gf = GlobalFactors { part, l, u };
        let grid = ProcessGrid::new(1, 1);
        let mut lf = distribute_factors(&gf, &grid, 0);
        compute_diag_inverses(&mut lf).unwrap();

        for col in lf.l_cols.iter().flatten() {
            let diag = col.diag.as_ref().unwrap();
            let inv = col.inv.as_ref().unwrap();
            let s = 3;
            let mut prod = vec![0.0; s * s];
            gemm(s, s, s, 1.0, diag, s, inv, s, 0.0, &mut prod, s);
            for j in 0..s {
                for i in 0..s {
                    let expect = if i == j { 1.0 } else { 0.0 };
                    assert!((prod[i + j * s] - expect).abs() < 1e-12);
                }
            }
        }
        for col in lf.u_cols.iter().flatten() {
            assert!(col.inv.is_some());
        }
    }
}

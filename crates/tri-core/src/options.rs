//! Solver configuration.

use crate::transport::TransportKind;

/// Environment variable consulted when `threads == 0`.
pub const THREADS_ENV: &str = "TRI_NUM_THREADS";

/// Configuration surface of the solve.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    /// Use the precomputed diagonal inverses (GEMM per solved block)
    /// instead of a triangular solve (TRSM). Falls back to TRSM per block
    /// when an inverse has not been computed.
    pub use_inverse_diagonals: bool,
    /// Message delivery mechanism for the solve phases.
    pub transport: TransportKind,
    /// Intra-rank threads (master + workers). 0 reads `TRI_NUM_THREADS`
    /// from the environment, defaulting to 1. Ignored without the
    /// `parallel` feature.
    pub threads: usize,
    /// Fan-out of the broadcast/reduction trees.
    pub tree_fanout: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        SolveOptions {
            use_inverse_diagonals: true,
            transport: TransportKind::TwoSided,
            threads: 1,
            tree_fanout: 2,
        }
    }
}

impl SolveOptions {
    /// Resolve the effective intra-rank thread count.
    pub fn num_threads(&self) -> usize {
        let n = if self.threads == 0 {
            std::env::var(THREADS_ENV)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(1)
        } else {
            self.threads
        };
        let n = n.max(1);
        if cfg!(feature = "parallel") {
            n
        } else {
            1
        }
    }
}

//! Per-solve statistics.

use std::fmt;
use std::time::Duration;

/// Counters and timings recorded by one rank during a solve.
#[derive(Debug, Clone, Default)]
pub struct SolveStat {
    /// Floating-point operations spent in block solves and updates.
    pub solve_ops: u64,
    /// Tree messages sent (broadcast forwards + reduce forwards).
    pub msgs_sent: u64,
    /// Tree messages received.
    pub msgs_recv: u64,
    /// Time in the B -> X and X -> B redistributions.
    pub t_redist: Duration,
    /// Time in the forward (L) solve.
    pub t_lsolve: Duration,
    /// Time in the backward (U) solve.
    pub t_usolve: Duration,
    /// Wall time of the whole solve entry.
    pub t_total: Duration,
}

impl fmt::Display for SolveStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "solve ops        {:>12}", self.solve_ops)?;
        writeln!(
            f,
            "messages         {:>6} sent / {:>6} recv",
            self.msgs_sent, self.msgs_recv
        )?;
        writeln!(f, "redistribute     {:>10.4}s", self.t_redist.as_secs_f64())?;
        writeln!(f, "L-solve          {:>10.4}s", self.t_lsolve.as_secs_f64())?;
        writeln!(f, "U-solve          {:>10.4}s", self.t_usolve.as_secs_f64())?;
        write!(f, "total            {:>10.4}s", self.t_total.as_secs_f64())
    }
}

//! Thread-rank harness.
//!
//! Runs one closure per mesh rank, each on its own OS thread with its own
//! [`MeshComm`] endpoint, and collects the per-rank results in rank order.
//! This is how the tests and the demo driver stand up a Pr x Pc "process"
//! mesh inside a single process; a real MPI launcher would replace this
//! loop and nothing else.

use crate::grid::ProcessGrid;
use crate::transport::MeshComm;

/// Run `f(rank, comm)` once per rank of `grid`, in parallel, returning the
/// results in rank order. A panic on any rank propagates.
pub fn run_mesh<R, F>(grid: &ProcessGrid, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize, MeshComm) -> R + Sync,
{
    let comms = MeshComm::mesh(grid);
    let fref = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                std::thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(s, move || fref(rank, comm))
                    .expect("failed to spawn rank thread")
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MsgKind, SolvePhase, TransportKind, WindowSizing};

    #[test]
    fn test_ranks_see_their_ids() {
        let grid = ProcessGrid::new(2, 2);
        let out = run_mesh(&grid, |rank, _comm| rank * 10);
        assert_eq!(out, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_barrier_and_alltoallv() {
        let grid = ProcessGrid::new(1, 3);
        let out = run_mesh(&grid, |rank, mut comm| {
            comm.barrier();
            // Everyone sends its rank to everyone.
            let idx: Vec<Vec<usize>> = (0..3).map(|_| vec![rank]).collect();
            let vals: Vec<Vec<f64>> = (0..3).map(|d| vec![(rank * 10 + d) as f64]).collect();
            let (ri, rv) = comm.alltoallv(idx, vals);
            (0..3)
                .map(|src| (ri[src][0], rv[src][0]))
                .collect::<Vec<_>>()
        });
        for (me, row) in out.iter().enumerate() {
            for (src, &(i, v)) in row.iter().enumerate() {
                assert_eq!(i, src);
                assert_eq!(v, (src * 10 + me) as f64);
            }
        }
    }

    #[test]
    fn test_two_sided_solve_roundtrip() {
        let grid = ProcessGrid::new(2, 1);
        let out = run_mesh(&grid, |rank, mut comm| {
            comm.begin_solve(TransportKind::TwoSided, &WindowSizing::default(), 4);
            if rank == 0 {
                let sender = comm.sender();
                sender.send_solve(1, SolvePhase::LSolve, MsgKind::Bcast, &[3.0, 1.5, 2.5]);
                comm.end_solve();
                Vec::new()
            } else {
                let msg = comm.recv_solve(SolvePhase::LSolve);
                assert_eq!(msg.kind, MsgKind::Bcast);
                comm.end_solve();
                msg.data
            }
        });
        assert_eq!(out[1], vec![3.0, 1.5, 2.5]);
    }

    #[test]
    fn test_one_sided_solve_roundtrip() {
        let grid = ProcessGrid::new(2, 1);
        let out = run_mesh(&grid, |rank, mut comm| {
            // Rank 1 expects one L bcast message from process row 0.
            let sizing = if rank == 1 {
                WindowSizing {
                    l_bc: vec![1, 0],
                    l_rd: vec![0],
                    u_bc: vec![0, 0],
                    u_rd: vec![0],
                }
            } else {
                WindowSizing {
                    l_bc: vec![0, 0],
                    l_rd: vec![0],
                    u_bc: vec![0, 0],
                    u_rd: vec![0],
                }
            };
            comm.begin_solve(TransportKind::OneSided, &sizing, 4);
            let result = if rank == 0 {
                let sender = comm.sender();
                sender.send_solve(1, SolvePhase::LSolve, MsgKind::Bcast, &[7.0, 0.5]);
                Vec::new()
            } else {
                let msg = comm.recv_solve(SolvePhase::LSolve);
                assert_eq!(msg.kind, MsgKind::Bcast);
                msg.data
            };
            comm.end_solve();
            result
        });
        // One-sided slots are fixed-size; the payload leads.
        assert_eq!(&out[1][..2], &[7.0, 0.5]);
    }
}

//! Message transport between ranks.
//!
//! Ranks are OS threads wired by an in-process communicator. Two delivery
//! mechanisms implement the solve-phase contract:
//!
//! - **Two-sided**: every rank owns an unbounded channel; a send enqueues a
//!   tagged, header-prefixed buffer and completes immediately, a receive
//!   blocks on the channel. The four tags are (L, U) x (broadcast, reduce).
//! - **One-sided**: every rank exposes one *window* per solve phase, laid
//!   out as counters followed by per-source slot stripes:
//!
//!   ```text
//!   [Pr bcast counters | Pc reduce counters][BC stripes, one per source row][RD stripes, one per source col]
//!   ```
//!
//!   A sender writes the payload into the next slot of its stripe in the
//!   receiver's window, then atomically increments the matching counter
//!   (Release); the receiver polls the counters (Acquire) and consumes each
//!   stripe in slot order. Slot index follows a monotonic per-destination
//!   sequence number on the sender. Slots are `AtomicU64` bit patterns of
//!   one f64 word each, so the payload stores are plain relaxed stores made
//!   visible by the counter increment. Stripes are sized from the exact
//!   per-edge message counts the plan computes, and writing past a stripe
//!   (more messages than predicted) is fatal.
//!
//! The all-to-all exchange used by the B <-> X redistribution always runs
//! over the channels; the one-sided windows carry solve-phase traffic only.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};

use crate::grid::ProcessGrid;

/// Message delivery mechanism for the solve phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Tagged point-to-point messages over per-rank channels.
    #[default]
    TwoSided,
    /// One-sided puts into counter-fronted windows.
    OneSided,
}

/// Which solve phase a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvePhase {
    /// Forward substitution with L.
    LSolve,
    /// Back substitution with U.
    USolve,
}

/// Whether a message travels down a broadcast tree or up a reduction tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// An X[K] block fanning down a column.
    Bcast,
    /// A partial lsum[K] folding toward a diagonal.
    Reduce,
}

/// One received solve-phase message. `data[0]` is the header word holding
/// the global supernode id; the payload follows.
#[derive(Debug)]
pub struct SolveMsg {
    /// Broadcast or reduce.
    pub kind: MsgKind,
    /// Header-prefixed payload.
    pub data: Vec<f64>,
}

/// Everything that travels over a rank's channel.
enum RankMsg {
    Solve {
        phase: SolvePhase,
        kind: MsgKind,
        data: Vec<f64>,
    },
    Redist {
        src: usize,
        idx: Vec<usize>,
        vals: Vec<f64>,
    },
}

// ============================================================================
// One-sided window
// ============================================================================

/// One phase's receive window of a single rank.
struct Window {
    maxrecvsz: usize,
    /// Expected message count per source row (bcast) / source col (reduce);
    /// also the stripe capacities.
    bc_expect: Vec<usize>,
    rd_expect: Vec<usize>,
    bc_counters: Vec<AtomicUsize>,
    rd_counters: Vec<AtomicUsize>,
    /// Word offset of each stripe within `slots`.
    bc_base: Vec<usize>,
    rd_base: Vec<usize>,
    slots: Vec<AtomicU64>,
}

impl Window {
    fn new(bc_expect: Vec<usize>, rd_expect: Vec<usize>, maxrecvsz: usize) -> Window {
        let mut bc_base = Vec::with_capacity(bc_expect.len());
        let mut off = 0;
        for &e in &bc_expect {
            bc_base.push(off);
            off += e * maxrecvsz;
        }
        let mut rd_base = Vec::with_capacity(rd_expect.len());
        for &e in &rd_expect {
            rd_base.push(off);
            off += e * maxrecvsz;
        }
        let slots = (0..off).map(|_| AtomicU64::new(0)).collect();
        Window {
            maxrecvsz,
            bc_counters: (0..bc_expect.len()).map(|_| AtomicUsize::new(0)).collect(),
            rd_counters: (0..rd_expect.len()).map(|_| AtomicUsize::new(0)).collect(),
            bc_expect,
            rd_expect,
            bc_base,
            rd_base,
            slots,
        }
    }

    /// Write `data` into slot `seq` of `stripe` and bump the counter.
    /// The payload stores are Relaxed; the Release increment publishes them.
    fn put(&self, kind: MsgKind, stripe: usize, seq: usize, data: &[f64]) {
        assert!(data.len() <= self.maxrecvsz, "payload exceeds window slot");
        let (base, expect, counter) = match kind {
            MsgKind::Bcast => (
                self.bc_base[stripe],
                self.bc_expect[stripe],
                &self.bc_counters[stripe],
            ),
            MsgKind::Reduce => (
                self.rd_base[stripe],
                self.rd_expect[stripe],
                &self.rd_counters[stripe],
            ),
        };
        assert!(
            seq < expect,
            "one-sided put overruns stripe {stripe}: seq {seq} >= expected {expect}"
        );
        let off = base + seq * self.maxrecvsz;
        for (i, &v) in data.iter().enumerate() {
            self.slots[off + i].store(v.to_bits(), Ordering::Relaxed);
        }
        counter.fetch_add(1, Ordering::Release);
    }

    /// Poll the counters once; consume and return the next unread message
    /// if any stripe has one.
    fn try_take(&self, consumed_bc: &mut [usize], consumed_rd: &mut [usize]) -> Option<SolveMsg> {
        for (stripe, counter) in self.bc_counters.iter().enumerate() {
            let avail = counter.load(Ordering::Acquire);
            assert!(
                avail <= self.bc_expect[stripe],
                "bcast counter overran stripe {stripe}"
            );
            if consumed_bc[stripe] < avail {
                let data = self.read_slot(self.bc_base[stripe], consumed_bc[stripe]);
                consumed_bc[stripe] += 1;
                return Some(SolveMsg {
                    kind: MsgKind::Bcast,
                    data,
                });
            }
        }
        for (stripe, counter) in self.rd_counters.iter().enumerate() {
            let avail = counter.load(Ordering::Acquire);
            assert!(
                avail <= self.rd_expect[stripe],
                "reduce counter overran stripe {stripe}"
            );
            if consumed_rd[stripe] < avail {
                let data = self.read_slot(self.rd_base[stripe], consumed_rd[stripe]);
                consumed_rd[stripe] += 1;
                return Some(SolveMsg {
                    kind: MsgKind::Reduce,
                    data,
                });
            }
        }
        None
    }

    fn read_slot(&self, base: usize, seq: usize) -> Vec<f64> {
        let off = base + seq * self.maxrecvsz;
        (0..self.maxrecvsz)
            .map(|i| f64::from_bits(self.slots[off + i].load(Ordering::Relaxed)))
            .collect()
    }
}

/// The two per-phase windows of one rank.
struct RankWindows {
    l: Window,
    u: Window,
}

impl RankWindows {
    fn phase(&self, phase: SolvePhase) -> &Window {
        match phase {
            SolvePhase::LSolve => &self.l,
            SolvePhase::USolve => &self.u,
        }
    }
}

/// Rendezvous point where ranks publish their windows at solve entry and
/// look up their peers' after a barrier.
pub(crate) struct WindowRegistry {
    slots: Mutex<Vec<Option<Arc<RankWindows>>>>,
}

impl WindowRegistry {
    fn new(nprocs: usize) -> WindowRegistry {
        WindowRegistry {
            slots: Mutex::new(vec![None; nprocs]),
        }
    }

    fn publish(&self, rank: usize, windows: Arc<RankWindows>) {
        self.slots.lock().unwrap()[rank] = Some(windows);
    }

    fn collect(&self) -> Vec<Arc<RankWindows>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.clone().expect("window not published"))
            .collect()
    }

    fn clear(&self, rank: usize) {
        self.slots.lock().unwrap()[rank] = None;
    }
}

/// Per-destination monotonic sequence numbers, one table per phase x kind.
/// The mutex both hands out the slot and serializes the payload write with
/// the counter increment when several worker threads send to one peer.
struct SendSeq {
    l_bc: Vec<Mutex<usize>>,
    l_rd: Vec<Mutex<usize>>,
    u_bc: Vec<Mutex<usize>>,
    u_rd: Vec<Mutex<usize>>,
}

impl SendSeq {
    fn new(nprocs: usize) -> SendSeq {
        let table = |n: usize| (0..n).map(|_| Mutex::new(0)).collect();
        SendSeq {
            l_bc: table(nprocs),
            l_rd: table(nprocs),
            u_bc: table(nprocs),
            u_rd: table(nprocs),
        }
    }

    fn get(&self, phase: SolvePhase, kind: MsgKind) -> &[Mutex<usize>] {
        match (phase, kind) {
            (SolvePhase::LSolve, MsgKind::Bcast) => &self.l_bc,
            (SolvePhase::LSolve, MsgKind::Reduce) => &self.l_rd,
            (SolvePhase::USolve, MsgKind::Bcast) => &self.u_bc,
            (SolvePhase::USolve, MsgKind::Reduce) => &self.u_rd,
        }
    }
}

/// Receiver-side consumed-slot cursors for the active one-sided solve.
struct OneSidedRecv {
    l_bc: Vec<usize>,
    l_rd: Vec<usize>,
    u_bc: Vec<usize>,
    u_rd: Vec<usize>,
}

enum ActiveTransport {
    TwoSided,
    OneSided {
        peers: Vec<Arc<RankWindows>>,
        seq: Arc<SendSeq>,
        recv: OneSidedRecv,
    },
}

// ============================================================================
// Mesh communicator
// ============================================================================

/// Exact per-edge message counts a rank expects to receive, used to size
/// the one-sided window stripes. Produced by the plan.
#[derive(Debug, Clone, Default)]
pub struct WindowSizing {
    /// L-solve bcast messages expected per source process row.
    pub l_bc: Vec<usize>,
    /// L-solve reduce messages expected per source process column.
    pub l_rd: Vec<usize>,
    /// U-solve bcast messages expected per source process row.
    pub u_bc: Vec<usize>,
    /// U-solve reduce messages expected per source process column.
    pub u_rd: Vec<usize>,
}

/// One rank's endpoint of the in-process mesh.
pub struct MeshComm {
    rank: usize,
    grid: ProcessGrid,
    senders: Vec<Sender<RankMsg>>,
    receiver: Receiver<RankMsg>,
    barrier: Arc<Barrier>,
    registry: Arc<WindowRegistry>,
    active: Option<ActiveTransport>,
}

impl MeshComm {
    /// Build the communicators for every rank of `grid`.
    pub fn mesh(grid: &ProcessGrid) -> Vec<MeshComm> {
        let nprocs = grid.nprocs();
        let mut senders = Vec::with_capacity(nprocs);
        let mut receivers = Vec::with_capacity(nprocs);
        for _ in 0..nprocs {
            let (tx, rx) = std::sync::mpsc::channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let barrier = Arc::new(Barrier::new(nprocs));
        let registry = Arc::new(WindowRegistry::new(nprocs));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| MeshComm {
                rank,
                grid: *grid,
                senders: senders.clone(),
                receiver,
                barrier: barrier.clone(),
                registry: registry.clone(),
                active: None,
            })
            .collect::<Vec<_>>()
    }

    /// This rank's id.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks on the mesh.
    pub fn nprocs(&self) -> usize {
        self.senders.len()
    }

    /// Synchronize all ranks.
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    /// Activate the solve-phase transport. For the one-sided kind this
    /// allocates and publishes this rank's windows (sized by `sizing` and
    /// `maxrecvsz`) and rendezvouses with the peers; collective.
    pub fn begin_solve(&mut self, kind: TransportKind, sizing: &WindowSizing, maxrecvsz: usize) {
        match kind {
            TransportKind::TwoSided => {
                self.active = Some(ActiveTransport::TwoSided);
            }
            TransportKind::OneSided => {
                let nprow = self.grid.nprow;
                let npcol = self.grid.npcol;
                let windows = Arc::new(RankWindows {
                    l: Window::new(sizing.l_bc.clone(), sizing.l_rd.clone(), maxrecvsz),
                    u: Window::new(sizing.u_bc.clone(), sizing.u_rd.clone(), maxrecvsz),
                });
                debug_assert_eq!(sizing.l_bc.len(), nprow);
                debug_assert_eq!(sizing.l_rd.len(), npcol);
                self.registry.publish(self.rank, windows);
                self.barrier.wait();
                let peers = self.registry.collect();
                self.active = Some(ActiveTransport::OneSided {
                    peers,
                    seq: Arc::new(SendSeq::new(self.nprocs())),
                    recv: OneSidedRecv {
                        l_bc: vec![0; nprow],
                        l_rd: vec![0; npcol],
                        u_bc: vec![0; nprow],
                        u_rd: vec![0; npcol],
                    },
                });
            }
        }
    }

    /// Release the solve-phase transport; collective for one-sided.
    pub fn end_solve(&mut self) {
        if let Some(ActiveTransport::OneSided { .. }) = self.active {
            self.barrier.wait();
            self.registry.clear(self.rank);
        }
        self.active = None;
    }

    /// Block until the next solve-phase message for `phase` arrives.
    pub fn recv_solve(&mut self, phase: SolvePhase) -> SolveMsg {
        match self.active.as_mut().expect("transport not active") {
            ActiveTransport::TwoSided => match self.receiver.recv().expect("mesh disconnected") {
                RankMsg::Solve {
                    phase: p,
                    kind,
                    data,
                } => {
                    assert!(p == phase, "solve message from the wrong phase");
                    SolveMsg { kind, data }
                }
                RankMsg::Redist { .. } => {
                    panic!("redistribution message during a solve phase")
                }
            },
            ActiveTransport::OneSided { peers, recv, .. } => {
                let window = peers[self.rank].phase(phase);
                let (cbc, crd) = match phase {
                    SolvePhase::LSolve => (&mut recv.l_bc, &mut recv.l_rd),
                    SolvePhase::USolve => (&mut recv.u_bc, &mut recv.u_rd),
                };
                loop {
                    if let Some(msg) = window.try_take(cbc, crd) {
                        return msg;
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Handle workers use to send; cheap to clone into a thread.
    pub fn sender(&self) -> MeshSender {
        let backend = match self.active.as_ref().expect("transport not active") {
            ActiveTransport::TwoSided => SenderBackend::TwoSided(self.senders.clone()),
            ActiveTransport::OneSided { peers, seq, .. } => SenderBackend::OneSided {
                peers: peers.clone(),
                seq: seq.clone(),
            },
        };
        MeshSender {
            myrow: self.grid.my_row(self.rank),
            mycol: self.grid.my_col(self.rank),
            backend,
        }
    }

    /// Await completion of outstanding sends. In-process sends complete
    /// eagerly, so this only closes out the tree send contract.
    pub fn wait_sends(&self) {}

    /// Exchange per-destination (index, value) buffers with every rank.
    /// Returns the received buffers indexed by source rank. Used by the
    /// B <-> X redistribution; always travels over the channels.
    pub fn alltoallv(
        &mut self,
        send_idx: Vec<Vec<usize>>,
        send_vals: Vec<Vec<f64>>,
    ) -> (Vec<Vec<usize>>, Vec<Vec<f64>>) {
        let nprocs = self.nprocs();
        assert_eq!(send_idx.len(), nprocs);
        assert_eq!(send_vals.len(), nprocs);
        let mut out_idx: Vec<Vec<usize>> = vec![Vec::new(); nprocs];
        let mut out_vals: Vec<Vec<f64>> = vec![Vec::new(); nprocs];
        for (dest, (idx, vals)) in send_idx.into_iter().zip(send_vals).enumerate() {
            if dest == self.rank {
                out_idx[dest] = idx;
                out_vals[dest] = vals;
            } else {
                self.senders[dest]
                    .send(RankMsg::Redist {
                        src: self.rank,
                        idx,
                        vals,
                    })
                    .expect("mesh disconnected");
            }
        }
        for _ in 0..nprocs - 1 {
            match self.receiver.recv().expect("mesh disconnected") {
                RankMsg::Redist { src, idx, vals } => {
                    out_idx[src] = idx;
                    out_vals[src] = vals;
                }
                RankMsg::Solve { .. } => panic!("solve message during redistribution"),
            }
        }
        (out_idx, out_vals)
    }
}

/// Send-only handle onto the mesh, safe to move into worker threads.
pub struct MeshSender {
    myrow: usize,
    mycol: usize,
    backend: SenderBackend,
}

enum SenderBackend {
    TwoSided(Vec<Sender<RankMsg>>),
    OneSided {
        peers: Vec<Arc<RankWindows>>,
        seq: Arc<SendSeq>,
    },
}

impl Clone for MeshSender {
    fn clone(&self) -> Self {
        let backend = match &self.backend {
            SenderBackend::TwoSided(s) => SenderBackend::TwoSided(s.clone()),
            SenderBackend::OneSided { peers, seq } => SenderBackend::OneSided {
                peers: peers.clone(),
                seq: seq.clone(),
            },
        };
        MeshSender {
            myrow: self.myrow,
            mycol: self.mycol,
            backend,
        }
    }
}

impl MeshSender {
    /// Deliver one header-prefixed solve-phase buffer to `dest`.
    /// Non-blocking in both transports.
    pub fn send_solve(&self, dest: usize, phase: SolvePhase, kind: MsgKind, data: &[f64]) {
        match &self.backend {
            SenderBackend::TwoSided(senders) => {
                senders[dest]
                    .send(RankMsg::Solve {
                        phase,
                        kind,
                        data: data.to_vec(),
                    })
                    .expect("mesh disconnected");
            }
            SenderBackend::OneSided { peers, seq } => {
                let window = peers[dest].phase(phase);
                // Broadcasts travel within a process column and are striped
                // by source row; reductions travel within a row, striped by
                // source column.
                let stripe = match kind {
                    MsgKind::Bcast => self.myrow,
                    MsgKind::Reduce => self.mycol,
                };
                let mut guard = seq.get(phase, kind)[dest].lock().unwrap();
                window.put(kind, stripe, *guard, data);
                *guard += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_put_take_in_order() {
        let w = Window::new(vec![2, 1], vec![1], 4);
        w.put(MsgKind::Bcast, 0, 0, &[1.0, 10.0]);
        w.put(MsgKind::Bcast, 0, 1, &[2.0, 20.0]);
        w.put(MsgKind::Reduce, 0, 0, &[3.0, 30.0]);
        let mut cbc = vec![0, 0];
        let mut crd = vec![0];
        let m1 = w.try_take(&mut cbc, &mut crd).unwrap();
        assert_eq!(m1.kind, MsgKind::Bcast);
        assert_eq!(m1.data[0], 1.0);
        let m2 = w.try_take(&mut cbc, &mut crd).unwrap();
        assert_eq!(m2.data[0], 2.0);
        let m3 = w.try_take(&mut cbc, &mut crd).unwrap();
        assert_eq!(m3.kind, MsgKind::Reduce);
        assert_eq!(m3.data[0], 3.0);
        assert!(w.try_take(&mut cbc, &mut crd).is_none());
    }

    #[test]
    #[should_panic(expected = "overruns stripe")]
    fn test_window_overrun_is_fatal() {
        let w = Window::new(vec![1], vec![], 2);
        w.put(MsgKind::Bcast, 0, 0, &[1.0]);
        w.put(MsgKind::Bcast, 0, 1, &[2.0]);
    }
}

//! The dependency-driven forward substitution L * Y = B1.
//!
//! Self-scheduled, message-driven loop. Each rank first solves its *leaf*
//! supernodes (diagonal blocks with no pending dependencies), broadcasts
//! their X blocks down the column trees, and applies the resulting block
//! updates. It then sits in a receive loop:
//!
//! - an incoming **X[k] broadcast** is relayed to the tree children first
//!   (bandwidth is not held hostage to compute), then every local block
//!   (I, k) contributes `lsum[I] -= L(I,k) * X[k]` and decrements
//!   `fmod[I]`;
//! - an incoming **partial sum** is merged into the local `lsum[k]` slab
//!   and also decrements `fmod[k]`.
//!
//! The thread that drives a counter to zero owns the follow-on work: an
//! interior reduce node folds its slabs and forwards one message toward
//! the root; the root (the diagonal process) folds `lsum` into `x`, solves
//! the diagonal block, broadcasts the fresh X block, and recurses into the
//! local updates of its own column. The loop terminates after exactly
//! `nfrecvx + nfrecvmod` messages, the only termination condition.
//!
//! With `nthreads > 1` the master thread keeps the receive loop and hands
//! ready work to a pool of scoped workers; each worker accumulates into
//! its own `lsum` slab and the slabs are summed at the readiness point.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::dense::{gemm, trsm_lower_unit};
use crate::factors::{LocalFactors, LSUM_H, XK_H};
use crate::grid::ProcessGrid;
use crate::plan::RankPlan;
use crate::pool::{scratch_for, SharedArray, Task, TaskQueue};
use crate::supernode::SupernodePartition;
use crate::transport::{MeshComm, MeshSender, MsgKind, SolveMsg, SolvePhase};

struct Ctx<'a> {
    part: &'a SupernodePartition,
    grid: &'a ProcessGrid,
    factors: &'a LocalFactors,
    plan: &'a RankPlan,
    nrhs: usize,
    use_inv: bool,
    mycol: usize,
    sizelsum: usize,
    nthreads: usize,
    x: SharedArray,
    lsum: SharedArray,
    fmod: Vec<AtomicI64>,
    ops: AtomicU64,
    sent: AtomicU64,
}

/// Run the forward solve on this rank. Returns (ops, sent, received).
#[allow(clippy::too_many_arguments)]
pub(crate) fn l_solve(
    part: &SupernodePartition,
    grid: &ProcessGrid,
    factors: &LocalFactors,
    plan: &RankPlan,
    nrhs: usize,
    use_inv: bool,
    nthreads: usize,
    x: &mut [f64],
    lsum: &mut [f64],
    sizelsum: usize,
    comm: &mut MeshComm,
) -> (u64, u64, u64) {
    let rank = comm.rank();
    let myrow = grid.my_row(rank);
    let mycol = grid.my_col(rank);
    let nsupers = part.nsupers();

    // fmod = local block products still pending + reduce children still
    // pending. A diagonal block starting at zero is a leaf.
    let fmod: Vec<AtomicI64> = plan
        .fmod
        .iter()
        .zip(&plan.frecv)
        .map(|(&f, &r)| AtomicI64::new(f + r))
        .collect();

    let mut leafsups = Vec::new();
    for lk in 0..factors.nlb {
        let gb = myrow + lk * grid.nprow;
        if gb < nsupers && grid.col_owner(gb) == mycol && fmod[lk].load(Ordering::Relaxed) == 0 {
            leafsups.push(gb);
        }
    }
    let total = plan.nfrecvx + plan.nfrecvmod;
    log::debug!(
        "rank {rank}: L-solve, {} leaves, expecting {total} messages",
        leafsups.len()
    );

    let ctx = Ctx {
        part,
        grid,
        factors,
        plan,
        nrhs,
        use_inv,
        mycol,
        sizelsum,
        nthreads,
        x: SharedArray::new(x),
        lsum: SharedArray::new(lsum),
        fmod,
        ops: AtomicU64::new(0),
        sent: AtomicU64::new(0),
    };
    let sender = comm.sender();
    let mut recv_count = 0u64;

    if nthreads <= 1 {
        let mut scratch = Vec::new();
        for &k in &leafsups {
            solve_diag(&ctx, k, &mut scratch);
        }
        for &k in &leafsups {
            forward_x(&ctx, &sender, k);
        }
        for &k in &leafsups {
            apply_column(&ctx, &sender, 0, &mut scratch, k, None);
        }
        for _ in 0..total {
            let msg = comm.recv_solve(SolvePhase::LSolve);
            recv_count += 1;
            handle_message(&ctx, &sender, 0, &mut scratch, msg);
        }
    } else {
        let queue = TaskQueue::new();
        std::thread::scope(|s| {
            for wid in 1..nthreads {
                let wsender = sender.clone();
                let ctxr = &ctx;
                let queuer = &queue;
                s.spawn(move || {
                    let mut scratch = Vec::new();
                    while let Some(task) = queuer.pop() {
                        process_task(ctxr, &wsender, wid, &mut scratch, task);
                        queuer.task_done();
                    }
                });
            }
            // Leaves in parallel, broadcasts flushed once they are final.
            for &k in &leafsups {
                queue.push(Task::Diag { k });
            }
            queue.wait_idle();
            for &k in &leafsups {
                forward_x(&ctx, &sender, k);
            }
            for &k in &leafsups {
                queue.push(Task::Update { k, data: None });
            }

            for _ in 0..total {
                let msg = comm.recv_solve(SolvePhase::LSolve);
                recv_count += 1;
                match msg.kind {
                    MsgKind::Bcast => {
                        let k = header_block(&msg.data, nsupers);
                        relay_bcast(&ctx, &sender, k, &msg.data);
                        queue.push(Task::Update {
                            k,
                            data: Some(msg.data),
                        });
                    }
                    MsgKind::Reduce => {
                        let k = header_block(&msg.data, nsupers);
                        queue.push(Task::Merge { k, data: msg.data });
                    }
                }
            }
            queue.wait_idle();
            queue.shutdown();
        });
    }
    comm.wait_sends();

    (
        ctx.ops.load(Ordering::Relaxed),
        ctx.sent.load(Ordering::Relaxed),
        recv_count,
    )
}

/// Validate a message header and return the global supernode id.
fn header_block(data: &[f64], nsupers: usize) -> usize {
    let h = data[0];
    assert!(
        h >= 0.0 && h < nsupers as f64 && h.fract() == 0.0,
        "malformed message header {h}"
    );
    h as usize
}

fn handle_message(
    ctx: &Ctx<'_>,
    sender: &MeshSender,
    tid: usize,
    scratch: &mut Vec<f64>,
    msg: SolveMsg,
) {
    let k = header_block(&msg.data, ctx.part.nsupers());
    match msg.kind {
        MsgKind::Bcast => {
            relay_bcast(ctx, sender, k, &msg.data);
            apply_column(ctx, sender, tid, scratch, k, Some(&msg.data));
        }
        MsgKind::Reduce => merge_reduce(ctx, sender, tid, scratch, k, &msg.data),
    }
}

fn process_task(
    ctx: &Ctx<'_>,
    sender: &MeshSender,
    tid: usize,
    scratch: &mut Vec<f64>,
    task: Task,
) {
    match task {
        Task::Diag { k } => solve_diag(ctx, k, scratch),
        Task::Update { k, data } => apply_column(ctx, sender, tid, scratch, k, data.as_deref()),
        Task::Merge { k, data } => merge_reduce(ctx, sender, tid, scratch, k, &data),
    }
}

/// Forward an incoming X[k] buffer to this node's tree children before any
/// local compute touches it.
fn relay_bcast(ctx: &Ctx<'_>, sender: &MeshSender, k: usize, data: &[f64]) {
    let lj = ctx.part.lbj(k, ctx.grid);
    let tree = ctx.plan.l_bcast[lj]
        .as_ref()
        .expect("broadcast received for a column without a tree");
    let len = XK_H + tree.msg_size() * ctx.nrhs;
    for &c in tree.children() {
        sender.send_solve(c, SolvePhase::LSolve, MsgKind::Bcast, &data[..len]);
        ctx.sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// X[k] <- Linv(k,k) * x[k] (or a unit-lower TRSM when no inverse is
/// available).
fn solve_diag(ctx: &Ctx<'_>, k: usize, scratch: &mut Vec<f64>) {
    let lk = ctx.part.lbi(k, ctx.grid);
    let sk = ctx.part.super_size(k);
    let ii = ctx.factors.x_blk(lk, ctx.nrhs);
    // Safety: the counter transition handed this thread block k of x.
    let xblk = unsafe { ctx.x.slice_mut(ii, sk * ctx.nrhs) };
    let col = ctx.factors.l_cols[ctx.part.lbj(k, ctx.grid)]
        .as_ref()
        .expect("diagonal block column missing");
    match &col.inv {
        Some(inv) if ctx.use_inv => {
            let tmp = scratch_for(scratch, sk * ctx.nrhs);
            gemm(sk, ctx.nrhs, sk, 1.0, inv, sk, xblk, sk, 0.0, tmp, sk);
            xblk.copy_from_slice(tmp);
        }
        _ => {
            let diag = col.diag.as_ref().expect("diagonal block missing");
            trsm_lower_unit(sk, ctx.nrhs, diag, sk, xblk, sk);
        }
    }
    ctx.ops
        .fetch_add((sk * sk.saturating_sub(1) * ctx.nrhs) as u64, Ordering::Relaxed);
}

/// Send the finished X[k] (header included) down the column tree.
fn forward_x(ctx: &Ctx<'_>, sender: &MeshSender, k: usize) {
    let lj = ctx.part.lbj(k, ctx.grid);
    let Some(tree) = ctx.plan.l_bcast[lj].as_ref() else {
        return;
    };
    debug_assert!(tree.is_root(), "only the diagonal process originates X[k]");
    let lk = ctx.part.lbi(k, ctx.grid);
    let sk = ctx.part.super_size(k);
    let ii = ctx.factors.x_blk(lk, ctx.nrhs);
    // Safety: block k is final; receivers get copies.
    let data = unsafe { ctx.x.slice(ii - XK_H, XK_H + sk * ctx.nrhs) };
    for &c in tree.children() {
        sender.send_solve(c, SolvePhase::LSolve, MsgKind::Bcast, data);
        ctx.sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// lsum[I] -= L(I,k) * X[k] for every local block (I, k), decrementing
/// each target's dependency counter.
fn apply_column(
    ctx: &Ctx<'_>,
    sender: &MeshSender,
    tid: usize,
    scratch: &mut Vec<f64>,
    k: usize,
    payload: Option<&[f64]>,
) {
    let lj = ctx.part.lbj(k, ctx.grid);
    let Some(col) = ctx.factors.l_cols[lj].as_ref() else {
        return;
    };
    let sk = ctx.part.super_size(k);
    let n = ctx.nrhs;
    let xk: &[f64] = match payload {
        Some(p) => &p[XK_H..XK_H + sk * n],
        // Safety: X[k] is final before its updates are scheduled.
        None => unsafe {
            ctx.x
                .slice(ctx.factors.x_blk(ctx.part.lbi(k, ctx.grid), n), sk * n)
        },
    };
    for blk in &col.blocks {
        let i = blk.block_row;
        let si = ctx.part.super_size(i);
        let lki = ctx.part.lbi(i, ctx.grid);
        let il = ctx.factors.lsum_blk(lki, n) + tid * ctx.sizelsum;
        // Safety: slab `tid` belongs to this thread.
        let dst = unsafe { ctx.lsum.slice_mut(il, si * n) };
        gemm(si, n, sk, -1.0, &blk.values, si, xk, sk, 1.0, dst, si);
        ctx.ops
            .fetch_add((2 * si * sk * n) as u64, Ordering::Relaxed);
        let prev = ctx.fmod[lki].fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "dependency counter underflow on block {i}");
        if prev == 1 {
            block_ready(ctx, sender, tid, scratch, i);
        }
    }
}

/// Fold a child's partial sum into this rank's slab for block row k.
fn merge_reduce(
    ctx: &Ctx<'_>,
    sender: &MeshSender,
    tid: usize,
    scratch: &mut Vec<f64>,
    k: usize,
    data: &[f64],
) {
    let lk = ctx.part.lbi(k, ctx.grid);
    let sk = ctx.part.super_size(k);
    let n = ctx.nrhs;
    let il = ctx.factors.lsum_blk(lk, n) + tid * ctx.sizelsum;
    // Safety: slab `tid` belongs to this thread.
    let dst = unsafe { ctx.lsum.slice_mut(il, sk * n) };
    for (d, &v) in dst.iter_mut().zip(&data[LSUM_H..LSUM_H + sk * n]) {
        *d += v;
    }
    let prev = ctx.fmod[lk].fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "dependency counter underflow on block {k}");
    if prev == 1 {
        block_ready(ctx, sender, tid, scratch, k);
    }
}

/// All dependencies of block row k have arrived; the calling thread owns
/// the follow-on work.
fn block_ready(ctx: &Ctx<'_>, sender: &MeshSender, tid: usize, scratch: &mut Vec<f64>, k: usize) {
    let lk = ctx.part.lbi(k, ctx.grid);
    let sk = ctx.part.super_size(k);
    let n = ctx.nrhs;
    let il0 = ctx.factors.lsum_blk(lk, n);
    // Safety: fmod[lk] just hit zero, so every contribution to block k is
    // in place (AcqRel on the decrement orders the slab writes).
    let base = unsafe { ctx.lsum.slice_mut(il0, sk * n) };
    for t in 1..ctx.nthreads {
        let other = unsafe { ctx.lsum.slice(il0 + t * ctx.sizelsum, sk * n) };
        for (b, &o) in base.iter_mut().zip(other) {
            *b += o;
        }
    }
    match ctx.plan.l_reduce[lk].as_ref() {
        Some(tree) if !tree.is_root() => {
            // Interior reduce node: one message toward the root.
            let mut buf = vec![0.0; LSUM_H + sk * n];
            buf[0] = k as f64;
            buf[LSUM_H..].copy_from_slice(base);
            let parent = tree.parent().expect("interior reduce node has a parent");
            sender.send_solve(parent, SolvePhase::LSolve, MsgKind::Reduce, &buf);
            ctx.sent.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            // Reduce root: fold into x, solve, broadcast, recurse.
            debug_assert_eq!(
                ctx.grid.col_owner(k),
                ctx.mycol,
                "reduce root must be the diagonal process"
            );
            let ii = ctx.factors.x_blk(lk, n);
            // Safety: the zero transition hands this thread block k of x.
            let xblk = unsafe { ctx.x.slice_mut(ii, sk * n) };
            for (xv, &s) in xblk.iter_mut().zip(&*base) {
                *xv += s;
            }
            solve_diag(ctx, k, scratch);
            forward_x(ctx, sender, k);
            apply_column(ctx, sender, tid, scratch, k, None);
        }
    }
}

//! The dependency-driven back substitution U * X = Y.
//!
//! Mirror of the forward solve with the dependency DAG reversed: the
//! *roots* (final supernodes, `bmod == 0` on their diagonal process) start
//! first, updates flow toward lower block rows (`lsum[I] -= U(I,k) * X[k]`
//! for I < k), and the loop drains exactly `nbrecvx + nbrecvmod`
//! messages. U has its own broadcast and reduction trees because its
//! sparsity pattern differs from L's; the diagonal solve uses the
//! precomputed Uinv (or an upper TRSM). The Y components left in `x` by
//! the forward solve are the inputs here.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::dense::{gemm, trsm_upper};
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
    bmod: Vec<AtomicI64>,
    ops: AtomicU64,
    sent: AtomicU64,
}

/// Run the back solve on this rank. Returns (ops, sent, received).
#[allow(clippy::too_many_arguments)]
pub(crate) fn u_solve(
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

    let bmod: Vec<AtomicI64> = plan
        .bmod
        .iter()
        .zip(&plan.brecv)
        .map(|(&b, &r)| AtomicI64::new(b + r))
        .collect();

    // Roots of the reversed DAG: diagonal blocks with nothing pending.
    let mut rootsups = Vec::new();
    for lk in 0..factors.nlb {
        let gb = myrow + lk * grid.nprow;
        if gb < nsupers && grid.col_owner(gb) == mycol && bmod[lk].load(Ordering::Relaxed) == 0 {
            rootsups.push(gb);
        }
    }
    let total = plan.nbrecvx + plan.nbrecvmod;
    log::debug!(
        "rank {rank}: U-solve, {} roots, expecting {total} messages",
        rootsups.len()
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
        bmod,
        ops: AtomicU64::new(0),
        sent: AtomicU64::new(0),
    };
    let sender = comm.sender();
    let mut recv_count = 0u64;

    if nthreads <= 1 {
        let mut scratch = Vec::new();
        for &k in &rootsups {
            solve_diag(&ctx, k, &mut scratch);
        }
        for &k in &rootsups {
            forward_x(&ctx, &sender, k);
        }
        for &k in &rootsups {
            apply_column(&ctx, &sender, 0, &mut scratch, k, None);
        }
        for _ in 0..total {
            let msg = comm.recv_solve(SolvePhase::USolve);
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
            for &k in &rootsups {
                queue.push(Task::Diag { k });
            }
            queue.wait_idle();
            for &k in &rootsups {
                forward_x(&ctx, &sender, k);
            }
            for &k in &rootsups {
                queue.push(Task::Update { k, data: None });
            }

            for _ in 0..total {
                let msg = comm.recv_solve(SolvePhase::USolve);
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

fn relay_bcast(ctx: &Ctx<'_>, sender: &MeshSender, k: usize, data: &[f64]) {
    let lj = ctx.part.lbj(k, ctx.grid);
    let tree = ctx.plan.u_bcast[lj]
        .as_ref()
        .expect("broadcast received for a column without a tree");
    let len = XK_H + tree.msg_size() * ctx.nrhs;
    for &c in tree.children() {
        sender.send_solve(c, SolvePhase::USolve, MsgKind::Bcast, &data[..len]);
        ctx.sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// X[k] <- Uinv(k,k) * x[k] (or an upper TRSM when no inverse is
/// available).
fn solve_diag(ctx: &Ctx<'_>, k: usize, scratch: &mut Vec<f64>) {
    let lk = ctx.part.lbi(k, ctx.grid);
    let sk = ctx.part.super_size(k);
    let ii = ctx.factors.x_blk(lk, ctx.nrhs);
    // Safety: the counter transition handed this thread block k of x.
    let xblk = unsafe { ctx.x.slice_mut(ii, sk * ctx.nrhs) };
    let col = ctx.factors.u_cols[ctx.part.lbj(k, ctx.grid)]
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
            trsm_upper(sk, ctx.nrhs, diag, sk, xblk, sk);
        }
    }
    ctx.ops
        .fetch_add((sk * (sk + 1) * ctx.nrhs) as u64, Ordering::Relaxed);
}

fn forward_x(ctx: &Ctx<'_>, sender: &MeshSender, k: usize) {
    let lj = ctx.part.lbj(k, ctx.grid);
    let Some(tree) = ctx.plan.u_bcast[lj].as_ref() else {
        return;
    };
    debug_assert!(tree.is_root(), "only the diagonal process originates X[k]");
    let lk = ctx.part.lbi(k, ctx.grid);
    let sk = ctx.part.super_size(k);
    let ii = ctx.factors.x_blk(lk, ctx.nrhs);
    // Safety: block k is final; receivers get copies.
    let data = unsafe { ctx.x.slice(ii - XK_H, XK_H + sk * ctx.nrhs) };
    for &c in tree.children() {
        sender.send_solve(c, SolvePhase::USolve, MsgKind::Bcast, data);
        ctx.sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// lsum[I] -= U(I,k) * X[k] for every local block (I, k) above the
/// diagonal.
fn apply_column(
    ctx: &Ctx<'_>,
    sender: &MeshSender,
    tid: usize,
    scratch: &mut Vec<f64>,
    k: usize,
    payload: Option<&[f64]>,
) {
    let lj = ctx.part.lbj(k, ctx.grid);
    let Some(col) = ctx.factors.u_cols[lj].as_ref() else {
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
        let prev = ctx.bmod[lki].fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "dependency counter underflow on block {i}");
        if prev == 1 {
            block_ready(ctx, sender, tid, scratch, i);
        }
    }
}

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
    let prev = ctx.bmod[lk].fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "dependency counter underflow on block {k}");
    if prev == 1 {
        block_ready(ctx, sender, tid, scratch, k);
    }
}

fn block_ready(ctx: &Ctx<'_>, sender: &MeshSender, tid: usize, scratch: &mut Vec<f64>, k: usize) {
    let lk = ctx.part.lbi(k, ctx.grid);
    let sk = ctx.part.super_size(k);
    let n = ctx.nrhs;
    let il0 = ctx.factors.lsum_blk(lk, n);
    // Safety: bmod[lk] just hit zero; every contribution is in place.
    let base = unsafe { ctx.lsum.slice_mut(il0, sk * n) };
    for t in 1..ctx.nthreads {
        let other = unsafe { ctx.lsum.slice(il0 + t * ctx.sizelsum, sk * n) };
        for (b, &o) in base.iter_mut().zip(other) {
            *b += o;
        }
    }
    match ctx.plan.u_reduce[lk].as_ref() {
        Some(tree) if !tree.is_root() => {
            let mut buf = vec![0.0; LSUM_H + sk * n];
            buf[0] = k as f64;
            buf[LSUM_H..].copy_from_slice(base);
            let parent = tree.parent().expect("interior reduce node has a parent");
            sender.send_solve(parent, SolvePhase::USolve, MsgKind::Reduce, &buf);
            ctx.sent.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
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

//! Intra-rank worker pool primitives.
//!
//! The engines share three mutable buffers across threads: `x`, the
//! per-thread `lsum` slabs, and the dependency counters. The counters are
//! atomics; `x` and `lsum` are handed around as raw pointers because the
//! ownership discipline is dynamic: a block of `x` belongs to whichever
//! thread drove its counter to zero, and a block's slab regions may be
//! read by the winning thread after every contributor has finished.
//!
//! Safety rests on the counter protocol, not the type system:
//! - each `lsum` slab is written only by its owning thread; other slabs'
//!   regions for block I are read only after `fmod[I]` reached zero, and
//!   every write precedes its decrement (AcqRel on the counter);
//! - an `x` block is written only by the thread that observed the zero,
//!   and read by others only after a synchronization point (the queue's
//!   pending counter, or a message carrying a copy).
//!
//! This is the same discipline the column-parallel refactorization uses:
//! raw pointers for disjoint writes, an atomic flag transition as the
//! happens-before edge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Raw view of a shared f64 buffer for counter-disciplined access.
pub(crate) struct SharedArray {
    ptr: *mut f64,
    len: usize,
}

unsafe impl Send for SharedArray {}
unsafe impl Sync for SharedArray {}

impl SharedArray {
    pub(crate) fn new(buf: &mut [f64]) -> SharedArray {
        SharedArray {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    /// Mutable sub-slice.
    ///
    /// Safety: the caller must hold exclusive access to `[off, off+len)`
    /// under the counter protocol described in the module docs.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, off: usize, len: usize) -> &mut [f64] {
        debug_assert!(off + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(off), len)
    }

    /// Shared sub-slice.
    ///
    /// Safety: no thread may be writing `[off, off+len)` concurrently;
    /// guaranteed after the region's counter transition.
    pub(crate) unsafe fn slice(&self, off: usize, len: usize) -> &[f64] {
        debug_assert!(off + len <= self.len);
        std::slice::from_raw_parts(self.ptr.add(off), len)
    }
}

/// One unit of engine work.
pub(crate) enum Task {
    /// Solve the diagonal block of a ready supernode (leaf/root phase).
    Diag { k: usize },
    /// Apply the block updates of column `k`. `data` carries the received
    /// broadcast payload (header included); `None` means X[k] lives in
    /// this rank's own `x` array.
    Update { k: usize, data: Option<Vec<f64>> },
    /// Merge a received partial-sum payload into block row `k`.
    Merge { k: usize, data: Vec<f64> },
}

/// A minimal multi-consumer task queue driven by the master thread.
pub(crate) struct TaskQueue {
    q: Mutex<VecDeque<Task>>,
    cv: Condvar,
    pending: AtomicUsize,
    done: AtomicBool,
}

impl TaskQueue {
    pub(crate) fn new() -> TaskQueue {
        TaskQueue {
            q: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            pending: AtomicUsize::new(0),
            done: AtomicBool::new(false),
        }
    }

    /// Enqueue a task. Pending count rises before the task is visible.
    pub(crate) fn push(&self, task: Task) {
        self.pending.fetch_add(1, Ordering::Release);
        self.q.lock().unwrap().push_back(task);
        self.cv.notify_one();
    }

    /// Blocking pop; returns `None` once the queue is shut down and empty.
    pub(crate) fn pop(&self) -> Option<Task> {
        let mut q = self.q.lock().unwrap();
        loop {
            if let Some(t) = q.pop_front() {
                return Some(t);
            }
            if self.done.load(Ordering::Acquire) {
                return None;
            }
            q = self.cv.wait(q).unwrap();
        }
    }

    /// Mark one popped task finished.
    pub(crate) fn task_done(&self) {
        self.pending.fetch_sub(1, Ordering::Release);
    }

    /// Spin until every pushed task has been completed.
    pub(crate) fn wait_idle(&self) {
        while self.pending.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
    }

    /// Wake all workers for exit.
    pub(crate) fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
        self.cv.notify_all();
    }
}

/// Grow-on-demand scratch buffer for the diagonal GEMM.
pub(crate) fn scratch_for(scratch: &mut Vec<f64>, len: usize) -> &mut [f64] {
    if scratch.len() < len {
        scratch.resize(len, 0.0);
    }
    &mut scratch[..len]
}

//! Deallocation engine: unmaps guest pages the host stack has let go of and finally answers the
//! guest's TX slots.

use std::sync::{Arc, Mutex, MutexGuard};

use netback_grant::{GrantOp, GrantOutput, Multicall};
use netback_ring::TxResponse;

use crate::group::{GroupSignal, TimerKind, WorkerGroup, WORK_DEALLOC, WORK_TX};
use crate::pool::PendingIdx;
use crate::stats::StatsCounters;
use crate::tx;

/// Pending indices whose mapped pages are no longer referenced. Pushed from whatever thread drops
/// the last frame fragment, drained by the group's deallocation pass.
#[derive(Debug)]
pub(crate) struct DeallocQueue {
    queue: Mutex<Vec<PendingIdx>>,
    signal: Arc<GroupSignal>,
}

impl DeallocQueue {
    pub(crate) fn new(signal: Arc<GroupSignal>) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingIdx>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push(&self, idx: PendingIdx) {
        self.lock().push(idx);
        self.signal.mark_runnable(WORK_DEALLOC);
    }

    fn requeue(&self, indices: impl IntoIterator<Item = PendingIdx>) {
        self.lock().extend(indices);
    }

    pub(crate) fn drain(&self) -> Vec<PendingIdx> {
        std::mem::take(&mut *self.lock())
    }
}

/// Age out long-held mappings, then unmap everything queued and answer the slots.
pub(crate) fn run(group: &WorkerGroup) {
    copy_back_aged(group);

    let indices = group.dealloc.drain();
    if indices.is_empty() {
        group.arm_copy_back();
        return;
    }

    let mut batch = Multicall::with_capacity(indices.len());
    let ops: Vec<_> = {
        let mut pool = group.lock_pool();
        indices
            .iter()
            .map(|&idx| batch.push(GrantOp::Unmap(pool.begin_unmap(idx))))
            .collect()
    };
    let mut results = batch.submit(&*group.engine.broker);

    let mut failed = Vec::new();
    let mut done = Vec::with_capacity(indices.len());
    {
        let mut pool = group.lock_pool();
        for (&idx, op) in indices.iter().zip(ops) {
            match results.take(op) {
                Ok(GrantOutput::Unmapped) => done.push(pool.complete_unmap(idx)),
                Ok(other) => panic!("unmap of pending slot {idx} answered with {other:?}"),
                Err(err) => {
                    tracing::warn!(group = group.id, slot = idx, error = %err, "unmap failed, will retry");
                    failed.push(idx);
                }
            }
        }
    }

    if !failed.is_empty() {
        group.dealloc.requeue(failed);
        let deadline = group.now() + group.config().unmap_retry;
        group.arm_timer(deadline, TimerKind::UnmapRetry);
    }

    let mut touched = Vec::new();
    for pending in &done {
        let iface = pending.iface.arc();
        iface.lock_tx().responses.complete(
            pending.seq,
            TxResponse {
                id: pending.request.id,
                status: pending.status,
            },
        );
        if !touched.iter().any(|t| Arc::ptr_eq(t, iface)) {
            touched.push(Arc::clone(iface));
        }
    }
    tx::flush_responses(group, &touched);
    tracing::trace!(group = group.id, unmapped = done.len(), "deallocation pass");
    // Dropping the entries releases their interface references.
    drop(done);

    if group.has_tx_work() {
        group.signal.mark_runnable(WORK_TX);
    }
    group.arm_copy_back();
}

/// Replace mappings older than the copy-back threshold with private copies so the guest pages
/// can be returned even while the host stack keeps the frame.
fn copy_back_aged(group: &WorkerGroup) {
    let Some(after) = group.config().copy_back_after else {
        return;
    };
    let Some(cutoff) = group.now().checked_sub(after) else {
        return;
    };
    let aged: Vec<_> = group
        .lock_pool()
        .mapped_since(cutoff)
        .filter_map(|(_, pending)| {
            let backing = pending.backing.as_ref()?.upgrade()?;
            Some((backing, pending.iface.clone()))
        })
        .collect();
    for (backing, iface) in aged {
        if backing.copy_back() {
            StatsCounters::bump(&iface.stats.copy_backs);
            tracing::debug!(iface = %iface.id, "copied back long-held fragment");
        }
    }
}

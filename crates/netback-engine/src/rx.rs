//! RX engine: frames the host stack sends to guests.
//!
//! Frames wait in their interface's queue until the guest has posted enough buffers. Each pass
//! stages as many as the batch budget allows, submits all of their copies or transfers in one
//! batch and then writes the responses.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use netback_grant::{
    CopyOp, CopyPtr, GrantOp, Multicall, MulticallResults, OpIndex, Page, TransferOp, PAGE_SIZE,
};
use netback_ring::{status, BackRing, ExtraInfo, RxFlags, RxRequest, RxResponse};

use crate::error::ProtocolError;
use crate::frame::{ChecksumState, OutboundFrame};
use crate::group::{TimerKind, WorkerGroup};
use crate::interface::{Interface, InterfaceRef, RxMode};
use crate::notify::NotifyList;
use crate::stats::StatsCounters;
use crate::tx;

enum RxSlot {
    Data {
        id: u16,
        ops: Range<OpIndex>,
        len: u16,
    },
    Extra(ExtraInfo),
}

struct RxBuild {
    iface: InterfaceRef,
    len: usize,
    checksum: ChecksumState,
    gso: bool,
    slots: Vec<RxSlot>,
}

enum Stage {
    /// The queue is empty.
    Drained,
    /// The head frame waits for guest buffers or transfer pages.
    Waiting,
    /// Frames are left but the pass budget is spent.
    Budget,
    Fatal(ProtocolError),
}

fn first_flags(checksum: ChecksumState, gso: bool) -> RxFlags {
    let mut flags = match checksum {
        ChecksumState::Partial { .. } => RxFlags::CSUM_BLANK | RxFlags::DATA_VALIDATED,
        ChecksumState::Unnecessary => RxFlags::DATA_VALIDATED,
        ChecksumState::None => RxFlags::empty(),
    };
    if gso {
        flags |= RxFlags::EXTRA_INFO;
    }
    flags
}

/// Consume the frame's guest buffers and queue the operations filling them.
fn stage_frame(
    iface: &Arc<Interface>,
    ring: &mut BackRing,
    frame: &OutboundFrame,
    pages: &[Arc<Page>],
    batch: &mut Multicall,
) -> RxBuild {
    let dom = iface.domid;
    let len = frame.len();
    let chunks = frame.data_slots() as usize;
    let mut slots = Vec::with_capacity(chunks + 1);

    for chunk in 0..chunks {
        let req: RxRequest = ring.consume_request();
        let start = chunk * PAGE_SIZE;
        let chunk_len = len.saturating_sub(start).min(PAGE_SIZE);
        let first_op = batch.len();
        let mut dest = 0;
        match pages.get(chunk) {
            None => {
                for piece in frame.pieces(start, chunk_len) {
                    batch.push(GrantOp::Copy(CopyOp {
                        source: CopyPtr::Local {
                            page: piece.page,
                            offset: piece.offset as u16,
                        },
                        dest: CopyPtr::Grant {
                            dom,
                            gref: req.gref,
                            offset: dest as u16,
                        },
                        len: piece.len as u16,
                    }));
                    dest += piece.len;
                }
            }
            Some(page) => {
                for piece in frame.pieces(start, chunk_len) {
                    page.copy_from(dest, &piece.page, piece.offset, piece.len);
                    dest += piece.len;
                }
                batch.push(GrantOp::Transfer(TransferOp {
                    page: Arc::clone(page),
                    dom,
                    gref: req.gref,
                }));
            }
        }
        slots.push(RxSlot::Data {
            id: req.id,
            ops: first_op..batch.len(),
            len: chunk_len as u16,
        });

        if chunk == 0 {
            if let Some(gso) = frame.gso() {
                // The extra-info response occupies the next posted buffer's slot.
                let _: RxRequest = ring.consume_request();
                slots.push(RxSlot::Extra(ExtraInfo::gso(gso.size, gso.kind.wire_type())));
            }
        }
    }

    RxBuild {
        iface: iface.acquire(),
        len,
        checksum: frame.checksum(),
        gso: frame.gso().is_some(),
        slots,
    }
}

fn stage(
    group: &WorkerGroup,
    iface: &Arc<Interface>,
    now: Instant,
    budget: usize,
    batch: &mut Multicall,
    builds: &mut Vec<RxBuild>,
) -> Stage {
    let config = group.config();
    let mut guard = iface.lock_rx();
    let rx = &mut *guard;
    if !iface.is_active() {
        return Stage::Drained;
    }

    let mut staged = 0;
    while let Some(head) = rx.queue.front() {
        if staged >= budget {
            return Stage::Budget;
        }
        let needed = head.slots_needed();
        let data_slots = head.data_slots() as usize;

        let mut avail = match rx.ring.unconsumed_requests() {
            Ok(avail) => avail,
            Err(err) => return Stage::Fatal(err.into()),
        };
        if avail < needed {
            rx.ring.request_event_threshold(needed);
            avail = match rx.ring.unconsumed_requests() {
                Ok(avail) => avail,
                Err(err) => return Stage::Fatal(err.into()),
            };
        }
        if avail < needed {
            match rx.stall_deadline {
                Some(deadline) if now >= deadline => {
                    rx.queue.pop_front();
                    rx.stall_deadline = None;
                    StatsCounters::bump(&iface.stats.rx_dropped);
                    tracing::warn!(
                        iface = %iface.id,
                        needed,
                        avail,
                        "guest posted too few buffers in time, dropping frame"
                    );
                    continue;
                }
                Some(_) => return Stage::Waiting,
                None => {
                    let deadline = now + config.rx_stall_timeout;
                    rx.stall_deadline = Some(deadline);
                    group.arm_timer(deadline, TimerKind::RxStall(Arc::clone(iface)));
                    tracing::debug!(iface = %iface.id, needed, avail, "waiting for guest buffers");
                    return Stage::Waiting;
                }
            }
        }
        rx.stall_deadline = None;

        let pages = match iface.rx_mode {
            RxMode::Copy => Vec::new(),
            RxMode::Transfer => match group.reserve_transfer_pages(data_slots, iface) {
                Some(pages) => pages,
                None => return Stage::Waiting,
            },
        };
        let Some(frame) = rx.queue.pop_front() else {
            break;
        };
        builds.push(stage_frame(iface, &mut rx.ring, &frame, &pages, batch));
        staged += 1;
    }
    Stage::Drained
}

fn complete(build: RxBuild, results: &mut MulticallResults, notify: &mut NotifyList) {
    let RxBuild {
        iface,
        len,
        checksum,
        gso,
        slots,
    } = build;

    let mut failure = None;
    for slot in &slots {
        if let RxSlot::Data { ops, .. } = slot {
            for op in ops.clone() {
                if let Err(err) = results.take(op) {
                    failure.get_or_insert(err);
                }
            }
        }
    }

    let data_slots = slots
        .iter()
        .filter(|slot| matches!(slot, RxSlot::Data { .. }))
        .count();
    let mut guard = iface.lock_rx();
    let mut seen = 0;
    for slot in slots {
        match slot {
            RxSlot::Data { id, len, .. } => {
                seen += 1;
                let mut flags = if seen == 1 {
                    first_flags(checksum, gso)
                } else {
                    RxFlags::empty()
                };
                if seen < data_slots {
                    flags |= RxFlags::MORE_DATA;
                }
                let status = if failure.is_some() {
                    status::ERROR
                } else {
                    len as i16
                };
                guard.ring.push_response(&RxResponse {
                    id,
                    offset: 0,
                    flags,
                    status,
                });
            }
            RxSlot::Extra(extra) => guard.ring.push_response(&extra),
        }
    }
    if guard.ring.push_responses_and_check_notify() {
        notify.push(iface.port);
    }
    drop(guard);

    match failure {
        None => {
            StatsCounters::bump(&iface.stats.rx_frames);
            StatsCounters::add(&iface.stats.rx_bytes, len as u64);
        }
        Some(err) => {
            StatsCounters::bump(&iface.stats.rx_errors);
            tracing::warn!(iface = %iface.id, domid = iface.domid, error = %err, "host frame failed");
        }
    }
}

/// One RX pass. Returns whether frames are left that the pass's budget cut off.
pub(crate) fn run(group: &WorkerGroup) -> bool {
    let config = group.config();
    let now = group.now();
    let mut batch = Multicall::new();
    let mut builds = Vec::new();
    let mut fatal = Vec::new();
    let mut budget_hit = false;

    while let Some(iface) = group.pop_rx() {
        let budget = config.rx_batch_frames.saturating_sub(builds.len());
        match stage(group, &iface, now, budget, &mut batch, &mut builds) {
            Stage::Drained | Stage::Waiting => {}
            Stage::Budget => {
                group.schedule_rx(&iface);
                budget_hit = true;
                break;
            }
            Stage::Fatal(err) => fatal.push((iface, err)),
        }
    }

    let mut results = batch.submit_with_retry(&*group.engine.broker, config.grant_retries);
    let mut notify = NotifyList::new();
    for build in builds {
        complete(build, &mut results, &mut notify);
    }
    notify.flush(&*group.engine.events, config.notify_batch);
    for (iface, err) in &fatal {
        tx::disable(group, iface, err);
    }
    budget_hit
}

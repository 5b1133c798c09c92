//! TX engine: frames the guest sends towards the host stack.
//!
//! One pass visits the group's scheduled interfaces round robin, taking at most one frame per
//! visit. Every frame's copy and map operations go into a single batch that is submitted once
//! the visiting is done; results are then matched back frame by frame, so one frame's failed
//! grant never affects its neighbours.

use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::Instant;

use netback_grant::{
    CopyOp, CopyPtr, DomId, GrantError, GrantOp, GrantOutput, GrantRef, MapFlags, MapOp,
    Multicall, MulticallResults, OpIndex, Page, PAGE_SIZE,
};
use netback_ring::{
    extra_type, status, BackRing, ExtraFlags, ExtraInfo, RingError, TxFlags, TxRequest, TxResponse,
};

use crate::config::{NetbackConfig, TxCopyMode, ETH_HLEN, MAX_EXTRA_INFO};
use crate::credit::Admission;
use crate::error::{FrameError, ProtocolError};
use crate::frame::{ChecksumState, FragmentBacking, GsoInfo, GsoKind, HostFrame};
use crate::group::{TimerKind, WorkerGroup};
use crate::interface::{Interface, InterfaceRef, TxState};
use crate::notify::NotifyList;
use crate::offload::{complete_checksum, locate_checksum, HEADER_PEEK_LEN};
use crate::pool::PendingIdx;
use crate::stats::StatsCounters;

/// Payload of an occupied pending-pool slot: one consumed TX data slot awaiting its response.
pub(crate) struct PendingTx {
    pub(crate) iface: InterfaceRef,
    pub(crate) request: TxRequest,
    pub(crate) seq: u64,
    pub(crate) status: i16,
    /// Set while the slot's page backs a fragment of a delivered frame.
    pub(crate) backing: Option<Weak<FragmentBacking>>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Data(TxRequest),
    Extra(ExtraInfo),
}

/// The slots making up the frame at the head of the ring, read but not yet consumed.
#[derive(Debug)]
struct Scan {
    first: TxRequest,
    /// Bytes carried by the first slot itself.
    first_len: usize,
    slots: Vec<Slot>,
    drop: Option<FrameError>,
}

impl Scan {
    fn extras(&self) -> impl Iterator<Item = &ExtraInfo> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Extra(extra) => Some(extra),
            Slot::Data(_) => None,
        })
    }

    fn data_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Data(_)))
            .count()
    }
}

type ScanFailure = (ProtocolError, Vec<Slot>);

fn scan_frame(ring: &BackRing, avail: u32, config: &NetbackConfig) -> Result<Scan, ScanFailure> {
    let first: TxRequest = ring.peek_request(0);
    let mut slots = vec![Slot::Data(first)];
    let mut at = 1;

    if first.flags.contains(TxFlags::EXTRA_INFO) {
        let mut extras = 0;
        loop {
            if at >= avail {
                return Err((ProtocolError::Truncated { available: avail }, slots));
            }
            let extra: ExtraInfo = ring.peek_request(at);
            at += 1;
            extras += 1;
            slots.push(Slot::Extra(extra));
            if extras > MAX_EXTRA_INFO {
                return Err((ProtocolError::TooManyExtras { max: MAX_EXTRA_INFO }, slots));
            }
            if extra.kind == extra_type::NONE || extra.kind >= extra_type::MAX {
                return Err((ProtocolError::BadExtraType(extra.kind), slots));
            }
            if !extra.flags.contains(ExtraFlags::MORE) {
                break;
            }
        }
    }

    let mut data = 1;
    let mut rest = 0usize;
    let mut more = first.flags.contains(TxFlags::MORE_DATA);
    while more {
        if at >= avail {
            return Err((ProtocolError::Truncated { available: avail }, slots));
        }
        let req: TxRequest = ring.peek_request(at);
        at += 1;
        data += 1;
        rest += usize::from(req.size);
        slots.push(Slot::Data(req));
        more = req.flags.contains(TxFlags::MORE_DATA);
    }
    // The whole chain is scanned first so every slot of an oversized frame gets answered.
    if data > config.max_frame_slots {
        return Err((
            ProtocolError::TooManySlots {
                slots: data,
                max: config.max_frame_slots,
            },
            slots,
        ));
    }

    let total = usize::from(first.size);
    let mut drop = None;
    let first_len = match total.checked_sub(rest) {
        Some(len) => len,
        None => {
            drop = Some(FrameError::SizeMismatch {
                slot: rest,
                remaining: total,
            });
            0
        }
    };

    let crossing = slots
        .iter()
        .filter_map(|slot| match slot {
            Slot::Data(req) => Some(req),
            Slot::Extra(_) => None,
        })
        .enumerate()
        .map(|(i, req)| {
            let len = if i == 0 { first_len } else { usize::from(req.size) };
            (req.offset, len)
        })
        .find(|&(offset, len)| usize::from(offset) + len > PAGE_SIZE);
    if let Some((offset, size)) = crossing {
        return Err((ProtocolError::CrossesPage { offset, size }, slots));
    }

    if drop.is_none() {
        if total < ETH_HLEN {
            drop = Some(FrameError::TooShort { size: total });
        } else if total > config.max_frame_bytes {
            drop = Some(FrameError::TooLarge {
                size: total,
                max: config.max_frame_bytes,
            });
        }
    }

    Ok(Scan {
        first,
        first_len,
        slots,
        drop,
    })
}

/// Consume `slots` and answer each one right away: data slots with `status`, extras with NULL.
fn answer(tx: &mut TxState, slots: &[Slot], status: i16) {
    let first_id = match slots.first() {
        Some(Slot::Data(first)) => first.id,
        _ => return,
    };
    tx.ring.skip_requests(slots.len() as u32);
    for slot in slots {
        let response = match slot {
            Slot::Data(req) => TxResponse { id: req.id, status },
            Slot::Extra(_) => TxResponse {
                id: first_id,
                status: status::NULL,
            },
        };
        let seq = tx.responses.reserve();
        tx.responses.complete(seq, response);
    }
}

/// Host memory receiving the copied part of a frame, filled page by page.
#[derive(Default)]
struct LocalBuffer {
    pages: Vec<Arc<Page>>,
    len: usize,
}

impl LocalBuffer {
    /// Queue copies of `len` guest bytes at `offset` in `gref`, split at local page boundaries.
    fn append_copy(
        &mut self,
        batch: &mut Multicall,
        dom: DomId,
        gref: GrantRef,
        mut offset: usize,
        mut len: usize,
    ) -> Range<OpIndex> {
        let start = batch.len();
        while len > 0 {
            let page_offset = self.len % PAGE_SIZE;
            if page_offset == 0 {
                self.pages.push(Arc::new(Page::new()));
            }
            let Some(page) = self.pages.last() else {
                break;
            };
            let take = len.min(PAGE_SIZE - page_offset);
            batch.push(GrantOp::Copy(CopyOp {
                source: CopyPtr::Grant {
                    dom,
                    gref,
                    offset: offset as u16,
                },
                dest: CopyPtr::Local {
                    page: Arc::clone(page),
                    offset: page_offset as u16,
                },
                len: take as u16,
            }));
            offset += take;
            len -= take;
            self.len += take;
        }
        start..batch.len()
    }

    fn into_vec(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        let mut left = self.len;
        for page in &self.pages {
            let n = left.min(PAGE_SIZE);
            out.extend_from_slice(&page.to_vec(0, n));
            left -= n;
        }
        out
    }
}

struct MapPlan {
    op: OpIndex,
    offset: u16,
    len: u16,
}

struct SlotPlan {
    idx: PendingIdx,
    copies: Range<OpIndex>,
    map: Option<MapPlan>,
}

struct FrameBuild {
    iface: Arc<Interface>,
    first: TxRequest,
    gso: Option<GsoInfo>,
    head: LocalBuffer,
    slots: Vec<SlotPlan>,
}

enum Step {
    Built(FrameBuild),
    /// The frame was answered without reaching the host stack.
    Answered,
    /// Nothing left on the ring.
    Idle,
    /// Out of credit; a timer reschedules the interface.
    Deferred,
    /// The pool cannot hold the frame's slots; nothing was consumed.
    PoolExhausted { needed: usize },
    Fatal(ProtocolError),
}

fn pending_requests(ring: &mut BackRing) -> Result<u32, RingError> {
    let avail = ring.unconsumed_requests()?;
    if avail > 0 || !ring.final_check_for_requests()? {
        return Ok(avail);
    }
    ring.unconsumed_requests()
}

fn build_frame(
    group: &WorkerGroup,
    iface: &Arc<Interface>,
    now: Instant,
    batch: &mut Multicall,
) -> Step {
    let config = group.config();
    let mut guard = iface.lock_tx();
    let tx = &mut *guard;
    if !iface.is_active() {
        return Step::Idle;
    }

    let avail = match pending_requests(&mut tx.ring) {
        Ok(0) => return Step::Idle,
        Ok(avail) => avail,
        Err(err) => return Step::Fatal(err.into()),
    };
    let scan = match scan_frame(&tx.ring, avail, config) {
        Ok(scan) => scan,
        Err((err, slots)) => {
            answer(tx, &slots, status::ERROR);
            return Step::Fatal(err);
        }
    };
    let first = scan.first;

    let mut verdict = scan.drop.clone();
    let mut gso = None;
    let mut multicast = Vec::new();
    for extra in scan.extras() {
        match extra.kind {
            extra_type::GSO => {
                let Some(wire) = extra.as_gso() else { continue };
                if wire.size == 0 {
                    answer(tx, &scan.slots, status::ERROR);
                    return Step::Fatal(ProtocolError::ZeroGsoSize);
                }
                match GsoKind::from_wire(wire.gso_type) {
                    Some(kind) => {
                        gso = Some(GsoInfo {
                            size: wire.size,
                            kind,
                        })
                    }
                    None => {
                        verdict.get_or_insert(FrameError::UnsupportedGso(wire.gso_type));
                    }
                }
            }
            extra_type::MCAST_ADD | extra_type::MCAST_DEL => multicast.push(*extra),
            _ => {}
        }
    }

    if !multicast.is_empty() {
        let mut ok = true;
        for extra in &multicast {
            let Some(addr) = extra.mcast_addr() else { continue };
            if extra.kind == extra_type::MCAST_ADD {
                ok &= iface.multicast_add(addr);
            } else {
                iface.multicast_del(addr);
            }
        }
        tracing::debug!(iface = %iface.id, updates = multicast.len(), ok, "multicast list updated");
        answer(tx, &scan.slots, if ok { status::OKAY } else { status::ERROR });
        return Step::Answered;
    }

    if let Some(err) = verdict {
        tracing::warn!(iface = %iface.id, domid = iface.domid, error = %err, "dropping guest frame");
        answer(tx, &scan.slots, status::ERROR);
        StatsCounters::bump(&iface.stats.tx_dropped);
        return Step::Answered;
    }

    let needed = scan.data_count();
    let mut pool = group.lock_pool();
    if pool.free_count() < needed {
        tracing::debug!(
            iface = %iface.id,
            needed,
            free = pool.free_count(),
            "pending pool exhausted, deferring"
        );
        return Step::PoolExhausted { needed };
    }
    if let Admission::Deferred { until } = tx.credit.admit(u64::from(first.size), now) {
        drop(pool);
        StatsCounters::bump(&iface.stats.tx_credit_deferrals);
        if !tx.credit_timer_armed {
            tx.credit_timer_armed = true;
            group.arm_timer(until, TimerKind::Credit(Arc::clone(iface)));
        }
        tracing::debug!(iface = %iface.id, bytes = first.size, "out of credit, deferring");
        return Step::Deferred;
    }

    tx.ring.skip_requests(scan.slots.len() as u32);
    let dom = iface.domid;
    let mut head = LocalBuffer::default();
    let mut plans: Vec<SlotPlan> = Vec::with_capacity(needed);
    for slot in &scan.slots {
        let seq = tx.responses.reserve();
        let req = match *slot {
            Slot::Extra(_) => {
                tx.responses.complete(
                    seq,
                    TxResponse {
                        id: first.id,
                        status: status::NULL,
                    },
                );
                continue;
            }
            Slot::Data(req) => req,
        };
        let is_first = plans.is_empty();
        let len = if is_first {
            scan.first_len
        } else {
            usize::from(req.size)
        };
        let pending = PendingTx {
            iface: iface.acquire(),
            request: req,
            seq,
            status: status::OKAY,
            backing: None,
        };
        let Some(idx) = pool.allocate(pending) else {
            unreachable!("free slots were counted under the same pool lock");
        };

        let offset = usize::from(req.offset);
        let copy_len = match config.tx_copy_mode {
            TxCopyMode::CopyAll => len,
            TxCopyMode::MapFragments if is_first => len.min(config.header_copy_len),
            TxCopyMode::MapFragments => 0,
        };
        let copies = head.append_copy(batch, dom, req.gref, offset, copy_len);
        let rest = len - copy_len;
        let map = (rest > 0).then(|| MapPlan {
            op: batch.push(GrantOp::Map(MapOp {
                dom,
                gref: req.gref,
                flags: MapFlags::READONLY,
            })),
            offset: (offset + copy_len) as u16,
            len: rest as u16,
        });
        plans.push(SlotPlan { idx, copies, map });
    }

    Step::Built(FrameBuild {
        iface: Arc::clone(iface),
        first,
        gso,
        head,
        slots: plans,
    })
}

fn apply_offloads(
    group: &WorkerGroup,
    frame: &mut HostFrame,
    first: &TxRequest,
    gso: Option<GsoInfo>,
) -> Result<(), FrameError> {
    if first.flags.contains(TxFlags::CSUM_BLANK) {
        if group.engine.stack.accepts_partial_checksum() {
            let location = locate_checksum(&frame.read_prefix(HEADER_PEEK_LEN), frame.len())?;
            frame.set_checksum(ChecksumState::Partial {
                start: location.start,
                offset: location.offset,
            });
        } else {
            frame.linearize();
            complete_checksum(frame.head_mut())?;
            frame.set_checksum(ChecksumState::Unnecessary);
        }
    } else if first.flags.contains(TxFlags::DATA_VALIDATED) {
        frame.set_checksum(ChecksumState::Unnecessary);
    }
    frame.set_gso(gso);
    Ok(())
}

/// Match a built frame's grant results, settle its pool slots and produce the frame if it
/// survived.
fn complete_frame(
    group: &WorkerGroup,
    build: FrameBuild,
    results: &mut MulticallResults,
    now: Instant,
) -> Option<HostFrame> {
    let FrameBuild {
        iface,
        first,
        gso,
        head,
        slots,
    } = build;

    let mut failure: Option<GrantError> = None;
    let mut grants = Vec::with_capacity(slots.len());
    for plan in &slots {
        for op in plan.copies.clone() {
            if let Err(err) = results.take(op) {
                failure.get_or_insert(err);
            }
        }
        let grant = match &plan.map {
            None => None,
            Some(map) => match results.take(map.op) {
                Ok(GrantOutput::Mapped(grant)) => Some(grant),
                Ok(_) => {
                    failure.get_or_insert(GrantError::General);
                    None
                }
                Err(err) => {
                    failure.get_or_insert(err);
                    None
                }
            },
        };
        grants.push(grant);
    }

    let mut frags = Vec::new();
    let mut released = Vec::new();
    let mut mapped_slots = Vec::new();
    {
        let mut pool = group.lock_pool();
        for (plan, grant) in slots.iter().zip(grants) {
            match (&plan.map, grant) {
                (Some(map), Some(grant)) => {
                    pool.mark_mapped(plan.idx, grant.handle, now);
                    mapped_slots.push(plan.idx);
                    if failure.is_some() {
                        if let Some(pending) = pool.get_mut(plan.idx) {
                            pending.status = status::ERROR;
                        }
                        group.dealloc.push(plan.idx);
                    } else {
                        let backing = FragmentBacking::new(
                            plan.idx,
                            grant.page,
                            map.offset,
                            map.len,
                            Arc::clone(&group.dealloc),
                        );
                        if let Some(pending) = pool.get_mut(plan.idx) {
                            pending.backing = Some(Arc::downgrade(&backing));
                        }
                        frags.push(backing);
                    }
                }
                _ => released.push(pool.release(plan.idx)),
            }
        }
    }

    let mut frame = None;
    let mut error: Option<FrameError> = failure.map(FrameError::from);
    if error.is_none() {
        let mut built = HostFrame::new(iface.id, head.into_vec(), frags);
        match apply_offloads(group, &mut built, &first, gso) {
            Ok(()) => frame = Some(built),
            Err(err) => {
                let mut pool = group.lock_pool();
                for &idx in &mapped_slots {
                    if let Some(pending) = pool.get_mut(idx) {
                        pending.status = status::ERROR;
                    }
                }
                drop(pool);
                // Dropping the frame queues its mapped slots for unmapping.
                drop(built);
                error = Some(err);
            }
        }
    }

    {
        let mut tx = iface.lock_tx();
        for pending in &mut released {
            if error.is_some() {
                pending.status = status::ERROR;
            }
            tx.responses.complete(
                pending.seq,
                TxResponse {
                    id: pending.request.id,
                    status: pending.status,
                },
            );
        }
    }
    drop(released);

    match (&frame, error) {
        (Some(frame), _) => {
            StatsCounters::bump(&iface.stats.tx_frames);
            StatsCounters::add(&iface.stats.tx_bytes, frame.len() as u64);
        }
        (None, Some(err)) => {
            tracing::warn!(iface = %iface.id, domid = iface.domid, error = %err, "guest frame failed");
            StatsCounters::bump(&iface.stats.tx_dropped);
        }
        (None, None) => {}
    }
    frame
}

/// Publish every in-order TX response of `ifaces` and notify the guests that need it.
pub(crate) fn flush_responses(group: &WorkerGroup, ifaces: &[Arc<Interface>]) {
    let mut notify = NotifyList::new();
    for iface in ifaces {
        let mut guard = iface.lock_tx();
        let TxState {
            ring, responses, ..
        } = &mut *guard;
        responses.drain_ready(|response| ring.push_response(&response));
        if ring.push_responses_and_check_notify() {
            notify.push(iface.port);
        }
    }
    notify.flush(&*group.engine.events, group.config().notify_batch);
}

/// Latch `iface` off after a protocol violation.
pub(crate) fn disable(group: &WorkerGroup, iface: &Arc<Interface>, err: &ProtocolError) {
    if !iface.mark_busted() {
        return;
    }
    tracing::error!(
        iface = %iface.id,
        domid = iface.domid,
        error = %err,
        "fatal protocol error, disabling interface"
    );
    group.engine.events.mask(iface.port);
    group.deschedule(iface);
    iface.purge_rx();
}

fn touch(touched: &mut Vec<Arc<Interface>>, iface: &Arc<Interface>) {
    if !touched.iter().any(|other| Arc::ptr_eq(other, iface)) {
        touched.push(Arc::clone(iface));
    }
}

/// One TX pass. Returns whether work is left that the pass's budget cut off.
pub(crate) fn run(group: &WorkerGroup) -> bool {
    let config = group.config();
    let now = group.now();
    let mut batch = Multicall::new();
    let mut builds = Vec::new();
    let mut touched = Vec::new();
    let mut fatal = Vec::new();
    let mut blocked = None;

    let mut visits = 0;
    while visits < config.tx_batch_frames {
        let Some(iface) = group.pop_tx() else { break };
        visits += 1;
        match build_frame(group, &iface, now, &mut batch) {
            Step::Built(build) => {
                builds.push(build);
                group.schedule_tx(&iface);
            }
            Step::Answered => {
                touch(&mut touched, &iface);
                group.schedule_tx(&iface);
            }
            Step::Idle | Step::Deferred => {}
            Step::PoolExhausted { needed } => {
                group.requeue_tx_front(&iface);
                blocked = Some(needed);
                break;
            }
            Step::Fatal(err) => {
                touch(&mut touched, &iface);
                fatal.push((iface, err));
            }
        }
    }

    let mut results = batch.submit_with_retry(&*group.engine.broker, config.grant_retries);
    let mut deliveries = Vec::with_capacity(builds.len());
    for build in builds {
        let iface = Arc::clone(&build.iface);
        if let Some(frame) = complete_frame(group, build, &mut results, now) {
            deliveries.push(frame);
        }
        touch(&mut touched, &iface);
    }

    flush_responses(group, &touched);
    for (iface, err) in &fatal {
        disable(group, iface, err);
    }
    for frame in deliveries {
        group.engine.stack.receive(frame);
    }
    group.arm_copy_back();

    match blocked {
        // Slots this pass released may already cover the frame that was turned away.
        Some(needed) => group.lock_pool().free_count() >= needed,
        None => visits >= config.tx_batch_frames && group.has_tx_work(),
    }
}

//! Reference guest frontend.
//!
//! Drives the guest end of the TX and RX rings against a [`SimHypervisor`]: it grants pages for
//! outgoing frames, posts receive buffers, and reassembles received frames from responses. Tests
//! and the simulator use it to play the untrusted side of the protocol, including the raw
//! request-level helpers needed to build malformed traffic.

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use netback_grant::{DomId, EventPort, GrantRef, Page, SimHypervisor, PAGE_SIZE};
use netback_ring::{
    status, ExtraFlags, ExtraInfo, FrontRing, GsoExtra, RingError, RxFlags, RxRequest, RxResponse,
    TxFlags, TxRequest, TxResponse, RX_SLOT_BYTES, TX_SLOT_BYTES,
};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrontendError {
    #[error("ring has {free} free slots, {needed} needed")]
    RingFull { needed: u32, free: u32 },
    #[error("frame of {0} bytes does not fit a request size field")]
    FrameTooLarge(usize),
    #[error("frame is empty")]
    EmptyFrame,
    #[error(transparent)]
    Ring(#[from] RingError),
}

/// How posted receive buffers are offered to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxBufferKind {
    /// Writable pages the backend copies into.
    #[default]
    Copy,
    /// Empty transfer grants the backend moves its own pages into.
    Transfer,
}

/// A frame reassembled from RX responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub data: Vec<u8>,
    pub flags: RxFlags,
    pub gso: Option<GsoExtra>,
    /// First negative status seen in the frame's responses.
    pub error: Option<i16>,
}

enum RxBuffer {
    Copy { gref: GrantRef, page: Arc<Page> },
    Transfer { gref: GrantRef },
}

#[derive(Default)]
struct PartialFrame {
    data: Vec<u8>,
    flags: RxFlags,
    gso: Option<GsoExtra>,
    error: Option<i16>,
    extras_pending: bool,
    more_data: bool,
}

impl PartialFrame {
    fn is_complete(&self) -> bool {
        !self.extras_pending && !self.more_data
    }

    fn finish(self) -> ReceivedFrame {
        ReceivedFrame {
            data: self.data,
            flags: self.flags,
            gso: self.gso,
            error: self.error,
        }
    }
}

pub struct Frontend {
    hv: Arc<SimHypervisor>,
    domid: DomId,
    port: EventPort,
    tx: FrontRing,
    rx: FrontRing,
    tx_ring_ref: GrantRef,
    rx_ring_ref: GrantRef,
    rx_kind: RxBufferKind,
    next_tx_id: u16,
    next_rx_id: u16,
    tx_grants: HashMap<u16, Vec<GrantRef>>,
    rx_posted: VecDeque<(u16, RxBuffer)>,
    partial: Option<PartialFrame>,
}

impl Frontend {
    pub fn new(hv: Arc<SimHypervisor>, domid: DomId) -> Self {
        Self::with_rx_kind(hv, domid, RxBufferKind::Copy)
    }

    pub fn with_rx_kind(hv: Arc<SimHypervisor>, domid: DomId, rx_kind: RxBufferKind) -> Self {
        let tx_page = Arc::new(Page::new());
        let rx_page = Arc::new(Page::new());
        let tx = FrontRing::init(tx_page.clone(), TX_SLOT_BYTES);
        let rx = FrontRing::init(rx_page.clone(), RX_SLOT_BYTES);
        let tx_ring_ref = hv.grant_access(domid, tx_page, false);
        let rx_ring_ref = hv.grant_access(domid, rx_page, false);
        let port = hv.bind_port(domid);
        Self {
            hv,
            domid,
            port,
            tx,
            rx,
            tx_ring_ref,
            rx_ring_ref,
            rx_kind,
            next_tx_id: 0,
            next_rx_id: 0,
            tx_grants: HashMap::new(),
            rx_posted: VecDeque::new(),
            partial: None,
        }
    }

    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn port(&self) -> EventPort {
        self.port
    }

    pub fn tx_ring_ref(&self) -> GrantRef {
        self.tx_ring_ref
    }

    pub fn rx_ring_ref(&self) -> GrantRef {
        self.rx_ring_ref
    }

    pub fn tx_ring(&self) -> &FrontRing {
        &self.tx
    }

    pub fn rx_ring(&self) -> &FrontRing {
        &self.rx
    }

    /// Notifications the backend has sent this guest.
    pub fn notifications(&self) -> u64 {
        self.hv.notifications(self.port)
    }

    fn alloc_tx_id(&mut self) -> u16 {
        let id = self.next_tx_id;
        self.next_tx_id = self.next_tx_id.wrapping_add(1);
        id
    }

    /// Grant a read-only page holding `data` at `offset`.
    pub fn grant_tx_page(&self, offset: usize, data: &[u8]) -> GrantRef {
        let page = Page::new();
        page.write(offset, data);
        self.hv.grant_access(self.domid, Arc::new(page), true)
    }

    /// Queue one frame, split into page-sized slots, preceded by `extras`. Returns the id of
    /// every data slot in ring order. Nothing is published until [`Frontend::push_tx`].
    pub fn queue_frame(
        &mut self,
        data: &[u8],
        flags: TxFlags,
        extras: &[ExtraInfo],
    ) -> Result<Vec<u16>, FrontendError> {
        if data.is_empty() {
            return Err(FrontendError::EmptyFrame);
        }
        let total = u16::try_from(data.len()).map_err(|_| FrontendError::FrameTooLarge(data.len()))?;
        let chunks: Vec<&[u8]> = data.chunks(PAGE_SIZE).collect();
        let needed = (chunks.len() + extras.len()) as u32;
        let free = self.tx.free_requests();
        if needed > free {
            return Err(FrontendError::RingFull { needed, free });
        }

        let mut ids = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let gref = self.grant_tx_page(0, chunk);
            let id = self.alloc_tx_id();
            let mut slot_flags = if i == 0 { flags } else { TxFlags::empty() };
            if i + 1 < chunks.len() {
                slot_flags |= TxFlags::MORE_DATA;
            }
            if i == 0 && !extras.is_empty() {
                slot_flags |= TxFlags::EXTRA_INFO;
            }
            let size = if i == 0 { total } else { chunk.len() as u16 };
            self.tx.push_request(&TxRequest {
                gref,
                offset: 0,
                flags: slot_flags,
                id,
                size,
            });
            self.tx_grants.entry(id).or_default().push(gref);
            ids.push(id);

            if i == 0 {
                for (j, extra) in extras.iter().enumerate() {
                    let mut extra = *extra;
                    extra.flags.set(ExtraFlags::MORE, j + 1 < extras.len());
                    self.tx.push_request(&extra);
                }
            }
        }
        Ok(ids)
    }

    /// Stage a raw TX request. Returns `false` when the ring is full.
    pub fn queue_tx_request(&mut self, req: &TxRequest) -> bool {
        self.tx.push_request(req)
    }

    pub fn queue_tx_extra(&mut self, extra: &ExtraInfo) -> bool {
        self.tx.push_request(extra)
    }

    /// Publish staged TX requests; returns whether the backend wants an interrupt.
    pub fn push_tx(&mut self) -> bool {
        self.tx.push_requests_and_check_notify()
    }

    /// Drain TX responses, revoking the grants of completed slots.
    pub fn collect_tx_responses(&mut self) -> Result<Vec<TxResponse>, FrontendError> {
        let mut out = Vec::new();
        loop {
            if self.tx.unconsumed_responses()? == 0 {
                break;
            }
            let Some(rsp) = self.tx.consume_response::<TxResponse>() else {
                break;
            };
            if rsp.status != status::NULL {
                if let Some(grefs) = self.tx_grants.remove(&rsp.id) {
                    for gref in grefs {
                        let _ = self.hv.end_access(self.domid, gref);
                    }
                }
            }
            out.push(rsp);
        }
        Ok(out)
    }

    /// TX slots whose grants the backend has not yet answered.
    pub fn tx_outstanding(&self) -> usize {
        self.tx_grants.len()
    }

    /// Post up to `count` receive buffers; returns how many fit.
    pub fn post_rx_buffers(&mut self, count: usize) -> usize {
        let mut posted = 0;
        while posted < count && self.rx.free_requests() > 0 {
            let id = self.next_rx_id;
            self.next_rx_id = self.next_rx_id.wrapping_add(1);
            let (gref, buffer) = match self.rx_kind {
                RxBufferKind::Copy => {
                    let page = Arc::new(Page::new());
                    let gref = self.hv.grant_access(self.domid, page.clone(), false);
                    (gref, RxBuffer::Copy { gref, page })
                }
                RxBufferKind::Transfer => {
                    let gref = self.hv.grant_transfer(self.domid);
                    (gref, RxBuffer::Transfer { gref })
                }
            };
            self.rx.push_request(&RxRequest { id, gref });
            self.rx_posted.push_back((id, buffer));
            posted += 1;
        }
        posted
    }

    pub fn push_rx(&mut self) -> bool {
        self.rx.push_requests_and_check_notify()
    }

    /// Receive buffers posted and not yet answered.
    pub fn rx_posted(&self) -> usize {
        self.rx_posted.len()
    }

    fn retire_rx_buffer(&self, buffer: RxBuffer) -> Option<Arc<Page>> {
        match buffer {
            RxBuffer::Copy { gref, page } => {
                let _ = self.hv.end_access(self.domid, gref);
                Some(page)
            }
            RxBuffer::Transfer { gref } => {
                let page = self.hv.take_transferred(self.domid, gref);
                if page.is_none() {
                    let _ = self.hv.end_access(self.domid, gref);
                }
                page
            }
        }
    }

    /// Drain RX responses and return every frame completed by them.
    pub fn collect_rx(&mut self) -> Result<Vec<ReceivedFrame>, FrontendError> {
        let mut frames = Vec::new();
        while self.rx.unconsumed_responses()? > 0 {
            // Responses answer posted requests in order, whatever record they carry.
            let Some((posted_id, buffer)) = self.rx_posted.pop_front() else {
                break;
            };

            if self.partial.as_ref().is_some_and(|p| p.extras_pending) {
                let Some(extra) = self.rx.consume_response::<ExtraInfo>() else {
                    break;
                };
                let _ = self.retire_rx_buffer(buffer);
                if let Some(partial) = self.partial.as_mut() {
                    if let Some(gso) = extra.as_gso() {
                        partial.gso = Some(gso);
                    }
                    partial.extras_pending = extra.flags.contains(ExtraFlags::MORE);
                }
                self.take_if_complete(&mut frames);
                continue;
            }

            let Some(rsp) = self.rx.consume_response::<RxResponse>() else {
                break;
            };
            trace!(id = rsp.id, posted_id, status = rsp.status, "rx response");
            let page = self.retire_rx_buffer(buffer);

            let partial = self.partial.get_or_insert_with(|| PartialFrame {
                flags: rsp.flags,
                ..PartialFrame::default()
            });
            if rsp.status < 0 {
                partial.error.get_or_insert(rsp.status);
            } else if let Some(page) = page {
                let len = rsp.status as usize;
                let offset = usize::from(rsp.offset);
                if offset + len <= PAGE_SIZE {
                    partial.data.extend_from_slice(&page.to_vec(offset, len));
                }
            }
            partial.extras_pending = rsp.flags.contains(RxFlags::EXTRA_INFO);
            partial.more_data = rsp.flags.contains(RxFlags::MORE_DATA);
            self.take_if_complete(&mut frames);
        }
        Ok(frames)
    }

    fn take_if_complete(&mut self, frames: &mut Vec<ReceivedFrame>) {
        if self.partial.as_ref().is_some_and(PartialFrame::is_complete) {
            if let Some(done) = self.partial.take() {
                frames.push(done.finish());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use netback_ring::{BackRing, SharedRing};

    use super::*;

    #[test]
    fn multi_page_frame_is_split_with_extras_after_the_first_slot() {
        let hv = Arc::new(SimHypervisor::new());
        let mut fe = Frontend::new(hv, 5);
        let data = vec![0x5A; PAGE_SIZE + 100];

        let ids = fe
            .queue_frame(&data, TxFlags::CSUM_BLANK, &[ExtraInfo::gso(1448, 1)])
            .unwrap();
        assert_eq!(ids.len(), 2);
        fe.push_tx();

        let mut back = BackRing::attach(SharedRing::new(
            fe.tx_ring().shared().page().clone(),
            TX_SLOT_BYTES,
        ));
        assert_eq!(back.unconsumed_requests(), Ok(3));

        let first: TxRequest = back.consume_request();
        assert_eq!(usize::from(first.size), data.len());
        assert!(first
            .flags
            .contains(TxFlags::CSUM_BLANK | TxFlags::MORE_DATA | TxFlags::EXTRA_INFO));

        let extra: ExtraInfo = back.consume_request();
        assert_eq!(extra.as_gso().map(|g| g.size), Some(1448));
        assert!(!extra.flags.contains(ExtraFlags::MORE));

        let second: TxRequest = back.consume_request();
        assert_eq!(second.size, 100);
        assert!(second.flags.is_empty());
    }

    #[test]
    fn full_ring_is_reported_without_queueing() {
        let hv = Arc::new(SimHypervisor::new());
        let mut fe = Frontend::new(hv, 5);
        let big = vec![0u8; 60];
        for _ in 0..fe.tx_ring().entries() {
            fe.queue_frame(&big, TxFlags::empty(), &[]).unwrap();
        }
        assert_eq!(
            fe.queue_frame(&big, TxFlags::empty(), &[]),
            Err(FrontendError::RingFull { needed: 1, free: 0 })
        );
    }
}

//! Frames crossing the host network-stack boundary.

use std::fmt;
use std::sync::{Arc, Mutex};

use netback_grant::{Page, PAGE_SIZE};
use netback_ring::gso_type;

use crate::dealloc::DeallocQueue;
use crate::error::FrameError;
use crate::interface::InterfaceId;
use crate::pool::PendingIdx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumState {
    /// Nothing known; the receiver must verify.
    #[default]
    None,
    /// Already verified.
    Unnecessary,
    /// Transport checksum left blank; whoever consumes the frame must fill it in.
    Partial { start: u16, offset: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GsoKind {
    TcpV4,
    TcpV6,
}

impl GsoKind {
    pub fn from_wire(ty: u8) -> Option<Self> {
        match ty {
            gso_type::TCPV4 => Some(GsoKind::TcpV4),
            gso_type::TCPV6 => Some(GsoKind::TcpV6),
            _ => None,
        }
    }

    pub fn wire_type(self) -> u8 {
        match self {
            GsoKind::TcpV4 => gso_type::TCPV4,
            GsoKind::TcpV6 => gso_type::TCPV6,
        }
    }
}

/// Segmentation offload request: the frame is a super-packet to be cut into `size`-byte segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsoInfo {
    pub size: u16,
    pub kind: GsoKind,
}

enum Backing {
    Mapped(Arc<Page>),
    Copied(Box<[u8]>),
}

/// A guest page region still mapped on behalf of a [`HostFrame`].
///
/// Dropping the last reference queues the pending slot for unmapping.
pub(crate) struct FragmentBacking {
    idx: PendingIdx,
    offset: u16,
    len: u16,
    state: Mutex<Backing>,
    dealloc: Arc<DeallocQueue>,
}

impl FragmentBacking {
    pub(crate) fn new(
        idx: PendingIdx,
        page: Arc<Page>,
        offset: u16,
        len: u16,
        dealloc: Arc<DeallocQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            idx,
            offset,
            len,
            state: Mutex::new(Backing::Mapped(page)),
            dealloc,
        })
    }

    fn len(&self) -> usize {
        usize::from(self.len)
    }

    fn read(&self, start: usize, out: &mut [u8]) {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &*state {
            Backing::Mapped(page) => page.read(usize::from(self.offset) + start, out),
            Backing::Copied(data) => out.copy_from_slice(&data[start..start + out.len()]),
        }
    }

    /// Replace the mapping with a private copy and queue the slot for unmapping. Returns `false`
    /// if the fragment was already copied.
    pub(crate) fn copy_back(&self) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Backing::Mapped(page) = &*state else {
            return false;
        };
        let data = page.to_vec(usize::from(self.offset), self.len());
        *state = Backing::Copied(data.into_boxed_slice());
        drop(state);
        self.dealloc.push(self.idx);
        true
    }
}

impl Drop for FragmentBacking {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(state, Backing::Mapped(_)) {
            self.dealloc.push(self.idx);
        }
    }
}

/// A guest→host frame handed to [`crate::HostStack::receive`].
///
/// The head is host memory; fragments may still be guest pages mapped read-only. Holding the
/// frame keeps those pages mapped and the guest's TX slots unanswered, so stacks should not hold
/// frames indefinitely.
pub struct HostFrame {
    interface: InterfaceId,
    head: Vec<u8>,
    frags: Vec<Arc<FragmentBacking>>,
    checksum: ChecksumState,
    gso: Option<GsoInfo>,
}

impl HostFrame {
    pub(crate) fn new(interface: InterfaceId, head: Vec<u8>, frags: Vec<Arc<FragmentBacking>>) -> Self {
        Self {
            interface,
            head,
            frags,
            checksum: ChecksumState::None,
            gso: None,
        }
    }

    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.frags.iter().map(|f| f.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }

    pub fn checksum(&self) -> ChecksumState {
        self.checksum
    }

    pub fn gso(&self) -> Option<GsoInfo> {
        self.gso
    }

    pub(crate) fn set_checksum(&mut self, checksum: ChecksumState) {
        self.checksum = checksum;
    }

    pub(crate) fn set_gso(&mut self, gso: Option<GsoInfo>) {
        self.gso = gso;
    }

    /// The first `n` bytes (or the whole frame if shorter).
    pub fn read_prefix(&self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.min(self.len()));
        out.extend_from_slice(&self.head[..n.min(self.head.len())]);
        for frag in &self.frags {
            let want = n - out.len();
            if want == 0 {
                break;
            }
            let take = want.min(frag.len());
            let start = out.len();
            out.resize(start + take, 0);
            frag.read(0, &mut out[start..]);
        }
        out
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read_prefix(self.len())
    }

    /// Pull every fragment into the head, releasing the guest pages.
    pub fn linearize(&mut self) {
        if self.frags.is_empty() {
            return;
        }
        self.head = self.to_vec();
        self.frags.clear();
    }

    pub(crate) fn head_mut(&mut self) -> &mut Vec<u8> {
        &mut self.head
    }
}

impl fmt::Debug for HostFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFrame")
            .field("interface", &self.interface)
            .field("len", &self.len())
            .field("fragments", &self.frags.len())
            .field("checksum", &self.checksum)
            .field("gso", &self.gso)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FrameSegment {
    pub(crate) page: Arc<Page>,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

/// A host→guest frame offered to [`crate::Netback::start_xmit`].
#[derive(Debug, Clone, Default)]
pub struct OutboundFrame {
    segments: Vec<FrameSegment>,
    len: usize,
    checksum: ChecksumState,
    gso: Option<GsoInfo>,
}

impl OutboundFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `data` into fresh page-sized segments.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut frame = Self::new();
        for chunk in data.chunks(PAGE_SIZE) {
            frame.segments.push(FrameSegment {
                page: Arc::new(Page::from_bytes(chunk)),
                offset: 0,
                len: chunk.len(),
            });
            frame.len += chunk.len();
        }
        frame
    }

    /// Append a fragment living in `page`.
    pub fn push_segment(&mut self, page: Arc<Page>, offset: usize, len: usize) -> Result<(), FrameError> {
        if offset.checked_add(len).map_or(true, |end| end > PAGE_SIZE) {
            return Err(FrameError::SegmentOutOfPage { offset, len });
        }
        if len > 0 {
            self.segments.push(FrameSegment { page, offset, len });
            self.len += len;
        }
        Ok(())
    }

    pub fn with_checksum(mut self, checksum: ChecksumState) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_gso(mut self, gso: Option<GsoInfo>) -> Self {
        self.gso = gso;
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn checksum(&self) -> ChecksumState {
        self.checksum
    }

    pub fn gso(&self) -> Option<GsoInfo> {
        self.gso
    }

    /// Guest buffers the frame's bytes occupy once packed page by page.
    pub fn data_slots(&self) -> u32 {
        self.len.div_ceil(PAGE_SIZE).max(1) as u32
    }

    /// Ring slots needed to deliver the frame, including the segmentation extra-info slot.
    pub fn slots_needed(&self) -> u32 {
        self.data_slots() + u32::from(self.gso.is_some())
    }

    pub fn dest_mac(&self) -> Option<[u8; 6]> {
        let head = self.segments.first()?;
        if head.len < 6 {
            return None;
        }
        let mut mac = [0u8; 6];
        head.page.read(head.offset, &mut mac);
        Some(mac)
    }

    /// Source pieces covering frame bytes `[start, start + len)`.
    pub(crate) fn pieces(&self, start: usize, len: usize) -> Vec<FrameSegment> {
        let mut out = Vec::new();
        let mut skip = start;
        let mut want = len;
        for seg in &self.segments {
            if want == 0 {
                break;
            }
            if skip >= seg.len {
                skip -= seg.len;
                continue;
            }
            let take = (seg.len - skip).min(want);
            out.push(FrameSegment {
                page: seg.page.clone(),
                offset: seg.offset + skip,
                len: take,
            });
            want -= take;
            skip = 0;
        }
        out
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segments {
            out.extend_from_slice(&seg.page.to_vec(seg.offset, seg.len));
        }
        out
    }
}

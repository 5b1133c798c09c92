use std::sync::Arc;

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::fence;
#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::fence;

use netback_grant::Page;

use crate::layout::{header, ring_entries};
use crate::slot::RingRecord;

/// View of one shared ring page.
///
/// Cursor accessors are the only synchronisation between the two ends: loads use acquire and
/// stores use release ordering. Everything else on the page is untrusted data.
#[derive(Debug, Clone)]
pub struct SharedRing {
    page: Arc<Page>,
    slot_bytes: usize,
    entries: u32,
}

impl SharedRing {
    /// Attach to a page whose header is already initialised.
    pub fn new(page: Arc<Page>, slot_bytes: usize) -> Self {
        Self {
            page,
            slot_bytes,
            entries: ring_entries(slot_bytes),
        }
    }

    /// Initialise the header of a fresh ring page and attach to it.
    pub fn init(page: Arc<Page>, slot_bytes: usize) -> Self {
        let ring = Self::new(page, slot_bytes);
        ring.set_req_prod(0);
        ring.set_rsp_prod(0);
        ring.set_req_event(1);
        ring.set_rsp_event(1);
        ring
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn req_prod(&self) -> u32 {
        self.page.load_u32(header::REQ_PROD)
    }

    pub fn set_req_prod(&self, value: u32) {
        self.page.store_u32(header::REQ_PROD, value);
    }

    pub fn req_event(&self) -> u32 {
        self.page.load_u32(header::REQ_EVENT)
    }

    pub fn set_req_event(&self, value: u32) {
        self.page.store_u32(header::REQ_EVENT, value);
    }

    pub fn rsp_prod(&self) -> u32 {
        self.page.load_u32(header::RSP_PROD)
    }

    pub fn set_rsp_prod(&self, value: u32) {
        self.page.store_u32(header::RSP_PROD, value);
    }

    pub fn rsp_event(&self) -> u32 {
        self.page.load_u32(header::RSP_EVENT)
    }

    pub fn set_rsp_event(&self, value: u32) {
        self.page.store_u32(header::RSP_EVENT, value);
    }

    fn slot_offset(&self, idx: u32) -> usize {
        header::BYTES + (idx & (self.entries - 1)) as usize * self.slot_bytes
    }

    /// Copy the record at free-running index `idx` out of the page.
    pub fn read_slot<T: RingRecord>(&self, idx: u32) -> T {
        debug_assert!(T::BYTES <= self.slot_bytes);
        let mut buf = [0u8; 16];
        let buf = &mut buf[..T::BYTES];
        self.page.read(self.slot_offset(idx), buf);
        T::decode(buf)
    }

    pub fn write_slot<T: RingRecord>(&self, idx: u32, record: &T) {
        debug_assert!(T::BYTES <= self.slot_bytes);
        let mut buf = [0u8; 16];
        let buf = &mut buf[..T::BYTES];
        record.encode(buf);
        self.page.write(self.slot_offset(idx), buf);
    }
}

/// `true` when a producer that moved its index from `old` to `new` has passed `event`.
pub(crate) fn event_crossed(old: u32, new: u32, event: u32) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_crossing_handles_wraparound() {
        assert!(event_crossed(0, 1, 1));
        assert!(!event_crossed(1, 2, 5));
        assert!(event_crossed(u32::MAX - 1, 2, u32::MAX));
        assert!(!event_crossed(u32::MAX - 1, 2, 3));
    }
}

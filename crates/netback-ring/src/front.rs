//! Guest end of a shared ring, used by frontends and tests.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use netback_grant::Page;

use crate::error::RingError;
use crate::shared::{event_crossed, fence, SharedRing};
use crate::slot::RingRecord;

#[derive(Debug)]
pub struct FrontRing {
    shared: SharedRing,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl FrontRing {
    /// Initialise a fresh ring page and take the guest end of it.
    pub fn init(page: Arc<Page>, slot_bytes: usize) -> Self {
        let shared = SharedRing::init(page, slot_bytes);
        Self {
            shared,
            req_prod_pvt: 0,
            rsp_cons: 0,
        }
    }

    pub fn shared(&self) -> &SharedRing {
        &self.shared
    }

    pub fn entries(&self) -> u32 {
        self.shared.entries()
    }

    pub fn req_prod_pvt(&self) -> u32 {
        self.req_prod_pvt
    }

    /// Slots the guest may still fill with requests.
    pub fn free_requests(&self) -> u32 {
        self.entries() - self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    /// Stage a request. Returns `false` when the ring is full.
    pub fn push_request<T: RingRecord>(&mut self, record: &T) -> bool {
        if self.free_requests() == 0 {
            return false;
        }
        self.shared.write_slot(self.req_prod_pvt, record);
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);
        true
    }

    /// Publish staged requests. Returns whether the backend asked to be notified.
    pub fn push_requests_and_check_notify(&mut self) -> bool {
        let old = self.shared.req_prod();
        let new = self.req_prod_pvt;
        fence(Ordering::Release);
        self.shared.set_req_prod(new);
        fence(Ordering::SeqCst);
        event_crossed(old, new, self.shared.req_event())
    }

    pub fn unconsumed_responses(&self) -> Result<u32, RingError> {
        let prod = self.shared.rsp_prod();
        let size = self.entries();
        let pending = prod.wrapping_sub(self.rsp_cons);
        if pending > size {
            return Err(RingError::ResponseOverflow {
                prod,
                cons: self.rsp_cons,
                pending,
                size,
            });
        }
        Ok(pending)
    }

    pub fn consume_response<T: RingRecord>(&mut self) -> Option<T> {
        if self.unconsumed_responses().ok()? == 0 {
            return None;
        }
        let record = self.shared.read_slot(self.rsp_cons);
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        Some(record)
    }

    pub fn final_check_for_responses(&mut self) -> bool {
        if self.unconsumed_responses().is_ok_and(|n| n > 0) {
            return true;
        }
        self.shared.set_rsp_event(self.rsp_cons.wrapping_add(1));
        fence(Ordering::SeqCst);
        self.unconsumed_responses().is_ok_and(|n| n > 0)
    }
}

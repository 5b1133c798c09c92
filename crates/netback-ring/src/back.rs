//! Backend end of a shared ring.

use std::sync::atomic::Ordering;

use crate::error::RingError;
use crate::shared::{event_crossed, fence, SharedRing};
use crate::slot::RingRecord;

/// Consumer of requests and producer of responses.
///
/// `req_cons` and `rsp_prod_pvt` are private to the backend; only `rsp_prod` and `req_event` are
/// ever written to the shared page. Every value read from the page is treated as untrusted.
#[derive(Debug)]
pub struct BackRing {
    shared: SharedRing,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl BackRing {
    /// Attach to a ring, resuming after whatever responses were already published.
    pub fn attach(shared: SharedRing) -> Self {
        let rsp_prod = shared.rsp_prod();
        Self {
            shared,
            req_cons: rsp_prod,
            rsp_prod_pvt: rsp_prod,
        }
    }

    pub fn shared(&self) -> &SharedRing {
        &self.shared
    }

    pub fn entries(&self) -> u32 {
        self.shared.entries()
    }

    pub fn req_cons(&self) -> u32 {
        self.req_cons
    }

    pub fn rsp_prod_pvt(&self) -> u32 {
        self.rsp_prod_pvt
    }

    /// Requests published by the guest and not yet consumed, capped by the response space the
    /// backend still owes.
    pub fn unconsumed_requests(&self) -> Result<u32, RingError> {
        let prod = self.shared.req_prod();
        let size = self.entries();
        let pending = prod.wrapping_sub(self.req_cons);
        if pending > size {
            return Err(RingError::RequestOverflow {
                prod,
                cons: self.req_cons,
                pending,
                size,
            });
        }
        let rsp_space = size - self.req_cons.wrapping_sub(self.rsp_prod_pvt);
        Ok(pending.min(rsp_space))
    }

    /// Copy out the request `ahead` slots past the consumer without consuming it.
    ///
    /// Callers must have established `ahead < unconsumed_requests()`.
    pub fn peek_request<T: RingRecord>(&self, ahead: u32) -> T {
        self.shared.read_slot(self.req_cons.wrapping_add(ahead))
    }

    /// Copy out the next request and consume it.
    pub fn consume_request<T: RingRecord>(&mut self) -> T {
        let record = self.shared.read_slot(self.req_cons);
        self.req_cons = self.req_cons.wrapping_add(1);
        record
    }

    /// Consume `count` requests that were already read with [`BackRing::peek_request`].
    pub fn skip_requests(&mut self, count: u32) {
        self.req_cons = self.req_cons.wrapping_add(count);
    }

    /// Stage a response in the next slot. Nothing is visible to the guest until
    /// [`BackRing::push_responses_and_check_notify`].
    ///
    /// # Panics
    ///
    /// Panics if there is no consumed request left to answer.
    pub fn push_response<T: RingRecord>(&mut self, record: &T) {
        assert!(
            self.req_cons.wrapping_sub(self.rsp_prod_pvt) > 0,
            "response without an outstanding request (req_cons={}, rsp_prod_pvt={})",
            self.req_cons,
            self.rsp_prod_pvt
        );
        self.shared.write_slot(self.rsp_prod_pvt, record);
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    /// Responses staged but not yet published.
    pub fn unpublished_responses(&self) -> u32 {
        self.rsp_prod_pvt.wrapping_sub(self.shared.rsp_prod())
    }

    /// Publish staged responses. Returns whether the guest asked to be notified.
    pub fn push_responses_and_check_notify(&mut self) -> bool {
        let old = self.shared.rsp_prod();
        let new = self.rsp_prod_pvt;
        // Response bodies must be visible before the producer index moves.
        fence(Ordering::Release);
        self.shared.set_rsp_prod(new);
        // The index store must be visible before we sample the guest's event threshold.
        fence(Ordering::SeqCst);
        event_crossed(old, new, self.shared.rsp_event())
    }

    /// Re-arm the request event and look once more, closing the race with a guest that
    /// published just before the event was moved.
    pub fn final_check_for_requests(&mut self) -> Result<bool, RingError> {
        if self.unconsumed_requests()? > 0 {
            return Ok(true);
        }
        self.shared.set_req_event(self.req_cons.wrapping_add(1));
        fence(Ordering::SeqCst);
        Ok(self.unconsumed_requests()? > 0)
    }

    /// Ask to be notified once `needed` requests beyond the consumer are available.
    pub fn request_event_threshold(&mut self, needed: u32) {
        self.shared
            .set_req_event(self.req_cons.wrapping_add(needed.max(1)));
        fence(Ordering::SeqCst);
    }
}

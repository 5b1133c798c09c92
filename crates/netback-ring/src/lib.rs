//! Shared request/response rings between a guest frontend and the network backend.
//!
//! Each ring is one granted page. The guest produces requests and consumes responses; the backend
//! does the reverse. Both ends keep private cursors and publish free-running `u32` indices plus
//! "wake me at" event thresholds in the page header. No lock is ever taken on the page: the guest
//! is untrusted and may scribble anywhere on it, so every read is a copy-out and every cursor is
//! validated before use.

#![forbid(unsafe_code)]

pub mod back;
pub mod error;
pub mod front;
pub mod layout;
pub mod shared;
pub mod slot;

pub use back::BackRing;
pub use error::RingError;
pub use front::FrontRing;
pub use layout::{status, RX_RING_SIZE, RX_SLOT_BYTES, TX_RING_SIZE, TX_SLOT_BYTES};
pub use shared::SharedRing;
pub use slot::{
    extra_type, gso_type, ExtraFlags, ExtraInfo, GsoExtra, RingRecord, RxFlags, RxRequest,
    RxResponse, TxFlags, TxRequest, TxResponse,
};

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use std::sync::Arc;

    use netback_grant::Page;

    use super::*;

    fn pair() -> (FrontRing, BackRing) {
        let page = Arc::new(Page::new());
        let front = FrontRing::init(page.clone(), TX_SLOT_BYTES);
        let back = BackRing::attach(SharedRing::new(page, TX_SLOT_BYTES));
        (front, back)
    }

    fn req(id: u16) -> TxRequest {
        TxRequest {
            id,
            size: 64,
            ..TxRequest::default()
        }
    }

    #[test]
    fn first_publish_always_notifies() {
        let (mut front, back) = pair();
        assert!(front.push_request(&req(1)));
        assert!(front.push_requests_and_check_notify());
        assert_eq!(back.unconsumed_requests(), Ok(1));
    }

    #[test]
    fn backend_sleeps_through_batch_until_final_check() {
        let (mut front, mut back) = pair();
        front.push_request(&req(1));
        front.push_requests_and_check_notify();

        let first: TxRequest = back.consume_request();
        assert_eq!(first.id, 1);

        // The backend has not re-armed its event yet, so further requests do not notify.
        front.push_request(&req(2));
        assert!(!front.push_requests_and_check_notify());

        assert_eq!(back.final_check_for_requests(), Ok(true));
        let second: TxRequest = back.consume_request();
        assert_eq!(second.id, 2);
        assert_eq!(back.final_check_for_requests(), Ok(false));

        front.push_request(&req(3));
        assert!(front.push_requests_and_check_notify());
    }

    #[test]
    fn responses_reach_the_guest_with_notify() {
        let (mut front, mut back) = pair();
        front.push_request(&req(9));
        front.push_requests_and_check_notify();
        let _: TxRequest = back.consume_request();

        back.push_response(&TxResponse {
            id: 9,
            status: status::OKAY,
        });
        assert_eq!(back.unpublished_responses(), 1);
        assert!(back.push_responses_and_check_notify());

        let rsp: TxResponse = front.consume_response().expect("response");
        assert_eq!(rsp, TxResponse { id: 9, status: 0 });
        assert!(!front.final_check_for_responses());
    }

    #[test]
    fn guest_overrunning_the_ring_is_detected() {
        let (front, back) = pair();
        front.shared().set_req_prod(TX_RING_SIZE + 1);
        assert!(matches!(
            back.unconsumed_requests(),
            Err(RingError::RequestOverflow { pending: 257, .. })
        ));
    }

    #[test]
    fn needed_slots_threshold_delays_the_guest_notify() {
        let (mut front, mut back) = pair();
        back.request_event_threshold(3);

        front.push_request(&req(1));
        assert!(!front.push_requests_and_check_notify());
        front.push_request(&req(2));
        assert!(!front.push_requests_and_check_notify());
        front.push_request(&req(3));
        assert!(front.push_requests_and_check_notify());
    }

    #[test]
    #[should_panic(expected = "without an outstanding request")]
    fn response_without_request_panics() {
        let (_front, mut back) = pair();
        back.push_response(&TxResponse { id: 0, status: 0 });
    }
}

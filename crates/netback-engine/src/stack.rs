use std::sync::{Arc, Mutex};

use crate::frame::HostFrame;

/// Where guest→host frames go.
///
/// `receive` runs on a worker thread (or inside [`crate::Netback::run_deferred`]) with no engine
/// locks held, so it may call back into the engine, e.g. to forward the frame to another
/// interface with [`crate::Netback::start_xmit`].
pub trait HostStack: Send + Sync {
    fn receive(&self, frame: HostFrame);

    /// Whether the stack can take frames with a blank transport checksum
    /// ([`crate::ChecksumState::Partial`]). When it cannot, the engine fills the checksum in.
    fn accepts_partial_checksum(&self) -> bool {
        true
    }
}

impl<T: HostStack + ?Sized> HostStack for Arc<T> {
    fn receive(&self, frame: HostFrame) {
        <T as HostStack>::receive(&**self, frame);
    }

    fn accepts_partial_checksum(&self) -> bool {
        <T as HostStack>::accepts_partial_checksum(&**self)
    }
}

impl<T: HostStack + ?Sized> HostStack for Box<T> {
    fn receive(&self, frame: HostFrame) {
        <T as HostStack>::receive(&**self, frame);
    }

    fn accepts_partial_checksum(&self) -> bool {
        <T as HostStack>::accepts_partial_checksum(&**self)
    }
}

/// Drops everything, releasing guest pages immediately.
impl HostStack for () {
    fn receive(&self, _frame: HostFrame) {}
}

/// Holds every frame until the caller takes them out. Mapped fragments stay mapped meanwhile.
impl HostStack for Mutex<Vec<HostFrame>> {
    fn receive(&self, frame: HostFrame) {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(frame);
    }
}

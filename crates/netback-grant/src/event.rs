//! Event channels: the doorbell between backend and guest.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventPort(pub u32);

pub trait EventChannels: Send + Sync {
    /// Signal the guest bound to `port`.
    fn notify(&self, port: EventPort);

    /// Signal several ports with one privileged call.
    fn notify_batch(&self, ports: &[EventPort]) {
        for &port in ports {
            self.notify(port);
        }
    }

    /// Stop delivering guest interrupts on `port` to the backend.
    fn mask(&self, port: EventPort);

    fn unmask(&self, port: EventPort);
}

impl<T: EventChannels + ?Sized> EventChannels for Arc<T> {
    fn notify(&self, port: EventPort) {
        <T as EventChannels>::notify(&**self, port);
    }

    fn notify_batch(&self, ports: &[EventPort]) {
        <T as EventChannels>::notify_batch(&**self, ports);
    }

    fn mask(&self, port: EventPort) {
        <T as EventChannels>::mask(&**self, port);
    }

    fn unmask(&self, port: EventPort) {
        <T as EventChannels>::unmask(&**self, port);
    }
}

impl EventChannels for () {
    fn notify(&self, _port: EventPort) {}

    fn mask(&self, _port: EventPort) {}

    fn unmask(&self, _port: EventPort) {}
}

//! Per-pass notification batching.

use netback_grant::{EventChannels, EventPort};

/// Ports owed a notification at the end of a pass. Each port is signalled at most once.
#[derive(Debug, Default)]
pub(crate) struct NotifyList {
    ports: Vec<EventPort>,
}

impl NotifyList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, port: EventPort) {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ports.len()
    }

    /// Send everything queued: up to `batch` ports in one batched call, any remainder one by one.
    pub(crate) fn flush(&mut self, events: &dyn EventChannels, batch: usize) {
        if self.ports.is_empty() {
            return;
        }
        let split = batch.min(self.ports.len());
        let (batched, rest) = self.ports.split_at(split);
        if !batched.is_empty() {
            events.notify_batch(batched);
        }
        for &port in rest {
            events.notify(port);
        }
        self.ports.clear();
    }
}

//! Reorder buffer for TX responses.
//!
//! Slots are consumed from the ring in order but complete out of order: copy-only slots finish
//! within the pass, mapped ones only after the host stack lets go of the frame. Responses still
//! have to reach the ring in consumption order, so each consumed slot reserves a sequence number
//! and a response is published only once everything reserved before it has completed.

use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct ResponseQueue<T> {
    /// Sequence number of `slots[0]`.
    head: u64,
    slots: VecDeque<Option<T>>,
}

impl<T> ResponseQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: 0,
            slots: VecDeque::new(),
        }
    }

    pub(crate) fn reserve(&mut self) -> u64 {
        let seq = self.head + self.slots.len() as u64;
        self.slots.push_back(None);
        seq
    }

    pub(crate) fn complete(&mut self, seq: u64, response: T) {
        let pos = seq
            .checked_sub(self.head)
            .and_then(|pos| usize::try_from(pos).ok())
            .filter(|&pos| pos < self.slots.len())
            .unwrap_or_else(|| panic!("response {seq} was never reserved"));
        let slot = &mut self.slots[pos];
        assert!(slot.is_none(), "response {seq} completed twice");
        *slot = Some(response);
    }

    /// Hand every response whose predecessors are all complete to `publish`, in order.
    pub(crate) fn drain_ready(&mut self, mut publish: impl FnMut(T)) -> usize {
        let mut n = 0;
        while let Some(Some(_)) = self.slots.front() {
            if let Some(Some(response)) = self.slots.pop_front() {
                publish(response);
            }
            self.head += 1;
            n += 1;
        }
        n
    }

    /// Reserved but not yet published.
    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.slots.len()
    }
}

//! Fixed-capacity table of in-flight TX slots.
//!
//! Each entry walks `Free → Allocated → (Mapped → AwaitingUnmap →) Free`. Copy-only slots go
//! straight back from `Allocated` through [`PendingPool::release`]; mapped slots only become free
//! again through [`PendingPool::complete_unmap`], after the broker confirmed the unmap. Any other
//! transition is an engine bug and panics.

use std::collections::VecDeque;
use std::time::Instant;

use netback_grant::GrantHandle;

pub type PendingIdx = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Allocated,
    Mapped,
    AwaitingUnmap,
}

#[derive(Debug)]
struct Entry<T> {
    state: SlotState,
    payload: Option<T>,
    handle: Option<GrantHandle>,
    mapped_at: Option<Instant>,
}

#[derive(Debug)]
pub struct PendingPool<T> {
    entries: Vec<Entry<T>>,
    free: VecDeque<PendingIdx>,
}

impl<T> PendingPool<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity <= usize::from(PendingIdx::MAX) + 1,
            "pending pool capacity {capacity} exceeds index width"
        );
        let entries = (0..capacity)
            .map(|_| Entry {
                state: SlotState::Free,
                payload: None,
                handle: None,
                mapped_at: None,
            })
            .collect();
        let free = (0..capacity).map(|i| i as PendingIdx).collect();
        Self { entries, free }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.free_count()
    }

    pub fn state(&self, idx: PendingIdx) -> SlotState {
        self.entries[usize::from(idx)].state
    }

    fn transition(&mut self, idx: PendingIdx, from: SlotState, to: SlotState) -> &mut Entry<T> {
        let entry = &mut self.entries[usize::from(idx)];
        assert_eq!(
            entry.state, from,
            "pending slot {idx}: illegal transition to {to:?}"
        );
        entry.state = to;
        entry
    }

    /// Take a free slot for `payload`. `None` means the pool is exhausted.
    pub fn allocate(&mut self, payload: T) -> Option<PendingIdx> {
        let idx = self.free.pop_front()?;
        let entry = self.transition(idx, SlotState::Free, SlotState::Allocated);
        entry.payload = Some(payload);
        Some(idx)
    }

    pub fn get(&self, idx: PendingIdx) -> Option<&T> {
        self.entries[usize::from(idx)].payload.as_ref()
    }

    pub fn get_mut(&mut self, idx: PendingIdx) -> Option<&mut T> {
        self.entries[usize::from(idx)].payload.as_mut()
    }

    pub fn mark_mapped(&mut self, idx: PendingIdx, handle: GrantHandle, now: Instant) {
        let entry = self.transition(idx, SlotState::Allocated, SlotState::Mapped);
        entry.handle = Some(handle);
        entry.mapped_at = Some(now);
    }

    /// Return a slot that never held a mapping.
    pub fn release(&mut self, idx: PendingIdx) -> T {
        let entry = self.transition(idx, SlotState::Allocated, SlotState::Free);
        let payload = entry.payload.take();
        self.free.push_back(idx);
        payload.unwrap_or_else(|| panic!("pending slot {idx} allocated without payload"))
    }

    /// Handle to unmap for a mapped slot, moving it to `AwaitingUnmap`. Slots already awaiting
    /// unmap (a retry after a failed unmap) keep their state.
    pub fn begin_unmap(&mut self, idx: PendingIdx) -> GrantHandle {
        let entry = &mut self.entries[usize::from(idx)];
        match entry.state {
            SlotState::Mapped => entry.state = SlotState::AwaitingUnmap,
            SlotState::AwaitingUnmap => {}
            state => panic!("pending slot {idx}: unmap requested in state {state:?}"),
        }
        entry
            .handle
            .unwrap_or_else(|| panic!("pending slot {idx} mapped without a handle"))
    }

    /// The broker confirmed the unmap; the slot is reusable.
    pub fn complete_unmap(&mut self, idx: PendingIdx) -> T {
        let entry = self.transition(idx, SlotState::AwaitingUnmap, SlotState::Free);
        entry.handle = None;
        entry.mapped_at = None;
        let payload = entry.payload.take();
        self.free.push_back(idx);
        payload.unwrap_or_else(|| panic!("pending slot {idx} mapped without payload"))
    }

    /// Mapped slots whose mapping is at least as old as `cutoff`.
    pub fn mapped_since(&self, cutoff: Instant) -> impl Iterator<Item = (PendingIdx, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(move |(i, entry)| {
            match (entry.state, entry.mapped_at, entry.payload.as_ref()) {
                (SlotState::Mapped, Some(at), Some(payload)) if at <= cutoff => {
                    Some((i as PendingIdx, payload))
                }
                _ => None,
            }
        })
    }

    /// Earliest mapping time among mapped slots.
    pub fn oldest_mapping(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|entry| entry.state == SlotState::Mapped)
            .filter_map(|entry| entry.mapped_at)
            .min()
    }
}

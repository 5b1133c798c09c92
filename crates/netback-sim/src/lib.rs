//! Host-side stand-ins for running guests against the engine without a real host network
//! stack: a stack that just keeps what it is given, and a learning bridge that switches frames
//! between the backend's own interfaces.

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use netback_engine::{HostFrame, HostStack, InterfaceId, Netback, OutboundFrame};

mod driver;

pub use driver::{run, sim_frame, SimOptions, SimReport};

pub type Mac = [u8; 6];

/// Locally administered address for a guest's interface.
pub fn guest_mac(domid: u16) -> Mac {
    let [hi, lo] = domid.to_be_bytes();
    [0x02, 0x00, 0x00, 0x00, hi, lo]
}

/// An Ethernet frame of `len` bytes from `src` to `dst`, with a recognisable payload.
pub fn ethernet_frame(dst: Mac, src: Mac, len: usize, seed: u8) -> Vec<u8> {
    let mut frame: Vec<u8> = (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    frame[0..6].copy_from_slice(&dst);
    frame[6..12].copy_from_slice(&src);
    frame[12..14].copy_from_slice(&0x88B5u16.to_be_bytes());
    frame
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps every frame until taken.
#[derive(Default)]
pub struct CollectingStack {
    frames: Mutex<Vec<HostFrame>>,
    arrived: Condvar,
}

impl CollectingStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every held frame, letting the backend release their guest pages once dropped.
    pub fn take(&self) -> Vec<HostFrame> {
        std::mem::take(&mut *lock(&self.frames))
    }

    /// Block until at least `count` frames are held or `timeout` passes.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut frames = lock(&self.frames);
        while frames.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            frames = self
                .arrived
                .wait_timeout(frames, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        true
    }
}

impl HostStack for CollectingStack {
    fn receive(&self, frame: HostFrame) {
        lock(&self.frames).push(frame);
        self.arrived.notify_all();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames sent to the single interface owning the destination address.
    pub forwarded: u64,
    /// Copies sent for broadcast, multicast and unknown destinations.
    pub flooded: u64,
    /// Copies the backend refused.
    pub refused: u64,
    /// Frames dropped before switching (runts, or addressed back to their sender).
    pub discarded: u64,
}

struct Pending {
    from: InterfaceId,
    frame: OutboundFrame,
}

/// Learning switch across every interface of one backend.
///
/// `receive` runs on the engine's worker threads and only queues; [`Bridge::forward`] does the
/// switching from the embedder's thread, so no engine call is made from inside a pass.
#[derive(Default)]
pub struct Bridge {
    queue: Mutex<VecDeque<Pending>>,
    table: Mutex<HashMap<Mac, InterfaceId>>,
    stats: Mutex<BridgeStats>,
    queued: Condvar,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BridgeStats {
        *lock(&self.stats)
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Interface last seen sending from `mac`.
    pub fn lookup(&self, mac: &Mac) -> Option<InterfaceId> {
        lock(&self.table).get(mac).copied()
    }

    /// Block until a frame is queued or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> bool {
        let queue = lock(&self.queue);
        let (queue, _) = self
            .queued
            .wait_timeout_while(queue, timeout, |queue| queue.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !queue.is_empty()
    }

    /// Switch every queued frame. Returns how many were taken off the queue.
    pub fn forward(&self, netback: &Netback) -> usize {
        let pending: Vec<Pending> = lock(&self.queue).drain(..).collect();
        let taken = pending.len();
        let mut stats = BridgeStats::default();

        for Pending { from, frame } in pending {
            let Some(dst) = frame.dest_mac() else {
                stats.discarded += 1;
                continue;
            };
            let unicast = dst[0] & 1 == 0;
            let owner = if unicast { self.lookup(&dst) } else { None };
            match owner {
                Some(to) if to == from => stats.discarded += 1,
                Some(to) => match netback.start_xmit(to, frame) {
                    Ok(()) => stats.forwarded += 1,
                    Err(err) => {
                        tracing::debug!(%from, %to, error = %err, "bridge: frame refused");
                        stats.refused += 1;
                    }
                },
                None => {
                    for to in netback.interfaces().into_iter().filter(|&to| to != from) {
                        match netback.start_xmit(to, frame.clone()) {
                            Ok(()) => stats.flooded += 1,
                            Err(_) => stats.refused += 1,
                        }
                    }
                }
            }
        }

        let mut total = lock(&self.stats);
        total.forwarded += stats.forwarded;
        total.flooded += stats.flooded;
        total.refused += stats.refused;
        total.discarded += stats.discarded;
        taken
    }

    /// Forget addresses learned from `iface`, e.g. after it disconnects.
    pub fn forget(&self, iface: InterfaceId) {
        lock(&self.table).retain(|_, owner| *owner != iface);
    }
}

impl HostStack for Bridge {
    fn receive(&self, frame: HostFrame) {
        let from = frame.interface();
        let head = frame.read_prefix(12);
        if head.len() < 12 {
            lock(&self.stats).discarded += 1;
            return;
        }
        let mut src = [0u8; 6];
        src.copy_from_slice(&head[6..12]);
        if src[0] & 1 == 0 {
            lock(&self.table).insert(src, from);
        }

        let outbound = OutboundFrame::from_bytes(&frame.to_vec())
            .with_checksum(frame.checksum())
            .with_gso(frame.gso());
        // The guest's pages go back as soon as the bytes are copied out.
        drop(frame);
        lock(&self.queue).push_back(Pending {
            from,
            frame: outbound,
        });
        self.queued.notify_all();
    }
}

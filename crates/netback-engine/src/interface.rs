//! Per-guest interface state.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use netback_grant::{DomId, EventPort, GrantHandle, GrantRef};
use netback_ring::{BackRing, TxResponse};

use crate::credit::{CreditBucket, CreditLimit};
use crate::frame::OutboundFrame;
use crate::responses::ResponseQueue;
use crate::stats::{InterfaceStats, StatsCounters};

/// Multicast addresses one interface may subscribe to.
pub const MAX_MULTICAST_GROUPS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub u32);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vif{}", self.0)
    }
}

/// How host→guest frames reach guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxMode {
    /// Copy into buffers the guest granted.
    #[default]
    Copy,
    /// Hand whole backend pages to the guest through transfer grants.
    Transfer,
}

/// Everything the guest negotiated for one interface.
#[derive(Debug, Clone)]
pub struct InterfaceParams {
    pub domid: DomId,
    /// Guest-chosen device index, only used for logging.
    pub handle: u32,
    pub tx_ring_ref: GrantRef,
    pub rx_ring_ref: GrantRef,
    pub event_port: EventPort,
    pub rx_mode: RxMode,
    pub credit: CreditLimit,
    /// When set, host→guest multicast is filtered by the guest's subscriptions.
    pub multicast_control: bool,
}

impl InterfaceParams {
    pub fn new(domid: DomId, tx_ring_ref: GrantRef, rx_ring_ref: GrantRef, event_port: EventPort) -> Self {
        Self {
            domid,
            handle: 0,
            tx_ring_ref,
            rx_ring_ref,
            event_port,
            rx_mode: RxMode::default(),
            credit: CreditLimit::UNLIMITED,
            multicast_control: false,
        }
    }
}

pub(crate) struct TxState {
    pub(crate) ring: BackRing,
    pub(crate) credit: CreditBucket,
    pub(crate) responses: ResponseQueue<TxResponse>,
    pub(crate) credit_timer_armed: bool,
}

pub(crate) struct RxState {
    pub(crate) ring: BackRing,
    pub(crate) queue: VecDeque<OutboundFrame>,
    /// Set while the head frame waits for guest buffers.
    pub(crate) stall_deadline: Option<Instant>,
}

pub(crate) struct Interface {
    pub(crate) id: InterfaceId,
    pub(crate) domid: DomId,
    pub(crate) handle: u32,
    pub(crate) group: usize,
    pub(crate) port: EventPort,
    pub(crate) rx_mode: RxMode,
    multicast_control: bool,
    pub(crate) ring_handles: [GrantHandle; 2],

    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    multicast: Mutex<Vec<[u8; 6]>>,

    carrier: AtomicBool,
    busted: AtomicBool,
    pub(crate) on_tx_list: AtomicBool,
    pub(crate) on_rx_list: AtomicBool,

    refs: Mutex<usize>,
    idle: Condvar,

    pub(crate) stats: StatsCounters,
}

impl Interface {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: InterfaceId,
        params: &InterfaceParams,
        group: usize,
        tx_ring: BackRing,
        rx_ring: BackRing,
        credit: CreditBucket,
        ring_handles: [GrantHandle; 2],
    ) -> Self {
        Self {
            id,
            domid: params.domid,
            handle: params.handle,
            group,
            port: params.event_port,
            rx_mode: params.rx_mode,
            multicast_control: params.multicast_control,
            ring_handles,
            tx: Mutex::new(TxState {
                ring: tx_ring,
                credit,
                responses: ResponseQueue::new(),
                credit_timer_armed: false,
            }),
            rx: Mutex::new(RxState {
                ring: rx_ring,
                queue: VecDeque::new(),
                stall_deadline: None,
            }),
            multicast: Mutex::new(Vec::new()),
            carrier: AtomicBool::new(true),
            busted: AtomicBool::new(false),
            on_tx_list: AtomicBool::new(false),
            on_rx_list: AtomicBool::new(false),
            refs: Mutex::new(0),
            idle: Condvar::new(),
            stats: StatsCounters::default(),
        }
    }

    pub(crate) fn lock_tx(&self) -> MutexGuard<'_, TxState> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn lock_rx(&self) -> MutexGuard<'_, RxState> {
        self.rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Carrier up and not disabled; only active interfaces get scheduled.
    pub(crate) fn is_active(&self) -> bool {
        self.carrier.load(Ordering::SeqCst) && !self.busted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_carrier(&self, up: bool) {
        self.carrier.store(up, Ordering::SeqCst);
    }

    /// Latch the interface off after a fatal protocol error. Returns `false` if it already was.
    pub(crate) fn mark_busted(&self) -> bool {
        self.carrier.store(false, Ordering::SeqCst);
        !self.busted.swap(true, Ordering::SeqCst)
    }

    /// Drop every queued host→guest frame.
    pub(crate) fn purge_rx(&self) -> usize {
        let mut rx = self.lock_rx();
        let n = rx.queue.len();
        rx.queue.clear();
        rx.stall_deadline = None;
        StatsCounters::add(&self.stats.rx_dropped, n as u64);
        n
    }

    pub(crate) fn has_queued_rx(&self) -> bool {
        !self.lock_rx().queue.is_empty()
    }

    /// Subscribe to a multicast group. Fails once the subscription list is full.
    pub(crate) fn multicast_add(&self, addr: [u8; 6]) -> bool {
        let mut list = self.multicast.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if list.contains(&addr) {
            return true;
        }
        if list.len() >= MAX_MULTICAST_GROUPS {
            return false;
        }
        list.push(addr);
        true
    }

    pub(crate) fn multicast_del(&self, addr: [u8; 6]) {
        let mut list = self.multicast.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        list.retain(|a| *a != addr);
    }

    /// Whether a frame addressed to `dest` should reach the guest.
    pub(crate) fn accepts_destination(&self, dest: [u8; 6]) -> bool {
        let multicast = dest[0] & 1 != 0;
        if !self.multicast_control || !multicast || dest == [0xff; 6] {
            return true;
        }
        self.multicast
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&dest)
    }

    /// Take a reference that keeps the interface from finishing disconnect.
    pub(crate) fn acquire(self: &Arc<Self>) -> InterfaceRef {
        *self.refs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        InterfaceRef(Arc::clone(self))
    }

    pub(crate) fn refs(&self) -> usize {
        *self.refs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait up to `timeout` for the last reference to go away.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let refs = self.refs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (refs, _) = self
            .idle
            .wait_timeout_while(refs, timeout, |refs| *refs > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *refs == 0
    }

    pub(crate) fn stats(&self) -> InterfaceStats {
        let groups = self
            .multicast
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len();
        InterfaceStats {
            multicast_groups: groups as u64,
            carrier: self.carrier.load(Ordering::SeqCst),
            busted: self.busted.load(Ordering::SeqCst),
            ..self.stats.snapshot()
        }
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.id)
            .field("domid", &self.domid)
            .field("handle", &self.handle)
            .field("group", &self.group)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// A counted reference held by every in-flight pending slot and RX batch entry.
pub(crate) struct InterfaceRef(Arc<Interface>);

impl InterfaceRef {
    pub(crate) fn arc(&self) -> &Arc<Interface> {
        &self.0
    }
}

impl Clone for InterfaceRef {
    fn clone(&self) -> Self {
        self.0.acquire()
    }
}

impl Deref for InterfaceRef {
    type Target = Interface;

    fn deref(&self) -> &Interface {
        &self.0
    }
}

impl Drop for InterfaceRef {
    fn drop(&mut self) {
        let mut refs = self.0.refs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *refs -= 1;
        if *refs == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl fmt::Debug for InterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InterfaceRef").field(&self.0.id).finish()
    }
}

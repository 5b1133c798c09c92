//! Worker groups.
//!
//! A group owns a share of the interfaces together with everything their passes need: the
//! pending pool, the TX/RX schedule lists, the deallocation queue, timers and the transfer page
//! pool. Passes of one group never overlap; different groups run independently.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use netback_grant::{EventChannels, GrantBroker, Page};

use crate::clock::Clock;
use crate::config::NetbackConfig;
use crate::dealloc::{self, DeallocQueue};
use crate::interface::Interface;
use crate::pool::PendingPool;
use crate::stack::HostStack;
use crate::tx::{self, PendingTx};
use crate::rx;

pub(crate) const WORK_TX: u8 = 1 << 0;
pub(crate) const WORK_RX: u8 = 1 << 1;
pub(crate) const WORK_DEALLOC: u8 = 1 << 2;

/// Shared collaborators of every group.
pub(crate) struct Engine {
    pub(crate) config: NetbackConfig,
    pub(crate) broker: Arc<dyn GrantBroker>,
    pub(crate) events: Arc<dyn EventChannels>,
    pub(crate) stack: Arc<dyn HostStack>,
    pub(crate) clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct SignalState {
    pending: u8,
    timers_changed: bool,
    stopped: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wake {
    Work,
    Timeout,
    /// A timer was armed; the sleep must be recomputed.
    Rearm,
    Stop,
}

/// Runnable bits of one group plus the condition variable its worker sleeps on.
#[derive(Debug, Default)]
pub(crate) struct GroupSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl GroupSignal {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn mark_runnable(&self, bits: u8) {
        self.lock().pending |= bits;
        self.cond.notify_all();
    }

    pub(crate) fn timers_changed(&self) {
        self.lock().timers_changed = true;
        self.cond.notify_all();
    }

    pub(crate) fn take(&self) -> u8 {
        std::mem::take(&mut self.lock().pending)
    }

    /// Sleep until work is marked, `timeout` passes or the group is stopped.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Wake {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return Wake::Stop;
            }
            if state.pending != 0 {
                return Wake::Work;
            }
            if std::mem::take(&mut state.timers_changed) {
                return Wake::Rearm;
            }
            match timeout {
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(timeout) => {
                    let (next, result) = self
                        .cond
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    state = next;
                    if result.timed_out()
                        && state.pending == 0
                        && !state.stopped
                        && !state.timers_changed
                    {
                        return Wake::Timeout;
                    }
                }
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.lock().stopped = true;
        self.cond.notify_all();
    }
}

pub(crate) enum TimerKind {
    /// The interface's credit window reopens.
    Credit(Arc<Interface>),
    /// The interface's head RX frame has waited long enough for guest buffers.
    RxStall(Arc<Interface>),
    TransferRefill,
    UnmapRetry,
    CopyBack,
}

impl TimerKind {
    fn interface(&self) -> Option<&Arc<Interface>> {
        match self {
            TimerKind::Credit(iface) | TimerKind::RxStall(iface) => Some(iface),
            _ => None,
        }
    }
}

struct Timer {
    deadline: Instant,
    kind: TimerKind,
}

/// Backend pages handed to guests in transfer mode. Pages leave the pool for good; the pool is
/// topped up after a backoff once it runs dry.
pub(crate) struct TransferPool {
    free: Vec<Arc<Page>>,
    capacity: usize,
    refill_armed: bool,
    waiters: Vec<Arc<Interface>>,
}

impl TransferPool {
    fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity).map(|_| Arc::new(Page::new())).collect(),
            capacity,
            refill_armed: false,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn refill(&mut self) -> Vec<Arc<Interface>> {
        while self.free.len() < self.capacity {
            self.free.push(Arc::new(Page::new()));
        }
        self.refill_armed = false;
        std::mem::take(&mut self.waiters)
    }
}

pub(crate) struct WorkerGroup {
    pub(crate) id: usize,
    pub(crate) engine: Arc<Engine>,
    pub(crate) signal: Arc<GroupSignal>,
    pub(crate) dealloc: Arc<DeallocQueue>,
    pool: Mutex<PendingPool<PendingTx>>,
    tx_schedule: Mutex<VecDeque<Arc<Interface>>>,
    rx_schedule: Mutex<VecDeque<Arc<Interface>>>,
    timers: Mutex<Vec<Timer>>,
    transfer: Mutex<TransferPool>,
    copy_back_armed: AtomicBool,
    members: AtomicUsize,
    run_lock: Mutex<()>,
}

impl WorkerGroup {
    pub(crate) fn new(id: usize, engine: Arc<Engine>) -> Self {
        let signal = Arc::new(GroupSignal::default());
        let pool = PendingPool::new(engine.config.max_pending);
        let transfer = TransferPool::new(engine.config.transfer_pool_pages);
        Self {
            id,
            dealloc: Arc::new(DeallocQueue::new(Arc::clone(&signal))),
            signal,
            engine,
            pool: Mutex::new(pool),
            tx_schedule: Mutex::new(VecDeque::new()),
            rx_schedule: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Vec::new()),
            transfer: Mutex::new(transfer),
            copy_back_armed: AtomicBool::new(false),
            members: AtomicUsize::new(0),
            run_lock: Mutex::new(()),
        }
    }

    pub(crate) fn config(&self) -> &NetbackConfig {
        &self.engine.config
    }

    pub(crate) fn now(&self) -> Instant {
        self.engine.clock.now()
    }

    /// Always taken after an interface's TX lock, never before.
    pub(crate) fn lock_pool(&self) -> MutexGuard<'_, PendingPool<PendingTx>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn members(&self) -> usize {
        self.members.load(Ordering::SeqCst)
    }

    pub(crate) fn join(&self) {
        self.members.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave(&self) {
        self.members.fetch_sub(1, Ordering::SeqCst);
    }

    fn lock_list(list: &Mutex<VecDeque<Arc<Interface>>>) -> MutexGuard<'_, VecDeque<Arc<Interface>>> {
        list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn schedule_tx(&self, iface: &Arc<Interface>) {
        if !iface.is_active() || iface.on_tx_list.swap(true, Ordering::SeqCst) {
            return;
        }
        Self::lock_list(&self.tx_schedule).push_back(Arc::clone(iface));
        self.signal.mark_runnable(WORK_TX);
    }

    /// Put an interface back at the head of the TX list without waking the group. Used when the
    /// pending pool is exhausted; the deallocation pass wakes TX once slots free up.
    pub(crate) fn requeue_tx_front(&self, iface: &Arc<Interface>) {
        if !iface.is_active() || iface.on_tx_list.swap(true, Ordering::SeqCst) {
            return;
        }
        Self::lock_list(&self.tx_schedule).push_front(Arc::clone(iface));
    }

    pub(crate) fn pop_tx(&self) -> Option<Arc<Interface>> {
        let mut list = Self::lock_list(&self.tx_schedule);
        let iface = list.pop_front()?;
        iface.on_tx_list.store(false, Ordering::SeqCst);
        Some(iface)
    }

    pub(crate) fn has_tx_work(&self) -> bool {
        !Self::lock_list(&self.tx_schedule).is_empty()
    }

    pub(crate) fn schedule_rx(&self, iface: &Arc<Interface>) {
        if !iface.is_active() || iface.on_rx_list.swap(true, Ordering::SeqCst) {
            return;
        }
        Self::lock_list(&self.rx_schedule).push_back(Arc::clone(iface));
        self.signal.mark_runnable(WORK_RX);
    }

    pub(crate) fn pop_rx(&self) -> Option<Arc<Interface>> {
        let mut list = Self::lock_list(&self.rx_schedule);
        let iface = list.pop_front()?;
        iface.on_rx_list.store(false, Ordering::SeqCst);
        Some(iface)
    }

    pub(crate) fn has_rx_work(&self) -> bool {
        !Self::lock_list(&self.rx_schedule).is_empty()
    }

    /// Forget every scheduled pass and timer that refers to `iface`.
    pub(crate) fn deschedule(&self, iface: &Arc<Interface>) {
        for (list, flag) in [
            (&self.tx_schedule, &iface.on_tx_list),
            (&self.rx_schedule, &iface.on_rx_list),
        ] {
            Self::lock_list(list).retain(|other| !Arc::ptr_eq(other, iface));
            flag.store(false, Ordering::SeqCst);
        }
        self.lock_timers().retain(|timer| {
            timer
                .kind
                .interface()
                .map_or(true, |other| !Arc::ptr_eq(other, iface))
        });
        self.lock_transfer()
            .waiters
            .retain(|other| !Arc::ptr_eq(other, iface));
    }

    fn lock_timers(&self) -> MutexGuard<'_, Vec<Timer>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn arm_timer(&self, deadline: Instant, kind: TimerKind) {
        self.lock_timers().push(Timer { deadline, kind });
        self.signal.timers_changed();
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.lock_timers().iter().map(|timer| timer.deadline).min()
    }

    /// Run every timer due at `now`. Returns how many fired.
    pub(crate) fn fire_timers(&self, now: Instant) -> usize {
        let due: Vec<Timer> = {
            let mut timers = self.lock_timers();
            let (due, pending) = timers.drain(..).partition(|timer| timer.deadline <= now);
            *timers = pending;
            due
        };
        let fired = due.len();
        for timer in due {
            match timer.kind {
                TimerKind::Credit(iface) => {
                    iface.lock_tx().credit_timer_armed = false;
                    self.schedule_tx(&iface);
                }
                TimerKind::RxStall(iface) => self.schedule_rx(&iface),
                TimerKind::TransferRefill => {
                    let waiters = self.lock_transfer().refill();
                    tracing::debug!(group = self.id, waiters = waiters.len(), "transfer pool refilled");
                    for iface in waiters {
                        self.schedule_rx(&iface);
                    }
                }
                TimerKind::UnmapRetry => self.signal.mark_runnable(WORK_DEALLOC),
                TimerKind::CopyBack => {
                    self.copy_back_armed.store(false, Ordering::SeqCst);
                    self.signal.mark_runnable(WORK_DEALLOC);
                }
            }
        }
        fired
    }

    /// Arm the copy-back timer for the oldest outstanding mapping, if any and not yet armed.
    pub(crate) fn arm_copy_back(&self) {
        let Some(after) = self.config().copy_back_after else {
            return;
        };
        let Some(oldest) = self.lock_pool().oldest_mapping() else {
            return;
        };
        if !self.copy_back_armed.swap(true, Ordering::SeqCst) {
            self.arm_timer(oldest + after, TimerKind::CopyBack);
        }
    }

    fn lock_transfer(&self) -> MutexGuard<'_, TransferPool> {
        self.transfer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn transfer_capacity(&self) -> usize {
        self.lock_transfer().capacity()
    }

    /// Take `n` pages for a transfer-mode frame. When the pool is short, `iface` is parked until
    /// the refill timer fires.
    pub(crate) fn reserve_transfer_pages(&self, n: usize, iface: &Arc<Interface>) -> Option<Vec<Arc<Page>>> {
        let mut pool = self.lock_transfer();
        if pool.free.len() >= n {
            let at = pool.free.len() - n;
            return Some(pool.free.split_off(at));
        }
        if !pool.waiters.iter().any(|other| Arc::ptr_eq(other, iface)) {
            pool.waiters.push(Arc::clone(iface));
        }
        if !pool.refill_armed {
            pool.refill_armed = true;
            drop(pool);
            let deadline = self.now() + self.config().transfer_backoff;
            tracing::debug!(group = self.id, iface = %iface.id, "transfer pool exhausted, backing off");
            self.arm_timer(deadline, TimerKind::TransferRefill);
        }
        None
    }

    /// Run the passes named in `bits`. Returns the bits that still have work left because a pass
    /// hit its batch budget.
    pub(crate) fn run(&self, bits: u8) -> u8 {
        let _running = self.run_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut more = 0;
        if bits & WORK_DEALLOC != 0 {
            dealloc::run(self);
        }
        if bits & WORK_TX != 0 && tx::run(self) {
            more |= WORK_TX;
        }
        if bits & WORK_RX != 0 && rx::run(self) {
            more |= WORK_RX;
        }
        more
    }

    /// Fire due timers and run whatever is pending once. Returns `false` when there was nothing
    /// to do.
    pub(crate) fn step(&self) -> bool {
        self.fire_timers(self.now());
        let bits = self.signal.take();
        if bits == 0 {
            return false;
        }
        let more = self.run(bits);
        if more != 0 {
            self.signal.mark_runnable(more);
        }
        true
    }
}

fn worker_loop(group: Arc<WorkerGroup>) {
    tracing::debug!(group = group.id, "worker started");
    loop {
        let timeout = group
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(group.now()));
        if group.signal.wait(timeout) == Wake::Stop {
            break;
        }
        group.step();
    }
    tracing::debug!(group = group.id, "worker stopped");
}

pub(crate) fn spawn_worker(group: Arc<WorkerGroup>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("netback-{}", group.id))
        .spawn(move || worker_loop(group))
}

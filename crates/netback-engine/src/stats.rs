use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one interface's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceStats {
    /// Guest→host frames handed to the host stack.
    pub tx_frames: u64,
    pub tx_bytes: u64,
    /// Guest→host frames answered with an error or drop status.
    pub tx_dropped: u64,
    /// Times the interface was skipped for lack of credit.
    pub tx_credit_deferrals: u64,
    /// Host→guest frames written into guest buffers.
    pub rx_frames: u64,
    pub rx_bytes: u64,
    /// Host→guest frames discarded before reaching the ring.
    pub rx_dropped: u64,
    /// Host→guest frames whose grant operations failed.
    pub rx_errors: u64,
    /// Mapped fragments replaced by private copies because the stack held them too long.
    pub copy_backs: u64,
    pub multicast_groups: u64,
    pub carrier: bool,
    /// Set once a fatal protocol error disabled the interface.
    pub busted: bool,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) tx_frames: AtomicU64,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) tx_dropped: AtomicU64,
    pub(crate) tx_credit_deferrals: AtomicU64,
    pub(crate) rx_frames: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    pub(crate) rx_dropped: AtomicU64,
    pub(crate) rx_errors: AtomicU64,
    pub(crate) copy_backs: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> InterfaceStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        InterfaceStats {
            tx_frames: get(&self.tx_frames),
            tx_bytes: get(&self.tx_bytes),
            tx_dropped: get(&self.tx_dropped),
            tx_credit_deferrals: get(&self.tx_credit_deferrals),
            rx_frames: get(&self.rx_frames),
            rx_bytes: get(&self.rx_bytes),
            rx_dropped: get(&self.rx_dropped),
            rx_errors: get(&self.rx_errors),
            copy_backs: get(&self.copy_backs),
            ..InterfaceStats::default()
        }
    }
}

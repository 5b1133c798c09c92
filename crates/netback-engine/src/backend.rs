use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use netback_grant::{EventChannels, GrantBroker, MapFlags, MapOp};
use netback_ring::{BackRing, SharedRing, RX_RING_SIZE, RX_SLOT_BYTES, TX_SLOT_BYTES};

use crate::clock::{Clock, SystemClock};
use crate::config::{ExecutionModel, NetbackConfig, ETH_HLEN};
use crate::credit::CreditBucket;
use crate::error::{NetbackError, Result, XmitError};
use crate::frame::OutboundFrame;
use crate::group::{spawn_worker, Engine, WorkerGroup};
use crate::interface::{Interface, InterfaceId, InterfaceParams, RxMode};
use crate::stack::HostStack;
use crate::stats::{InterfaceStats, StatsCounters};

/// Upper bound on back-to-back group passes in one [`Netback::run_deferred`] call.
const MAX_DEFERRED_ROUNDS: usize = 1024;

/// The backend: routes interfaces to worker groups and exposes the control and data entry
/// points.
pub struct Netback {
    engine: Arc<Engine>,
    groups: Vec<Arc<WorkerGroup>>,
    interfaces: RwLock<HashMap<InterfaceId, Arc<Interface>>>,
    next_id: AtomicU32,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Netback {
    pub fn new(
        config: NetbackConfig,
        broker: Arc<dyn GrantBroker>,
        events: Arc<dyn EventChannels>,
        stack: Arc<dyn HostStack>,
    ) -> Result<Self> {
        Self::with_clock(config, broker, events, stack, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: NetbackConfig,
        broker: Arc<dyn GrantBroker>,
        events: Arc<dyn EventChannels>,
        stack: Arc<dyn HostStack>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let execution = config.execution;
        let group_count = config.worker_groups;
        let engine = Arc::new(Engine {
            config,
            broker,
            events,
            stack,
            clock,
        });
        let groups: Vec<_> = (0..group_count)
            .map(|id| Arc::new(WorkerGroup::new(id, Arc::clone(&engine))))
            .collect();

        let netback = Self {
            engine,
            groups,
            interfaces: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            workers: Mutex::new(Vec::new()),
        };
        if execution == ExecutionModel::Threaded {
            let mut workers = netback.lock_workers();
            for group in &netback.groups {
                workers.push(spawn_worker(Arc::clone(group))?);
            }
        }
        tracing::info!(groups = group_count, ?execution, "netback started");
        Ok(netback)
    }

    pub fn config(&self) -> &NetbackConfig {
        &self.engine.config
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, id: InterfaceId) -> Option<Arc<Interface>> {
        self.interfaces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn group(&self, iface: &Interface) -> &Arc<WorkerGroup> {
        &self.groups[iface.group]
    }

    /// Map the guest's rings, place the interface in the least-loaded group and bring the
    /// carrier up.
    pub fn connect(&self, params: InterfaceParams) -> Result<InterfaceId> {
        if !params.credit.is_unlimited() && params.credit.window.is_zero() {
            return Err(NetbackError::InvalidParams("credit window must be non-zero"));
        }

        let broker = &self.engine.broker;
        let map = |gref| MapOp {
            dom: params.domid,
            gref,
            flags: MapFlags::empty(),
        };
        let tx_map = broker
            .map(&map(params.tx_ring_ref))
            .map_err(|source| NetbackError::RingMap { ring: "tx", source })?;
        let rx_map = match broker.map(&map(params.rx_ring_ref)) {
            Ok(rx_map) => rx_map,
            Err(source) => {
                if let Err(err) = broker.unmap(tx_map.handle) {
                    tracing::warn!(domid = params.domid, error = %err, "failed to unmap tx ring");
                }
                return Err(NetbackError::RingMap { ring: "rx", source });
            }
        };

        let Some(group) = self.groups.iter().min_by_key(|group| group.members()) else {
            return Err(NetbackError::InvalidParams("no worker groups"));
        };
        let id = InterfaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let credit = CreditBucket::new(
            params.credit,
            self.engine.config.max_frame_bytes as u64,
            self.engine.clock.now(),
        );
        let iface = Arc::new(Interface::new(
            id,
            &params,
            group.id,
            BackRing::attach(SharedRing::new(tx_map.page, TX_SLOT_BYTES)),
            BackRing::attach(SharedRing::new(rx_map.page, RX_SLOT_BYTES)),
            credit,
            [tx_map.handle, rx_map.handle],
        ));
        group.join();
        self.interfaces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Arc::clone(&iface));
        self.engine.events.unmask(iface.port);
        tracing::info!(
            iface = %id,
            domid = params.domid,
            handle = params.handle,
            group = group.id,
            rx_mode = ?params.rx_mode,
            "interface connected"
        );
        // Requests published before the connect completed.
        group.schedule_tx(&iface);
        Ok(id)
    }

    /// Take the interface down and wait for everything in flight to drain, then unmap its
    /// rings. Frames the host stack still holds keep this call waiting.
    pub fn disconnect(&self, id: InterfaceId) -> Result<()> {
        let iface = self
            .interfaces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
            .ok_or(NetbackError::UnknownInterface(id))?;
        let group = Arc::clone(self.group(&iface));

        iface.set_carrier(false);
        group.deschedule(&iface);
        self.engine.events.mask(iface.port);
        iface.purge_rx();
        // A pass already building from this interface finishes under these locks.
        drop(iface.lock_tx());
        drop(iface.lock_rx());

        while !iface.wait_idle(Duration::from_millis(10)) {
            if self.engine.config.execution == ExecutionModel::Deferred {
                for _ in 0..MAX_DEFERRED_ROUNDS {
                    if !group.step() {
                        break;
                    }
                }
            }
            tracing::debug!(iface = %id, refs = iface.refs(), "waiting for in-flight work");
        }

        for handle in iface.ring_handles {
            if let Err(err) = self.engine.broker.unmap(handle) {
                tracing::warn!(iface = %id, error = %err, "failed to unmap ring page");
            }
        }
        group.leave();
        tracing::info!(iface = %id, domid = iface.domid, "interface disconnected");
        Ok(())
    }

    /// The guest signalled its event channel: look for new TX requests and, if frames are
    /// waiting for buffers, for new RX buffers.
    pub fn interrupt(&self, id: InterfaceId) -> Result<()> {
        let iface = self.lookup(id).ok_or(NetbackError::UnknownInterface(id))?;
        if !iface.is_active() {
            return Ok(());
        }
        let group = self.group(&iface);
        group.schedule_tx(&iface);
        if iface.has_queued_rx() {
            group.schedule_rx(&iface);
        }
        Ok(())
    }

    /// Queue a host frame for delivery to the guest.
    pub fn start_xmit(&self, id: InterfaceId, frame: OutboundFrame) -> std::result::Result<(), XmitError> {
        let iface = self.lookup(id).ok_or(XmitError::UnknownInterface(id))?;
        let drop_frame = |err: XmitError| {
            StatsCounters::bump(&iface.stats.rx_dropped);
            tracing::debug!(iface = %id, error = %err, "host frame not queued");
            Err(err)
        };

        if !iface.is_active() {
            return drop_frame(XmitError::CarrierDown(id));
        }
        let fits = frame.slots_needed() <= RX_RING_SIZE
            && match iface.rx_mode {
                RxMode::Copy => true,
                RxMode::Transfer => {
                    frame.data_slots() as usize <= self.group(&iface).transfer_capacity()
                }
            };
        if frame.len() < ETH_HLEN || !fits {
            return drop_frame(XmitError::BadFrame(frame.len()));
        }
        if let Some(dest) = frame.dest_mac() {
            if !iface.accepts_destination(dest) {
                return drop_frame(XmitError::Filtered(id));
            }
        }
        {
            let mut rx = iface.lock_rx();
            if rx.queue.len() >= self.engine.config.rx_queue_frames {
                drop(rx);
                return drop_frame(XmitError::QueueFull(id));
            }
            rx.queue.push_back(frame);
        }
        self.group(&iface).schedule_rx(&iface);
        Ok(())
    }

    /// Run every pending pass of every group until none has work left. Only meaningful with
    /// [`ExecutionModel::Deferred`]; returns the number of group passes run.
    pub fn run_deferred(&self) -> usize {
        let mut passes = 0;
        for _ in 0..MAX_DEFERRED_ROUNDS {
            let mut progressed = false;
            for group in &self.groups {
                if group.step() {
                    passes += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        passes
    }

    pub fn stats(&self, id: InterfaceId) -> Option<InterfaceStats> {
        self.lookup(id).map(|iface| iface.stats())
    }

    /// Worker group an interface was placed in.
    pub fn group_of(&self, id: InterfaceId) -> Option<usize> {
        self.lookup(id).map(|iface| iface.group)
    }

    pub fn interfaces(&self) -> Vec<InterfaceId> {
        let mut ids: Vec<_> = self
            .interfaces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Stop and join the worker threads. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        for group in &self.groups {
            group.signal.stop();
        }
        let workers = std::mem::take(&mut *self.lock_workers());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("netback worker panicked");
            }
        }
    }
}

impl Drop for Netback {
    fn drop(&mut self) {
        self.shutdown();
    }
}

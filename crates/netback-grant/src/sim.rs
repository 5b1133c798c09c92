//! In-process hypervisor model.
//!
//! `SimHypervisor` plays both sides of the grant protocol: guests use the `grant_*` methods to
//! share pages, and the backend uses it as its [`GrantBroker`] and [`EventChannels`]. It enforces
//! the access rules a real grant table enforces (read-only grants, transfer-only grants, revoking
//! a mapped grant) and can inject failures per grant reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::{
    execute, CopyOp, CopyPtr, DomId, EventChannels, EventPort, GrantBroker, GrantError, GrantHandle,
    GrantOp, GrantRef, GrantResult, MapFlags, MapOp, MappedGrant, Page, Result, TransferOp,
};

/// Injected failure for one grant reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the next operation touching the grant, then behave normally.
    Once(GrantError),
    /// Fail every operation touching the grant until cleared.
    Always(GrantError),
}

/// Hypercall counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub multicalls: u64,
    pub maps: u64,
    pub unmaps: u64,
    pub copies: u64,
    pub transfers: u64,
    pub notifies: u64,
    pub notify_batches: u64,
}

#[derive(Default)]
struct Counters {
    multicalls: AtomicU64,
    maps: AtomicU64,
    unmaps: AtomicU64,
    copies: AtomicU64,
    transfers: AtomicU64,
    notifies: AtomicU64,
    notify_batches: AtomicU64,
}

enum Access {
    ReadOnly(Arc<Page>),
    ReadWrite(Arc<Page>),
    Transfer(Option<Arc<Page>>),
}

struct GrantEntry {
    access: Access,
    map_count: u32,
}

#[derive(Default)]
struct Domain {
    grants: HashMap<GrantRef, GrantEntry>,
    next_gref: GrantRef,
}

struct Mapping {
    dom: DomId,
    gref: GrantRef,
}

#[derive(Default)]
struct PortState {
    notifications: u64,
    masked: bool,
}

#[derive(Default)]
struct State {
    domains: HashMap<DomId, Domain>,
    mappings: HashMap<GrantHandle, Mapping>,
    next_handle: u32,
    faults: HashMap<(DomId, GrantRef), Fault>,
    ports: HashMap<EventPort, PortState>,
    next_port: u32,
}

impl State {
    fn check_fault(&mut self, dom: DomId, gref: GrantRef) -> Result<()> {
        match self.faults.get(&(dom, gref)).copied() {
            None => Ok(()),
            Some(Fault::Always(err)) => Err(err),
            Some(Fault::Once(err)) => {
                self.faults.remove(&(dom, gref));
                Err(err)
            }
        }
    }

    fn entry(&mut self, dom: DomId, gref: GrantRef) -> Result<&mut GrantEntry> {
        self.domains
            .get_mut(&dom)
            .ok_or(GrantError::BadDomain)?
            .grants
            .get_mut(&gref)
            .ok_or(GrantError::BadGrantRef)
    }

    fn readable(&mut self, dom: DomId, gref: GrantRef) -> Result<Arc<Page>> {
        self.check_fault(dom, gref)?;
        match &self.entry(dom, gref)?.access {
            Access::ReadOnly(page) | Access::ReadWrite(page) => Ok(page.clone()),
            Access::Transfer(_) => Err(GrantError::BadGrantRef),
        }
    }

    fn writable(&mut self, dom: DomId, gref: GrantRef) -> Result<Arc<Page>> {
        self.check_fault(dom, gref)?;
        match &self.entry(dom, gref)?.access {
            Access::ReadWrite(page) => Ok(page.clone()),
            Access::ReadOnly(_) => Err(GrantError::PermissionDenied),
            Access::Transfer(_) => Err(GrantError::BadGrantRef),
        }
    }
}

#[derive(Default)]
pub struct SimHypervisor {
    state: Mutex<State>,
    counters: Counters,
}

impl SimHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, dom: DomId, access: Access) -> GrantRef {
        let mut state = self.lock();
        let domain = state.domains.entry(dom).or_default();
        // Grant reference 0 is reserved by convention.
        domain.next_gref += 1;
        let gref = domain.next_gref;
        domain.grants.insert(
            gref,
            GrantEntry {
                access,
                map_count: 0,
            },
        );
        gref
    }

    /// Guest side: share `page` with the backend.
    pub fn grant_access(&self, dom: DomId, page: Arc<Page>, readonly: bool) -> GrantRef {
        let access = if readonly {
            Access::ReadOnly(page)
        } else {
            Access::ReadWrite(page)
        };
        self.insert(dom, access)
    }

    /// Guest side: offer a slot the backend may transfer a page into.
    pub fn grant_transfer(&self, dom: DomId) -> GrantRef {
        self.insert(dom, Access::Transfer(None))
    }

    /// Guest side: revoke a grant. Fails while the backend still has it mapped.
    pub fn end_access(&self, dom: DomId, gref: GrantRef) -> Result<()> {
        let mut state = self.lock();
        let entry = state.entry(dom, gref)?;
        if entry.map_count > 0 {
            return Err(GrantError::PermissionDenied);
        }
        state
            .domains
            .get_mut(&dom)
            .map(|domain| domain.grants.remove(&gref));
        Ok(())
    }

    /// Guest side: collect a page transferred into a transfer grant, revoking the grant.
    pub fn take_transferred(&self, dom: DomId, gref: GrantRef) -> Option<Arc<Page>> {
        let mut state = self.lock();
        let domain = state.domains.get_mut(&dom)?;
        match domain.grants.get(&gref).map(|entry| &entry.access) {
            Some(Access::Transfer(Some(_))) => {}
            _ => return None,
        }
        match domain.grants.remove(&gref)?.access {
            Access::Transfer(page) => page,
            _ => None,
        }
    }

    pub fn map_count(&self, dom: DomId, gref: GrantRef) -> u32 {
        self.lock()
            .entry(dom, gref)
            .map(|entry| entry.map_count)
            .unwrap_or(0)
    }

    /// Number of live backend mappings across all domains.
    pub fn active_mappings(&self) -> usize {
        self.lock().mappings.len()
    }

    pub fn inject_fault(&self, dom: DomId, gref: GrantRef, fault: Fault) {
        self.lock().faults.insert((dom, gref), fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Allocate an event channel for `dom`.
    pub fn bind_port(&self, dom: DomId) -> EventPort {
        let mut state = self.lock();
        state.next_port += 1;
        let port = EventPort(state.next_port);
        state.ports.insert(port, PortState::default());
        trace!(dom, port = port.0, "bound event channel");
        port
    }

    /// Notifications the backend has delivered on `port`.
    pub fn notifications(&self, port: EventPort) -> u64 {
        self.lock()
            .ports
            .get(&port)
            .map(|p| p.notifications)
            .unwrap_or(0)
    }

    pub fn is_masked(&self, port: EventPort) -> bool {
        self.lock().ports.get(&port).is_some_and(|p| p.masked)
    }

    pub fn stats(&self) -> SimStats {
        let c = &self.counters;
        SimStats {
            multicalls: c.multicalls.load(Ordering::Relaxed),
            maps: c.maps.load(Ordering::Relaxed),
            unmaps: c.unmaps.load(Ordering::Relaxed),
            copies: c.copies.load(Ordering::Relaxed),
            transfers: c.transfers.load(Ordering::Relaxed),
            notifies: c.notifies.load(Ordering::Relaxed),
            notify_batches: c.notify_batches.load(Ordering::Relaxed),
        }
    }
}

impl GrantBroker for SimHypervisor {
    fn map(&self, op: &MapOp) -> Result<MappedGrant> {
        self.counters.maps.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        let page = if op.flags.contains(MapFlags::READONLY) {
            state.readable(op.dom, op.gref)?
        } else {
            state.writable(op.dom, op.gref)?
        };
        state.entry(op.dom, op.gref)?.map_count += 1;
        state.next_handle += 1;
        let handle = GrantHandle(state.next_handle);
        state.mappings.insert(
            handle,
            Mapping {
                dom: op.dom,
                gref: op.gref,
            },
        );
        Ok(MappedGrant {
            handle,
            page,
            dom: op.dom,
            gref: op.gref,
        })
    }

    fn unmap(&self, handle: GrantHandle) -> Result<()> {
        self.counters.unmaps.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        let mapping = state.mappings.get(&handle).ok_or(GrantError::BadHandle)?;
        let (dom, gref) = (mapping.dom, mapping.gref);
        state.check_fault(dom, gref)?;
        state.mappings.remove(&handle);
        if let Ok(entry) = state.entry(dom, gref) {
            entry.map_count = entry.map_count.saturating_sub(1);
        }
        Ok(())
    }

    fn copy(&self, op: &CopyOp) -> Result<()> {
        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        op.check_bounds()?;
        let (src, dst) = {
            let mut state = self.lock();
            let src = match &op.source {
                CopyPtr::Grant { dom, gref, .. } => state.readable(*dom, *gref)?,
                CopyPtr::Local { page, .. } => page.clone(),
            };
            let dst = match &op.dest {
                CopyPtr::Grant { dom, gref, .. } => state.writable(*dom, *gref)?,
                CopyPtr::Local { page, .. } => page.clone(),
            };
            (src, dst)
        };
        dst.copy_from(
            usize::from(op.dest.offset()),
            &src,
            usize::from(op.source.offset()),
            usize::from(op.len),
        );
        Ok(())
    }

    fn transfer(&self, op: &TransferOp) -> Result<()> {
        self.counters.transfers.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state.check_fault(op.dom, op.gref)?;
        let entry = state.entry(op.dom, op.gref)?;
        match &mut entry.access {
            Access::Transfer(slot @ None) => {
                *slot = Some(op.page.clone());
                Ok(())
            }
            _ => Err(GrantError::BadGrantRef),
        }
    }

    fn multicall(&self, ops: Vec<GrantOp>) -> Vec<GrantResult> {
        self.counters.multicalls.fetch_add(1, Ordering::Relaxed);
        ops.into_iter().map(|op| execute(self, op)).collect()
    }
}

impl EventChannels for SimHypervisor {
    fn notify(&self, port: EventPort) {
        self.counters.notifies.fetch_add(1, Ordering::Relaxed);
        if let Some(state) = self.lock().ports.get_mut(&port) {
            state.notifications += 1;
        }
    }

    fn notify_batch(&self, ports: &[EventPort]) {
        self.counters.notify_batches.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        for port in ports {
            if let Some(port) = state.ports.get_mut(port) {
                port.notifications += 1;
            }
        }
    }

    fn mask(&self, port: EventPort) {
        if let Some(state) = self.lock().ports.get_mut(&port) {
            state.masked = true;
        }
    }

    fn unmask(&self, port: EventPort) {
        if let Some(state) = self.lock().ports.get_mut(&port) {
            state.masked = false;
        }
    }
}

//! Grant-table access for a network backend.
//!
//! A guest names each page it is willing to share with a `(domain, grant reference)` pair. The
//! backend never touches guest memory directly: it asks a [`GrantBroker`] to map, copy or transfer
//! pages, normally in batches built with [`Multicall`]. [`SimHypervisor`] is an in-process broker
//! that models the guest side for tests and the simulator.

#![forbid(unsafe_code)]

pub mod error;
pub mod event;
pub mod multicall;
pub mod page;
pub mod sim;

use std::sync::Arc;

use bitflags::bitflags;

pub use error::{GrantError, Result};
pub use event::{EventChannels, EventPort};
pub use multicall::{Multicall, MulticallResults, OpIndex};
pub use page::Page;
pub use sim::{Fault, SimHypervisor, SimStats};

pub const PAGE_SIZE: usize = 4096;

/// Domain identifier. Domain 0 is the privileged domain hosting the backend.
pub type DomId = u16;

/// Guest-issued capability naming one page.
pub type GrantRef = u32;

/// Opaque token returned by a successful map; required to unmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantHandle(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Map without write access. Required for grants the guest shared read-only.
        const READONLY = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOp {
    pub dom: DomId,
    pub gref: GrantRef,
    pub flags: MapFlags,
}

#[derive(Debug, Clone)]
pub struct MappedGrant {
    pub handle: GrantHandle,
    pub page: Arc<Page>,
    pub dom: DomId,
    pub gref: GrantRef,
}

/// One end of a copy operation.
#[derive(Debug, Clone)]
pub enum CopyPtr {
    Grant {
        dom: DomId,
        gref: GrantRef,
        offset: u16,
    },
    Local {
        page: Arc<Page>,
        offset: u16,
    },
}

impl CopyPtr {
    pub fn offset(&self) -> u16 {
        match self {
            CopyPtr::Grant { offset, .. } | CopyPtr::Local { offset, .. } => *offset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopyOp {
    pub source: CopyPtr,
    pub dest: CopyPtr,
    pub len: u16,
}

impl CopyOp {
    /// Copies may not cross a page boundary on either side.
    pub fn check_bounds(&self) -> Result<()> {
        let len = usize::from(self.len);
        for ptr in [&self.source, &self.dest] {
            if usize::from(ptr.offset()) + len > PAGE_SIZE {
                return Err(GrantError::BadCopyArg);
            }
        }
        Ok(())
    }
}

/// Hand a backend-owned page to a guest that offered a transfer grant.
///
/// On success ownership of `page` moves to the guest; the backend must not touch it again.
#[derive(Debug, Clone)]
pub struct TransferOp {
    pub page: Arc<Page>,
    pub dom: DomId,
    pub gref: GrantRef,
}

#[derive(Debug, Clone)]
pub enum GrantOp {
    Map(MapOp),
    Unmap(GrantHandle),
    Copy(CopyOp),
    Transfer(TransferOp),
}

#[derive(Debug, Clone)]
pub enum GrantOutput {
    Mapped(MappedGrant),
    Unmapped,
    Copied,
    Transferred,
}

pub type GrantResult = Result<GrantOutput>;

/// The privileged grant interface.
///
/// Single-operation methods are the primitives; [`GrantBroker::multicall`] submits a batch as a
/// single privileged call and reports one status per entry, in order.
pub trait GrantBroker: Send + Sync {
    fn map(&self, op: &MapOp) -> Result<MappedGrant>;

    fn unmap(&self, handle: GrantHandle) -> Result<()>;

    fn copy(&self, op: &CopyOp) -> Result<()>;

    fn transfer(&self, op: &TransferOp) -> Result<()>;

    fn multicall(&self, ops: Vec<GrantOp>) -> Vec<GrantResult> {
        ops.into_iter().map(|op| execute(self, op)).collect()
    }
}

/// Run one batched entry against the broker's single-operation primitives.
pub fn execute<B: GrantBroker + ?Sized>(broker: &B, op: GrantOp) -> GrantResult {
    match op {
        GrantOp::Map(op) => broker.map(&op).map(GrantOutput::Mapped),
        GrantOp::Unmap(handle) => broker.unmap(handle).map(|()| GrantOutput::Unmapped),
        GrantOp::Copy(op) => broker.copy(&op).map(|()| GrantOutput::Copied),
        GrantOp::Transfer(op) => broker.transfer(&op).map(|()| GrantOutput::Transferred),
    }
}

impl<T: GrantBroker + ?Sized> GrantBroker for Arc<T> {
    fn map(&self, op: &MapOp) -> Result<MappedGrant> {
        <T as GrantBroker>::map(&**self, op)
    }

    fn unmap(&self, handle: GrantHandle) -> Result<()> {
        <T as GrantBroker>::unmap(&**self, handle)
    }

    fn copy(&self, op: &CopyOp) -> Result<()> {
        <T as GrantBroker>::copy(&**self, op)
    }

    fn transfer(&self, op: &TransferOp) -> Result<()> {
        <T as GrantBroker>::transfer(&**self, op)
    }

    fn multicall(&self, ops: Vec<GrantOp>) -> Vec<GrantResult> {
        <T as GrantBroker>::multicall(&**self, ops)
    }
}

impl<T: GrantBroker + ?Sized> GrantBroker for Box<T> {
    fn map(&self, op: &MapOp) -> Result<MappedGrant> {
        <T as GrantBroker>::map(&**self, op)
    }

    fn unmap(&self, handle: GrantHandle) -> Result<()> {
        <T as GrantBroker>::unmap(&**self, handle)
    }

    fn copy(&self, op: &CopyOp) -> Result<()> {
        <T as GrantBroker>::copy(&**self, op)
    }

    fn transfer(&self, op: &TransferOp) -> Result<()> {
        <T as GrantBroker>::transfer(&**self, op)
    }

    fn multicall(&self, ops: Vec<GrantOp>) -> Vec<GrantResult> {
        <T as GrantBroker>::multicall(&**self, ops)
    }
}

//! Backend half of a split virtual network device.
//!
//! Guests exchange frames with the backend through two shared rings per interface. Guest→host
//! (TX) frames are pulled off the TX ring, copied or mapped through the grant broker and handed
//! to a [`HostStack`]; host→guest (RX) frames offered through [`Netback::start_xmit`] are written
//! into buffers the guest posted on its RX ring. Interfaces are spread over worker groups, each
//! with its own pending pool, schedule lists and timers.
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//!
//! use netback_engine::{HostFrame, InterfaceParams, Netback, NetbackConfig};
//! use netback_grant::SimHypervisor;
//!
//! let hv = Arc::new(SimHypervisor::new());
//! let stack = Arc::new(Mutex::new(Vec::<HostFrame>::new()));
//! let netback = Netback::new(NetbackConfig::default(), hv.clone(), hv.clone(), stack)?;
//! # let (tx_ring_ref, rx_ring_ref) = (1, 2);
//! let port = hv.bind_port(1);
//! let vif = netback.connect(InterfaceParams::new(1, tx_ring_ref, rx_ring_ref, port))?;
//! netback.interrupt(vif)?;
//! # Ok::<(), netback_engine::NetbackError>(())
//! ```

#![forbid(unsafe_code)]

mod backend;
pub mod clock;
pub mod config;
pub mod credit;
mod dealloc;
pub mod error;
mod frame;
mod group;
mod interface;
mod notify;
pub mod offload;
pub mod pool;
mod responses;
mod rx;
mod stack;
mod stats;
mod tx;

pub use backend::Netback;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ExecutionModel, NetbackConfig, TxCopyMode};
pub use credit::{Admission, CreditBucket, CreditLimit, CreditState};
pub use error::{ConfigError, FrameError, NetbackError, ProtocolError, Result, XmitError};
pub use frame::{ChecksumState, GsoInfo, GsoKind, HostFrame, OutboundFrame};
pub use interface::{InterfaceId, InterfaceParams, RxMode, MAX_MULTICAST_GROUPS};
pub use stack::HostStack;
pub use stats::InterfaceStats;

use netback_grant::GrantError;
use netback_ring::RingError;
use thiserror::Error;

use crate::interface::InterfaceId;
use crate::offload::OffloadError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Guest misbehaviour that permanently disables an interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error("request at offset {offset} with size {size} crosses a page boundary")]
    CrossesPage { offset: u16, size: usize },
    #[error("frame spans {slots} slots, limit is {max}")]
    TooManySlots { slots: usize, max: usize },
    #[error("more than {max} extra-info records")]
    TooManyExtras { max: usize },
    #[error("invalid extra-info type {0}")]
    BadExtraType(u8),
    #[error("request chain runs past the {available} published requests")]
    Truncated { available: u32 },
    #[error("segmentation offload with zero segment size")]
    ZeroGsoSize,
}

/// A single frame that cannot be delivered. The interface keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes is shorter than an Ethernet header")]
    TooShort { size: usize },
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("slot of {slot} bytes exceeds the {remaining} bytes left in the frame")]
    SizeMismatch { slot: usize, remaining: usize },
    #[error("segment at offset {offset} with length {len} does not fit in a page")]
    SegmentOutOfPage { offset: usize, len: usize },
    #[error("unsupported segmentation offload type {0}")]
    UnsupportedGso(u8),
    #[error("checksum offload: {0}")]
    Offload(#[from] OffloadError),
    #[error("grant operation failed: {0}")]
    Grant(#[from] GrantError),
}

#[derive(Debug, Error)]
pub enum NetbackError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown interface {0}")]
    UnknownInterface(InterfaceId),
    #[error("failed to map {ring} ring page: {source}")]
    RingMap {
        ring: &'static str,
        #[source]
        source: GrantError,
    },
    #[error("invalid interface parameters: {0}")]
    InvalidParams(&'static str),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a host→guest frame was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum XmitError {
    #[error("unknown interface {0}")]
    UnknownInterface(InterfaceId),
    #[error("interface {0} carrier is down")]
    CarrierDown(InterfaceId),
    #[error("interface {0} receive queue is full")]
    QueueFull(InterfaceId),
    #[error("interface {0} is not subscribed to the destination multicast group")]
    Filtered(InterfaceId),
    #[error("frame of {0} bytes cannot be delivered")]
    BadFrame(usize),
}

pub type Result<T> = std::result::Result<T, NetbackError>;

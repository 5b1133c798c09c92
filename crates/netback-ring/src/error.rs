use thiserror::Error;

/// Cursor states no well-behaved guest can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("request producer {prod} is {pending} slots ahead of consumer {cons}, ring holds {size}")]
    RequestOverflow {
        prod: u32,
        cons: u32,
        pending: u32,
        size: u32,
    },
    #[error("response producer {prod} is {pending} slots ahead of consumer {cons}, ring holds {size}")]
    ResponseOverflow {
        prod: u32,
        cons: u32,
        pending: u32,
        size: u32,
    },
}

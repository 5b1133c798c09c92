//! Shared ring page layout.
//!
//! A ring occupies exactly one guest page: a 64-byte header of event counters followed by a
//! power-of-two array of fixed-size slots. Requests and responses share the slot array; the
//! backend overwrites a consumed request's slot with its response.

use netback_grant::PAGE_SIZE;

/// Byte offsets of the header counters within the ring page.
pub mod header {
    pub const REQ_PROD: usize = 0;
    pub const REQ_EVENT: usize = 4;
    pub const RSP_PROD: usize = 8;
    pub const RSP_EVENT: usize = 12;
    pub const BYTES: usize = 64;
}

/// TX slots hold a 12-byte request, a 4-byte response or an 8-byte extra-info record.
pub const TX_SLOT_BYTES: usize = 12;

/// RX slots hold an 8-byte request, response or extra-info record.
pub const RX_SLOT_BYTES: usize = 8;

/// Number of slots in a ring with `slot_bytes` wide entries: the largest power of two that fits
/// after the header.
pub const fn ring_entries(slot_bytes: usize) -> u32 {
    let fit = (PAGE_SIZE - header::BYTES) / slot_bytes;
    let mut n = 1usize;
    while n * 2 <= fit {
        n *= 2;
    }
    n as u32
}

pub const TX_RING_SIZE: u32 = ring_entries(TX_SLOT_BYTES);
pub const RX_RING_SIZE: u32 = ring_entries(RX_SLOT_BYTES);

/// Response status codes.
pub mod status {
    /// Frame discarded without being looked at.
    pub const DROPPED: i16 = -2;
    pub const ERROR: i16 = -1;
    pub const OKAY: i16 = 0;
    /// Answer to a slot that carried extra-info rather than data.
    pub const NULL: i16 = 1;
}

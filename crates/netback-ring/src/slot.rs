//! Bit-exact ring records.
//!
//! All multi-byte fields are little-endian. Field offsets are part of the guest ABI.

use bitflags::bitflags;
use netback_grant::GrantRef;

/// A fixed-size record that can be stored in a ring slot.
pub trait RingRecord: Copy {
    const BYTES: usize;

    fn decode(bytes: &[u8]) -> Self;

    fn encode(&self, out: &mut [u8]);
}

bitflags! {
    /// Flags on a guest→backend (TX) request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxFlags: u16 {
        /// Transport checksum is blank and must be filled in downstream.
        const CSUM_BLANK = 1 << 0;
        /// Payload is known good; no checksum validation needed.
        const DATA_VALIDATED = 1 << 1;
        /// Another data slot of the same frame follows.
        const MORE_DATA = 1 << 2;
        /// Extra-info records follow this request.
        const EXTRA_INFO = 1 << 3;
    }
}

bitflags! {
    /// Flags on a backend→guest (RX) response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RxFlags: u16 {
        const DATA_VALIDATED = 1 << 0;
        const CSUM_BLANK = 1 << 1;
        const MORE_DATA = 1 << 2;
        const EXTRA_INFO = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExtraFlags: u8 {
        /// Another extra-info record follows.
        const MORE = 1 << 0;
    }
}

/// Extra-info record types.
pub mod extra_type {
    pub const NONE: u8 = 0;
    pub const GSO: u8 = 1;
    pub const MCAST_ADD: u8 = 2;
    pub const MCAST_DEL: u8 = 3;
    pub const HASH: u8 = 4;
    pub const MAX: u8 = 5;
}

/// Segmentation offload types carried in a GSO extra.
pub mod gso_type {
    pub const NONE: u8 = 0;
    pub const TCPV4: u8 = 1;
    pub const TCPV6: u8 = 2;
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxRequest {
    pub gref: GrantRef,
    pub offset: u16,
    pub flags: TxFlags,
    pub id: u16,
    /// On the first slot of a frame: the whole frame's length. Otherwise: this slot's length.
    pub size: u16,
}

impl RingRecord for TxRequest {
    const BYTES: usize = 12;

    fn decode(b: &[u8]) -> Self {
        Self {
            gref: u32_at(b, 0),
            offset: u16_at(b, 4),
            flags: TxFlags::from_bits_retain(u16_at(b, 6)),
            id: u16_at(b, 8),
            size: u16_at(b, 10),
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.gref.to_le_bytes());
        out[4..6].copy_from_slice(&self.offset.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..10].copy_from_slice(&self.id.to_le_bytes());
        out[10..12].copy_from_slice(&self.size.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxResponse {
    pub id: u16,
    pub status: i16,
}

impl RingRecord for TxResponse {
    const BYTES: usize = 4;

    fn decode(b: &[u8]) -> Self {
        Self {
            id: u16_at(b, 0),
            status: u16_at(b, 2) as i16,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2..4].copy_from_slice(&self.status.to_le_bytes());
    }
}

/// Extra-info record. The 6-byte payload is interpreted according to `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtraInfo {
    pub kind: u8,
    pub flags: ExtraFlags,
    pub payload: [u8; 6],
}

/// Decoded GSO extra payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsoExtra {
    pub size: u16,
    pub gso_type: u8,
    pub features: u16,
}

impl ExtraInfo {
    pub fn gso(size: u16, gso_type: u8) -> Self {
        let mut payload = [0u8; 6];
        payload[0..2].copy_from_slice(&size.to_le_bytes());
        payload[2] = gso_type;
        Self {
            kind: extra_type::GSO,
            flags: ExtraFlags::empty(),
            payload,
        }
    }

    pub fn mcast_add(addr: [u8; 6]) -> Self {
        Self {
            kind: extra_type::MCAST_ADD,
            flags: ExtraFlags::empty(),
            payload: addr,
        }
    }

    pub fn mcast_del(addr: [u8; 6]) -> Self {
        Self {
            kind: extra_type::MCAST_DEL,
            flags: ExtraFlags::empty(),
            payload: addr,
        }
    }

    pub fn with_more(mut self) -> Self {
        self.flags |= ExtraFlags::MORE;
        self
    }

    pub fn as_gso(&self) -> Option<GsoExtra> {
        (self.kind == extra_type::GSO).then(|| GsoExtra {
            size: u16_at(&self.payload, 0),
            gso_type: self.payload[2],
            features: u16_at(&self.payload, 4),
        })
    }

    pub fn mcast_addr(&self) -> Option<[u8; 6]> {
        matches!(self.kind, extra_type::MCAST_ADD | extra_type::MCAST_DEL).then_some(self.payload)
    }
}

impl RingRecord for ExtraInfo {
    const BYTES: usize = 8;

    fn decode(b: &[u8]) -> Self {
        let mut payload = [0u8; 6];
        payload.copy_from_slice(&b[2..8]);
        Self {
            kind: b[0],
            flags: ExtraFlags::from_bits_retain(b[1]),
            payload,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.kind;
        out[1] = self.flags.bits();
        out[2..8].copy_from_slice(&self.payload);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxRequest {
    pub id: u16,
    pub gref: GrantRef,
}

impl RingRecord for RxRequest {
    const BYTES: usize = 8;

    fn decode(b: &[u8]) -> Self {
        Self {
            id: u16_at(b, 0),
            gref: u32_at(b, 4),
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2..4].fill(0);
        out[4..8].copy_from_slice(&self.gref.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxResponse {
    pub id: u16,
    pub offset: u16,
    pub flags: RxFlags,
    /// Byte count when non-negative, otherwise an error status.
    pub status: i16,
}

impl RingRecord for RxResponse {
    const BYTES: usize = 8;

    fn decode(b: &[u8]) -> Self {
        Self {
            id: u16_at(b, 0),
            offset: u16_at(b, 2),
            flags: RxFlags::from_bits_retain(u16_at(b, 4)),
            status: u16_at(b, 6) as i16,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..6].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[6..8].copy_from_slice(&self.status.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_request_field_offsets() {
        let req = TxRequest {
            gref: 0x0403_0201,
            offset: 0x0605,
            flags: TxFlags::MORE_DATA | TxFlags::CSUM_BLANK,
            id: 0x0A09,
            size: 0x0C0B,
        };
        let mut bytes = [0u8; 12];
        req.encode(&mut bytes);
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 0x05, 0x00, 9, 10, 11, 12]);
    }

    #[test]
    fn negative_status_is_twos_complement() {
        let mut bytes = [0u8; 4];
        TxResponse { id: 3, status: -1 }.encode(&mut bytes);
        assert_eq!(bytes, [3, 0, 0xFF, 0xFF]);
        assert_eq!(TxResponse::decode(&bytes).status, -1);
    }

    #[test]
    fn gso_extra_layout() {
        let mut bytes = [0u8; 8];
        ExtraInfo::gso(1448, gso_type::TCPV4).with_more().encode(&mut bytes);
        assert_eq!(bytes, [1, 1, 0xA8, 0x05, 1, 0, 0, 0]);

        let gso = ExtraInfo::decode(&bytes).as_gso().expect("gso extra");
        assert_eq!(gso.size, 1448);
        assert_eq!(gso.gso_type, gso_type::TCPV4);
    }

    #[test]
    fn rx_response_layout() {
        let rsp = RxResponse {
            id: 0x0201,
            offset: 0,
            flags: RxFlags::MORE_DATA,
            status: 1514,
        };
        let mut bytes = [0u8; 8];
        rsp.encode(&mut bytes);
        assert_eq!(bytes, [1, 2, 0, 0, 4, 0, 0xEA, 0x05]);
    }

    #[test]
    fn unknown_flag_bits_survive_decoding() {
        let mut bytes = [0u8; 12];
        bytes[6] = 0xF0;
        let req = TxRequest::decode(&bytes);
        assert_eq!(req.flags.bits(), 0xF0);
        assert!(!req.flags.contains(TxFlags::MORE_DATA));
    }
}

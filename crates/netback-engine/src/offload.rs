//! Transport checksum helpers for guests that transmit with a blank checksum.
//!
//! Only what the data path needs: find where the L4 checksum lives so the host stack can finish
//! it, or finish it here when the stack cannot.

use thiserror::Error;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Bytes of a frame that always cover the headers [`locate_checksum`] inspects.
pub const HEADER_PEEK_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OffloadError {
    #[error("packet too short")]
    PacketTooShort,
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEthertype(u16),
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),
    #[error("unsupported L4 protocol {0}")]
    UnsupportedL4Protocol(u8),
    #[error("IPv4 fragment cannot carry a partial checksum")]
    Fragmented,
}

/// Where a partial transport checksum must be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumLocation {
    /// Offset of the L4 header from the start of the frame.
    pub start: u16,
    /// Offset of the checksum field from `start`.
    pub offset: u16,
}

struct L3 {
    l4_offset: usize,
    /// End of the IP payload within the frame.
    end: usize,
    protocol: u8,
    pseudo: Pseudo,
}

enum Pseudo {
    V4 { src: [u8; 4], dst: [u8; 4] },
    V6 { src: [u8; 16], dst: [u8; 16] },
}

fn parse_ethernet(packet: &[u8]) -> Result<(usize, u16), OffloadError> {
    if packet.len() < 14 {
        return Err(OffloadError::PacketTooShort);
    }
    let mut offset = 12;
    let mut ethertype = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        offset += 4;
        if packet.len() < offset + 2 {
            return Err(OffloadError::PacketTooShort);
        }
        ethertype = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
    }
    Ok((offset + 2, ethertype))
}

fn parse_l3(packet: &[u8]) -> Result<L3, OffloadError> {
    let (l3, ethertype) = parse_ethernet(packet)?;
    let buf = &packet[l3..];
    match ethertype {
        ETHERTYPE_IPV4 => {
            if buf.len() < 20 {
                return Err(OffloadError::PacketTooShort);
            }
            let version = buf[0] >> 4;
            if version != 4 {
                return Err(OffloadError::UnsupportedIpVersion(version));
            }
            let ihl = usize::from(buf[0] & 0x0F) * 4;
            if ihl < 20 || buf.len() < ihl {
                return Err(OffloadError::PacketTooShort);
            }
            let frag = u16::from_be_bytes([buf[6], buf[7]]);
            if frag & 0x3FFF != 0 {
                return Err(OffloadError::Fragmented);
            }
            let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
            Ok(L3 {
                l4_offset: l3 + ihl,
                end: l3 + total_len.max(ihl),
                protocol: buf[9],
                pseudo: Pseudo::V4 {
                    src: [buf[12], buf[13], buf[14], buf[15]],
                    dst: [buf[16], buf[17], buf[18], buf[19]],
                },
            })
        }
        ETHERTYPE_IPV6 => {
            if buf.len() < 40 {
                return Err(OffloadError::PacketTooShort);
            }
            let version = buf[0] >> 4;
            if version != 6 {
                return Err(OffloadError::UnsupportedIpVersion(version));
            }
            let payload_len = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&buf[8..24]);
            dst.copy_from_slice(&buf[24..40]);
            Ok(L3 {
                l4_offset: l3 + 40,
                end: l3 + 40 + payload_len,
                protocol: buf[6],
                pseudo: Pseudo::V6 { src, dst },
            })
        }
        other => Err(OffloadError::UnsupportedEthertype(other)),
    }
}

fn checksum_field(protocol: u8) -> Result<u16, OffloadError> {
    match protocol {
        IPPROTO_TCP => Ok(16),
        IPPROTO_UDP => Ok(6),
        other => Err(OffloadError::UnsupportedL4Protocol(other)),
    }
}

/// Find the transport checksum of a `frame_len`-byte frame whose leading bytes are `headers`.
///
/// The IP payload and the checksum field must both lie inside the frame.
pub fn locate_checksum(headers: &[u8], frame_len: usize) -> Result<ChecksumLocation, OffloadError> {
    let l3 = parse_l3(headers)?;
    let offset = checksum_field(l3.protocol)?;
    let field_end = l3.l4_offset + usize::from(offset) + 2;
    if l3.end > frame_len || field_end > l3.end {
        return Err(OffloadError::PacketTooShort);
    }
    let start = u16::try_from(l3.l4_offset).map_err(|_| OffloadError::PacketTooShort)?;
    Ok(ChecksumLocation { start, offset })
}

/// Compute and store the full transport checksum (pseudo-header included).
pub fn complete_checksum(packet: &mut [u8]) -> Result<(), OffloadError> {
    let l3 = parse_l3(packet)?;
    let field = l3.l4_offset + usize::from(checksum_field(l3.protocol)?);
    if l3.end > packet.len() || field + 2 > l3.end {
        return Err(OffloadError::PacketTooShort);
    }

    packet[field..field + 2].fill(0);
    let segment = &packet[l3.l4_offset..l3.end];
    let mut csum = transport_checksum(&l3.pseudo, l3.protocol, segment);
    if l3.protocol == IPPROTO_UDP && csum == 0 {
        csum = 0xFFFF;
    }
    packet[field..field + 2].copy_from_slice(&csum.to_be_bytes());
    Ok(())
}

fn transport_checksum(pseudo: &Pseudo, protocol: u8, segment: &[u8]) -> u16 {
    let len = segment.len() as u32;
    let mut sum: u32 = 0;
    match pseudo {
        Pseudo::V4 { src, dst } => {
            sum = checksum_sum_u16_words(src, sum);
            sum = checksum_sum_u16_words(dst, sum);
        }
        Pseudo::V6 { src, dst } => {
            sum = checksum_sum_u16_words(src, sum);
            sum = checksum_sum_u16_words(dst, sum);
            sum += len >> 16;
        }
    }
    sum += u32::from(protocol);
    sum += len & 0xFFFF;
    sum = checksum_sum_u16_words(segment, sum);
    fold_checksum_sum(sum)
}

fn fold_checksum_sum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn checksum_sum_u16_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        // Fold early so very long segments cannot overflow the accumulator.
        if sum > 0xFFFF_0000 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += u32::from(last) << 8;
    }
    sum
}

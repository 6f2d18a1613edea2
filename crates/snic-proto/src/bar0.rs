//! BAR0 configuration block.
//!
//! BAR0 carries the static NIC identity the driver reads at probe time:
//! a magic word, the two MAC addresses (each padded to 8 bytes by a
//! reserved word) and the two tunnel endpoints. The MAC fields are stored
//! byte-reversed relative to canonical transmission order, and the same
//! reversing copy is applied in both directions.

use std::net::Ipv4Addr;

pub const MAGIC: u32 = 0x0123_4567;

/// Encoded size of the config block.
pub const BAR0_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar0 {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
}

impl Bar0 {
    /// Decodes the block; the MAC fields come back in canonical order.
    pub fn decode(b: &[u8]) -> Option<Bar0> {
        if b.len() < BAR0_SIZE {
            return None;
        }
        if u32::from_le_bytes(b[0..4].try_into().unwrap()) != MAGIC {
            return None;
        }
        Some(Bar0 {
            // Each MAC is followed by a 2-byte reserved word (10..12 and
            // 18..20).
            dst_mac: reverse_mac(b[4..10].try_into().unwrap()),
            src_mac: reverse_mac(b[12..18].try_into().unwrap()),
            // The IP fields are big-endian on the wire.
            src_ip: Ipv4Addr::from(u32::from_be_bytes(b[20..24].try_into().unwrap())),
            dst_ip: Ipv4Addr::from(u32::from_be_bytes(b[24..28].try_into().unwrap())),
        })
    }

    pub fn encode(&self) -> [u8; BAR0_SIZE] {
        let mut b = [0u8; BAR0_SIZE];
        b[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        b[4..10].copy_from_slice(&reverse_mac(self.dst_mac));
        // b[10..12] reserved.
        b[12..18].copy_from_slice(&reverse_mac(self.src_mac));
        // b[18..20] reserved.
        b[20..24].copy_from_slice(&u32::from(self.src_ip).to_be_bytes());
        b[24..28].copy_from_slice(&u32::from(self.dst_ip).to_be_bytes());
        b
    }
}

/// The 6-byte reversing copy used for the BAR0 MAC fields.
///
/// Applied symmetrically on read and write, so stored and canonical order
/// are mirror images of each other.
pub fn reverse_mac(mac: [u8; 6]) -> [u8; 6] {
    [mac[5], mac[4], mac[3], mac[2], mac[1], mac[0]]
}

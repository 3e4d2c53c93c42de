//! Fixed-size header layouts and well-known ethertypes

use crate::error::{DetunnelError, DetunnelResult};

pub const ETHERTYPE_IP4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IP6: u16 = 0x86DD;
pub const ETHERTYPE_MPLS: u16 = 0x8847;
pub const ETHERTYPE_DOT1AD: u16 = 0x88A8;
pub const ETHERTYPE_LLDP: u16 = 0x88CC;

/// Ethernet II: dst(6) src(6) type(2)
pub const ETH_HDR_SIZE: usize = 14;
/// 802.1Q tag: priority/cfi/id(2) type(2)
pub const VLAN_HDR_SIZE: usize = 4;

/// A header of fixed size with a big-endian 16-bit type field at a fixed offset.
///
/// The type field always lies inside the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    size: usize,
    type_offset: usize,
}

impl HeaderLayout {
    pub const ETHERNET: Self = Self {
        size: ETH_HDR_SIZE,
        type_offset: 12,
    };

    pub const VLAN: Self = Self {
        size: VLAN_HDR_SIZE,
        type_offset: 2,
    };

    pub fn new(size: usize, type_offset: usize) -> DetunnelResult<Self> {
        match type_offset.checked_add(2) {
            Some(end) if end <= size => Ok(Self { size, type_offset }),
            _ => Err(DetunnelError::InvalidLayout { size, type_offset }),
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn type_offset(&self) -> usize {
        self.type_offset
    }

    /// Read the type field from the start of `data`.
    ///
    /// Callers must have checked `data.len() >= self.size`.
    #[inline(always)]
    pub fn ethertype(&self, data: &[u8]) -> u16 {
        u16::from_be_bytes([data[self.type_offset], data[self.type_offset + 1]])
    }
}

/// Parse an ethertype given either as a well-known name or as a number
/// (`0x88cc`, `34984`)
pub fn parse_ethertype(s: &str) -> DetunnelResult<u16> {
    let s = s.trim();
    let named = match s.to_ascii_lowercase().as_str() {
        "ip4" | "ipv4" => Some(ETHERTYPE_IP4),
        "arp" => Some(ETHERTYPE_ARP),
        "vlan" | "dot1q" => Some(ETHERTYPE_VLAN),
        "ip6" | "ipv6" => Some(ETHERTYPE_IP6),
        "mpls" => Some(ETHERTYPE_MPLS),
        "dot1ad" | "qinq" => Some(ETHERTYPE_DOT1AD),
        "lldp" => Some(ETHERTYPE_LLDP),
        _ => None,
    };
    if let Some(t) = named {
        return Ok(t);
    }

    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|_| DetunnelError::UnknownEthertype(s.to_string()))
}

//! Mesh station identifiers and MAC address helpers.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error as ThisError;

/// A 16-bit mesh station identifier.
///
/// `0x0000` is reserved for broadcast; the Top's own id (commonly `0xFFFE`) is
/// reserved by configuration, not by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeshId(pub u16);

impl MeshId {
    pub const BROADCAST: Self = Self(0x0000);

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }
}

impl From<u16> for MeshId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<MeshId> for u16 {
    fn from(value: MeshId) -> Self {
        value.0
    }
}

impl Display for MeshId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for MeshId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u16::from_str_radix(s, 16)?))
    }
}

/// A 6-byte Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum MacParseError {
    #[error("expected 6 colon- or dash-separated hex octets, got {0} part(s)")]
    WrongPartCount(usize),
    #[error("invalid hex octet {0:?}")]
    InvalidOctet(String),
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(['-', ':']).collect();
        if parts.len() != 6 {
            return Err(MacParseError::WrongPartCount(parts.len()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::InvalidOctet(part.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

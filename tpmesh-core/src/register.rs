//! The rule-`0x10` control frame body: registration, heartbeat, and their acks.

use crate::addr::{MacAddr, MeshId};
use crate::crc::crc16_modbus;
use thiserror::Error as ThisError;

/// Register/heartbeat frame types (the first byte of the 15-byte body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    RegisterRequest,
    RegisterAck,
    Heartbeat,
    HeartbeatAck,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(byte: u8) -> Self {
        match byte {
            0x01 => Self::RegisterRequest,
            0x02 => Self::RegisterAck,
            0x03 => Self::Heartbeat,
            0x04 => Self::HeartbeatAck,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(value: FrameType) -> Self {
        match value {
            FrameType::RegisterRequest => 0x01,
            FrameType::RegisterAck => 0x02,
            FrameType::Heartbeat => 0x03,
            FrameType::HeartbeatAck => 0x04,
            FrameType::Unknown(byte) => byte,
        }
    }
}

/// The 15-byte rule-`0x10` body: `type ∥ mac(6) ∥ ip_lwip_u32(4, LE) ∥
/// mesh_id(2, LE) ∥ crc16(2, LE)`.
pub const BODY_OCTETS: usize = 15;
const CRC_COVERED_OCTETS: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFrame {
    pub frame_type: FrameType,
    pub mac: MacAddr,
    pub ip_lwip_u32: u32,
    pub mesh_id: MeshId,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("register body is {0} bytes, expected {BODY_OCTETS}")]
    WrongLength(usize),
    #[error("CRC mismatch: frame claims {claimed:#06x}, computed {computed:#06x}")]
    CrcMismatch { claimed: u16, computed: u16 },
}

impl RegisterFrame {
    /// Parses and CRC-validates a 15-byte register/heartbeat body.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != BODY_OCTETS {
            return Err(DecodeError::WrongLength(bytes.len()));
        }
        let claimed = u16::from_le_bytes([bytes[13], bytes[14]]);
        let computed = crc16_modbus(&bytes[..CRC_COVERED_OCTETS]);
        if claimed != computed {
            return Err(DecodeError::CrcMismatch { claimed, computed });
        }

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[1..7]);
        let ip_lwip_u32 = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        let mesh_id = MeshId(u16::from_le_bytes([bytes[11], bytes[12]]));

        Ok(Self {
            frame_type: bytes[0].into(),
            mac: MacAddr::new(mac),
            ip_lwip_u32,
            mesh_id,
        })
    }

    /// Serializes this frame to its 15-byte wire form, computing a fresh CRC.
    pub fn encode(&self) -> [u8; BODY_OCTETS] {
        let mut body = [0u8; BODY_OCTETS];
        body[0] = self.frame_type.into();
        body[1..7].copy_from_slice(self.mac.as_bytes());
        body[7..11].copy_from_slice(&self.ip_lwip_u32.to_le_bytes());
        body[11..13].copy_from_slice(&self.mesh_id.0.to_le_bytes());
        let crc = crc16_modbus(&body[..CRC_COVERED_OCTETS]);
        body[13..15].copy_from_slice(&crc.to_le_bytes());
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::to_lwip_u32;
    use std::net::Ipv4Addr;

    fn sample() -> RegisterFrame {
        RegisterFrame {
            frame_type: FrameType::RegisterRequest,
            mac: MacAddr::new([0x00, 0x6B, 0xA0, 0x00, 0x00, 0x10]),
            ip_lwip_u32: to_lwip_u32(Ipv4Addr::new(192, 168, 10, 11)),
            mesh_id: MeshId(0x0003),
        }
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let frame = sample();
        let decoded = RegisterFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_rejects_bad_crc() {
        let mut body = sample().encode();
        body[14] ^= 0xFF;
        assert!(matches!(
            RegisterFrame::decode(&body),
            Err(DecodeError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(
            RegisterFrame::decode(&[0u8; 14]),
            Err(DecodeError::WrongLength(14))
        );
    }

    #[test]
    fn frame_type_round_trips_through_u8() {
        for ty in [
            FrameType::RegisterRequest,
            FrameType::RegisterAck,
            FrameType::Heartbeat,
            FrameType::HeartbeatAck,
        ] {
            let byte: u8 = ty.into();
            assert_eq!(FrameType::from(byte), ty);
        }
        assert!(matches!(FrameType::from(0x09), FrameType::Unknown(0x09)));
    }
}

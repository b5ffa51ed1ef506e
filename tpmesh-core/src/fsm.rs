//! Top-side registration/heartbeat finite-state machine: validates rule
//! `0x10` control frames, updates the node [`Registry`], and builds ACKs.

use crate::addr::{MacAddr, MeshId};
use crate::register::{self, DecodeError, FrameType, RegisterFrame};
use crate::registry::{RegisteredNode, Registry};
use crate::tunnel::{self, TunnelHeader};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum FsmError {
    #[error("register/heartbeat frame shorter than the tunnel header")]
    FrameTooShort,
    #[error("register/heartbeat frame must carry a clear broadcast bit")]
    Broadcast,
    #[error("register/heartbeat frame must be a single, final, seq=0 fragment")]
    NotSingleFragment,
    #[error("register/heartbeat body is {0} bytes, expected {}", register::BODY_OCTETS)]
    WrongBodyLength(usize),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// What the FSM decided to do with one rule-`0x10` tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Emit `tunnel_frame` (a complete, unfragmented tunnel frame) to `dest`.
    Ack { dest: MeshId, tunnel_frame: Vec<u8> },
    /// A recognized but non-actionable frame type (logged and dropped).
    Ignored,
}

/// The Top's own identity, used to stamp outgoing ACKs.
pub struct RegistrationFsm {
    pub mac: MacAddr,
    pub ip_lwip_u32: u32,
    pub mesh_id: MeshId,
}

impl RegistrationFsm {
    pub fn new(mac: MacAddr, ip_lwip_u32: u32, mesh_id: MeshId) -> Self {
        Self {
            mac,
            ip_lwip_u32,
            mesh_id,
        }
    }

    /// Validates and dispatches one complete (already-reassembled if needed)
    /// rule-`0x10` tunnel frame, upserting `registry` on a register or
    /// heartbeat. Callers should log and drop the frame on `Err` rather than
    /// propagate it further: every variant here corresponds to a silently
    /// dropped frame in the protocol's error taxonomy, not a fatal error.
    pub fn handle(&self, registry: &Registry, tunnel_frame: &[u8]) -> Result<Outcome, FsmError> {
        if tunnel_frame.len() < tunnel::HEADER_OCTETS {
            return Err(FsmError::FrameTooShort);
        }
        let header = TunnelHeader::parse(tunnel_frame).map_err(|_| FsmError::FrameTooShort)?;
        if header.broadcast {
            return Err(FsmError::Broadcast);
        }
        if !(header.last_fragment && header.seq == 0) {
            return Err(FsmError::NotSingleFragment);
        }

        let body = &tunnel_frame[tunnel::HEADER_OCTETS..];
        if body.len() != register::BODY_OCTETS {
            return Err(FsmError::WrongBodyLength(body.len()));
        }
        let frame = RegisterFrame::decode(body)?;

        match frame.frame_type {
            FrameType::RegisterRequest => {
                self.upsert(registry, &frame);
                Ok(self.build_ack(FrameType::RegisterAck, frame.mesh_id))
            }
            FrameType::Heartbeat => {
                self.upsert(registry, &frame);
                Ok(self.build_ack(FrameType::HeartbeatAck, frame.mesh_id))
            }
            FrameType::RegisterAck | FrameType::HeartbeatAck | FrameType::Unknown(_) => {
                Ok(Outcome::Ignored)
            }
        }
    }

    fn upsert(&self, registry: &Registry, frame: &RegisterFrame) {
        registry.upsert(RegisteredNode {
            mesh_id: frame.mesh_id,
            mac: frame.mac,
            ip_lwip_u32: frame.ip_lwip_u32,
        });
    }

    fn build_ack(&self, ack_type: FrameType, dest: MeshId) -> Outcome {
        let ack = RegisterFrame {
            frame_type: ack_type,
            mac: self.mac,
            ip_lwip_u32: self.ip_lwip_u32,
            mesh_id: self.mesh_id,
        };
        let mut tunnel_frame = TunnelHeader::register_ack().to_bytes().to_vec();
        tunnel_frame.extend_from_slice(&ack.encode());
        Outcome::Ack { dest, tunnel_frame }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::to_lwip_u32;
    use std::net::Ipv4Addr;

    fn top() -> RegistrationFsm {
        RegistrationFsm::new(
            MacAddr::new([0x02, 0x00, 0x00, 0x00, 0xFF, 0xFE]),
            to_lwip_u32(Ipv4Addr::new(192, 168, 10, 3)),
            MeshId(0xFFFE),
        )
    }

    fn leaf_register_request_frame() -> Vec<u8> {
        let body = RegisterFrame {
            frame_type: FrameType::RegisterRequest,
            mac: MacAddr::new([0x00, 0x6B, 0xA0, 0x00, 0x00, 0x10]),
            ip_lwip_u32: to_lwip_u32(Ipv4Addr::new(192, 168, 10, 11)),
            mesh_id: MeshId(0x0003),
        }
        .encode();
        let mut frame = TunnelHeader::register_ack().to_bytes().to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn register_request_upserts_and_acks() {
        let registry = Registry::new();
        let fsm = top();
        let outcome = fsm
            .handle(&registry, &leaf_register_request_frame())
            .unwrap();

        match outcome {
            Outcome::Ack { dest, tunnel_frame } => {
                assert_eq!(dest, MeshId(0x0003));
                assert_eq!(&tunnel_frame[..3], &[0x00, 0x80, 0x10]);
                let ack = RegisterFrame::decode(&tunnel_frame[3..]).unwrap();
                assert_eq!(ack.frame_type, FrameType::RegisterAck);
                assert_eq!(ack.mesh_id, MeshId(0xFFFE));
                assert_eq!(ack.mac, MacAddr::new([0x02, 0x00, 0x00, 0x00, 0xFF, 0xFE]));
            }
            Outcome::Ignored => panic!("expected an ack"),
        }

        let node = registry.by_mesh(MeshId(0x0003)).unwrap();
        assert_eq!(node.mac, MacAddr::new([0x00, 0x6B, 0xA0, 0x00, 0x00, 0x10]));
    }

    #[test]
    fn heartbeat_upserts_and_acks_with_heartbeat_ack_type() {
        let registry = Registry::new();
        let fsm = top();
        let body = RegisterFrame {
            frame_type: FrameType::Heartbeat,
            mac: MacAddr::new([0x00, 0x6B, 0xA0, 0x00, 0x00, 0x10]),
            ip_lwip_u32: to_lwip_u32(Ipv4Addr::new(192, 168, 10, 11)),
            mesh_id: MeshId(0x0003),
        }
        .encode();
        let mut frame = TunnelHeader::register_ack().to_bytes().to_vec();
        frame.extend_from_slice(&body);

        let outcome = fsm.handle(&registry, &frame).unwrap();
        match outcome {
            Outcome::Ack { tunnel_frame, .. } => {
                let ack = RegisterFrame::decode(&tunnel_frame[3..]).unwrap();
                assert_eq!(ack.frame_type, FrameType::HeartbeatAck);
            }
            Outcome::Ignored => panic!("expected an ack"),
        }
    }

    #[test]
    fn unknown_frame_type_is_ignored_without_touching_registry() {
        let registry = Registry::new();
        let fsm = top();
        let body = RegisterFrame {
            frame_type: FrameType::Unknown(0x09),
            mac: MacAddr::new([0x00, 0x6B, 0xA0, 0x00, 0x00, 0x10]),
            ip_lwip_u32: to_lwip_u32(Ipv4Addr::new(192, 168, 10, 11)),
            mesh_id: MeshId(0x0003),
        }
        .encode();
        let mut frame = TunnelHeader::register_ack().to_bytes().to_vec();
        frame.extend_from_slice(&body);

        assert_eq!(fsm.handle(&registry, &frame).unwrap(), Outcome::Ignored);
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_bit_set_is_rejected() {
        let registry = Registry::new();
        let fsm = top();
        let mut frame = leaf_register_request_frame();
        frame[0] = 0x80;
        assert_eq!(
            fsm.handle(&registry, &frame).unwrap_err(),
            FsmError::Broadcast
        );
    }

    #[test]
    fn multi_fragment_register_is_rejected() {
        let registry = Registry::new();
        let fsm = top();
        let mut frame = leaf_register_request_frame();
        frame[1] = 0x00; // not last, seq=0
        assert_eq!(
            fsm.handle(&registry, &frame).unwrap_err(),
            FsmError::NotSingleFragment
        );
    }

    #[test]
    fn bad_crc_is_rejected_and_not_acked() {
        let registry = Registry::new();
        let fsm = top();
        let mut frame = leaf_register_request_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            fsm.handle(&registry, &frame),
            Err(FsmError::Decode(DecodeError::CrcMismatch { .. }))
        ));
        assert!(registry.is_empty());
    }
}

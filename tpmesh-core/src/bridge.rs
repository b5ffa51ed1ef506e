//! The Top's bidirectional UDP↔mesh bridge: mesh-side frame extraction and
//! UDP-side frame construction plus unicast/broadcast routing.

use crate::addr::{MacAddr, MeshId};
use crate::registry::Registry;
use crate::tunnel::{self, TunnelHeader};
use crate::{ethernet, ipv4, udp};
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum MeshToUdpError {
    #[error("tunnel frame shorter than the 3-byte header")]
    FrameTooShort,
    #[error(transparent)]
    Ethernet(#[from] ethernet::ParseError),
    #[error("ethertype {0:#06x}, expected IPv4 (0x0800)")]
    WrongEthertype(u16),
    #[error(transparent)]
    Ipv4(#[from] ipv4::ParseError),
    #[error("IP protocol {0}, expected UDP (17)")]
    NotUdp(u8),
    #[error(transparent)]
    Udp(#[from] udp::ParseError),
}

/// A UDP datagram extracted from a reassembled NO_COMPRESS tunnel frame,
/// ready to hand to the BMS-facing socket's `sendto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshToUdp {
    pub destination: SocketAddrV4,
    pub payload: Vec<u8>,
}

/// Strips the tunnel, Ethernet, IPv4, and UDP headers from a reassembled
/// NO_COMPRESS frame, yielding the payload and its intended UDP destination.
pub fn decode_mesh_to_udp(tunnel_frame: &[u8]) -> Result<MeshToUdp, MeshToUdpError> {
    if tunnel_frame.len() < tunnel::HEADER_OCTETS {
        return Err(MeshToUdpError::FrameTooShort);
    }
    let body = &tunnel_frame[tunnel::HEADER_OCTETS..];

    let eth = ethernet::parse(body)?;
    if eth.ethertype != ethernet::ETHERTYPE_IPV4 {
        return Err(MeshToUdpError::WrongEthertype(eth.ethertype));
    }

    let ip_bytes = &body[ethernet::HEADER_OCTETS..];
    let ip_header = ipv4::parse(ip_bytes)?;
    if ip_header.protocol != ipv4::PROTO_UDP {
        return Err(MeshToUdpError::NotUdp(ip_header.protocol));
    }

    let udp_bytes = &ip_bytes[ip_header.ihl_octets..ip_header.total_length as usize];
    let udp_header = udp::parse(udp_bytes)?;
    let payload = udp::payload(udp_bytes, &udp_header).to_vec();

    Ok(MeshToUdp {
        destination: SocketAddrV4::new(ip_header.destination, udp_header.destination_port),
        payload,
    })
}

/// Returns `true` when `source` is permitted onto the mesh, preventing
/// mesh-originated traffic that loops back onto the BMS segment from being
/// re-injected into the mesh.
pub fn is_source_allowed(allowlist: &[Ipv4Addr], source: Ipv4Addr) -> bool {
    allowlist.contains(&source)
}

/// The outcome of resolving a destination IPv4 address against the node
/// [`Registry`]: a specific mesh station, or the configured broadcast id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Unicast { mesh_id: MeshId, mac: MacAddr },
    Broadcast { mesh_id: MeshId, mac: MacAddr },
}

impl Routing {
    pub fn mesh_id(self) -> MeshId {
        match self {
            Routing::Unicast { mesh_id, .. } | Routing::Broadcast { mesh_id, .. } => mesh_id,
        }
    }

    pub fn is_broadcast(self) -> bool {
        matches!(self, Routing::Broadcast { .. })
    }
}

/// Resolves `dst_ip_lwip_u32` against `registry`; falls back to
/// `mesh_broadcast_id` with an all-ones MAC when the destination isn't a
/// known node.
pub fn route(registry: &Registry, dst_ip_lwip_u32: u32, mesh_broadcast_id: MeshId) -> Routing {
    match registry.by_ip(dst_ip_lwip_u32) {
        Some(node) => Routing::Unicast {
            mesh_id: node.mesh_id,
            mac: node.mac,
        },
        None => Routing::Broadcast {
            mesh_id: mesh_broadcast_id,
            mac: MacAddr::BROADCAST,
        },
    }
}

/// A role-local, monotonically incrementing IPv4 identification counter.
/// Starts at 1 and wraps back to 1 past `0xFFFF` (0 is never emitted). This
/// skips identification 0 on wrap, unlike the original firmware's
/// `(ip_id + 1) & 0xFFFF`, which does emit 0 — a deliberate, spec-permitted
/// divergence (see DESIGN.md).
#[derive(Debug, Default)]
pub struct IpIdCounter(u16);

impl IpIdCounter {
    pub fn new() -> Self {
        Self(1)
    }

    pub fn next(&mut self) -> u16 {
        let id = self.0.max(1);
        self.0 = if id == 0xFFFF { 1 } else { id + 1 };
        id
    }
}

/// Builds a complete (unfragmented) NO_COMPRESS tunnel frame carrying a full
/// Ethernet+IPv4+UDP frame for `payload`, addressed per `routing`. The
/// caller is responsible for passing the result through
/// [`crate::fragment::fragment`] before transmission.
pub fn build_udp_to_mesh(
    top_mac: MacAddr,
    ip_id: u16,
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &[u8],
    routing: Routing,
) -> Vec<u8> {
    let udp_header = udp::build(source.port(), destination.port(), payload.len() as u16);
    let mut ip_payload = udp_header.to_vec();
    ip_payload.extend_from_slice(payload);

    let ip_header = ipv4::build(
        *source.ip(),
        *destination.ip(),
        ipv4::PROTO_UDP,
        ip_id,
        ip_payload.len() as u16,
    );

    let dest_mac = match routing {
        Routing::Unicast { mac, .. } | Routing::Broadcast { mac, .. } => mac,
    };
    let eth_header = ethernet::build(top_mac, dest_mac, ethernet::ETHERTYPE_IPV4);

    let tunnel_header = TunnelHeader {
        broadcast: routing.is_broadcast(),
        last_fragment: true,
        seq: 0,
        rule: tunnel::RULE_NO_COMPRESS,
    };

    let mut frame = tunnel_header.to_bytes().to_vec();
    frame.extend_from_slice(&eth_header);
    frame.extend_from_slice(&ip_header);
    frame.extend_from_slice(&ip_payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::to_lwip_u32;
    use crate::registry::RegisteredNode;

    #[test]
    fn decode_mesh_to_udp_recovers_destination_and_payload() {
        let top_mac = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0xFF, 0xFE]);
        let leaf_mac = MacAddr::new([0x00, 0x6B, 0xA0, 0x00, 0x00, 0x10]);
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 168, 10, 11), 47000);
        let destination = SocketAddrV4::new(Ipv4Addr::new(192, 168, 10, 3), 47808);
        let frame = build_udp_to_mesh(
            leaf_mac,
            1,
            source,
            destination,
            b"DEADBEEF",
            Routing::Unicast {
                mesh_id: MeshId(0xFFFE),
                mac: top_mac,
            },
        );

        let decoded = decode_mesh_to_udp(&frame).unwrap();
        assert_eq!(decoded.destination, destination);
        assert_eq!(decoded.payload, b"DEADBEEF");
    }

    #[test]
    fn decode_rejects_non_ipv4_ethertype() {
        let mut frame = vec![0x00, 0x80, 0x00]; // tunnel header, NO_COMPRESS
        frame.extend_from_slice(&[0; 12]); // src/dst mac
        frame.extend_from_slice(&0x0806u16.to_be_bytes()); // ARP, not IPv4
        assert_eq!(
            decode_mesh_to_udp(&frame),
            Err(MeshToUdpError::WrongEthertype(0x0806))
        );
    }

    #[test]
    fn unicast_routing_resolves_registered_node() {
        let registry = Registry::new();
        let leaf_ip = to_lwip_u32(Ipv4Addr::new(192, 168, 10, 11));
        registry.upsert(RegisteredNode {
            mesh_id: MeshId(0x0003),
            mac: MacAddr::new([0x00, 0x6B, 0xA0, 0x00, 0x00, 0x10]),
            ip_lwip_u32: leaf_ip,
        });

        let routing = route(&registry, leaf_ip, MeshId(0x0000));
        assert_eq!(routing.mesh_id(), MeshId(0x0003));
        assert!(!routing.is_broadcast());
    }

    #[test]
    fn unknown_destination_falls_back_to_mesh_broadcast() {
        let registry = Registry::new();
        let routing = route(&registry, 0xDEAD_BEEF, MeshId(0x0000));
        assert_eq!(routing.mesh_id(), MeshId(0x0000));
        assert!(routing.is_broadcast());
        assert_eq!(
            match routing {
                Routing::Broadcast { mac, .. } => mac,
                _ => unreachable!(),
            },
            MacAddr::BROADCAST
        );
    }

    #[test]
    fn allowlist_rejects_unlisted_sources() {
        let allowlist = [Ipv4Addr::new(192, 168, 10, 3)];
        assert!(is_source_allowed(&allowlist, Ipv4Addr::new(192, 168, 10, 3)));
        assert!(!is_source_allowed(&allowlist, Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn ip_id_counter_starts_at_one_and_wraps() {
        let mut counter = IpIdCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);

        let mut counter = IpIdCounter(0xFFFF);
        assert_eq!(counter.next(), 0xFFFF);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn broadcast_routing_sets_tunnel_broadcast_bit() {
        let top_mac = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0xFF, 0xFE]);
        let frame = build_udp_to_mesh(
            top_mac,
            1,
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 10, 3), 47000),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 10, 11), 47808),
            b"X",
            Routing::Broadcast {
                mesh_id: MeshId(0x0000),
                mac: MacAddr::BROADCAST,
            },
        );
        assert_eq!(frame[0], 0x80);
    }
}

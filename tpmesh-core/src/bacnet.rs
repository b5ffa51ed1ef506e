//! Leaf-side BACnet Who-Is detection and I-Am emission.

use crate::addr::{MacAddr, MeshId};
use crate::bridge::{self, Routing};
use crate::tunnel::{self, TunnelHeader};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

pub const BACNET_PORT: u16 = 47808;

/// True if `apdu` is a BACnet/IP Who-Is: a `81 0B` BVLC prefix over an APDU
/// containing the unconfirmed-request Who-Is service choice `10 08`
/// somewhere in its body. This is a shallow heuristic, not a full BACnet
/// decoder — sufficient for recognizing the one service this bridge reacts to.
pub fn is_who_is(apdu: &[u8]) -> bool {
    if apdu.len() < 4 || apdu[0] != 0x81 || apdu[1] != 0x0B {
        return false;
    }
    apdu.windows(2).any(|w| w == [0x10, 0x08])
}

/// Inspects one received tunnel frame (already reassembled if it was
/// fragmented) for a Who-Is, recognizing both tunnel rules a Who-Is can
/// arrive on. Only a complete, single/final fragment (seq=0, last set) is
/// ever considered: a continuation fragment's bytes aren't BACnet-framed on
/// their own.
pub fn detect_who_is(tunnel_frame: &[u8]) -> bool {
    let Ok(header) = TunnelHeader::parse(tunnel_frame) else {
        return false;
    };
    if header.seq != 0 || !header.last_fragment {
        return false;
    }
    match header.rule {
        tunnel::RULE_BACNET_IP => {
            // Compressed body: tunnel header(3) + src_mac(6) + ip(4) precede
            // the BACnet application bytes.
            let offset = tunnel::HEADER_OCTETS + 6 + 4;
            tunnel_frame.get(offset..).is_some_and(is_who_is)
        }
        tunnel::RULE_NO_COMPRESS => match bridge::decode_mesh_to_udp(tunnel_frame) {
            Ok(datagram) if datagram.destination.port() == BACNET_PORT => {
                is_who_is(&datagram.payload)
            }
            _ => false,
        },
        _ => false,
    }
}

/// Tracks the cooldown between consecutive I-Am emissions.
pub struct IAmEmitter {
    cooldown: Duration,
    last_sent: Option<Instant>,
}

impl IAmEmitter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: None,
        }
    }

    /// Returns `true` (and records `now` as the last send) if `cooldown` has
    /// elapsed since the previous successful fire, or this is the first one.
    pub fn try_fire(&mut self) -> bool {
        let now = Instant::now();
        let allowed = match self.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= self.cooldown,
        };
        if allowed {
            self.last_sent = Some(now);
        }
        allowed
    }
}

/// Builds the tunneled broadcast I-Am frame: a NO_COMPRESS tunnel frame
/// carrying a full Ethernet+IPv4+UDP datagram whose payload is the (already
/// BVLC/APDU-framed) `apdu` bytes, broadcast at both the IP layer
/// (`broadcast_ip:BACNET_PORT`) and the tunnel's L2 layer (broadcast bit
/// set), even though the `AT+SEND` carrying it is still addressed directly
/// to `top_mesh_id` at the mesh layer by the caller.
pub fn build_i_am(
    leaf_mac: MacAddr,
    leaf_ip: Ipv4Addr,
    ip_id: u16,
    src_port: u16,
    broadcast_ip: Ipv4Addr,
    apdu: &[u8],
    top_mesh_id: MeshId,
) -> Vec<u8> {
    let source = SocketAddrV4::new(leaf_ip, src_port);
    let destination = SocketAddrV4::new(broadcast_ip, BACNET_PORT);
    bridge::build_udp_to_mesh(
        leaf_mac,
        ip_id,
        source,
        destination,
        apdu,
        Routing::Broadcast {
            mesh_id: top_mesh_id,
            mac: MacAddr::BROADCAST,
        },
    )
}

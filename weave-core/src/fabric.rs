//! Fabric-wide node identity and the deterministic fabric ULA derivation
//! used so every device can compute a peer's address from its node id alone
//! (§4.2).

use crate::ids::{FabricId, KeyId, MessageId, NodeId};
use std::{
    collections::HashMap,
    net::Ipv6Addr,
    sync::atomic::{AtomicU32, Ordering},
};

/// `fd00::/8`, the locally-assigned ULA prefix Weave fabrics are carved from.
const ULA_PREFIX: u8 = 0xfd;

/// Derives the fabric-unique-local IPv6 address for `node_id` within
/// `fabric_id`'s subnet `subnet_id`.
///
/// Layout: `fd` prefix || 40-bit fabric global id || 16-bit subnet id ||
/// 64-bit EUI-64 interface id formed from the node id (RFC 4291 Appendix A:
/// the node id's bytes with the universal/local bit of the first octet
/// flipped).
pub fn fabric_ula(fabric_id: FabricId, subnet_id: u16, node_id: NodeId) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = ULA_PREFIX;

    let global_id = fabric_id.as_u64() & 0xFF_FFFF_FFFF; // low 40 bits
    let global_id_bytes = global_id.to_be_bytes();
    octets[1..6].copy_from_slice(&global_id_bytes[3..8]);

    octets[6..8].copy_from_slice(&subnet_id.to_be_bytes());

    let mut interface_id = node_id.as_u64().to_be_bytes();
    interface_id[0] ^= 0x02; // flip the universal/local bit
    octets[8..16].copy_from_slice(&interface_id);

    Ipv6Addr::from(octets)
}

/// Per-(source node, key) message counters and the node/fabric identity of
/// the local device (C2).
pub struct FabricState {
    local_node_id: NodeId,
    fabric_id: FabricId,
    subnet_id: u16,
    next_counters: std::sync::Mutex<HashMap<(NodeId, KeyId), u32>>,
    solitary_counter: AtomicU32,
    known_addresses: std::sync::Mutex<HashMap<NodeId, Ipv6Addr>>,
}

impl FabricState {
    pub fn new(local_node_id: NodeId, fabric_id: FabricId, subnet_id: u16) -> Self {
        Self {
            local_node_id,
            fabric_id,
            subnet_id,
            next_counters: std::sync::Mutex::new(HashMap::new()),
            solitary_counter: AtomicU32::new(1),
            known_addresses: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn fabric_id(&self) -> FabricId {
        self.fabric_id
    }

    /// Returns the address to use for `peer_node_id`, preferring an address
    /// learned out-of-band (e.g. from a received datagram) over the
    /// deterministically-derived fabric ULA.
    pub fn select_node_address(&self, peer_node_id: NodeId) -> Ipv6Addr {
        if let Some(addr) = self.known_addresses.lock().unwrap().get(&peer_node_id) {
            return *addr;
        }
        fabric_ula(self.fabric_id, self.subnet_id, peer_node_id)
    }

    /// Records an address learned for a peer (e.g. the source of an inbound
    /// datagram), so future sends to that node skip ULA derivation.
    pub fn record_peer_address(&self, peer_node_id: NodeId, addr: Ipv6Addr) {
        self.known_addresses
            .lock()
            .unwrap()
            .insert(peer_node_id, addr);
    }

    /// Resolves a desired destination node id (possibly `NodeId::ANY` or
    /// unspecified) to a concrete `(node id, address)` pair.
    pub fn select_dest_node_and_address(&self, desired_dest: NodeId) -> (NodeId, Ipv6Addr) {
        (desired_dest, self.select_node_address(desired_dest))
    }

    /// Allocates the next message id for the given key, per (source node,
    /// key). Group keys (key id present, non-solitary) share a single
    /// fabric-wide counter since the source node cannot be distinguished at
    /// the group level until resynchronized.
    pub fn next_message_id(&self, key_id: KeyId) -> MessageId {
        if key_id.is_none() {
            let mut counters = self.next_counters.lock().unwrap();
            let counter = counters.entry((self.local_node_id, key_id)).or_insert(1);
            let id = *counter;
            *counter = counter.wrapping_add(1);
            return MessageId::new(id);
        }

        let id = self.solitary_counter.fetch_add(1, Ordering::Relaxed);
        MessageId::new(id)
    }

    /// Verifies that a message claiming to be from `source_node_id` is
    /// consistent with what this device knows about the peer (non-zero,
    /// within the fabric). Key authentication itself is delegated to the
    /// security layer (§1, out of scope).
    pub fn is_authentic_message_from_peer(&self, source_node_id: NodeId) -> bool {
        source_node_id.is_specified()
    }
}

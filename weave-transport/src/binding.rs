//! Bindings: a cached peer identity apps can resolve once and reuse across
//! many exchanges to the same peer, instead of re-resolving addressing and
//! key material on every send.

use std::net::Ipv6Addr;
use weave_core::ids::{KeyId, NodeId};

use crate::context::ConnectionId;

slotmap::new_key_type! {
    pub struct BindingKey;
}

#[derive(Clone, Debug)]
pub struct Binding {
    pub peer_node_id: NodeId,
    pub peer_addr: Option<Ipv6Addr>,
    pub peer_port: Option<u16>,
    pub key_id: KeyId,
    pub connection: Option<ConnectionId>,
}

#[derive(Default)]
pub struct BindingPool {
    bindings: slotmap::SlotMap<BindingKey, Binding>,
}

impl BindingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, binding: Binding) -> BindingKey {
        self.bindings.insert(binding)
    }

    pub fn get(&self, key: BindingKey) -> Option<&Binding> {
        self.bindings.get(key)
    }

    pub fn release(&mut self, key: BindingKey) -> Option<Binding> {
        self.bindings.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_release_frees_the_slot() {
        let mut pool = BindingPool::new();
        let key = pool.create(Binding {
            peer_node_id: NodeId::new(5),
            peer_addr: None,
            peer_port: None,
            key_id: KeyId::NONE,
            connection: None,
        });
        assert!(pool.get(key).is_some());
        assert!(pool.release(key).is_some());
        assert!(pool.get(key).is_none());
    }
}

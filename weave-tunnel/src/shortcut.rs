//! Shortcut UDP control (C9): caches addresses advertised by fabric peers on
//! the local network so traffic to them can bypass the service tunnel
//! entirely when both ends are on the same link.

use std::{net::Ipv6Addr, time::Duration};

use hashbrown::HashMap;
use weave_core::{ids::NodeId, tick::TickCount};

#[derive(Copy, Clone, Debug)]
struct ShortcutEntry {
    addr: Ipv6Addr,
    expires_in: TickCount,
}

/// C9: a TTL cache of `NodeId -> Ipv6Addr` learned from local-network
/// shortcut advertisements.
pub struct ShortcutUdpControl {
    entries: HashMap<NodeId, ShortcutEntry>,
    ttl: TickCount,
}

impl ShortcutUdpControl {
    pub fn new(ttl: Duration, tick_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: TickCount::from_duration(ttl, tick_interval),
        }
    }

    /// Records (or refreshes) an advertisement heard from `node`.
    pub fn record_advertisement(&mut self, node: NodeId, addr: Ipv6Addr) {
        self.entries.insert(
            node,
            ShortcutEntry {
                addr,
                expires_in: self.ttl,
            },
        );
    }

    pub fn forget(&mut self, node: NodeId) {
        self.entries.remove(&node);
    }

    /// Returns a live shortcut address for `node`, if one hasn't expired.
    pub fn lookup(&self, node: NodeId) -> Option<Ipv6Addr> {
        self.entries.get(&node).map(|entry| entry.addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ages every cached entry by one tick, dropping any that expire.
    pub fn expire_ticks(&mut self) {
        self.entries.retain(|_, entry| {
            entry.expires_in = entry.expires_in.expire(1);
            !entry.expires_in.is_due()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_is_looked_up_until_ttl_expires() {
        let mut control = ShortcutUdpControl::new(Duration::from_millis(400), Duration::from_millis(200));
        let node = NodeId::new(9);
        let addr: Ipv6Addr = "fe80::1".parse().unwrap();
        control.record_advertisement(node, addr);
        assert_eq!(control.lookup(node), Some(addr));

        control.expire_ticks();
        assert_eq!(control.lookup(node), Some(addr));

        control.expire_ticks();
        assert_eq!(control.lookup(node), None);
    }

    #[test]
    fn re_advertisement_refreshes_ttl() {
        let mut control = ShortcutUdpControl::new(Duration::from_millis(400), Duration::from_millis(200));
        let node = NodeId::new(9);
        let addr: Ipv6Addr = "fe80::1".parse().unwrap();
        control.record_advertisement(node, addr);
        control.expire_ticks();
        control.record_advertisement(node, addr); // refresh before expiry
        control.expire_ticks();
        assert_eq!(control.lookup(node), Some(addr));
    }
}

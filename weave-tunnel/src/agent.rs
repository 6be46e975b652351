//! The tunnel agent (C8): drives the primary/backup connection managers,
//! routes encapsulated IPv6 traffic between them, and enforces the
//! service's routing-restriction policy.

use std::time::Duration;

use bytes::Bytes;
use weave_core::error::{Result, WeaveError};

use crate::connection_mgr::{BackoffConfig, TunnelConnectionMgr, TunnelRole};

#[derive(Debug, PartialEq, Eq)]
pub enum TunnelRoute {
    /// An established path exists now; the caller should send immediately.
    Immediate,
    /// No path is up yet; the packet was queued for delivery once one is.
    Queued,
}

/// C8: owns the primary tunnel and an optional backup, plus the queue of
/// traffic accumulated while neither is established.
pub struct TunnelAgent {
    primary: TunnelConnectionMgr,
    backup: Option<TunnelConnectionMgr>,
    queue: std::collections::VecDeque<Bytes>,
    queue_capacity: usize,
    /// Set by the service: when true, only device-originated traffic (not
    /// traffic relayed from the local fabric) may use the tunnel.
    routing_restricted: bool,
}

impl TunnelAgent {
    pub fn new(queue_capacity: usize, tick_interval: Duration, liveness_interval: Duration) -> Self {
        Self {
            primary: TunnelConnectionMgr::new(TunnelRole::Primary, BackoffConfig::default(), tick_interval, liveness_interval),
            backup: None,
            queue: std::collections::VecDeque::new(),
            queue_capacity,
            routing_restricted: false,
        }
    }

    pub fn enable_backup(&mut self, tick_interval: Duration, liveness_interval: Duration) {
        self.backup = Some(TunnelConnectionMgr::new(
            TunnelRole::Backup,
            BackoffConfig::default(),
            tick_interval,
            liveness_interval,
        ));
    }

    pub fn disable_backup(&mut self) -> Option<TunnelConnectionMgr> {
        self.backup.take()
    }

    pub fn set_routing_restricted(&mut self, restricted: bool) {
        self.routing_restricted = restricted;
    }

    pub fn is_routing_restricted(&self) -> bool {
        self.routing_restricted
    }

    pub fn primary(&self) -> &TunnelConnectionMgr {
        &self.primary
    }

    pub fn primary_mut(&mut self) -> &mut TunnelConnectionMgr {
        &mut self.primary
    }

    pub fn backup(&self) -> Option<&TunnelConnectionMgr> {
        self.backup.as_ref()
    }

    pub fn backup_mut(&mut self) -> Option<&mut TunnelConnectionMgr> {
        self.backup.as_mut()
    }

    /// The path currently carrying traffic: primary whenever it's up,
    /// falling back to backup only while primary is down (§ role policy:
    /// primary-preferred).
    pub fn active_role(&self) -> Option<TunnelRole> {
        if self.primary.state().is_established() {
            Some(TunnelRole::Primary)
        } else if self.backup.as_ref().is_some_and(|b| b.state().is_established()) {
            Some(TunnelRole::Backup)
        } else {
            None
        }
    }

    /// Routes (or queues) an outbound encapsulated packet. `from_device`
    /// distinguishes device-originated traffic from traffic relayed on
    /// behalf of another node on the local fabric, which a routing
    /// restriction may block.
    pub fn route_outbound(&mut self, packet: Bytes, from_device: bool) -> Result<TunnelRoute> {
        if self.routing_restricted && !from_device {
            return Err(WeaveError::TunnelRoutingRestricted);
        }
        if self.active_role().is_some() {
            return Ok(TunnelRoute::Immediate);
        }
        if self.queue.len() >= self.queue_capacity {
            return Err(WeaveError::TunnelServiceQueueFull);
        }
        self.queue.push_back(packet);
        Ok(TunnelRoute::Queued)
    }

    /// Drains everything queued while no path was up, for replay once one
    /// establishes.
    pub fn drain_queue(&mut self) -> smallvec::SmallVec<[Bytes; 8]> {
        self.queue.drain(..).collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Ages both connection managers' timers by one tick.
    pub fn expire_ticks(&mut self) {
        self.primary.expire_ticks();
        if let Some(backup) = self.backup.as_mut() {
            backup.expire_ticks();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> TunnelAgent {
        TunnelAgent::new(2, Duration::from_millis(200), Duration::from_secs(2))
    }

    #[test]
    fn outbound_queues_until_primary_established_then_routes_immediately() {
        let mut agent = agent();
        assert_eq!(
            agent.route_outbound(Bytes::from_static(b"pkt1"), true).unwrap(),
            TunnelRoute::Queued
        );

        agent.primary_mut().begin_connect().unwrap();
        agent.primary_mut().on_connected(1).unwrap();

        assert_eq!(
            agent.route_outbound(Bytes::from_static(b"pkt2"), true).unwrap(),
            TunnelRoute::Immediate
        );
        assert_eq!(agent.drain_queue().len(), 1);
    }

    #[test]
    fn queue_full_reports_error_without_dropping_silently() {
        let mut agent = agent();
        agent.route_outbound(Bytes::from_static(b"a"), true).unwrap();
        agent.route_outbound(Bytes::from_static(b"b"), true).unwrap();
        assert!(matches!(
            agent.route_outbound(Bytes::from_static(b"c"), true),
            Err(WeaveError::TunnelServiceQueueFull)
        ));
    }

    #[test]
    fn routing_restriction_blocks_relayed_traffic_only() {
        let mut agent = agent();
        agent.set_routing_restricted(true);
        assert!(matches!(
            agent.route_outbound(Bytes::from_static(b"relayed"), false),
            Err(WeaveError::TunnelRoutingRestricted)
        ));
        assert!(agent.route_outbound(Bytes::from_static(b"device"), true).is_ok());
    }

    #[test]
    fn backup_carries_traffic_only_while_primary_is_down() {
        let mut agent = agent();
        agent.enable_backup(Duration::from_millis(200), Duration::from_secs(2));
        agent.backup_mut().unwrap().begin_connect().unwrap();
        agent.backup_mut().unwrap().on_connected(2).unwrap();
        assert_eq!(agent.active_role(), Some(TunnelRole::Backup));

        agent.primary_mut().begin_connect().unwrap();
        agent.primary_mut().on_connected(1).unwrap();
        assert_eq!(agent.active_role(), Some(TunnelRole::Primary));
    }
}

//! The stack: the single owning value tying the message layer, exchange
//! manager, and (optionally) the tunnel agent together.

use std::{net::Ipv6Addr, time::Instant};

use weave_core::{
    error::Result,
    fabric::FabricState,
    ids::{NodeId, ProfileId},
};
use weave_transport::{
    ConnectionId, DatagramTransport, ExchangeDelegate, ExchangeKey, ExchangeManager, MessageLayer,
    PeerIdentity, SendFlags, StreamTransport,
};

use crate::config::StackConfig;

/// Owns every collaborator that makes up a running Weave device: the
/// message layer (transport framing + the fabric identity), the exchange
/// manager (reliable request/response conversations), and, when the
/// `tunnel` feature is enabled, the tunnel agent.
///
/// Methods pass collaborators to each other by reference rather than
/// having them own one another, so no component needs to reach back up
/// through a parent pointer.
pub struct Stack {
    message_layer: MessageLayer,
    exchange_manager: ExchangeManager,
    #[cfg(feature = "tunnel")]
    tunnel_agent: Option<weave_tunnel::TunnelAgent>,
}

impl Stack {
    pub fn new(
        config: StackConfig,
        datagram: Box<dyn DatagramTransport>,
        stream: Box<dyn StreamTransport>,
    ) -> Self {
        let fabric = FabricState::new(config.local_node_id, config.fabric_id, config.subnet_id);
        Self {
            message_layer: MessageLayer::new(fabric, datagram, stream),
            exchange_manager: ExchangeManager::new(
                config.exchange_capacity,
                config.retrans_table_capacity,
                config.unsolicited_capacity,
                config.tick_interval,
            ),
            #[cfg(feature = "tunnel")]
            tunnel_agent: None,
        }
    }

    pub fn message_layer(&self) -> &MessageLayer {
        &self.message_layer
    }

    pub fn message_layer_mut(&mut self) -> &mut MessageLayer {
        &mut self.message_layer
    }

    pub fn exchange_manager(&self) -> &ExchangeManager {
        &self.exchange_manager
    }

    pub fn exchange_manager_mut(&mut self) -> &mut ExchangeManager {
        &mut self.exchange_manager
    }

    #[cfg(feature = "tunnel")]
    pub fn enable_tunnel(&mut self, queue_capacity: usize, tick_interval: std::time::Duration, liveness_interval: std::time::Duration) {
        self.tunnel_agent = Some(weave_tunnel::TunnelAgent::new(queue_capacity, tick_interval, liveness_interval));
    }

    #[cfg(feature = "tunnel")]
    pub fn tunnel_agent(&self) -> Option<&weave_tunnel::TunnelAgent> {
        self.tunnel_agent.as_ref()
    }

    #[cfg(feature = "tunnel")]
    pub fn tunnel_agent_mut(&mut self) -> Option<&mut weave_tunnel::TunnelAgent> {
        self.tunnel_agent.as_mut()
    }

    /// Allocates an initiator-side exchange to `peer_node_id`, resolving its
    /// address via the fabric's known-address cache or deterministic ULA
    /// derivation.
    pub fn new_exchange(&mut self, profile_id: ProfileId, peer_node_id: NodeId) -> Result<ExchangeKey> {
        let identity = PeerIdentity {
            peer_node_id,
            peer_addr: Some(self.message_layer.fabric().select_node_address(peer_node_id)),
            peer_port: None,
            peer_interface: None,
            connection: None,
        };
        self.exchange_manager.new_exchange(profile_id, identity)
    }

    /// Allocates an initiator-side exchange bound to an existing connection
    /// (TCP/BLE) rather than UDP.
    pub fn new_exchange_on_connection(
        &mut self,
        profile_id: ProfileId,
        peer_node_id: NodeId,
        connection: ConnectionId,
    ) -> Result<ExchangeKey> {
        let identity = PeerIdentity {
            peer_node_id,
            peer_addr: None,
            peer_port: None,
            peer_interface: None,
            connection: Some(connection),
        };
        self.exchange_manager.new_exchange(profile_id, identity)
    }

    pub fn send_message(
        &mut self,
        key: ExchangeKey,
        message_type: u8,
        payload: &[u8],
        flags: SendFlags,
        msg_ctxt: Option<u64>,
    ) -> Result<()> {
        self.exchange_manager
            .send_message(&mut self.message_layer, key, message_type, payload, flags, msg_ctxt)
    }

    /// Flushes a pending piggyback ack on `key` immediately rather than
    /// waiting for the next timer tick.
    pub fn send_standalone_ack(&mut self, key: ExchangeKey) -> Result<()> {
        self.exchange_manager.send_standalone_ack(&mut self.message_layer, key)
    }

    pub fn close_exchange(&mut self, key: ExchangeKey) {
        self.exchange_manager.close(key);
    }

    pub fn abort_exchange(&mut self, key: ExchangeKey) {
        self.exchange_manager.abort(key);
    }

    /// Feeds a datagram received on the UDP endpoint into the exchange
    /// manager's inbound dispatch.
    pub fn handle_inbound_datagram(
        &mut self,
        source_addr: Ipv6Addr,
        source_port: u16,
        interface: Option<u32>,
        data: &[u8],
    ) -> Result<()> {
        self.exchange_manager
            .dispatch_inbound(&mut self.message_layer, source_addr, source_port, interface, None, data)
    }

    /// Feeds data received on an established stream (TCP/BLE) connection
    /// into the exchange manager's inbound dispatch.
    pub fn handle_inbound_stream(&mut self, connection: ConnectionId, data: &[u8]) -> Result<()> {
        self.exchange_manager.dispatch_inbound(
            &mut self.message_layer,
            Ipv6Addr::UNSPECIFIED,
            0,
            None,
            Some(connection),
            data,
        )
    }

    pub fn notify_connection_closed(&mut self, connection: ConnectionId, error: weave_core::error::WeaveError) {
        self.exchange_manager.notify_connection_closed(connection, error);
    }

    /// Drives one virtual tick across every timer-backed subsystem.
    pub fn on_timer_tick(&mut self) {
        self.exchange_manager.on_timer_tick(&mut self.message_layer);
        self.exchange_manager.check_response_timeouts(Instant::now());
        #[cfg(feature = "tunnel")]
        if let Some(tunnel) = self.tunnel_agent.as_mut() {
            tunnel.expire_ticks();
        }
    }

    /// Drains and dispatches every event queued since the last call.
    pub fn dispatch_events(&mut self, delegate: &mut dyn ExchangeDelegate) {
        self.exchange_manager.dispatch_events(delegate);
    }
}

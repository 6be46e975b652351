//! The exchange manager (C5): owns the exchange context pool, the
//! unsolicited-handler pool, and the inbound dispatch algorithm (§4.6).

use std::{collections::VecDeque, net::Ipv6Addr, time::Instant};

use bytes::Bytes;
use hashbrown::HashMap;
use slotmap::SlotMap;
use weave_core::{
    common_profile,
    error::{Result, WeaveError},
    exchange_header::{ExchangeFlags, ExchangeHeader, ExchangeVersion},
    ids::{DuplicateWindow, ExchangeId, KeyId, MessageId, NodeId, ProfileId, MIN_DUPLICATE_WINDOW},
    message_header::MessageHeader,
    tick::TickCount,
};

use tracing::{debug, trace, warn};

use crate::{
    binding::{Binding, BindingKey, BindingPool},
    context::{self, ConnectionId, ExchangeContext, ExchangeKey, PeerIdentity},
    events::{ExchangeDelegate, ExchangeEvent, UnsolicitedHandler},
    flags::{ContextFlags, SendFlags},
    message_layer::MessageLayer,
    reliable::ReliableMessaging,
};

type UnsolicitedSlot = (ProfileId, Option<u8>, Box<dyn UnsolicitedHandler>);

/// C5: the single owner of every live exchange on this device.
pub struct ExchangeManager {
    exchanges: SlotMap<ExchangeKey, ExchangeContext>,
    exchange_capacity: usize,
    next_exchange_id: u16,
    unsolicited_handlers: Vec<UnsolicitedSlot>,
    unsolicited_capacity: usize,
    bindings: BindingPool,
    reliable: ReliableMessaging,
    dup_windows: HashMap<(NodeId, KeyId), DuplicateWindow>,
    events: VecDeque<ExchangeEvent>,
}

impl ExchangeManager {
    pub fn new(
        exchange_capacity: usize,
        retrans_table_capacity: usize,
        unsolicited_capacity: usize,
        tick_interval: std::time::Duration,
    ) -> Self {
        Self {
            exchanges: SlotMap::with_capacity_and_key(exchange_capacity),
            exchange_capacity,
            // Seed away from zero so exchange ids don't collide with a peer
            // that reconnects shortly after we restart and also starts low.
            next_exchange_id: rand::random::<u16>().max(1),
            unsolicited_handlers: Vec::with_capacity(unsolicited_capacity),
            unsolicited_capacity,
            bindings: BindingPool::new(),
            reliable: ReliableMessaging::new(retrans_table_capacity, tick_interval),
            dup_windows: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn get(&self, key: ExchangeKey) -> Option<&ExchangeContext> {
        self.exchanges.get(key)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = ExchangeKey> + '_ {
        self.exchanges.keys()
    }

    fn alloc_exchange_id(&mut self) -> ExchangeId {
        let id = self.next_exchange_id;
        self.next_exchange_id = self.next_exchange_id.wrapping_add(1);
        ExchangeId::new(id)
    }

    fn new_exchange_for(
        &mut self,
        exchange_id: ExchangeId,
        is_initiator: bool,
        profile_id: ProfileId,
        identity: PeerIdentity,
    ) -> Result<ExchangeKey> {
        if self.exchanges.len() >= self.exchange_capacity {
            return Err(WeaveError::NoMemory);
        }
        Ok(self
            .exchanges
            .insert(ExchangeContext::new(exchange_id, is_initiator, profile_id, identity)))
    }

    /// Allocates a new initiator-side exchange bound to `identity`.
    pub fn new_exchange(&mut self, profile_id: ProfileId, identity: PeerIdentity) -> Result<ExchangeKey> {
        let exchange_id = self.alloc_exchange_id();
        self.new_exchange_for(exchange_id, true, profile_id, identity)
    }

    /// Drops the caller's reference to `key`; the exchange is freed once no
    /// references remain (§3 `ref_count`).
    pub fn close(&mut self, key: ExchangeKey) {
        self.release(key);
    }

    pub fn retain(&mut self, key: ExchangeKey) {
        context::retain_ref(&mut self.exchanges, key);
    }

    /// Drops the manager's own reference. Does NOT touch the retransmit
    /// table: an in-flight `RequestAck` send holds its own reference (added
    /// in `add_to_retrans_table`) and keeps the exchange alive until it
    /// completes, even after every other caller has released it.
    fn release(&mut self, key: ExchangeKey) {
        context::release_ref(&mut self.exchanges, key);
    }

    /// Unconditionally tears down `key`, ignoring outstanding references and
    /// clearing any in-flight retransmissions; used for abrupt aborts rather
    /// than graceful close.
    pub fn abort(&mut self, key: ExchangeKey) {
        self.reliable.clear_exchange(&mut self.exchanges, key);
        self.exchanges.remove(key);
    }

    pub fn create_binding(&mut self, binding: Binding) -> BindingKey {
        self.bindings.create(binding)
    }

    pub fn binding(&self, key: BindingKey) -> Option<&Binding> {
        self.bindings.get(key)
    }

    pub fn release_binding(&mut self, key: BindingKey) -> Option<Binding> {
        self.bindings.release(key)
    }

    /// Registers a handler for unsolicited initiator messages (§4.6 step 6).
    /// `message_type = None` matches every message type under `profile_id`.
    pub fn register_unsolicited_handler(
        &mut self,
        profile_id: ProfileId,
        message_type: Option<u8>,
        handler: Box<dyn UnsolicitedHandler>,
    ) -> Result<()> {
        if self.unsolicited_handlers.len() >= self.unsolicited_capacity {
            return Err(WeaveError::NoMemory);
        }
        self.unsolicited_handlers.push((profile_id, message_type, handler));
        Ok(())
    }

    pub fn unregister_unsolicited_handler(&mut self, profile_id: ProfileId, message_type: Option<u8>) {
        self.unsolicited_handlers
            .retain(|(p, mt, _)| !(*p == profile_id && *mt == message_type));
    }

    /// Prefers an exact-type handler over a wildcard (`message_type: None`)
    /// one registered for the same profile (§4.6 step 6).
    fn take_unsolicited_handler(&mut self, profile_id: ProfileId, message_type: u8) -> Option<UnsolicitedSlot> {
        let exact = self
            .unsolicited_handlers
            .iter()
            .position(|(p, mt, _)| *p == profile_id && *mt == Some(message_type));
        let idx = exact.or_else(|| {
            self.unsolicited_handlers
                .iter()
                .position(|(p, mt, _)| *p == profile_id && mt.is_none())
        })?;
        Some(self.unsolicited_handlers.remove(idx))
    }

    fn find_exchange(&self, peer: NodeId, exchange_id: ExchangeId, inbound_is_initiator: bool) -> Option<ExchangeKey> {
        // Linear scan over the live pool, mirroring the fixed-array scan the
        // original exchange manager does over its context table.
        self.exchanges
            .iter()
            .find(|(_, ctx)| {
                ctx.identity.peer_node_id.matches(peer)
                    && ctx.exchange_id == exchange_id
                    && ctx.is_initiator != inbound_is_initiator
            })
            .map(|(key, _)| key)
    }

    /// Sends an application message on `key` (§4.4). Allocates a fresh
    /// message id, applies the exchange's auto-ack-request policy, and (for
    /// UDP exchanges requesting an ack) registers the wire image for
    /// retransmission.
    pub fn send_message(
        &mut self,
        message_layer: &mut MessageLayer,
        key: ExchangeKey,
        message_type: u8,
        payload: &[u8],
        send_flags: SendFlags,
        msg_ctxt: Option<u64>,
    ) -> Result<()> {
        if send_flags.contains(SendFlags::EXPECT_RESPONSE) {
            let exchange = self.exchanges.get_mut(key).ok_or(WeaveError::IncorrectState)?;
            exchange.response_expected = true;
            exchange.response_deadline = Some(Instant::now() + exchange.response_timeout);
        }

        let exchange = self.exchanges.get(key).ok_or(WeaveError::IncorrectState)?;
        if exchange.is_connection_closed() {
            return Err(WeaveError::NotConnected);
        }
        if exchange.is_throttled() {
            trace!(?key, "send suppressed: exchange is throttled");
            return Err(WeaveError::SendThrottled);
        }

        let message_id = message_layer.fabric().next_message_id(exchange.key_id);
        let is_datagram = exchange.identity.connection.is_none();

        // An exchange bound to a connection (TCP/BLE) MUST NOT emit NeedsAck
        // frames: the connection itself guarantees delivery, so an explicit
        // request is a caller error (§4.4, testable property §8 #7).
        if send_flags.contains(SendFlags::REQUEST_ACK) && !is_datagram {
            return Err(WeaveError::InvalidArgument);
        }
        let auto_request_ack = exchange.flags.contains(ContextFlags::AUTO_REQUEST_ACK)
            && !send_flags.contains(SendFlags::NO_AUTO_REQUEST_ACK);
        let request_ack = is_datagram && (send_flags.contains(SendFlags::REQUEST_ACK) || auto_request_ack);

        let mut exchange_flags = ExchangeFlags::empty();
        if exchange.is_initiator {
            exchange_flags |= ExchangeFlags::INITIATOR;
        }
        if request_ack {
            exchange_flags |= ExchangeFlags::NEEDS_ACK;
        }
        let ack_message_id = if exchange.peer_requested_ack {
            exchange_flags |= ExchangeFlags::ACK_ID;
            exchange.pending_peer_ack_id
        } else {
            None
        };

        let message_header =
            MessageHeader::new(message_id).with_source(message_layer.fabric().local_node_id());
        let exchange_header = ExchangeHeader {
            version: ExchangeVersion::V1,
            flags: exchange_flags,
            message_type,
            exchange_id: exchange.exchange_id,
            profile_id: exchange.profile_id,
            ack_message_id,
        };
        let wire = message_layer.encode(&message_header, &exchange_header, payload);

        if request_ack {
            self.reliable
                .add_to_retrans_table(&mut self.exchanges, key, message_id, wire.clone(), msg_ctxt)?;
        }

        let exchange = self.exchanges.get(key).ok_or(WeaveError::IncorrectState)?;
        message_layer.send_to_identity(&exchange.identity, &wire)?;

        if let Some(exchange) = self.exchanges.get_mut(key) {
            if ack_message_id.is_some() {
                exchange.ack_pending = false;
                exchange.pending_peer_ack_id = None;
            }
        }
        Ok(())
    }

    /// Immediately flushes a pending piggyback ack rather than waiting for
    /// the next timer tick, e.g. when the application has nothing else to
    /// say on this exchange right now.
    pub fn send_standalone_ack(&mut self, message_layer: &mut MessageLayer, key: ExchangeKey) -> Result<()> {
        let exchange = self.exchanges.get(key).ok_or(WeaveError::IncorrectState)?;
        if !exchange.ack_pending {
            return Ok(());
        }
        let Some(ack_id) = exchange.pending_peer_ack_id else {
            self.exchanges.get_mut(key).unwrap().ack_pending = false;
            return Ok(());
        };

        let message_header =
            MessageHeader::new(MessageId::new(0)).with_source(message_layer.fabric().local_node_id());
        let exchange_header = ExchangeHeader {
            version: ExchangeVersion::V1,
            flags: ExchangeFlags::ACK_ID,
            message_type: weave_core::common_profile::NULL,
            exchange_id: exchange.exchange_id,
            profile_id: ProfileId::COMMON,
            ack_message_id: Some(ack_id),
        };
        let wire = message_layer.encode(&message_header, &exchange_header, &[]);
        message_layer.send_to_identity(&exchange.identity, &wire)?;

        let exchange = self.exchanges.get_mut(key).unwrap();
        exchange.ack_pending = false;
        exchange.pending_peer_ack_id = None;
        Ok(())
    }

    fn prime_exchange_from_inbound(
        &mut self,
        key: ExchangeKey,
        message_id: MessageId,
        needs_ack: bool,
        ack_id: Option<MessageId>,
    ) {
        if let Some(ack_id) = ack_id {
            self.reliable.handle_ack(&mut self.exchanges, key, ack_id, &mut self.events);
        }
        let Some(exchange) = self.exchanges.get_mut(key) else {
            return;
        };
        exchange.msg_rcvd_from_peer = true;
        if exchange.response_expected {
            exchange.response_expected = false;
            exchange.response_deadline = None;
        }
        exchange.last_rcvd_message_id = Some(message_id);
        if needs_ack {
            exchange.peer_requested_ack = true;
            exchange.pending_peer_ack_id = Some(message_id);
            exchange.ack_pending = true;
            exchange.next_ack_ticks =
                TickCount::from_duration(exchange.wrmp_config.ack_piggyback_timeout, self.reliable.tick_interval());
        }
    }

    fn dispatch_to_exchange(
        &mut self,
        key: ExchangeKey,
        exchange_header: &ExchangeHeader,
        message_id: MessageId,
        payload: Bytes,
        fabric_duplicate: bool,
    ) {
        self.prime_exchange_from_inbound(key, message_id, exchange_header.needs_ack(), exchange_header.ack_id());

        let is_common_null =
            exchange_header.profile_id == ProfileId::COMMON && exchange_header.message_type == common_profile::NULL;
        let is_throttle_flow = exchange_header.profile_id == ProfileId::COMMON
            && exchange_header.message_type == common_profile::WRMP_THROTTLE_FLOW;

        // Common/Null is an ack carrier and WRMP_Throttle_Flow is a transport
        // control message; neither is ever delivered to the application
        // (§4.4, §4.6 step 4).
        if is_common_null {
            return;
        }
        if is_throttle_flow {
            if let Some(pause_millis) = common_profile::decode_throttle_flow(&payload) {
                self.reliable.apply_throttle(&mut self.exchanges, key, pause_millis);
            }
            return;
        }

        let allow_duplicate_msgs = self
            .exchanges
            .get(key)
            .map(|ctx| ctx.allow_duplicate_msgs)
            .unwrap_or(false);
        if fabric_duplicate && !allow_duplicate_msgs {
            return;
        }
        self.events.push_back(ExchangeEvent::MessageReceived {
            exchange: key,
            profile_id: exchange_header.profile_id,
            message_type: exchange_header.message_type,
            payload,
            duplicate: fabric_duplicate,
        });
    }

    /// The inbound dispatch algorithm (§4.6): decode, authenticate,
    /// deduplicate, route to a live exchange or an unsolicited handler.
    /// Returns `Err(UnsolicitedMsgNoOriginator)` when neither matches.
    pub fn dispatch_inbound(
        &mut self,
        message_layer: &mut MessageLayer,
        source_addr: Ipv6Addr,
        source_port: u16,
        interface: Option<u32>,
        connection: Option<ConnectionId>,
        data: &[u8],
    ) -> Result<()> {
        let (message_header, exchange_header, payload) = message_layer.decode(data)?;
        let source = message_header.source_node_id.ok_or(WeaveError::InvalidArgument)?;
        if !message_layer.fabric().is_authentic_message_from_peer(source) {
            warn!(?source, "rejecting message from unauthenticated peer");
            return Err(WeaveError::AuthenticationFailed);
        }
        message_layer.fabric().record_peer_address(source, source_addr);

        // WRMP_Delayed_Delivery (§4.6 step 4) is a pure sideband: it applies
        // to every retransmit entry addressed to the named peer regardless of
        // which exchange it arrived on, and is handled ahead of exchange
        // matching rather than through it.
        if exchange_header.profile_id == ProfileId::COMMON
            && exchange_header.message_type == common_profile::WRMP_DELAYED_DELIVERY
        {
            if let Some((pause_millis, delayed_node_id)) = common_profile::decode_delayed_delivery(&payload) {
                self.reliable.apply_delayed_delivery(&self.exchanges, delayed_node_id, pause_millis);
            }
            return Ok(());
        }

        let key_id = message_header.encryption.map(|enc| enc.key_id).unwrap_or(KeyId::NONE);
        let fabric_duplicate = self
            .dup_windows
            .entry((source, key_id))
            .or_insert_with(|| DuplicateWindow::new(MIN_DUPLICATE_WINDOW))
            .check_and_record(message_header.message_id);

        if let Some(key) = self.find_exchange(source, exchange_header.exchange_id, exchange_header.is_initiator()) {
            self.dispatch_to_exchange(key, &exchange_header, message_header.message_id, payload, fabric_duplicate);
            return Ok(());
        }

        if let Some(mut slot) = self.take_unsolicited_handler(exchange_header.profile_id, exchange_header.message_type) {
            let identity = PeerIdentity {
                peer_node_id: source,
                peer_addr: Some(source_addr),
                peer_port: Some(source_port),
                peer_interface: interface,
                connection,
            };
            let key = self.new_exchange_for(exchange_header.exchange_id, false, exchange_header.profile_id, identity)?;
            self.prime_exchange_from_inbound(
                key,
                message_header.message_id,
                exchange_header.needs_ack(),
                exchange_header.ack_id(),
            );
            slot.2.handle(self, key, exchange_header.profile_id, exchange_header.message_type, payload);
            self.unsolicited_handlers.push(slot);
            return Ok(());
        }

        debug!(
            profile = exchange_header.profile_id.as_u32(),
            message_type = exchange_header.message_type,
            "no live exchange or unsolicited handler for inbound message"
        );
        Err(WeaveError::UnsolicitedMsgNoOriginator)
    }

    /// Walks every exchange attached to `connection`, marking it closed and
    /// dropping its outstanding retransmissions.
    pub fn notify_connection_closed(&mut self, connection: ConnectionId, error: WeaveError) {
        let affected: smallvec::SmallVec<[ExchangeKey; 4]> = self
            .exchanges
            .iter()
            .filter(|(_, ctx)| ctx.identity.connection == Some(connection))
            .map(|(key, _)| key)
            .collect();
        for key in affected {
            if let Some(ctx) = self.exchanges.get_mut(key) {
                ctx.flags |= ContextFlags::CONNECTION_CLOSED;
            }
            self.reliable.clear_exchange(&mut self.exchanges, key);
            self.events.push_back(ExchangeEvent::ConnectionClosed {
                exchange: key,
                error: error.clone(),
            });
        }
    }

    /// Scans for exchanges whose response timer has elapsed, reporting each
    /// exactly once (§4.4 response timeout).
    pub fn check_response_timeouts(&mut self, now: Instant) {
        let expired: smallvec::SmallVec<[ExchangeKey; 4]> = self
            .exchanges
            .iter()
            .filter(|(_, ctx)| ctx.response_expected && ctx.response_deadline.map_or(false, |d| now >= d))
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            if let Some(ctx) = self.exchanges.get_mut(key) {
                ctx.response_expected = false;
                ctx.response_deadline = None;
            }
            self.events.push_back(ExchangeEvent::ResponseTimeout { exchange: key });
        }
    }

    /// Drives one virtual tick: ages every timer, then executes whatever
    /// became due (§4.5 items 1-2).
    pub fn on_timer_tick(&mut self, message_layer: &mut MessageLayer) {
        self.reliable.expire_ticks(&mut self.exchanges);
        self.reliable
            .execute_actions(&mut self.exchanges, message_layer, &mut self.events);
    }

    /// Drains and dispatches every queued event to `delegate`. Draining into
    /// an owned `Vec` first means `delegate` can freely call back into
    /// `self` (close an exchange, send a reply) from inside a callback
    /// without re-entering a borrow of the event queue.
    pub fn dispatch_events(&mut self, delegate: &mut dyn ExchangeDelegate) {
        let drained: Vec<ExchangeEvent> = self.events.drain(..).collect();
        for event in drained {
            match event {
                ExchangeEvent::MessageReceived {
                    exchange,
                    profile_id,
                    message_type,
                    payload,
                    duplicate,
                } => delegate.on_message_received(self, exchange, profile_id, message_type, payload, duplicate),
                ExchangeEvent::AckReceived { exchange, msg_ctxt } => {
                    delegate.on_ack_received(self, exchange, msg_ctxt)
                }
                ExchangeEvent::SendError { exchange, error, msg_ctxt } => {
                    delegate.on_send_error(self, exchange, error, msg_ctxt)
                }
                ExchangeEvent::ResponseTimeout { exchange } => delegate.on_response_timeout(self, exchange),
                ExchangeEvent::ConnectionClosed { exchange, error } => {
                    delegate.on_connection_closed(self, exchange, error)
                }
                ExchangeEvent::KeyError { exchange, error } => delegate.on_key_error(self, exchange, error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::{
        fabric::FabricState,
        ids::{FabricId, NodeId},
    };

    struct RecordingTransport {
        sent: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }
    impl crate::message_layer::DatagramTransport for RecordingTransport {
        fn send_to(&mut self, _: Ipv6Addr, _: u16, _: Option<u32>, data: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }
    struct NoopStream;
    impl crate::message_layer::StreamTransport for NoopStream {
        fn send(&mut self, _: ConnectionId, _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn layer(local: NodeId) -> (MessageLayer, std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>) {
        let sent = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let layer = MessageLayer::new(
            FabricState::new(local, FabricId::new(1), 0),
            Box::new(RecordingTransport { sent: sent.clone() }),
            Box::new(NoopStream),
        );
        (layer, sent)
    }

    fn manager() -> ExchangeManager {
        ExchangeManager::new(8, 8, 4, std::time::Duration::from_millis(200))
    }

    fn identity(peer: NodeId) -> PeerIdentity {
        PeerIdentity {
            peer_node_id: peer,
            peer_addr: Some("fd00::2".parse().unwrap()),
            peer_port: None,
            peer_interface: None,
            connection: None,
        }
    }

    fn connected_identity(peer: NodeId) -> PeerIdentity {
        PeerIdentity {
            connection: Some(1),
            ..identity(peer)
        }
    }

    #[test]
    fn send_message_with_request_ack_registers_retransmit_entry() {
        let mut mgr = manager();
        let (mut layer, sent) = layer(NodeId::new(1));
        let key = mgr.new_exchange(ProfileId::COMMON, identity(NodeId::new(2))).unwrap();

        mgr.send_message(&mut layer, key, 5, b"hi", SendFlags::REQUEST_ACK, None)
            .unwrap();

        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(mgr.reliable.retransmit_table().len(), 1);
    }

    #[test]
    fn request_ack_rejected_on_connection_bound_exchange() {
        let mut mgr = manager();
        let (mut layer, sent) = layer(NodeId::new(1));
        let key = mgr
            .new_exchange(ProfileId::COMMON, connected_identity(NodeId::new(2)))
            .unwrap();

        let result = mgr.send_message(&mut layer, key, 5, b"hi", SendFlags::REQUEST_ACK, None);

        assert!(matches!(result, Err(WeaveError::InvalidArgument)));
        assert_eq!(sent.lock().unwrap().len(), 0);
        assert!(mgr.reliable.retransmit_table().is_empty());
    }

    #[test]
    fn auto_request_ack_is_suppressed_on_connection_bound_exchange() {
        let mut mgr = manager();
        let (mut layer, sent) = layer(NodeId::new(1));
        let key = mgr
            .new_exchange(ProfileId::COMMON, connected_identity(NodeId::new(2)))
            .unwrap();

        // No explicit REQUEST_ACK: the exchange's default AUTO_REQUEST_ACK
        // policy must not push NeedsAck onto a connection-bound send.
        mgr.send_message(&mut layer, key, 5, b"hi", SendFlags::empty(), None)
            .unwrap();

        assert_eq!(sent.lock().unwrap().len(), 1);
        assert!(mgr.reliable.retransmit_table().is_empty());
    }

    #[test]
    fn close_does_not_clear_outstanding_retransmit_entry() {
        let mut mgr = manager();
        let (mut layer, _sent) = layer(NodeId::new(1));
        let key = mgr.new_exchange(ProfileId::COMMON, identity(NodeId::new(2))).unwrap();

        mgr.send_message(&mut layer, key, 5, b"hi", SendFlags::REQUEST_ACK, None)
            .unwrap();
        assert_eq!(mgr.reliable.retransmit_table().len(), 1);

        mgr.close(key);

        // The retransmit table's own reference keeps the exchange alive and
        // the entry uncleared; only `abort` forces it out.
        assert_eq!(mgr.reliable.retransmit_table().len(), 1);
        assert!(mgr.get(key).is_some());
    }

    #[test]
    fn abort_clears_outstanding_retransmit_entry() {
        let mut mgr = manager();
        let (mut layer, _sent) = layer(NodeId::new(1));
        let key = mgr.new_exchange(ProfileId::COMMON, identity(NodeId::new(2))).unwrap();

        mgr.send_message(&mut layer, key, 5, b"hi", SendFlags::REQUEST_ACK, None)
            .unwrap();
        assert_eq!(mgr.reliable.retransmit_table().len(), 1);

        mgr.abort(key);

        assert!(mgr.reliable.retransmit_table().is_empty());
        assert!(mgr.get(key).is_none());
    }

    #[test]
    fn unsolicited_message_allocates_responder_exchange_and_invokes_handler() {
        let mut mgr = manager();
        let (mut layer, _sent) = layer(NodeId::new(1));

        let invoked = std::sync::Arc::new(std::sync::Mutex::new(false));
        let invoked2 = invoked.clone();
        mgr.register_unsolicited_handler(
            ProfileId::COMMON,
            Some(9),
            Box::new(
                move |_manager: &mut ExchangeManager,
                      _exchange: ExchangeKey,
                      _profile: ProfileId,
                      _message_type: u8,
                      _payload: Bytes| {
                    *invoked2.lock().unwrap() = true;
                },
            ),
        )
        .unwrap();

        let peer_layer = MessageLayer::new(
            FabricState::new(NodeId::new(2), FabricId::new(1), 0),
            Box::new(NoopDatagram),
            Box::new(NoopStream),
        );
        let message_header = MessageHeader::new(MessageId::new(1)).with_source(NodeId::new(2));
        let exchange_header = ExchangeHeader {
            version: ExchangeVersion::V1,
            flags: ExchangeFlags::INITIATOR,
            message_type: 9,
            exchange_id: ExchangeId::new(55),
            profile_id: ProfileId::COMMON,
            ack_message_id: None,
        };
        let wire = peer_layer.encode(&message_header, &exchange_header, b"ping");

        mgr.dispatch_inbound(&mut layer, "fd00::2".parse().unwrap(), 0, None, None, &wire)
            .unwrap();

        assert!(*invoked.lock().unwrap());
        assert_eq!(mgr.len(), 1);
    }

    struct NoopDatagram;
    impl crate::message_layer::DatagramTransport for NoopDatagram {
        fn send_to(&mut self, _: Ipv6Addr, _: u16, _: Option<u32>, _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unmatched_message_with_no_handler_is_rejected() {
        let mut mgr = manager();
        let (mut layer, _sent) = layer(NodeId::new(1));

        let peer_layer = MessageLayer::new(
            FabricState::new(NodeId::new(2), FabricId::new(1), 0),
            Box::new(NoopDatagram),
            Box::new(NoopStream),
        );
        let message_header = MessageHeader::new(MessageId::new(1)).with_source(NodeId::new(2));
        let exchange_header = ExchangeHeader {
            version: ExchangeVersion::V1,
            flags: ExchangeFlags::INITIATOR,
            message_type: 9,
            exchange_id: ExchangeId::new(55),
            profile_id: ProfileId::COMMON,
            ack_message_id: None,
        };
        let wire = peer_layer.encode(&message_header, &exchange_header, b"ping");

        let result = mgr.dispatch_inbound(&mut layer, "fd00::2".parse().unwrap(), 0, None, None, &wire);
        assert!(matches!(result, Err(WeaveError::UnsolicitedMsgNoOriginator)));
    }

    struct CountingDelegate(std::sync::Arc<std::sync::atomic::AtomicUsize>);
    impl ExchangeDelegate for CountingDelegate {
        fn on_message_received(
            &mut self,
            _manager: &mut ExchangeManager,
            _exchange: ExchangeKey,
            _profile_id: ProfileId,
            _message_type: u8,
            _payload: Bytes,
            _duplicate: bool,
        ) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn common_null_message_is_not_delivered_to_application() {
        let mut mgr = manager();
        let (mut layer, _sent) = layer(NodeId::new(1));
        let key = mgr.new_exchange(ProfileId::COMMON, identity(NodeId::new(2))).unwrap();
        let exchange_id = mgr.get(key).unwrap().exchange_id;

        let peer_layer = MessageLayer::new(
            FabricState::new(NodeId::new(2), FabricId::new(1), 0),
            Box::new(NoopDatagram),
            Box::new(NoopStream),
        );
        let message_header = MessageHeader::new(MessageId::new(1)).with_source(NodeId::new(2));
        let exchange_header = ExchangeHeader {
            version: ExchangeVersion::V1,
            flags: ExchangeFlags::empty(),
            message_type: common_profile::NULL,
            exchange_id,
            profile_id: ProfileId::COMMON,
            ack_message_id: None,
        };
        let wire = peer_layer.encode(&message_header, &exchange_header, &[]);

        mgr.dispatch_inbound(&mut layer, "fd00::2".parse().unwrap(), 0, None, None, &wire)
            .unwrap();

        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut delegate = CountingDelegate(count.clone());
        mgr.dispatch_events(&mut delegate);

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn throttle_flow_pauses_exchange_and_is_not_delivered() {
        let mut mgr = manager();
        let (mut layer, _sent) = layer(NodeId::new(1));
        let key = mgr.new_exchange(ProfileId::COMMON, identity(NodeId::new(2))).unwrap();
        let exchange_id = mgr.get(key).unwrap().exchange_id;

        let peer_layer = MessageLayer::new(
            FabricState::new(NodeId::new(2), FabricId::new(1), 0),
            Box::new(NoopDatagram),
            Box::new(NoopStream),
        );
        let message_header = MessageHeader::new(MessageId::new(1)).with_source(NodeId::new(2));
        let exchange_header = ExchangeHeader {
            version: ExchangeVersion::V1,
            flags: ExchangeFlags::empty(),
            message_type: common_profile::WRMP_THROTTLE_FLOW,
            exchange_id,
            profile_id: ProfileId::COMMON,
            ack_message_id: None,
        };
        let wire = peer_layer.encode(&message_header, &exchange_header, &400u32.to_le_bytes());

        mgr.dispatch_inbound(&mut layer, "fd00::2".parse().unwrap(), 0, None, None, &wire)
            .unwrap();

        assert!(mgr.get(key).unwrap().is_throttled());

        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut delegate = CountingDelegate(count.clone());
        mgr.dispatch_events(&mut delegate);

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn delayed_delivery_extends_retransmit_timer_for_named_peer() {
        let mut mgr = manager();
        let (mut layer, _sent) = layer(NodeId::new(1));
        let peer = NodeId::new(2);
        let key = mgr.new_exchange(ProfileId::COMMON, identity(peer)).unwrap();
        mgr.send_message(&mut layer, key, 5, b"hi", SendFlags::REQUEST_ACK, None)
            .unwrap();

        let peer_layer = MessageLayer::new(
            FabricState::new(peer, FabricId::new(1), 0),
            Box::new(NoopDatagram),
            Box::new(NoopStream),
        );
        let message_header = MessageHeader::new(MessageId::new(1)).with_source(peer);
        let mut payload = Vec::new();
        payload.extend_from_slice(&250u32.to_le_bytes());
        payload.extend_from_slice(&peer.as_u64().to_le_bytes());
        let exchange_header = ExchangeHeader {
            version: ExchangeVersion::V1,
            flags: ExchangeFlags::empty(),
            message_type: common_profile::WRMP_DELAYED_DELIVERY,
            // Delivered on an unrelated exchange id: the sideband applies by
            // peer, not by the exchange it arrives on.
            exchange_id: ExchangeId::new(9999),
            profile_id: ProfileId::COMMON,
            ack_message_id: None,
        };
        let wire = peer_layer.encode(&message_header, &exchange_header, &payload);

        mgr.dispatch_inbound(&mut layer, "fd00::2".parse().unwrap(), 0, None, None, &wire)
            .unwrap();

        assert_eq!(mgr.reliable.retransmit_table().len(), 1);
    }
}

//! WRMP reliable messaging (§4.5): the retransmit table plus the tick-driven
//! timer wheel that drains it.

use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;
use slotmap::SlotMap;
use tracing::{debug, trace};
use weave_core::{
    error::WeaveError,
    exchange_header::{ExchangeFlags, ExchangeHeader, ExchangeVersion},
    ids::{MessageId, NodeId, ProfileId},
    message_header::MessageHeader,
    tick::TickCount,
};

use crate::{
    context::{self, ExchangeKey, PeerIdentity},
    events::ExchangeEvent,
    message_layer::MessageLayer,
    retransmit::{RetransKey, RetransmitEntry, RetransmitTable},
    ExchangeContext,
};

/// Owns the retransmit table and the per-tick bookkeeping that ages it
/// (§4.5 items 1-3). Exchange-level ack/throttle timers live on
/// `ExchangeContext` itself; this module ages both together so a single
/// timer callback can drive the whole subsystem.
pub struct ReliableMessaging {
    retransmit_table: RetransmitTable,
    tick_interval: std::time::Duration,
}

impl ReliableMessaging {
    pub fn new(retrans_table_capacity: usize, tick_interval: std::time::Duration) -> Self {
        Self {
            retransmit_table: RetransmitTable::new(retrans_table_capacity),
            tick_interval,
        }
    }

    pub fn retransmit_table(&self) -> &RetransmitTable {
        &self.retransmit_table
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        self.tick_interval
    }

    /// Registers a freshly-sent WRMP message for retransmission, using the
    /// exchange's current retransmit timeout (§4.5: slow initial probe, then
    /// the steady-state timeout once any reply has arrived). Adds a
    /// reference to the exchange (§3: "addref held until entry cleared"),
    /// released in `handle_ack`/`clear_exchange`/exhaustion.
    pub fn add_to_retrans_table(
        &mut self,
        exchanges: &mut SlotMap<ExchangeKey, ExchangeContext>,
        exchange_key: ExchangeKey,
        msg_id: MessageId,
        msg_buffer: Bytes,
        msg_ctxt: Option<u64>,
    ) -> weave_core::error::Result<RetransKey> {
        let next_retrans_ticks = exchanges
            .get(exchange_key)
            .ok_or(WeaveError::IncorrectState)?
            .current_retransmit_ticks(self.tick_interval);
        let entry = RetransmitEntry {
            exchange: exchange_key,
            msg_id,
            msg_buffer,
            send_count: 1,
            next_retrans_ticks,
            msg_ctxt,
        };
        let key = self
            .retransmit_table
            .insert(entry)
            .ok_or(WeaveError::RetransTableFull)?;
        context::retain_ref(exchanges, exchange_key);
        Ok(key)
    }

    /// Processes an inbound piggybacked ack (§4.4): clears the matching
    /// retransmit entry and reports `AckReceived`. A no-op (not an error) if
    /// no entry matches, since the ack may have already been satisfied by an
    /// earlier duplicate delivery.
    pub fn handle_ack(
        &mut self,
        exchanges: &mut SlotMap<ExchangeKey, ExchangeContext>,
        exchange_key: ExchangeKey,
        ack_id: MessageId,
        events: &mut VecDeque<ExchangeEvent>,
    ) {
        if let Some(key) = self.retransmit_table.find_ack(exchange_key, ack_id) {
            if let Some(entry) = self.retransmit_table.remove(key) {
                context::release_ref(exchanges, entry.exchange);
                events.push_back(ExchangeEvent::AckReceived {
                    exchange: exchange_key,
                    msg_ctxt: entry.msg_ctxt,
                });
            }
        }
    }

    /// Drops every retransmit entry belonging to `exchange`, e.g. on abort
    /// or connection close, releasing the reference each one held. Does not
    /// emit events; callers that need one (`ConnectionClosed`) push it
    /// themselves.
    pub fn clear_exchange(&mut self, exchanges: &mut SlotMap<ExchangeKey, ExchangeContext>, exchange: ExchangeKey) {
        for key in self.retransmit_table.keys_for_exchange(exchange) {
            if let Some(entry) = self.retransmit_table.remove(key) {
                context::release_ref(exchanges, entry.exchange);
            }
        }
    }

    /// `WRMP_Throttle_Flow` (§4.4): pauses `exchange`'s own ack timer and
    /// every retransmit entry currently in flight on it by `pause_millis`.
    pub fn apply_throttle(
        &mut self,
        exchanges: &mut SlotMap<ExchangeKey, ExchangeContext>,
        exchange: ExchangeKey,
        pause_millis: u32,
    ) {
        let pause_ticks = TickCount::from_duration(Duration::from_millis(pause_millis as u64), self.tick_interval);
        if let Some(ctx) = exchanges.get_mut(exchange) {
            ctx.throttle_ticks = pause_ticks;
        }
        for (_, entry) in self.retransmit_table.iter_mut() {
            if entry.exchange == exchange {
                entry.next_retrans_ticks = entry.next_retrans_ticks.add(pause_ticks.0);
            }
        }
    }

    /// `WRMP_Delayed_Delivery` (§4.6 step 4): a pure sideband, independent of
    /// exchange matching. Extends the retransmit timer of every in-flight
    /// entry addressed to `delayed_node_id`, on any exchange.
    pub fn apply_delayed_delivery(
        &mut self,
        exchanges: &SlotMap<ExchangeKey, ExchangeContext>,
        delayed_node_id: NodeId,
        pause_millis: u32,
    ) {
        let pause_ticks = TickCount::from_duration(Duration::from_millis(pause_millis as u64), self.tick_interval);
        for (_, entry) in self.retransmit_table.iter_mut() {
            let targets_delayed_peer = exchanges
                .get(entry.exchange)
                .map_or(false, |ctx| ctx.identity.peer_node_id == delayed_node_id);
            if targets_delayed_peer {
                entry.next_retrans_ticks = entry.next_retrans_ticks.add(pause_ticks.0);
            }
        }
    }

    /// Ages every exchange's ack/throttle timers and every retransmit
    /// entry's timer by one tick (§4.5 item 1; testable property §8 #4).
    pub fn expire_ticks(&mut self, exchanges: &mut SlotMap<ExchangeKey, ExchangeContext>) {
        for (_, exchange) in exchanges.iter_mut() {
            if exchange.ack_pending {
                exchange.next_ack_ticks = exchange.next_ack_ticks.expire(1);
            }
            exchange.throttle_ticks = exchange.throttle_ticks.expire(1);
        }
        for (_, entry) in self.retransmit_table.iter_mut() {
            entry.next_retrans_ticks = entry.next_retrans_ticks.expire(1);
        }
    }

    /// Runs every due action (§4.5 item 2): emits pending acks and
    /// retransmits or fails exhausted entries. `exchanges` and
    /// `message_layer` are borrowed rather than owned so the caller (the
    /// exchange manager) retains them for its own bookkeeping.
    pub fn execute_actions(
        &mut self,
        exchanges: &mut SlotMap<ExchangeKey, ExchangeContext>,
        message_layer: &mut MessageLayer,
        events: &mut VecDeque<ExchangeEvent>,
    ) {
        self.send_due_acks(exchanges, message_layer);
        self.run_due_retransmits(exchanges, message_layer, events);
    }

    fn send_due_acks(
        &mut self,
        exchanges: &mut SlotMap<ExchangeKey, ExchangeContext>,
        message_layer: &mut MessageLayer,
    ) {
        for (_, exchange) in exchanges.iter_mut() {
            if !exchange.ack_pending || !exchange.next_ack_ticks.is_due() {
                continue;
            }
            let Some(ack_id) = exchange.pending_peer_ack_id else {
                exchange.ack_pending = false;
                continue;
            };
            if exchange.flags.contains(crate::flags::ContextFlags::DROP_ACK) {
                exchange.ack_pending = false;
                continue;
            }

            let message_header = MessageHeader::new(MessageId::new(0))
                .with_source(exchange.identity.peer_node_id);
            let exchange_header = ExchangeHeader {
                version: ExchangeVersion::V1,
                flags: ExchangeFlags::ACK_ID,
                message_type: weave_core::common_profile::NULL,
                exchange_id: exchange.exchange_id,
                profile_id: ProfileId::COMMON,
                ack_message_id: Some(ack_id),
            };
            let wire = message_layer.encode(&message_header, &exchange_header, &[]);
            // A standalone ack is fire-and-forget: a dropped ack is simply
            // re-sent the next time the peer retransmits.
            let _ = message_layer.send_to_identity(&exchange.identity, &wire);
            exchange.ack_pending = false;
        }
    }

    fn run_due_retransmits(
        &mut self,
        exchanges: &mut SlotMap<ExchangeKey, ExchangeContext>,
        message_layer: &mut MessageLayer,
        events: &mut VecDeque<ExchangeEvent>,
    ) {
        let due: smallvec::SmallVec<[RetransKey; 8]> = self
            .retransmit_table
            .iter()
            .filter(|(_, entry)| entry.next_retrans_ticks.is_due())
            .map(|(key, _)| key)
            .collect();

        for key in due {
            let Some(entry) = self.retransmit_table.get(key) else {
                continue;
            };
            let Some(exchange) = exchanges.get(entry.exchange) else {
                self.retransmit_table.remove(key);
                continue;
            };

            let max_retrans = exchange.wrmp_config.max_retrans;
            if entry.send_count > max_retrans {
                let entry = self.retransmit_table.remove(key).expect("checked above");
                context::release_ref(exchanges, entry.exchange);
                debug!(msg_id = ?entry.msg_id, send_count = entry.send_count, "retransmission exhausted");
                events.push_back(ExchangeEvent::SendError {
                    exchange: entry.exchange,
                    error: WeaveError::MessageNotAcknowledged,
                    msg_ctxt: entry.msg_ctxt,
                });
                continue;
            }

            let send_result = message_layer.send_to_identity(&exchange.identity, &entry.msg_buffer);
            match send_result {
                Ok(()) => {
                    let retrans_ticks = exchange.current_retransmit_ticks(self.tick_interval);
                    let entry = self.retransmit_table.get_mut(key).expect("checked above");
                    entry.send_count += 1;
                    trace!(msg_id = ?entry.msg_id, send_count = entry.send_count, "retransmitted");
                    entry.next_retrans_ticks = retrans_ticks;
                }
                Err(err) if err.is_send_error_non_critical() => {
                    let retrans_ticks = TickCount::from_duration(
                        exchange.wrmp_config.active_retrans_timeout,
                        self.tick_interval,
                    );
                    let entry = self.retransmit_table.get_mut(key).expect("checked above");
                    entry.next_retrans_ticks = retrans_ticks;
                }
                Err(err) => {
                    let entry = self.retransmit_table.remove(key).expect("checked above");
                    context::release_ref(exchanges, entry.exchange);
                    events.push_back(ExchangeEvent::SendError {
                        exchange: entry.exchange,
                        error: err,
                        msg_ctxt: entry.msg_ctxt,
                    });
                }
            }
        }
    }
}

//! The exchange context (C4): one instance per logical request/response
//! conversation (§3, §4.4).

use crate::flags::ContextFlags;
use std::{net::Ipv6Addr, time::Duration};
use weave_core::{
    ids::{ExchangeId, KeyId, MessageId, NodeId, ProfileId},
    message_header::{EncryptionType, MessageVersion},
    tick::{TickCount, DEFAULT_TICK_INTERVAL},
};

slotmap::new_key_type! {
    /// Stable handle to a pooled `ExchangeContext`. Invalidated once the slot
    /// is freed and reused (the slotmap generation changes), matching the
    /// generational-arena approach recommended for the raw-pointer graphs in
    /// the original implementation.
    pub struct ExchangeKey;
}

/// Opaque handle identifying a connection owned by the message layer. TCP
/// and BLE connections are addressed this way; UDP exchanges carry `None`.
pub type ConnectionId = u64;

/// Reliability tuning knobs (§4.5, §6 `Configuration options`).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WrmpConfig {
    pub initial_retrans_timeout: Duration,
    pub active_retrans_timeout: Duration,
    pub max_retrans: u8,
    pub ack_piggyback_timeout: Duration,
}

impl Default for WrmpConfig {
    fn default() -> Self {
        Self {
            initial_retrans_timeout: Duration::from_millis(2000),
            active_retrans_timeout: Duration::from_millis(2000),
            max_retrans: 3,
            ack_piggyback_timeout: Duration::from_millis(200),
        }
    }
}

/// Identity and addressing half of an exchange's state.
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    pub peer_node_id: NodeId,
    pub peer_addr: Option<Ipv6Addr>,
    pub peer_port: Option<u16>,
    pub peer_interface: Option<u32>,
    pub connection: Option<ConnectionId>,
}

/// One request/response conversation, scoped by `(peer_node, exchange_id,
/// is_initiator, connection?)` (Glossary).
#[derive(Clone, Debug)]
pub struct ExchangeContext {
    pub identity: PeerIdentity,

    pub exchange_id: ExchangeId,
    pub is_initiator: bool,
    pub encryption_type: Option<EncryptionType>,
    pub key_id: KeyId,
    pub msg_protocol_version: MessageVersion,
    pub profile_id: ProfileId,
    pub allow_duplicate_msgs: bool,

    pub response_expected: bool,
    pub response_timeout: Duration,
    pub response_deadline: Option<std::time::Instant>,

    pub ack_pending: bool,
    pub pending_peer_ack_id: Option<MessageId>,
    pub peer_requested_ack: bool,
    pub msg_rcvd_from_peer: bool,
    pub next_ack_ticks: TickCount,
    pub wrmp_config: WrmpConfig,
    pub throttle_ticks: TickCount,
    /// Last inbound message id observed on this exchange; used to detect an
    /// immediate duplicate retransmission from the peer (§4.4).
    pub last_rcvd_message_id: Option<MessageId>,

    pub flags: ContextFlags,
    pub ref_count: u32,
}

impl ExchangeContext {
    pub fn new(
        exchange_id: ExchangeId,
        is_initiator: bool,
        profile_id: ProfileId,
        identity: PeerIdentity,
    ) -> Self {
        Self {
            identity,
            exchange_id,
            is_initiator,
            encryption_type: None,
            key_id: KeyId::NONE,
            msg_protocol_version: MessageVersion::V1,
            profile_id,
            allow_duplicate_msgs: false,
            response_expected: false,
            response_timeout: Duration::ZERO,
            response_deadline: None,
            ack_pending: false,
            pending_peer_ack_id: None,
            peer_requested_ack: false,
            msg_rcvd_from_peer: false,
            next_ack_ticks: TickCount::ZERO,
            wrmp_config: WrmpConfig::default(),
            throttle_ticks: TickCount::ZERO,
            last_rcvd_message_id: None,
            flags: ContextFlags::AUTO_REQUEST_ACK,
            ref_count: 1,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        self.flags.contains(ContextFlags::CONNECTION_CLOSED)
    }

    pub fn is_throttled(&self) -> bool {
        !self.throttle_ticks.is_due()
    }

    /// The retransmit timeout to apply to the *next* attempt: a slow first
    /// probe, then the faster steady-state timeout once any message has been
    /// received from the peer on this exchange (§4.5).
    pub fn current_retransmit_timeout(&self) -> Duration {
        if self.msg_rcvd_from_peer {
            self.wrmp_config.active_retrans_timeout
        } else {
            self.wrmp_config.initial_retrans_timeout
        }
    }

    pub fn current_retransmit_ticks(&self, tick_interval: Duration) -> TickCount {
        TickCount::from_duration(self.current_retransmit_timeout(), tick_interval)
    }

    /// Invariant (§8 #3): `ack_pending ⇒ peer_requested_ack ∧
    /// pending_peer_ack_id != None`.
    pub fn check_ack_invariant(&self) -> bool {
        !self.ack_pending || (self.peer_requested_ack && self.pending_peer_ack_id.is_some())
    }
}

pub const DEFAULT_TICK_WIDTH: Duration = DEFAULT_TICK_INTERVAL;

/// Adds one reference to `key`'s exchange, e.g. when a retransmit-table
/// entry is created for it (§3: "addref held until entry cleared").
pub(crate) fn retain_ref(exchanges: &mut slotmap::SlotMap<ExchangeKey, ExchangeContext>, key: ExchangeKey) {
    if let Some(ctx) = exchanges.get_mut(key) {
        ctx.ref_count = ctx.ref_count.saturating_add(1);
    }
}

/// Drops one reference from `key`'s exchange, freeing it once the count
/// reaches zero. Returns whether the exchange was freed.
pub(crate) fn release_ref(exchanges: &mut slotmap::SlotMap<ExchangeKey, ExchangeContext>, key: ExchangeKey) -> bool {
    let should_free = match exchanges.get_mut(key) {
        Some(ctx) => {
            ctx.ref_count = ctx.ref_count.saturating_sub(1);
            ctx.ref_count == 0
        }
        None => false,
    };
    if should_free {
        exchanges.remove(key);
    }
    should_free
}

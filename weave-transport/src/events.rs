//! Exchange lifecycle events (§5).
//!
//! The original implementation invokes application callbacks synchronously,
//! re-entrantly, from deep inside send/receive/timer processing. Here the
//! manager instead queues `ExchangeEvent`s during `dispatch_inbound` /
//! `on_timer_tick` and the caller drains them afterwards via
//! `ExchangeManager::dispatch_events`, which hands the delegate a live
//! `&mut ExchangeManager` so it can still call back in (close, abort,
//! send_message) — without ever doing so while a pool borrow is held.

use crate::context::ExchangeKey;
use bytes::Bytes;
use weave_core::{error::WeaveError, ids::ProfileId};

#[derive(Debug)]
pub enum ExchangeEvent {
    MessageReceived {
        exchange: ExchangeKey,
        profile_id: ProfileId,
        message_type: u8,
        payload: Bytes,
        duplicate: bool,
    },
    AckReceived {
        exchange: ExchangeKey,
        msg_ctxt: Option<u64>,
    },
    SendError {
        exchange: ExchangeKey,
        error: WeaveError,
        msg_ctxt: Option<u64>,
    },
    ResponseTimeout {
        exchange: ExchangeKey,
    },
    ConnectionClosed {
        exchange: ExchangeKey,
        error: WeaveError,
    },
    KeyError {
        exchange: ExchangeKey,
        error: WeaveError,
    },
}

/// Application hooks for exchange events. All methods have a no-op default
/// so implementers only override what they use.
pub trait ExchangeDelegate {
    fn on_message_received(
        &mut self,
        manager: &mut crate::manager::ExchangeManager,
        exchange: ExchangeKey,
        profile_id: ProfileId,
        message_type: u8,
        payload: Bytes,
        duplicate: bool,
    ) {
        let _ = (manager, exchange, profile_id, message_type, payload, duplicate);
    }

    fn on_ack_received(
        &mut self,
        manager: &mut crate::manager::ExchangeManager,
        exchange: ExchangeKey,
        msg_ctxt: Option<u64>,
    ) {
        let _ = (manager, exchange, msg_ctxt);
    }

    fn on_send_error(
        &mut self,
        manager: &mut crate::manager::ExchangeManager,
        exchange: ExchangeKey,
        error: WeaveError,
        msg_ctxt: Option<u64>,
    ) {
        let _ = (manager, exchange, error, msg_ctxt);
    }

    fn on_response_timeout(
        &mut self,
        manager: &mut crate::manager::ExchangeManager,
        exchange: ExchangeKey,
    ) {
        let _ = (manager, exchange);
    }

    fn on_connection_closed(
        &mut self,
        manager: &mut crate::manager::ExchangeManager,
        exchange: ExchangeKey,
        error: WeaveError,
    ) {
        let _ = (manager, exchange, error);
    }

    fn on_key_error(
        &mut self,
        manager: &mut crate::manager::ExchangeManager,
        exchange: ExchangeKey,
        error: WeaveError,
    ) {
        let _ = (manager, exchange, error);
    }
}

/// Handles an inbound initiator message with no matching live exchange
/// (§4.6 step 6): registered per `(profile_id, message_type)`.
pub trait UnsolicitedHandler: Send {
    fn handle(
        &mut self,
        manager: &mut crate::manager::ExchangeManager,
        exchange: ExchangeKey,
        profile_id: ProfileId,
        message_type: u8,
        payload: Bytes,
    );
}

impl<F> UnsolicitedHandler for F
where
    F: FnMut(&mut crate::manager::ExchangeManager, ExchangeKey, ProfileId, u8, Bytes) + Send,
{
    fn handle(
        &mut self,
        manager: &mut crate::manager::ExchangeManager,
        exchange: ExchangeKey,
        profile_id: ProfileId,
        message_type: u8,
        payload: Bytes,
    ) {
        self(manager, exchange, profile_id, message_type, payload)
    }
}

//! The cross-exchange retransmit table (§3, §4.5): entries for WRMP
//! messages awaiting acknowledgment.

use crate::context::ExchangeKey;
use bytes::Bytes;
use weave_core::{ids::MessageId, tick::TickCount};

slotmap::new_key_type! {
    pub struct RetransKey;
}

/// One outstanding WRMP send awaiting acknowledgment.
///
/// The entry is the exclusive owner of `msg_buffer` until it is cleared
/// (§5): nothing else retains a copy of the encoded wire image.
#[derive(Clone, Debug)]
pub struct RetransmitEntry {
    pub exchange: ExchangeKey,
    pub msg_id: MessageId,
    pub msg_buffer: Bytes,
    pub send_count: u8,
    pub next_retrans_ticks: TickCount,
    /// Opaque application context token threaded back through `on_send_error`
    /// / `on_ack_received`, mirroring the original `msgCtxt` pointer.
    pub msg_ctxt: Option<u64>,
}

/// Fixed-capacity (by convention, enforced at insert time) table of
/// in-flight retransmissions, shared across every exchange owned by one
/// `ExchangeManager` (§5: "the manager is the sole mutator").
pub struct RetransmitTable {
    entries: slotmap::SlotMap<RetransKey, RetransmitEntry>,
    capacity: usize,
}

impl RetransmitTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: slotmap::SlotMap::with_capacity_and_key(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Inserts a new entry, returning `None` if the table is at capacity
    /// (`RetransTableFull`, §7).
    pub fn insert(&mut self, entry: RetransmitEntry) -> Option<RetransKey> {
        if self.is_full() {
            return None;
        }
        Some(self.entries.insert(entry))
    }

    pub fn get(&self, key: RetransKey) -> Option<&RetransmitEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: RetransKey) -> Option<&mut RetransmitEntry> {
        self.entries.get_mut(key)
    }

    /// Clears an entry, releasing its buffer and exchange reference exactly
    /// once (§8 #2).
    pub fn remove(&mut self, key: RetransKey) -> Option<RetransmitEntry> {
        self.entries.remove(key)
    }

    /// Finds the entry on `exchange` acknowledging `ack_id`, if any.
    pub fn find_ack(&self, exchange: ExchangeKey, ack_id: MessageId) -> Option<RetransKey> {
        self.entries
            .iter()
            .find(|(_, e)| e.exchange == exchange && e.msg_id == ack_id)
            .map(|(key, _)| key)
    }

    /// Every entry belonging to `exchange`, for throttle/delayed-delivery
    /// sideband processing (§4.4) and abort-time cleanup.
    pub fn keys_for_exchange(&self, exchange: ExchangeKey) -> smallvec::SmallVec<[RetransKey; 4]> {
        self.entries
            .iter()
            .filter(|(_, e)| e.exchange == exchange)
            .map(|(key, _)| key)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RetransKey, &RetransmitEntry)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RetransKey, &mut RetransmitEntry)> {
        self.entries.iter_mut()
    }

    pub fn keys(&self) -> smallvec::SmallVec<[RetransKey; 8]> {
        self.entries.keys().collect()
    }
}

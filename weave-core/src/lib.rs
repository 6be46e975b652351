//! Internal crate used by weave: fabric identity, wire codecs and the shared
//! error taxonomy (§3, §4.1, §4.2, §6).

pub mod error;
pub mod exchange_header;
pub mod fabric;
pub mod ids;
pub mod message_header;
pub mod state;
pub mod tick;

pub use error::{Result, WeaveError};
pub use exchange_header::{ExchangeFlags, ExchangeHeader, ExchangeVersion};
pub use fabric::{fabric_ula, FabricState};
pub use ids::{DuplicateWindow, ExchangeId, FabricId, KeyId, MessageId, NodeId, ProfileId};
pub use message_header::{EncryptionMeta, EncryptionType, MessageFlags, MessageHeader, MessageVersion};
pub use tick::{TickCount, DEFAULT_TICK_INTERVAL};

/// Common-profile message types carried under `ProfileId::COMMON` (§6).
pub mod common_profile {
    use crate::ids::NodeId;

    /// Empty payload; the universal acknowledgment carrier.
    pub const NULL: u8 = 0x00;
    /// Payload: `pause_millis: u32`.
    pub const WRMP_THROTTLE_FLOW: u8 = 0x01;
    /// Payload: `pause_millis: u32, delayed_node_id: u64`.
    pub const WRMP_DELAYED_DELIVERY: u8 = 0x02;

    /// Decodes a `WRMP_Throttle_Flow` payload; `None` on a short read.
    pub fn decode_throttle_flow(payload: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = payload.get(0..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Decodes a `WRMP_Delayed_Delivery` payload; `None` on a short read.
    pub fn decode_delayed_delivery(payload: &[u8]) -> Option<(u32, NodeId)> {
        let pause_bytes: [u8; 4] = payload.get(0..4)?.try_into().ok()?;
        let node_bytes: [u8; 8] = payload.get(4..12)?.try_into().ok()?;
        Some((u32::from_le_bytes(pause_bytes), NodeId::new(u64::from_le_bytes(node_bytes))))
    }
}

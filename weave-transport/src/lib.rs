//! Transport-facing fabric plumbing: wire framing, the reliable-messaging
//! subsystem, and the exchange manager (§3-§5).

pub mod binding;
pub mod buffer;
pub mod context;
pub mod events;
pub mod flags;
pub mod manager;
pub mod message_layer;
pub mod reliable;
pub mod retransmit;

pub use binding::{Binding, BindingKey, BindingPool};
pub use buffer::PacketBuffer;
pub use context::{ConnectionId, ExchangeContext, ExchangeKey, PeerIdentity, WrmpConfig};
pub use events::{ExchangeDelegate, ExchangeEvent, UnsolicitedHandler};
pub use flags::{ContextFlags, SendFlags};
pub use manager::ExchangeManager;
pub use message_layer::{DatagramTransport, MessageLayer, StreamTransport, UnsecuredConnectionHandler, DEFAULT_UDP_PORT};
pub use reliable::ReliableMessaging;
pub use retransmit::{RetransKey, RetransmitEntry, RetransmitTable};

//! Per-send and per-handler option flags (§4.4, §4.6).

bitflags::bitflags! {
    /// Options passed to `ExchangeContext::send_message`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SendFlags: u16 {
        /// Request a WRMP acknowledgment for this message (datagram only).
        const REQUEST_ACK          = 0x0001;
        /// Arm the response timer; the next inbound message on this
        /// exchange satisfies it.
        const EXPECT_RESPONSE      = 0x0002;
        /// Keep the caller's buffer alive after the send call returns.
        const RETAIN_BUFFER        = 0x0004;
        /// Suppress the exchange's `auto_request_ack` default for this send.
        const NO_AUTO_REQUEST_ACK  = 0x0008;
        /// Re-use the message id already present in an encoded buffer
        /// (retransmit path).
        const REUSE_MESSAGE_ID     = 0x0010;
        /// Re-use the source node id already present in an encoded buffer
        /// (retransmit path).
        const REUSE_SOURCE_ID      = 0x0020;
        /// The buffer already contains an encoded message header/exchange
        /// header (retransmit path): skip re-encoding.
        const MESSAGE_ENCODED      = 0x0040;
    }
}

bitflags::bitflags! {
    /// Persistent behavior flags on an `ExchangeContext` (§3).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ContextFlags: u16 {
        const AUTO_REQUEST_ACK       = 0x0001;
        const AUTO_RELEASE_KEY       = 0x0002;
        const AUTO_RELEASE_CONNECTION = 0x0004;
        const CONNECTION_CLOSED      = 0x0008;
        const USE_EPHEMERAL_UDP_PORT = 0x0010;
        /// Debug-only: drop outbound acks instead of sending them.
        const DROP_ACK               = 0x0020;
    }
}

//! Error taxonomy shared across the fabric stack.
//!
//! Transient transport failures are classified `non_critical` so the
//! reliability layer (weave-transport) can retry instead of tearing down
//! the owning exchange; everything else unwinds to the caller.

/// Errors surfaced by the fabric stack's public APIs.
#[derive(Debug, Clone, displaydoc::Display, thiserror::Error)]
#[non_exhaustive]
pub enum WeaveError {
    /// an argument was invalid for this call
    InvalidArgument,
    /// the object is not in a state that permits this operation
    IncorrectState,
    /// no free slots remain in a fixed-size pool
    NoMemory,
    /// the exchange is not associated with an open connection
    NotConnected,
    /// the connection closed unexpectedly
    ConnectionClosedUnexpectedly,
    /// the response timer expired before a reply arrived
    Timeout,
    /// retransmission was exhausted without receiving an acknowledgment
    MessageNotAcknowledged,
    /// the peer has throttled this exchange's flow
    SendThrottled,
    /// an acknowledgment referenced an unknown message id
    InvalidAckId,
    /// the message uses an unsupported protocol version
    UnsupportedMessageVersion,
    /// the message buffer was too short for its declared fields
    InvalidMessageLength,
    /// the profile id was not recognized
    InvalidProfileId,
    /// the message type is not valid for its profile
    InvalidMessageType,
    /// the message's counter fell outside the peer's duplicate-detection window
    MessageCounterOutOfWindow,
    /// message authentication failed
    AuthenticationFailed,
    /// a key-management operation failed: {0}
    KeyError(String),
    /// the retransmit table has no free entries
    RetransTableFull,
    /// no unsolicited handler or live exchange matched the inbound message
    UnsolicitedMsgNoOriginator,
    /// the tunnel's outbound queue is full
    TunnelServiceQueueFull,
    /// the service has restricted this tunnel to device-originated traffic
    TunnelRoutingRestricted,
    /// the tunnel's liveness probe failed to receive a timely acknowledgment
    TunnelLivenessFailed,
    /// the tunnel was aborted internally during reconfiguration
    TunnelForceAbort,
    /// an I/O error occurred on a transport endpoint: {0}
    Io(String),
}

impl WeaveError {
    /// True for transport-send failures that are transient (e.g. a full
    /// socket buffer) as opposed to fatal to the underlying connection.
    ///
    /// The reliability layer consults this before giving up on a
    /// retransmit-table entry: a non-critical failure is treated as if the
    /// send succeeded and the attempt is simply retried on the next tick.
    pub fn is_send_error_non_critical(&self) -> bool {
        matches!(self, WeaveError::SendThrottled)
    }
}

pub type Result<T> = core::result::Result<T, WeaveError>;

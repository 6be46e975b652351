//! Connection-level tunnel state machine (C7), one instance per tunnel path
//! (primary/backup).

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelConnState {
    /// No connection attempt is in progress or established.
    Idle,
    /// A connect (TCP handshake or UDP shortcut probe) is outstanding.
    Connecting,
    /// The tunnel is up and passing traffic.
    Established,
    /// The connection dropped or failed liveness; backing off before retry.
    Reconnecting,
}

impl TunnelConnState {
    weave_core::state::event! {
        /// Begins a connection attempt from idle, or immediately after a
        /// backoff period elapses.
        start_connecting(Idle | Reconnecting => Connecting);
        /// The handshake completed successfully.
        connected(Connecting => Established);
        /// The handshake failed; back off before retrying.
        connect_failed(Connecting => Reconnecting);
        /// An established tunnel's liveness probe failed, or the peer
        /// closed the connection.
        lost(Established => Reconnecting);
        /// The application tore the tunnel down deliberately.
        shutdown(Idle | Connecting | Established | Reconnecting => Idle);
    }

    weave_core::state::is!(is_established, Established);
    weave_core::state::is!(is_down, Idle | Reconnecting);
}

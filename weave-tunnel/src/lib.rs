//! Dual-path IPv6-over-Weave tunneling: the per-path connection manager, the
//! agent that picks between primary and backup, and the local-network
//! shortcut cache (§ tunneling subsystem).

pub mod agent;
pub mod connection_mgr;
pub mod shortcut;
pub mod state;

pub use agent::{TunnelAgent, TunnelRoute};
pub use connection_mgr::{BackoffConfig, TunnelConnectionMgr, TunnelRole, TunnelStats};
pub use shortcut::ShortcutUdpControl;
pub use state::TunnelConnState;

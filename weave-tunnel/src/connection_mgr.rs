//! The tunnel connection manager (C7): one logical tunnel path (primary or
//! backup), its state machine, reconnect backoff, and liveness probing.

use std::time::Duration;

use weave_core::{
    error::{Result, WeaveError},
    tick::TickCount,
};
use weave_transport::ConnectionId;

use crate::state::TunnelConnState;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TunnelRole {
    Primary,
    Backup,
}

/// Exponential backoff between reconnect attempts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            multiplier: 2,
        }
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct TunnelStats {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub struct TunnelConnectionMgr {
    role: TunnelRole,
    state: TunnelConnState,
    connection: Option<ConnectionId>,
    backoff: BackoffConfig,
    current_backoff: Duration,
    retry_ticks: TickCount,
    tick_interval: Duration,
    liveness_interval_ticks: TickCount,
    next_liveness_ticks: TickCount,
    liveness_probe_outstanding: bool,
    stats: TunnelStats,
}

impl TunnelConnectionMgr {
    pub fn new(role: TunnelRole, backoff: BackoffConfig, tick_interval: Duration, liveness_interval: Duration) -> Self {
        Self {
            role,
            state: TunnelConnState::Idle,
            connection: None,
            current_backoff: backoff.initial,
            backoff,
            retry_ticks: TickCount::ZERO,
            tick_interval,
            liveness_interval_ticks: TickCount::from_duration(liveness_interval, tick_interval),
            next_liveness_ticks: TickCount::ZERO,
            liveness_probe_outstanding: false,
            stats: TunnelStats::default(),
        }
    }

    pub fn role(&self) -> TunnelRole {
        self.role
    }

    pub fn state(&self) -> TunnelConnState {
        self.state
    }

    pub fn stats(&self) -> TunnelStats {
        self.stats
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn begin_connect(&mut self) -> Result<()> {
        self.state.start_connecting().map_err(|_| WeaveError::IncorrectState)?;
        self.stats.connect_attempts += 1;
        Ok(())
    }

    pub fn on_connected(&mut self, connection: ConnectionId) -> Result<()> {
        self.state.connected().map_err(|_| WeaveError::IncorrectState)?;
        self.connection = Some(connection);
        self.current_backoff = self.backoff.initial;
        self.next_liveness_ticks = self.liveness_interval_ticks;
        Ok(())
    }

    pub fn on_connect_failed(&mut self) -> Result<()> {
        self.state.connect_failed().map_err(|_| WeaveError::IncorrectState)?;
        self.stats.connect_failures += 1;
        self.arm_backoff();
        Ok(())
    }

    pub fn on_lost(&mut self) -> Result<()> {
        self.state.lost().map_err(|_| WeaveError::IncorrectState)?;
        self.connection = None;
        self.liveness_probe_outstanding = false;
        self.arm_backoff();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        let _ = self.state.shutdown();
        self.connection = None;
        self.liveness_probe_outstanding = false;
    }

    fn arm_backoff(&mut self) {
        self.retry_ticks = TickCount::from_duration(self.current_backoff, self.tick_interval);
        self.current_backoff = self
            .current_backoff
            .saturating_mul(self.backoff.multiplier)
            .min(self.backoff.max);
    }

    pub fn retry_is_due(&self) -> bool {
        self.state == TunnelConnState::Reconnecting && self.retry_ticks.is_due()
    }

    pub fn liveness_probe_is_due(&self) -> bool {
        self.state.is_established() && !self.liveness_probe_outstanding && self.next_liveness_ticks.is_due()
    }

    pub fn mark_liveness_probe_sent(&mut self) {
        self.liveness_probe_outstanding = true;
        self.next_liveness_ticks = self.liveness_interval_ticks;
    }

    pub fn mark_liveness_ack_received(&mut self) {
        self.liveness_probe_outstanding = false;
    }

    /// True if a liveness probe was sent and the interval has elapsed again
    /// without an ack — the tunnel should be torn down (§ liveness failure).
    pub fn liveness_has_failed(&self) -> bool {
        self.liveness_probe_outstanding && self.next_liveness_ticks.is_due()
    }

    pub fn expire_ticks(&mut self) {
        self.retry_ticks = self.retry_ticks.expire(1);
        if self.state.is_established() {
            self.next_liveness_ticks = self.next_liveness_ticks.expire(1);
        }
    }

    pub fn record_tx(&mut self, bytes: usize) {
        self.stats.tx_packets += 1;
        self.stats.tx_bytes += bytes as u64;
    }

    pub fn record_rx(&mut self, bytes: usize) {
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += bytes as u64;
    }
}

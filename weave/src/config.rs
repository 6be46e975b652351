//! Stack configuration (§6 `Configuration options`).

use std::time::Duration;

use weave_core::{
    ids::{FabricId, NodeId},
    tick::DEFAULT_TICK_INTERVAL,
};

/// Sizing and timing knobs for a [`crate::Stack`]. Pool capacities are fixed
/// for the stack's lifetime, matching the fixed-size pools of the exchange
/// manager and retransmit table they configure.
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub local_node_id: NodeId,
    pub fabric_id: FabricId,
    pub subnet_id: u16,
    pub exchange_capacity: usize,
    pub retrans_table_capacity: usize,
    pub unsolicited_capacity: usize,
    pub tick_interval: Duration,
}

impl StackConfig {
    pub fn new(local_node_id: NodeId, fabric_id: FabricId) -> Self {
        Self {
            local_node_id,
            fabric_id,
            ..Self::default()
        }
    }

    pub fn with_subnet_id(mut self, subnet_id: u16) -> Self {
        self.subnet_id = subnet_id;
        self
    }

    pub fn with_exchange_capacity(mut self, capacity: usize) -> Self {
        self.exchange_capacity = capacity;
        self
    }

    pub fn with_retrans_table_capacity(mut self, capacity: usize) -> Self {
        self.retrans_table_capacity = capacity;
        self
    }

    pub fn with_unsolicited_capacity(mut self, capacity: usize) -> Self {
        self.unsolicited_capacity = capacity;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            local_node_id: NodeId::NOT_SPECIFIED,
            fabric_id: FabricId::new(0),
            subnet_id: 0,
            exchange_capacity: 16,
            retrans_table_capacity: 16,
            unsolicited_capacity: 8,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

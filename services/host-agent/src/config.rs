//! Configuration for the host agent.

use std::time::Duration;

use convoy_id::{HostId, PoolId};
use convoy_reconcile::{
    ATTACH_ATTEMPTS, ATTACH_INTERVAL, COORDINATION_RETRY_DELAY, START_EVENT_TIMEOUT,
    STATE_REFRESH_INTERVAL,
};

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Host this agent reconciles.
    pub host_id: HostId,

    /// Resource pool to register this host in.
    pub pool_id: Option<PoolId>,

    /// Worker timings.
    pub timings: WorkerTimings,
}

impl AgentConfig {
    pub fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            pool_id: None,
            timings: WorkerTimings::default(),
        }
    }

    pub fn with_pool(mut self, pool_id: PoolId) -> Self {
        self.pool_id = Some(pool_id);
        self
    }

    pub fn with_timings(mut self, timings: WorkerTimings) -> Self {
        self.timings = timings;
        self
    }
}

/// Delays and bounds used by the host loop and its instance workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimings {
    /// Delay before retrying a failed coordination read.
    pub retry_delay: Duration,

    /// Attempts made to find a container when attaching.
    pub attach_attempts: u32,

    /// Delay between attach attempts.
    pub attach_interval: Duration,

    /// Maximum wait for a start event, and for an exit after a kill.
    pub start_timeout: Duration,

    /// Interval between network info refreshes while monitoring.
    pub refresh_interval: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            retry_delay: COORDINATION_RETRY_DELAY,
            attach_attempts: ATTACH_ATTEMPTS,
            attach_interval: ATTACH_INTERVAL,
            start_timeout: START_EVENT_TIMEOUT,
            refresh_interval: STATE_REFRESH_INTERVAL,
        }
    }
}

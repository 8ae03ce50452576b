//! Leader configuration.

use std::time::Duration;

use convoy_coord::paths;
use convoy_id::HostId;
use convoy_reconcile::COORDINATION_RETRY_DELAY;

/// Configuration for a leader candidate.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Host this candidate runs on; written into the leader record.
    pub host_id: HostId,

    /// Election path shared by every candidate.
    pub election_path: String,

    /// Delay before retrying a failed coordination read or election.
    pub retry_delay: Duration,
}

impl LeaderConfig {
    pub fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            election_path: paths::SCHEDULER.to_string(),
            retry_delay: COORDINATION_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_election_path(mut self, election_path: impl Into<String>) -> Self {
        self.election_path = election_path.into();
        self
    }
}

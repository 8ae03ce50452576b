//! Reconciliation loop primitives.
//!
//! This library holds the pieces of the reconciliation engine that do not
//! touch the coordination service or the container runtime:
//!
//! - **Lifecycle**: the tagged actual-state of an instance
//!   (`NeverStarted`, `Running`, `Exited`) carried alongside real timestamps.
//! - **Deciding**: the instance worker's precedence table, as a pure function.
//! - **Convergence**: how many instances a leader pass starts or stops, which
//!   ones are stopped, and which instance indices new ones take.
//! - **Supervision**: single-owner child maps, fan-in completion reports and
//!   the two-phase close handshake (see [`supervision`]).
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Scale planning never both starts and stops in one pass
//! - Termination always picks the lowest instance indices first

pub mod supervision;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// The loop that owns a close handshake is no longer running.
    #[error("reconciliation loop is not running")]
    LoopClosed,
}

// =============================================================================
// Desired state
// =============================================================================

/// Operator-declared target for a service or a single assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Stop,
    Run,
}

impl DesiredState {
    /// Combines a service-level and an assignment-level desired state.
    ///
    /// Either side asking for `Stop` wins.
    #[must_use]
    pub fn and(self, other: DesiredState) -> DesiredState {
        match (self, other) {
            (DesiredState::Run, DesiredState::Run) => DesiredState::Run,
            _ => DesiredState::Stop,
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::Stop => f.write_str("stop"),
            DesiredState::Run => f.write_str("run"),
        }
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Coarse phase of an instance, derived from its [`Lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstancePhase {
    /// No container has ever been recorded as started.
    NeverStarted,
    /// A container was started and no exit has been recorded.
    Running,
    /// A container was started and has since exited.
    Exited,
}

/// Recorded lifecycle of an instance.
///
/// Timestamps only exist in the variants where they are meaningful, so a
/// "terminated but never started" record cannot be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    NeverStarted,
    Running {
        started_at: DateTime<Utc>,
    },
    Exited {
        started_at: DateTime<Utc>,
        terminated_at: DateTime<Utc>,
    },
}

impl Lifecycle {
    /// Lifecycle of a container that just started.
    #[must_use]
    pub fn started(at: DateTime<Utc>) -> Self {
        Lifecycle::Running { started_at: at }
    }

    /// Records an exit observed at `at`.
    ///
    /// An exit on a record that never started keeps both timestamps equal.
    #[must_use]
    pub fn exited(self, at: DateTime<Utc>) -> Self {
        let started_at = self.started_at().unwrap_or(at);
        Lifecycle::Exited {
            started_at,
            terminated_at: at,
        }
    }

    pub fn phase(&self) -> InstancePhase {
        match self {
            Lifecycle::NeverStarted => InstancePhase::NeverStarted,
            Lifecycle::Running { .. } => InstancePhase::Running,
            Lifecycle::Exited { .. } => InstancePhase::Exited,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifecycle::NeverStarted => None,
            Lifecycle::Running { started_at } | Lifecycle::Exited { started_at, .. } => {
                Some(*started_at)
            }
        }
    }

    pub fn terminated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifecycle::Exited { terminated_at, .. } => Some(*terminated_at),
            _ => None,
        }
    }
}

// =============================================================================
// Deciding
// =============================================================================

/// What an instance worker does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Stop the instance and clean up its nodes. When `wait_for_exit` is set
    /// the worker is attached and must see the container exit first.
    Terminate { wait_for_exit: bool },
    /// Already attached and nothing relevant changed.
    KeepMonitoring,
    /// Never ran, or exited and should be restarted.
    Start,
    /// Recorded as running by an earlier worker: adopt the existing container.
    Attach,
}

/// The instance worker's Deciding step.
///
/// Rules are evaluated in precedence order and the first match wins:
///
/// 1. desired `Stop` terminates
/// 2. an attached worker keeps monitoring
/// 3. `Run` with no start recorded, or with an exit recorded, starts
/// 4. a recorded start without an exit attaches
///
/// With a tagged [`Lifecycle`] there is no combination left for a fifth
/// "unhandled" rule; records that cannot be decoded never reach this point.
pub fn decide(desired: DesiredState, attached: bool, lifecycle: &Lifecycle) -> Decision {
    match (desired, attached, lifecycle.phase()) {
        (DesiredState::Stop, attached, _) => Decision::Terminate {
            wait_for_exit: attached,
        },
        (DesiredState::Run, true, _) => Decision::KeepMonitoring,
        (DesiredState::Run, false, InstancePhase::NeverStarted | InstancePhase::Exited) => {
            Decision::Start
        }
        (DesiredState::Run, false, InstancePhase::Running) => Decision::Attach,
    }
}

// =============================================================================
// Convergence
// =============================================================================

/// Instance-count delta for a single leader pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Actual matches desired.
    Hold,
    /// Create this many new assignments.
    Start(usize),
    /// Terminate this many existing instances.
    Stop(usize),
}

/// Computes the delta between a desired instance count and the number of
/// live instances.
pub fn plan_scale(desired: u32, actual: usize) -> ScaleAction {
    let desired = desired as usize;
    if actual < desired {
        ScaleAction::Start(desired - actual)
    } else if actual > desired {
        ScaleAction::Stop(actual - desired)
    } else {
        ScaleAction::Hold
    }
}

/// Selects `count` instances to terminate, lowest instance index first.
///
/// The sort is stable, so instances sharing an index keep list order.
pub fn select_for_termination<T, F>(instances: Vec<T>, count: usize, index_of: F) -> Vec<T>
where
    F: Fn(&T) -> u32,
{
    let mut ordered = instances;
    ordered.sort_by_key(|i| index_of(i));
    ordered.truncate(count);
    ordered
}

/// Returns the `n` lowest instance indices not present in `used`.
pub fn free_instance_indices<I>(used: I, n: usize) -> Vec<u32>
where
    I: IntoIterator<Item = u32>,
{
    let used: BTreeSet<u32> = used.into_iter().collect();
    (0u32..)
        .filter(|i| !used.contains(i))
        .take(n)
        .collect()
}

// =============================================================================
// Retry policy
// =============================================================================

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRetry {
    /// Delay between attempts.
    pub delay: Duration,

    /// Maximum attempts, or `None` to retry until shut down.
    pub max_attempts: Option<u32>,
}

impl FixedRetry {
    /// Unbounded retry with the given delay.
    pub const fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Bounded retry: `attempts` tries, `delay` apart.
    pub const fn bounded(attempts: u32, delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: Some(attempts),
        }
    }

    /// Returns true if another attempt is allowed after `attempts_made`.
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}

/// Delay before retrying a failed coordination read.
pub const COORDINATION_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Attempts made to find an existing container when attaching.
pub const ATTACH_ATTEMPTS: u32 = 30;

/// Delay between attach attempts.
pub const ATTACH_INTERVAL: Duration = Duration::from_secs(3);

/// Maximum wait for a container start event.
pub const START_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval at which a monitored instance refreshes its network info.
pub const STATE_REFRESH_INTERVAL: Duration = Duration::from_secs(20);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[rstest]
    #[case(DesiredState::Stop, false, Lifecycle::NeverStarted, Decision::Terminate { wait_for_exit: false })]
    #[case(DesiredState::Stop, true, Lifecycle::started(ts(10)), Decision::Terminate { wait_for_exit: true })]
    #[case(DesiredState::Run, true, Lifecycle::started(ts(10)), Decision::KeepMonitoring)]
    #[case(DesiredState::Run, true, Lifecycle::NeverStarted, Decision::KeepMonitoring)]
    #[case(DesiredState::Run, false, Lifecycle::NeverStarted, Decision::Start)]
    #[case(DesiredState::Run, false, Lifecycle::started(ts(10)).exited(ts(20)), Decision::Start)]
    #[case(DesiredState::Run, false, Lifecycle::started(ts(10)), Decision::Attach)]
    fn test_decide_precedence(
        #[case] desired: DesiredState,
        #[case] attached: bool,
        #[case] lifecycle: Lifecycle,
        #[case] expected: Decision,
    ) {
        assert_eq!(decide(desired, attached, &lifecycle), expected);
    }

    #[test]
    fn test_desired_state_and() {
        assert_eq!(DesiredState::Run.and(DesiredState::Run), DesiredState::Run);
        assert_eq!(DesiredState::Run.and(DesiredState::Stop), DesiredState::Stop);
        assert_eq!(DesiredState::Stop.and(DesiredState::Run), DesiredState::Stop);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let running = Lifecycle::started(ts(100));
        assert_eq!(running.started_at(), Some(ts(100)));
        assert_eq!(running.terminated_at(), None);

        let exited = running.exited(ts(200));
        assert_eq!(exited.phase(), InstancePhase::Exited);
        assert_eq!(exited.started_at(), Some(ts(100)));
        assert_eq!(exited.terminated_at(), Some(ts(200)));

        let never = Lifecycle::NeverStarted.exited(ts(300));
        assert_eq!(never.started_at(), Some(ts(300)));
    }

    #[test]
    fn test_lifecycle_json_is_tagged() {
        let json = serde_json::to_value(Lifecycle::NeverStarted).unwrap();
        assert_eq!(json, serde_json::json!({"phase": "never_started"}));

        let json = serde_json::to_value(Lifecycle::started(ts(0))).unwrap();
        assert_eq!(json["phase"], "running");
        assert!(json.get("terminated_at").is_none());
    }

    #[rstest]
    #[case(3, 0, ScaleAction::Start(3))]
    #[case(1, 2, ScaleAction::Stop(1))]
    #[case(2, 2, ScaleAction::Hold)]
    #[case(0, 4, ScaleAction::Stop(4))]
    fn test_plan_scale(#[case] desired: u32, #[case] actual: usize, #[case] expected: ScaleAction) {
        assert_eq!(plan_scale(desired, actual), expected);
    }

    #[test]
    fn test_select_for_termination_lowest_index_first() {
        let instances = vec![("c", 2), ("a", 0), ("b", 1)];
        let picked = select_for_termination(instances, 2, |(_, idx)| *idx);
        assert_eq!(picked, vec![("a", 0), ("b", 1)]);
    }

    #[test]
    fn test_free_instance_indices_fills_gaps() {
        assert_eq!(free_instance_indices([0, 2, 3], 3), vec![1, 4, 5]);
        assert_eq!(free_instance_indices([], 2), vec![0, 1]);
        assert!(free_instance_indices([0], 0).is_empty());
    }

    #[test]
    fn test_fixed_retry() {
        let bounded = FixedRetry::bounded(ATTACH_ATTEMPTS, ATTACH_INTERVAL);
        assert!(bounded.allows(29));
        assert!(!bounded.allows(30));
        assert!(FixedRetry::unbounded(COORDINATION_RETRY_DELAY).allows(u32::MAX));
    }

    proptest! {
        // One pass issues max(N-M, 0) starts and max(M-N, 0) stops.
        #[test]
        fn prop_plan_scale_converges(desired in 0u32..64, actual in 0usize..64) {
            let (started, stopped) = match plan_scale(desired, actual) {
                ScaleAction::Hold => (0, 0),
                ScaleAction::Start(n) => (n, 0),
                ScaleAction::Stop(n) => (0, n),
            };
            prop_assert_eq!(started, (desired as usize).saturating_sub(actual));
            prop_assert_eq!(stopped, actual.saturating_sub(desired as usize));
            prop_assert_eq!(actual + started - stopped, desired as usize);
        }

        #[test]
        fn prop_termination_takes_lowest_indices(
            indices in proptest::collection::btree_set(0u32..1000, 0..32),
            count in 0usize..40,
        ) {
            let list: Vec<u32> = indices.into_iter().rev().collect();
            let picked = select_for_termination(list.clone(), count, |i| *i);
            let mut expected = list;
            expected.sort_unstable();
            expected.truncate(count);
            prop_assert_eq!(picked, expected);
        }

        // A running record without an exit always attaches, never starts.
        #[test]
        fn prop_running_record_attaches(started in 0i64..4_000_000_000) {
            let lifecycle = Lifecycle::started(ts(started));
            prop_assert_eq!(decide(DesiredState::Run, false, &lifecycle), Decision::Attach);
        }

        // An exited record with Run desired always restarts.
        #[test]
        fn prop_exited_record_restarts(started in 0i64..2_000_000_000, ran in 0i64..1_000_000) {
            let lifecycle = Lifecycle::started(ts(started)).exited(ts(started + ran));
            prop_assert_eq!(decide(DesiredState::Run, false, &lifecycle), Decision::Start);
        }

        #[test]
        fn prop_free_indices_unused_and_sorted(
            used in proptest::collection::vec(0u32..50, 0..30),
            n in 0usize..20,
        ) {
            let free = free_instance_indices(used.clone(), n);
            prop_assert_eq!(free.len(), n);
            prop_assert!(free.iter().all(|i| !used.contains(i)));
            prop_assert!(free.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

//! Task ownership for reconciliation loops.
//!
//! Every long-running reconciliation task has exactly one owner:
//!
//! ```text
//! HostReconciler ── ChildSet<InstanceId>  ── InstanceWorker(id)
//! ClusterLeader  ── ChildSet<ServiceId>   ── ServiceWatcher(id)
//! ```
//!
//! The owner holds a per-child stop trigger (a oneshot sender) and a single
//! fan-in channel that children report on when they finish. A child reports
//! exactly once. Dropping the owner's trigger also counts as a stop signal,
//! so abandoning a [`ChildSet`] stops its children without waiting.
//!
//! The close handshake ([`close_channel`]) lets an outside caller ask a loop
//! to shut down and receive the loop's final result on a reply channel.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::{mpsc, oneshot};

use crate::ReconcileError;

// =============================================================================
// Reports
// =============================================================================

/// Completion report a child sends to its owner.
#[derive(Debug)]
pub struct Report<K, E> {
    pub id: K,
    pub result: Result<(), E>,
}

/// Stop signal held by a child.
///
/// Resolves when the owner signals or when the owner goes away.
#[derive(Debug)]
pub struct StopSignal {
    rx: oneshot::Receiver<()>,
    fired: bool,
}

impl StopSignal {
    /// A signal that resolves when the returned sender fires or is dropped.
    pub fn new() -> (oneshot::Sender<()>, StopSignal) {
        let (tx, rx) = oneshot::channel();
        (tx, StopSignal { rx, fired: false })
    }

    /// Waits for the stop signal. Returns immediately once it has fired.
    pub async fn wait(&mut self) {
        if self.fired {
            return;
        }
        let _ = (&mut self.rx).await;
        self.fired = true;
    }

    /// Returns true if the signal has fired, without waiting.
    pub fn is_signalled(&mut self) -> bool {
        if !self.fired {
            match self.rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => self.fired = true,
            }
        }
        self.fired
    }
}

/// What a child task receives from its owner.
#[derive(Debug)]
pub struct ChildContext<K, E> {
    pub id: K,
    pub stop: StopSignal,
    reports: mpsc::UnboundedSender<Report<K, E>>,
}

impl<K, E> ChildContext<K, E> {
    /// Splits the context so the stop signal can be borrowed mutably while
    /// the reporter is kept for the end of the task.
    pub fn into_parts(self) -> (K, StopSignal, Reporter<K, E>) {
        (
            self.id,
            self.stop,
            Reporter {
                reports: self.reports,
            },
        )
    }
}

/// Sends the final report of a child.
#[derive(Debug)]
pub struct Reporter<K, E> {
    reports: mpsc::UnboundedSender<Report<K, E>>,
}

impl<K, E> Reporter<K, E> {
    /// Reports completion. An owner that has gone away is not an error.
    pub fn report(self, id: K, result: Result<(), E>) {
        let _ = self.reports.send(Report { id, result });
    }
}

// =============================================================================
// Child Set
// =============================================================================

/// Outcome of [`ChildSet::shutdown_all`].
#[derive(Debug)]
pub struct Drained<E> {
    /// Children that were signalled.
    pub signalled: usize,
    /// First error reported while draining.
    pub first_error: Option<E>,
}

/// Single-owner map of running children plus their fan-in report channel.
///
/// A key is present from [`enlist`](Self::enlist) until the child's report is
/// consumed by [`next_report`](Self::next_report) or
/// [`shutdown_all`](Self::shutdown_all). At most one child runs per key.
#[derive(Debug)]
pub struct ChildSet<K, E> {
    children: HashMap<K, Option<oneshot::Sender<()>>>,
    tx: mpsc::UnboundedSender<Report<K, E>>,
    rx: mpsc::UnboundedReceiver<Report<K, E>>,
}

impl<K, E> Default for ChildSet<K, E>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> ChildSet<K, E>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            children: HashMap::new(),
            tx,
            rx,
        }
    }

    pub fn contains(&self, id: &K) -> bool {
        self.children.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// IDs of children that have not yet reported.
    pub fn ids(&self) -> impl Iterator<Item = &K> {
        self.children.keys()
    }

    /// Registers a new child under `id`.
    ///
    /// Returns `None` if a child with that ID is already running; the caller
    /// must not spawn a second one.
    pub fn enlist(&mut self, id: K) -> Option<ChildContext<K, E>> {
        if self.children.contains_key(&id) {
            return None;
        }
        let (trigger, stop) = StopSignal::new();
        self.children.insert(id.clone(), Some(trigger));
        Some(ChildContext {
            id,
            stop,
            reports: self.tx.clone(),
        })
    }

    /// Signals a single child to stop. Returns false if it is not running.
    pub fn signal(&mut self, id: &K) -> bool {
        match self.children.get_mut(id) {
            Some(trigger) => {
                if let Some(tx) = trigger.take() {
                    let _ = tx.send(());
                }
                true
            }
            None => false,
        }
    }

    /// Waits for the next completion report and forgets that child.
    ///
    /// Never resolves while no child is running, which makes it safe to use
    /// as a `tokio::select!` branch.
    pub async fn next_report(&mut self) -> Report<K, E> {
        loop {
            // The set holds a sender, so the channel never closes.
            if let Some(report) = self.rx.recv().await {
                self.children.remove(&report.id);
                return report;
            }
        }
    }

    /// Signals every child, then waits until all of them have reported.
    ///
    /// Returns the first error seen while draining.
    pub async fn shutdown_all(&mut self) -> Drained<E> {
        let mut signalled = 0;
        for trigger in self.children.values_mut() {
            if let Some(tx) = trigger.take() {
                let _ = tx.send(());
                signalled += 1;
            }
        }

        let mut first_error = None;
        while !self.children.is_empty() {
            let report = self.next_report().await;
            if let Err(e) = report.result {
                first_error.get_or_insert(e);
            }
        }

        Drained {
            signalled,
            first_error,
        }
    }

    /// Forgets every child without waiting. Their stop signals fire because
    /// the triggers are dropped.
    ///
    /// The report channel is replaced, so late reports from abandoned
    /// children never reach a child later enlisted under the same key.
    pub fn abandon(&mut self) -> usize {
        let count = self.children.len();
        self.children.clear();
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = tx;
        self.rx = rx;
        count
    }
}

// =============================================================================
// Close Handshake
// =============================================================================

/// Reply channel a loop answers on when it finishes shutting down.
pub type CloseReply<E> = oneshot::Sender<Result<(), E>>;

/// Receiving side of the close handshake, owned by the loop.
pub type CloseRequests<E> = mpsc::Receiver<CloseReply<E>>;

/// Sending side of the close handshake.
#[derive(Debug)]
pub struct Closer<E> {
    tx: mpsc::Sender<CloseReply<E>>,
}

impl<E> Clone for Closer<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Creates a close handshake pair.
pub fn close_channel<E>() -> (Closer<E>, CloseRequests<E>) {
    let (tx, rx) = mpsc::channel(1);
    (Closer { tx }, rx)
}

impl<E> Closer<E>
where
    E: From<ReconcileError>,
{
    /// Asks the loop to shut down and waits for its final result.
    pub async fn close(&self) -> Result<(), E> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(reply_tx)
            .await
            .map_err(|_| E::from(ReconcileError::LoopClosed))?;
        reply_rx
            .await
            .map_err(|_| E::from(ReconcileError::LoopClosed))?
    }
}

// =============================================================================
// Tests
// =============================================================================

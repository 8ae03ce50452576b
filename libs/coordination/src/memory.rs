//! In-memory coordination service.
//!
//! Used by tests and by `convoyd` in dev mode. Behaves like a hierarchical
//! store with one-shot watches:
//!
//! - `create` fires `NodeCreated` on the node and `NodeChildrenChanged` on
//!   its parent
//! - `set` fires `NodeDataChanged`
//! - `delete` fires `NodeDeleted` on every removed node and
//!   `NodeChildrenChanged` on the parent of the subtree
//!
//! Leadership is granted first come, first served. When the holder releases
//! or is expired, the longest-waiting candidate takes over and the leader
//! record is rewritten with the next version.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::coordinator::{Coordinator, Leader};
use crate::error::{CoordError, Result};
use crate::event::{Event, EventKind, Watch};
use crate::model::LeaderRecord;
use crate::paths;

/// In-memory [`Coordinator`]. Cloning shares the same store.
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
}

struct State {
    nodes: BTreeMap<String, Vec<u8>>,
    data_watches: HashMap<String, Vec<oneshot::Sender<Event>>>,
    child_watches: HashMap<String, Vec<oneshot::Sender<Event>>>,
    pending_failures: usize,
    elections: HashMap<String, Election>,
    next_candidate: u64,
}

#[derive(Default)]
struct Election {
    holder: Option<Holder>,
    queue: VecDeque<Waiter>,
    version: u64,
}

struct Holder {
    candidate: u64,
    loss: oneshot::Sender<Event>,
}

struct Waiter {
    candidate: u64,
    record: LeaderRecord,
    grant: oneshot::Sender<Watch>,
}

impl Default for State {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(paths::ROOT.to_string(), Vec::new());
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            pending_failures: 0,
            elections: HashMap::new(),
            next_candidate: 0,
        }
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `n` operations fail with [`CoordError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.state().pending_failures = n;
    }

    /// Injected failures not yet returned.
    pub fn pending_failures(&self) -> usize {
        self.state().pending_failures
    }

    /// Revokes leadership of `election` as if the holder's session expired.
    ///
    /// The holder's loss watch fires with [`EventKind::Session`]. Returns
    /// false if nobody was leading.
    pub fn expire_leader(&self, election: &str) -> bool {
        let mut state = self.state();
        let holder = state
            .elections
            .get_mut(election)
            .and_then(|e| e.holder.take());
        match holder {
            Some(holder) => {
                info!(path = %election, candidate = holder.candidate, "Expiring leader session");
                let _ = holder
                    .loss
                    .send(Event::new(EventKind::Session, election));
                state.vacate(election);
                true
            }
            None => false,
        }
    }

    /// Drops every registered watch. Waiters observe `NotWatching`.
    pub fn disconnect_watches(&self) {
        let mut state = self.state();
        state.data_watches.clear();
        state.child_watches.clear();
    }

    /// Number of nodes in the store, including the root.
    pub fn node_count(&self) -> usize {
        self.state().nodes.len()
    }

    fn withdraw(&self, election: &str, candidate: u64) {
        let mut state = self.state();
        let Some(e) = state.elections.get_mut(election) else {
            return;
        };
        if e.holder.as_ref().is_some_and(|h| h.candidate == candidate) {
            e.holder = None;
            state.vacate(election);
        } else {
            e.queue.retain(|w| w.candidate != candidate);
        }
    }
}

impl State {
    fn check_failure(&mut self) -> Result<()> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(CoordError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn require(&self, path: &str) -> Result<()> {
        paths::validate(path)?;
        if self.nodes.contains_key(path) {
            Ok(())
        } else {
            Err(CoordError::NoNode(path.to_string()))
        }
    }

    fn fire(
        watches: &mut HashMap<String, Vec<oneshot::Sender<Event>>>,
        path: &str,
        kind: EventKind,
    ) {
        if let Some(list) = watches.remove(path) {
            for tx in list {
                let _ = tx.send(Event::new(kind, path));
            }
        }
    }

    fn fire_created(&mut self, path: &str) {
        Self::fire(&mut self.data_watches, path, EventKind::NodeCreated);
        if let Some(parent) = paths::parent(path) {
            Self::fire(&mut self.child_watches, parent, EventKind::NodeChildrenChanged);
        }
    }

    fn ensure_ancestors(&mut self, path: &str) {
        if let Some(parent) = paths::parent(path) {
            if !self.nodes.contains_key(parent) {
                self.ensure_ancestors(parent);
                self.nodes.insert(parent.to_string(), Vec::new());
                self.fire_created(parent);
            }
        }
    }

    fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.ensure_ancestors(path);
        self.nodes.insert(path.to_string(), data);
        self.fire_created(path);
    }

    fn put(&mut self, path: &str, data: Vec<u8>) {
        if self.nodes.contains_key(path) {
            self.nodes.insert(path.to_string(), data);
            Self::fire(&mut self.data_watches, path, EventKind::NodeDataChanged);
        } else {
            self.insert(path, data);
        }
    }

    fn child_prefix(path: &str) -> String {
        if path == paths::ROOT {
            paths::ROOT.to_string()
        } else {
            format!("{path}/")
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = Self::child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn remove_subtree(&mut self, path: &str) -> Result<()> {
        if path == paths::ROOT {
            return Err(CoordError::InvalidPath(path.to_string()));
        }
        self.require(path)?;

        let prefix = Self::child_prefix(path);
        let mut removed: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        removed.push(path.to_string());

        for node in &removed {
            self.nodes.remove(node);
            Self::fire(&mut self.data_watches, node, EventKind::NodeDeleted);
            Self::fire(&mut self.child_watches, node, EventKind::NodeDeleted);
        }
        if let Some(parent) = paths::parent(path) {
            Self::fire(&mut self.child_watches, parent, EventKind::NodeChildrenChanged);
        }
        Ok(())
    }

    fn grant(&mut self, election: &str, candidate: u64, record: LeaderRecord) -> Watch {
        let e = self.elections.entry(election.to_string()).or_default();
        e.version += 1;
        let record = LeaderRecord {
            version: e.version,
            ..record
        };
        let (loss, watch) = Watch::channel(election);
        e.holder = Some(Holder { candidate, loss });

        debug!(path = %election, host_id = %record.host_id, version = record.version, "Leadership granted");
        let data = serde_json::to_vec(&record).unwrap_or_default();
        self.put(&paths::leader_record(election), data);
        watch
    }

    /// Clears the leader record and hands leadership to the next waiter.
    fn vacate(&mut self, election: &str) {
        let _ = self.remove_subtree(&paths::leader_record(election));
        loop {
            let Some(waiter) = self
                .elections
                .get_mut(election)
                .and_then(|e| e.queue.pop_front())
            else {
                return;
            };
            if waiter.grant.is_closed() {
                continue;
            }
            let watch = self.grant(election, waiter.candidate, waiter.record);
            if waiter.grant.send(watch).is_ok() {
                return;
            }
            if let Some(e) = self.elections.get_mut(election) {
                e.holder = None;
            }
            let _ = self.remove_subtree(&paths::leader_record(election));
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create_dir(&self, path: &str) -> Result<()> {
        let mut state = self.state();
        state.check_failure()?;
        paths::validate(path)?;
        if !state.nodes.contains_key(path) {
            state.insert(path, Vec::new());
        }
        Ok(())
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        state.check_failure()?;
        paths::validate(path)?;
        if state.nodes.contains_key(path) {
            return Err(CoordError::NodeExists(path.to_string()));
        }
        state.insert(path, data);
        Ok(())
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        state.check_failure()?;
        state.require(path)?;
        state.put(path, data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let mut state = self.state();
        state.check_failure()?;
        state.require(path)?;
        Ok(state.nodes.get(path).cloned().unwrap_or_default())
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Watch)> {
        let mut state = self.state();
        state.check_failure()?;
        state.require(path)?;
        let data = state.nodes.get(path).cloned().unwrap_or_default();
        let (tx, watch) = Watch::channel(path);
        register(&mut state.data_watches, path, tx);
        Ok((data, watch))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let mut state = self.state();
        state.check_failure()?;
        paths::validate(path)?;
        Ok(state.nodes.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.state();
        state.check_failure()?;
        paths::validate(path)?;
        state.remove_subtree(path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let mut state = self.state();
        state.check_failure()?;
        state.require(path)?;
        Ok(state.children(path))
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut state = self.state();
        state.check_failure()?;
        state.require(path)?;
        let children = state.children(path);
        let (tx, watch) = Watch::channel(path);
        register(&mut state.child_watches, path, tx);
        Ok((children, watch))
    }

    fn new_leader(&self, path: &str, record: LeaderRecord) -> Box<dyn Leader> {
        let candidate = {
            let mut state = self.state();
            state.next_candidate += 1;
            state.next_candidate
        };
        Box::new(MemoryLeader {
            coord: self.clone(),
            election: path.to_string(),
            record,
            candidate,
        })
    }
}

// =============================================================================
// Leader
// =============================================================================

struct MemoryLeader {
    coord: MemoryCoordinator,
    election: String,
    record: LeaderRecord,
    candidate: u64,
}

/// Withdraws a pending candidacy if `take_lead` is dropped mid-wait.
struct Candidacy<'a> {
    leader: &'a MemoryLeader,
    armed: bool,
}

impl Drop for Candidacy<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.leader
                .coord
                .withdraw(&self.leader.election, self.leader.candidate);
        }
    }
}

#[async_trait]
impl Leader for MemoryLeader {
    async fn take_lead(&self) -> Result<Watch> {
        let grant = {
            let mut state = self.coord.state();
            state.check_failure()?;
            paths::validate(&self.election)?;
            let e = state.elections.entry(self.election.clone()).or_default();
            if e.holder.is_none() && e.queue.is_empty() {
                return Ok(state.grant(&self.election, self.candidate, self.record.clone()));
            }
            let (tx, rx) = oneshot::channel();
            e.queue.push_back(Waiter {
                candidate: self.candidate,
                record: self.record.clone(),
                grant: tx,
            });
            rx
        };

        let mut candidacy = Candidacy {
            leader: self,
            armed: true,
        };
        let watch = grant.await.map_err(|_| CoordError::SessionClosed)?;
        candidacy.armed = false;
        Ok(watch)
    }

    async fn release_lead(&self) -> Result<()> {
        self.coord.withdraw(&self.election, self.candidate);
        Ok(())
    }
}

/// Adds a watch on `path`, dropping senders whose watch is gone.
fn register(
    watches: &mut HashMap<String, Vec<oneshot::Sender<Event>>>,
    path: &str,
    tx: oneshot::Sender<Event>,
) {
    let pending = watches.entry(path.to_string()).or_default();
    pending.retain(|w| !w.is_closed());
    pending.push(tx);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node;
    use convoy_id::HostId;
    use std::time::Duration;

    fn record(host: &str) -> LeaderRecord {
        LeaderRecord::new(HostId::parse(host).unwrap())
    }

    #[tokio::test]
    async fn test_create_makes_ancestors_and_lists_children() {
        let c = MemoryCoordinator::new();
        c.create("/hosts/h1/a", b"1".to_vec()).await.unwrap();
        c.create("/hosts/h1/b", b"2".to_vec()).await.unwrap();
        c.create("/hosts/h2", Vec::new()).await.unwrap();

        assert_eq!(c.children("/hosts").await.unwrap(), vec!["h1", "h2"]);
        assert_eq!(c.children("/hosts/h1").await.unwrap(), vec!["a", "b"]);
        assert_eq!(c.get("/hosts/h1/b").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let c = MemoryCoordinator::new();
        c.create("/a", Vec::new()).await.unwrap();
        let err = c.create("/a", Vec::new()).await.unwrap_err();
        assert!(err.is_node_exists());
        c.create_dir("/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_and_get_missing() {
        let c = MemoryCoordinator::new();
        assert!(c.set("/nope", Vec::new()).await.unwrap_err().is_not_found());
        assert!(c.get("/nope").await.unwrap_err().is_not_found());
        assert!(!c.exists("/nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let c = MemoryCoordinator::new();
        c.create("/services/web", Vec::new()).await.unwrap();
        c.create("/services/web/i1", Vec::new()).await.unwrap();
        c.create("/services/webapp", Vec::new()).await.unwrap();

        c.delete("/services/web").await.unwrap();
        assert!(!c.exists("/services/web/i1").await.unwrap());
        assert!(c.exists("/services/webapp").await.unwrap());
        assert!(c.delete("/services/web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_children_watch_fires_once() {
        let c = MemoryCoordinator::new();
        c.create_dir("/hosts/h1").await.unwrap();
        let (children, watch) = c.children_w("/hosts/h1").await.unwrap();
        assert!(children.is_empty());

        c.create("/hosts/h1/a", Vec::new()).await.unwrap();
        let event = watch.await;
        assert_eq!(event.kind, EventKind::NodeChildrenChanged);
        assert_eq!(event.path, "/hosts/h1");
    }

    #[tokio::test]
    async fn test_data_watch_sees_change_and_delete() {
        let c = MemoryCoordinator::new();
        c.create("/services/web", b"a".to_vec()).await.unwrap();

        let (_, watch) = c.get_w("/services/web").await.unwrap();
        c.set("/services/web", b"b".to_vec()).await.unwrap();
        assert_eq!(watch.await.kind, EventKind::NodeDataChanged);

        let (_, watch) = c.get_w("/services/web").await.unwrap();
        c.delete("/services").await.unwrap();
        assert_eq!(watch.await.kind, EventKind::NodeDeleted);
    }

    #[tokio::test]
    async fn test_disconnect_watches_reports_not_watching() {
        let c = MemoryCoordinator::new();
        c.create_dir("/hosts").await.unwrap();
        let (_, watch) = c.children_w("/hosts").await.unwrap();
        c.disconnect_watches();
        assert_eq!(watch.await.kind, EventKind::NotWatching);
    }

    #[tokio::test]
    async fn test_fail_next_is_transient_and_bounded() {
        let c = MemoryCoordinator::new();
        c.fail_next(2);
        assert_eq!(c.pending_failures(), 2);
        assert!(c.exists("/").await.unwrap_err().is_transient());
        assert!(c.exists("/").await.unwrap_err().is_transient());
        assert_eq!(c.pending_failures(), 0);
        assert!(c.exists("/").await.unwrap());
    }

    #[tokio::test]
    async fn test_leadership_hands_off_in_order() {
        let c = MemoryCoordinator::new();
        let first = c.new_leader(paths::SCHEDULER, record("h1"));
        let second = c.new_leader(paths::SCHEDULER, record("h2"));

        let loss = first.take_lead().await.unwrap();
        let rec: LeaderRecord = node::load(&c, "/scheduler/leader").await.unwrap();
        assert_eq!(rec.host_id.as_str(), "h1");
        assert_eq!(rec.version, 1);

        let waiting = tokio::spawn(async move {
            let watch = second.take_lead().await.unwrap();
            (second, watch)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        assert!(c.expire_leader(paths::SCHEDULER));
        assert_eq!(loss.await.kind, EventKind::Session);

        let (_second, _watch) = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        let rec: LeaderRecord = node::load(&c, "/scheduler/leader").await.unwrap();
        assert_eq!(rec.host_id.as_str(), "h2");
        assert_eq!(rec.version, 2);
    }

    #[tokio::test]
    async fn test_dropped_watches_do_not_accumulate() {
        let c = MemoryCoordinator::new();
        c.create("/services/web", Vec::new()).await.unwrap();

        for _ in 0..1000 {
            let (_, data) = c.get_w("/services/web").await.unwrap();
            let (_, children) = c.children_w("/services/web").await.unwrap();
            drop((data, children));
        }
        let (_, live) = c.get_w("/services/web").await.unwrap();

        {
            let state = c.state();
            assert_eq!(state.data_watches["/services/web"].len(), 1);
            assert_eq!(state.child_watches["/services/web"].len(), 1);
        }

        c.set("/services/web", b"x".to_vec()).await.unwrap();
        assert_eq!(live.await.kind, EventKind::NodeDataChanged);
    }

    #[tokio::test]
    async fn test_dropped_candidate_is_skipped() {
        let c = MemoryCoordinator::new();
        let first = c.new_leader(paths::SCHEDULER, record("h1"));
        let quitter = c.new_leader(paths::SCHEDULER, record("h2"));
        let third = c.new_leader(paths::SCHEDULER, record("h3"));

        let _loss = first.take_lead().await.unwrap();
        let gave_up =
            tokio::time::timeout(Duration::from_millis(10), quitter.take_lead()).await;
        assert!(gave_up.is_err());

        let waiting = tokio::spawn(async move { third.take_lead().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.release_lead().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let rec: LeaderRecord = node::load(&c, "/scheduler/leader").await.unwrap();
        assert_eq!(rec.host_id.as_str(), "h3");
    }
}

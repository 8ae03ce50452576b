//! End-to-end cluster scenarios.
//!
//! A leader candidate and several host agents share one in-memory
//! coordinator; every host runs its own mock container runtime. The tests
//! change service definitions the way an operator would and wait for the
//! containers to follow, verifying:
//!
//! 1. Services converge to running containers spread over the pool
//! 2. Scaling down stops the surplus containers
//! 3. Stopping a service stops its containers, and running it again restarts them
//! 4. A crashed container is restarted in place
//! 5. A standby leader takes over and keeps scheduling
//!
//! ## Running
//!
//! ```bash
//! cargo test -p convoy-e2e --test cluster
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use convoy_coord::{
    node, paths, Coordinator, DesiredState, InstanceState, LeaderRecord, Lifecycle,
    MemoryCoordinator, ServiceDefinition,
};
use convoy_host_agent::{AgentConfig, HostAgentHandle, HostReconciler, MockRuntime, WorkerTimings};
use convoy_id::{HostId, InstanceId, PoolId, ServiceId};
use convoy_scheduler::{ClusterLeader, LabelSnapshotter, LeaderConfig, RandomPlacement};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

const RETRY_DELAY: Duration = Duration::from_millis(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn timings() -> WorkerTimings {
    WorkerTimings {
        retry_delay: RETRY_DELAY,
        attach_attempts: 3,
        attach_interval: Duration::from_millis(10),
        start_timeout: Duration::from_millis(250),
        refresh_interval: Duration::from_millis(50),
    }
}

fn pool() -> PoolId {
    PoolId::parse("default").unwrap()
}

fn service(name: &str, instances: u32) -> ServiceDefinition {
    ServiceDefinition {
        id: ServiceId::parse(name).unwrap(),
        name: name.to_string(),
        instances,
        pool_id: pool(),
        desired_state: DesiredState::Run,
        image: "nginx:1.27".to_string(),
        command: vec![],
        env: BTreeMap::from([("PORT".to_string(), "80".to_string())]),
    }
}

// =============================================================================
// Cluster fixture
// =============================================================================

struct Host {
    id: HostId,
    runtime: Arc<MockRuntime>,
    agent: HostAgentHandle,
}

struct Leader {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Cluster {
    coord: MemoryCoordinator,
    hosts: Vec<Host>,
    leaders: Vec<Leader>,
}

impl Cluster {
    /// Starts `hosts` host agents in the default pool and one leader
    /// candidate on the first host.
    fn start(hosts: &[&str]) -> Self {
        init_tracing();
        let mut cluster = Self {
            coord: MemoryCoordinator::new(),
            hosts: Vec::new(),
            leaders: Vec::new(),
        };
        for name in hosts {
            cluster.add_host(name);
        }
        cluster.add_leader(hosts[0]);
        cluster
    }

    fn coord(&self) -> Arc<dyn Coordinator> {
        Arc::new(self.coord.clone())
    }

    fn add_host(&mut self, name: &str) {
        let id = HostId::parse(name).unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let config = AgentConfig::new(id.clone())
            .with_pool(pool())
            .with_timings(timings());
        let agent = HostReconciler::spawn(config, self.coord(), Arc::clone(&runtime));
        self.hosts.push(Host { id, runtime, agent });
    }

    fn add_leader(&mut self, name: &str) {
        let coord = self.coord();
        let config = LeaderConfig::new(HostId::parse(name).unwrap()).with_retry_delay(RETRY_DELAY);
        let leader = ClusterLeader::new(
            config,
            Arc::clone(&coord),
            Arc::new(RandomPlacement),
            Arc::new(LabelSnapshotter::new(coord)),
        );
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(leader.run(rx));
        self.leaders.push(Leader { shutdown, task });
    }

    async fn put_service(&self, svc: &ServiceDefinition) {
        node::create_record(&self.coord, &paths::service(&svc.id), svc)
            .await
            .unwrap();
    }

    async fn edit_service<F>(&self, svc: &ServiceDefinition, edit: F)
    where
        F: FnOnce(&mut ServiceDefinition) + Send,
    {
        node::update(&self.coord, &paths::service(&svc.id), edit)
            .await
            .unwrap();
    }

    async fn leader_host(&self) -> Option<String> {
        node::load::<_, LeaderRecord>(&self.coord, &paths::leader_record(paths::SCHEDULER))
            .await
            .ok()
            .map(|r| r.host_id.to_string())
    }

    /// Running containers across every host.
    fn running(&self) -> usize {
        self.hosts.iter().map(|h| h.runtime.running_count()).sum()
    }

    /// Instance states of a service whose container is running.
    async fn running_states(&self, svc: &ServiceDefinition) -> Vec<InstanceState> {
        let mut running = Vec::new();
        let children = self
            .coord
            .children(&paths::service(&svc.id))
            .await
            .unwrap_or_default();
        for child in children {
            let Ok(id) = child.parse::<InstanceId>() else {
                continue;
            };
            let path = paths::instance_state(&svc.id, &id);
            if let Ok(state) = node::load::<_, InstanceState>(&self.coord, &path).await {
                if state.docker_id.is_some() && matches!(state.lifecycle, Lifecycle::Running { .. }) {
                    running.push(state);
                }
            }
        }
        running.sort_by_key(|s| s.instance_index);
        running
    }

    /// True when `svc` has exactly `count` running instances and no other
    /// container runs.
    async fn converged(&self, svc: &ServiceDefinition, count: usize) -> bool {
        self.running_states(svc).await.len() == count && self.running() == count
    }

    async fn converged_pair(
        &self,
        (a, a_count): (&ServiceDefinition, usize),
        (b, b_count): (&ServiceDefinition, usize),
    ) -> bool {
        self.running_states(a).await.len() == a_count
            && self.running_states(b).await.len() == b_count
            && self.running() == a_count + b_count
    }

    fn host(&self, id: &HostId) -> &Host {
        self.hosts.iter().find(|h| &h.id == id).unwrap()
    }

    async fn stop(self) {
        for leader in self.leaders {
            let _ = leader.shutdown.send(true);
            tokio::time::timeout(Duration::from_secs(3), leader.task)
                .await
                .expect("leader did not stop")
                .unwrap();
        }
        for host in self.hosts {
            tokio::time::timeout(Duration::from_secs(3), host.agent.shutdown())
                .await
                .expect("host agent did not stop")
                .unwrap();
            assert_eq!(host.runtime.running_count(), 0);
        }
    }
}

/// Polls `check` until it returns true, failing the test after 5 seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn services_converge_to_running_containers() {
    let cluster = Cluster::start(&["h1", "h2", "h3"]);
    let web = service("web", 4);
    let api = service("api", 2);
    cluster.put_service(&web).await;
    cluster.put_service(&api).await;

    eventually("both services running", || cluster.converged_pair((&web, 4), (&api, 2))).await;

    let states = cluster.running_states(&web).await;
    let indices: Vec<u32> = states.iter().map(|s| s.instance_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    for state in &states {
        let runtime = &cluster.host(&state.host_id).runtime;
        assert!(runtime.is_running(&state.id.to_string()));
        assert!(state.private_ip.is_some());
        assert!(state.port_mapping.contains_key("80/tcp"));
    }
    info!(running = cluster.running(), "Cluster converged");

    cluster.stop().await;
}

#[tokio::test]
async fn scale_down_stops_surplus_containers() {
    let cluster = Cluster::start(&["h1", "h2"]);
    let web = service("web", 3);
    cluster.put_service(&web).await;
    eventually("three running", || cluster.converged(&web, 3)).await;

    cluster.edit_service(&web, |s| s.instances = 1).await;
    eventually("one running", || cluster.converged(&web, 1)).await;

    // The highest index survives.
    let states = cluster.running_states(&web).await;
    assert_eq!(states[0].instance_index, 2);

    cluster.stop().await;
}

#[tokio::test]
async fn stopped_service_restarts_when_run_again() {
    let cluster = Cluster::start(&["h1", "h2"]);
    let web = service("web", 2);
    cluster.put_service(&web).await;
    eventually("two running", || cluster.converged(&web, 2)).await;

    cluster
        .edit_service(&web, |s| s.desired_state = DesiredState::Stop)
        .await;
    eventually("nothing running", || async { cluster.running() == 0 }).await;

    cluster
        .edit_service(&web, |s| s.desired_state = DesiredState::Run)
        .await;
    eventually("two running again", || cluster.converged(&web, 2)).await;

    cluster.stop().await;
}

#[tokio::test]
async fn crashed_container_is_restarted() {
    let cluster = Cluster::start(&["h1"]);
    let web = service("web", 1);
    cluster.put_service(&web).await;
    eventually("running", || cluster.converged(&web, 1)).await;

    let before = cluster.running_states(&web).await.remove(0);
    let host = cluster.host(&before.host_id);
    assert!(host.runtime.crash(&before.id.to_string(), 137));
    let created = host.runtime.created_count();

    eventually("restarted", || async {
        host.runtime.running_count() == 1 && host.runtime.created_count() == created + 1
    })
    .await;
    eventually("state running", || async {
        cluster
            .running_states(&web)
            .await
            .first()
            .is_some_and(|s| s.id == before.id && s.docker_id != before.docker_id)
    })
    .await;

    cluster.stop().await;
}

#[tokio::test]
async fn standby_leader_keeps_scheduling() {
    let mut cluster = Cluster::start(&["h1", "h2"]);
    let web = service("web", 2);
    cluster.put_service(&web).await;
    eventually("two running", || cluster.converged(&web, 2)).await;
    assert_eq!(cluster.leader_host().await.as_deref(), Some("h1"));

    cluster.add_leader("h2");
    assert!(cluster.coord.expire_leader(paths::SCHEDULER));
    eventually("h2 leads", || async {
        cluster.leader_host().await.as_deref() == Some("h2")
    })
    .await;

    cluster.edit_service(&web, |s| s.instances = 4).await;
    eventually("four running", || cluster.converged(&web, 4)).await;

    // Containers placed by the old leader keep running.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cluster.converged(&web, 4).await);

    cluster.stop().await;
}

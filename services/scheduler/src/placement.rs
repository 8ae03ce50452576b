//! Host selection for new instances.

use async_trait::async_trait;
use convoy_coord::ServiceDefinition;
use convoy_id::HostId;
use rand::seq::IndexedRandom;

/// Chooses the host a new instance of `service` is assigned to.
#[async_trait]
pub trait PlacementPolicy: Send + Sync + 'static {
    /// Picks one of `hosts`, or `None` if none is acceptable.
    async fn select_host(&self, service: &ServiceDefinition, hosts: &[HostId]) -> Option<HostId>;
}

/// Uniform random choice over the pool's hosts.
///
/// No resource or affinity awareness: every host in the pool is equally
/// likely, independently for each new instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPlacement;

#[async_trait]
impl PlacementPolicy for RandomPlacement {
    async fn select_host(&self, _service: &ServiceDefinition, hosts: &[HostId]) -> Option<HostId> {
        hosts.choose(&mut rand::rng()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_coord::DesiredState;
    use convoy_id::{PoolId, ServiceId};
    use std::collections::HashSet;

    fn service() -> ServiceDefinition {
        ServiceDefinition {
            id: ServiceId::parse("web").unwrap(),
            name: "web".to_string(),
            instances: 1,
            pool_id: PoolId::parse("default").unwrap(),
            desired_state: DesiredState::Run,
            image: "nginx".to_string(),
            command: vec![],
            env: Default::default(),
        }
    }

    fn hosts(names: &[&str]) -> Vec<HostId> {
        names.iter().map(|n| HostId::parse(n).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_empty_pool_selects_nothing() {
        assert_eq!(RandomPlacement.select_host(&service(), &[]).await, None);
    }

    #[tokio::test]
    async fn test_selects_every_host_eventually() {
        let pool = hosts(&["h1", "h2", "h3"]);
        let mut seen = HashSet::new();
        for _ in 0..300 {
            let host = RandomPlacement.select_host(&service(), &pool).await.unwrap();
            assert!(pool.contains(&host));
            seen.insert(host);
        }
        assert_eq!(seen.len(), 3);
    }
}

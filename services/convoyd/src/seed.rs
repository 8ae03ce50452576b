//! Development seed: pools and services loaded into a fresh coordinator.
//!
//! ```json
//! {
//!   "pools": { "default": ["h1", "h2"] },
//!   "services": [
//!     { "id": "web", "instances": 2, "pool_id": "default",
//!       "desired_state": "run", "image": "nginx:1.27" }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use convoy_coord::{node, paths, Coordinator, PoolMember, ServiceDefinition};
use convoy_id::{HostId, PoolId};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    /// Pool membership, by pool.
    #[serde(default)]
    pub pools: BTreeMap<PoolId, Vec<HostId>>,

    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse seed file {}", path.display()))
    }

    /// Writes every pool member, host directory and service.
    ///
    /// Records that already exist are overwritten.
    pub async fn apply(&self, coord: &dyn Coordinator) -> Result<()> {
        for (pool_id, hosts) in &self.pools {
            for host_id in hosts {
                coord.create_dir(&paths::host(host_id)).await?;
                let member = PoolMember {
                    host_id: host_id.clone(),
                    registered_at: Utc::now(),
                };
                put(coord, &paths::pool_member(pool_id, host_id), &member).await?;
            }
        }

        for service in &self.services {
            put(coord, &paths::service(&service.id), service).await?;
        }

        info!(
            pools = self.pools.len(),
            services = self.services.len(),
            "Seed applied"
        );
        Ok(())
    }
}

async fn put<T>(coord: &dyn Coordinator, path: &str, record: &T) -> Result<()>
where
    T: serde::Serialize + Sync,
{
    match node::create_record(coord, path, record).await {
        Err(e) if e.is_node_exists() => node::store(coord, path, record).await?,
        other => other?,
    }
    Ok(())
}

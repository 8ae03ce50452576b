//! Configuration for the convoy daemon.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use convoy_host_agent::{AgentConfig, WorkerTimings};
use convoy_id::{HostId, PoolId, Ulid};
use convoy_scheduler::LeaderConfig;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host this process runs the agent for.
    pub host_id: HostId,

    /// Pool the host registers in.
    pub pool_id: Option<PoolId>,

    /// Whether this process stands for cluster leader.
    pub leader_candidate: bool,

    /// Log level (trace, debug, info, warn, error), used when RUST_LOG is unset.
    pub log_level: String,

    /// JSON file with pools and services to load at startup.
    pub seed_file: Option<PathBuf>,

    /// Host agent timings.
    pub timings: WorkerTimings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Host ID can be provided, else the hostname, else generated
        let host_id = match var("CONVOY_HOST_ID") {
            Some(s) => HostId::parse(&s).context("invalid CONVOY_HOST_ID")?,
            None => default_host_id()?,
        };

        let pool_id = var("CONVOY_POOL_ID")
            .map(|s| PoolId::parse(&s))
            .transpose()
            .context("invalid CONVOY_POOL_ID")?;

        let leader_candidate = parse_var(&var, "CONVOY_LEADER_CANDIDATE")?.unwrap_or(true);

        let log_level = var("CONVOY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let seed_file = var("CONVOY_SEED_FILE").map(PathBuf::from);

        let defaults = WorkerTimings::default();
        let timings = WorkerTimings {
            retry_delay: parse_var(&var, "CONVOY_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            attach_attempts: parse_var(&var, "CONVOY_ATTACH_ATTEMPTS")?
                .unwrap_or(defaults.attach_attempts),
            attach_interval: parse_var(&var, "CONVOY_ATTACH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.attach_interval),
            start_timeout: parse_var(&var, "CONVOY_START_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.start_timeout),
            refresh_interval: parse_var(&var, "CONVOY_REFRESH_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_interval),
        };

        Ok(Self {
            host_id,
            pool_id,
            leader_candidate,
            log_level,
            seed_file,
            timings,
        })
    }

    pub fn agent_config(&self) -> AgentConfig {
        let config = AgentConfig::new(self.host_id.clone()).with_timings(self.timings);
        match &self.pool_id {
            Some(pool_id) => config.with_pool(pool_id.clone()),
            None => config,
        }
    }

    pub fn leader_config(&self) -> LeaderConfig {
        LeaderConfig::new(self.host_id.clone()).with_retry_delay(self.timings.retry_delay)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|s| s.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("invalid {key}"))
}

fn default_host_id() -> Result<HostId> {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .and_then(|name| HostId::parse(name.trim()).ok());
    match hostname {
        Some(id) => Ok(id),
        None => {
            let generated = format!("host-{}", Ulid::new().to_string().to_lowercase());
            HostId::parse(&generated).context("failed to generate a host id")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("CONVOY_HOST_ID", "h1")]).unwrap();
        assert_eq!(config.host_id.as_str(), "h1");
        assert!(config.pool_id.is_none());
        assert!(config.leader_candidate);
        assert_eq!(config.log_level, "info");
        assert!(config.seed_file.is_none());
        assert_eq!(config.timings, WorkerTimings::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CONVOY_HOST_ID", "h2"),
            ("CONVOY_POOL_ID", "gpu"),
            ("CONVOY_LEADER_CANDIDATE", "false"),
            ("CONVOY_RETRY_DELAY_MS", "250"),
            ("CONVOY_ATTACH_ATTEMPTS", "5"),
            ("CONVOY_START_TIMEOUT_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.pool_id.unwrap().as_str(), "gpu");
        assert!(!config.leader_candidate);
        assert_eq!(config.timings.retry_delay, Duration::from_millis(250));
        assert_eq!(config.timings.attach_attempts, 5);
        assert_eq!(config.timings.start_timeout, Duration::from_secs(30));
        assert_eq!(config.timings.refresh_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_leader_config_shares_retry_delay() {
        let config = load(&[("CONVOY_HOST_ID", "h1"), ("CONVOY_RETRY_DELAY_MS", "100")]).unwrap();
        let leader = config.leader_config();
        assert_eq!(leader.retry_delay, Duration::from_millis(100));
        assert_eq!(leader.host_id.as_str(), "h1");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(load(&[("CONVOY_HOST_ID", "a/b")]).is_err());
        assert!(load(&[("CONVOY_HOST_ID", "h1"), ("CONVOY_ATTACH_ATTEMPTS", "many")]).is_err());
    }
}

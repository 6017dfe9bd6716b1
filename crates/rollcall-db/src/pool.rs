//! Database connection pool management.
//!
//! API handlers and every worker slot draw from one pool. A slot holds a
//! connection for each claim, failure and recognition write, so the pool is
//! sized to the worker concurrency plus headroom for requests.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use rollcall_core::{defaults, Error, Result};

/// Pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long a caller waits for a free connection before failing.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// Recycle connections after this long; `None` keeps them indefinitely.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::DATABASE_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(defaults::DATABASE_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(defaults::DATABASE_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(defaults::DATABASE_MAX_LIFETIME_SECS)),
        }
    }
}

impl PoolConfig {
    /// Read `DATABASE_MAX_CONNECTIONS` and `DATABASE_CONNECT_TIMEOUT_SECS`,
    /// then raise the size to fit `JOB_MAX_CONCURRENT` worker slots.
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<u32>("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("DATABASE_CONNECT_TIMEOUT_SECS") {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        let workers = env_parse::<u32>("JOB_MAX_CONCURRENT")
            .unwrap_or(defaults::JOB_MAX_CONCURRENT as u32);
        config.fit_workers(workers)
    }

    /// Grow `max_connections` so `workers` concurrent jobs cannot starve
    /// API requests. Never shrinks an explicit larger size.
    pub fn fit_workers(mut self, workers: u32) -> Self {
        let needed = workers.saturating_add(defaults::DATABASE_API_HEADROOM);
        if self.max_connections < needed {
            warn!(
                subsystem = "db",
                component = "pool",
                configured = self.max_connections,
                workers,
                max_connections = needed,
                "Pool too small for worker concurrency, raising it"
            );
            self.max_connections = needed;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Connect with [`PoolConfig::default`].
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout);
    if let Some(max_lifetime) = config.max_lifetime {
        options = options.max_lifetime(max_lifetime);
    }

    let pool = options
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool ready"
    );
    Ok(pool)
}

/// Log pool usage. Called from worker housekeeping; a pool with no idle
/// connection means claims and API requests are queueing for one.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle() as u32;

    debug!(
        subsystem = "db",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool usage"
    );
    if idle == 0 && size > 0 {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = size,
            "No idle database connections; workers and requests are waiting"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, defaults::DATABASE_MAX_CONNECTIONS);
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_fit_workers_raises_small_pool() {
        let config = PoolConfig {
            max_connections: 2,
            ..PoolConfig::default()
        }
        .fit_workers(8);
        assert_eq!(config.max_connections, 8 + defaults::DATABASE_API_HEADROOM);
    }

    #[test]
    fn test_fit_workers_keeps_larger_pool() {
        let config = PoolConfig {
            max_connections: 50,
            ..PoolConfig::default()
        }
        .fit_workers(4);
        assert_eq!(config.max_connections, 50);
    }
}

use std::{env::var, time::Duration};

use crate::{Config, Result};

use super::PgPool;

/// Generic [`Pool`][super::Pool] options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub(crate) max: usize,
    pub(crate) acquire_timeout: Option<Duration>,
    pub(crate) idle_timeout: Option<Duration>,
}

impl PoolOptions {
    /// Options with max of 10 resources and no timeout.
    pub fn new() -> Self {
        Self { max: 10, acquire_timeout: None, idle_timeout: None }
    }

    /// Returns the max resources.
    pub fn get_max(&self) -> usize {
        self.max
    }

    /// Set max resources, value of 0 is treated as 1.
    pub fn max(mut self, value: usize) -> Self {
        self.max = value.max(1);
        self
    }

    /// Fail acquire with [`PoolError::Timeout`][super::PoolError::Timeout]
    /// if it takes longer than `value`.
    pub fn acquire_timeout(mut self, value: Duration) -> Self {
        self.acquire_timeout = Some(value);
        self
    }

    /// Destroy resource that is idle longer than `value`.
    pub fn idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = Some(value);
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// [`PgPool`] configuration builder.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub(crate) conn: Config,
    pub(crate) options: PoolOptions,
}

impl PoolConfig {
    /// Create config from environment variables.
    ///
    /// Connection config is read by [`Config::from_env`], max connection
    /// is read from `PGPOOL_MAX`.
    pub fn from_env() -> PoolConfig {
        let mut options = PoolOptions::new();
        if let Some(max) = var("PGPOOL_MAX").ok().and_then(|e|e.parse().ok()) {
            options = options.max(max);
        }
        Self { conn: Config::from_env(), options }
    }

    /// Create config with given connection config.
    pub fn new(conn: Config) -> PoolConfig {
        Self { conn, options: PoolOptions::new() }
    }

    /// Get connection config.
    pub fn connection(&self) -> &Config {
        &self.conn
    }

    /// Get pool options.
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Set connection config.
    pub fn set_connection(mut self, conn: Config) -> Self {
        self.conn = conn;
        self
    }

    /// Set max connection value.
    pub fn max_connection(mut self, value: usize) -> Self {
        self.options = self.options.max(value);
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, value: Duration) -> Self {
        self.options = self.options.acquire_timeout(value);
        self
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, value: Duration) -> Self {
        self.options = self.options.idle_timeout(value);
        self
    }
}

impl PoolConfig {
    /// Parse `url` as connection config and create [`PgPool`].
    pub async fn connect(mut self, url: &str) -> Result<PgPool> {
        self.conn = Config::parse(url)?;
        PgPool::connect_with(self).await
    }

    /// Parse `url` as connection config and create [`PgPool`] without connecting.
    pub fn connect_lazy(mut self, url: &str) -> Result<PgPool> {
        self.conn = Config::parse(url)?;
        Ok(PgPool::connect_lazy_with(self))
    }
}

//! Postgres [`Connection`] pool.
use std::fmt;

use super::{Manager, Pool, PoolConfig, Pooled};
use crate::{
    Config, Connection, Error, Result,
    command::LeaseFuture,
    connection::StreamLease,
    executor::Executor,
    postgres::ReadyState,
    stream::PgStream,
    transport::Lease,
};

/// Postgres connection pool.
pub type PgPool = Pool<ConnectionManager>;

/// [`Manager`] that creates [`Connection`] from [`Config`].
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    config: Config,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Returns the connection config.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Manager for ConnectionManager {
    type Resource = Connection;
    type Error = Error;

    async fn create(&self) -> Result<Connection> {
        Connection::connect_with(self.config.clone()).await
    }

    async fn destroy(&self, conn: Connection) {
        if conn.is_broken() {
            return;
        }
        if let Err(_err) = conn.terminate().await {
            #[cfg(feature = "log")]
            log::warn!("failed to terminate connection: {_err}");
        }
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        conn.is_broken()
    }
}

impl Pool<ConnectionManager> {
    /// Create [`PgPool`] and try to create one connection.
    pub async fn connect(url: &str) -> Result<Self> {
        PoolConfig::from_env().connect(url).await
    }

    /// Create [`PgPool`] without trying to create connection.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        PoolConfig::from_env().connect_lazy(url)
    }

    /// Create [`PgPool`] and try to create one connection.
    ///
    /// See [`Config::from_env`] and [`PoolConfig::from_env`] for more details on env.
    pub async fn connect_env() -> Result<Self> {
        Self::connect_with(PoolConfig::from_env()).await
    }

    /// Create [`PgPool`] and try to create one connection.
    pub async fn connect_with(config: PoolConfig) -> Result<Self> {
        let pool = Self::connect_lazy_with(config);
        drop(pool.acquire().await?);
        Ok(pool)
    }

    /// Create [`PgPool`] without trying to create connection.
    pub fn connect_lazy_with(config: PoolConfig) -> Self {
        Pool::new(ConnectionManager::new(config.conn), config.options)
    }
}

/// [`Lease`] of a pooled [`Connection`].
///
/// The connection is returned to the pool after the stream is released.
pub struct PooledLease<M: Manager<Resource = Connection>> {
    lease: StreamLease,
    pooled: Pooled<M>,
}

impl<M: Manager<Resource = Connection>> PooledLease<M> {
    /// Returns the pooled connection.
    pub fn connection(&self) -> &Connection {
        &self.pooled
    }
}

impl<M: Manager<Resource = Connection>> Lease for PooledLease<M> {
    type Transport = PgStream;

    fn transport(&mut self) -> &mut Self::Transport {
        self.lease.transport()
    }

    fn release(self, ready: Option<ReadyState>) {
        let Self { lease, pooled } = self;
        lease.release(ready);
        drop(pooled);
    }
}

impl<M: Manager<Resource = Connection>> fmt::Debug for PooledLease<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledLease")
            .field("lease", &self.lease)
            .field("connection", &*self.pooled)
            .finish()
    }
}

impl<M> Executor for Pool<M>
where
    M: Manager<Resource = Connection>,
    Error: From<M::Error>,
{
    type Lease = PooledLease<M>;

    fn connection(&self) -> LeaseFuture<Self::Lease> {
        let pool = self.clone();
        Box::pin(async move {
            let pooled = pool.acquire().await?;
            let lease = pooled.lease().await?;
            Ok(PooledLease { lease, pooled })
        })
    }
}

//! The [`Executor`] trait.
use crate::{
    Result,
    command::{Command, LeaseFuture, simple_query},
    connection::{Connection, StreamLease},
    postgres::ReadyState,
    transport::Lease,
};

/// A type that can hand out [`Lease`], e.g. [`Connection`] or [`PgPool`][crate::PgPool].
pub trait Executor {
    /// The returned lease.
    type Lease: Lease;

    /// Acquire a lease.
    fn connection(&self) -> LeaseFuture<Self::Lease>;

    /// Create a [`Command`], nothing is sent until it is consumed.
    fn query(&self, sql: impl Into<String>) -> Command<Self::Lease> {
        Command::new(sql, self.connection())
    }

    /// Run multiple statements using the simple query protocol.
    ///
    /// Returns the transaction state after the batch.
    fn execute_batch(&self, sql: &str) -> impl Future<Output = Result<ReadyState>> + Send {
        let acquire = self.connection();
        let sql = sql.to_owned();
        async move { simple_query(acquire.await?, &sql).await }
    }
}

impl<E: Executor> Executor for &E {
    type Lease = E::Lease;

    fn connection(&self) -> LeaseFuture<Self::Lease> {
        E::connection(self)
    }
}

impl Executor for Connection {
    type Lease = StreamLease;

    fn connection(&self) -> LeaseFuture<Self::Lease> {
        let conn = self.clone();
        Box::pin(async move { conn.lease().await })
    }
}

#[cfg(test)]
mod test {
    use super::Executor;

    #[allow(unused, reason = "type assertion")]
    async fn assert_type<E: Executor>(e: E) {
        let _ = e.query("").fetch_all().await;
        let _ = (&e).query("").bind(1).execute().await;
        let _ = e.execute_batch("").await;
    }

    #[allow(unused, reason = "type assertion")]
    fn assert_send<E: Executor + Send>(e: E) -> impl Send {
        async move {
            let mut cmd = e.query("SELECT 1");
            let _ = cmd.fetch_one().await;
        }
    }
}

use std::time::Duration;
use postwire::{Executor, PgPool, PoolConfig, Result};

pub async fn main() -> Result<()> {
    let config = PoolConfig::from_env()
        .max_connection(4)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(60));

    let pool = PgPool::connect_with(config).await?;

    pool.execute_batch("CREATE TABLE IF NOT EXISTS postwire_pool(id int)").await?;

    let mut handles = vec![];

    for i in 0..14 {
        let pool = pool.clone();
        let t = tokio::spawn(async move {
            pool.query("INSERT INTO postwire_pool(id) VALUES($1)")
                .bind(i)
                .execute()
                .await
        });
        handles.push(t);
    }

    for h in handles {
        h.await.unwrap()?;
    }

    let status = pool.status();
    assert!(status.idle + status.busy + status.wait <= 4);
    tracing::info!("{status:?}");

    let count = pool.query("SELECT count(*) FROM postwire_pool")
        .map(|row| row.try_parse::<_, i64>(0))
        .fetch_one()
        .await?
        .unwrap();

    assert!(count.unwrap() >= 14);

    pool.execute_batch("DROP TABLE postwire_pool").await?;
    pool.shutdown().await;

    Ok(())
}

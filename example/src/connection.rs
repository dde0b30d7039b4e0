use std::{env::var, time::Duration};
use postwire::{AsyncMessage, Config, Connection, Executor, Result};

pub async fn main() -> Result<()> {
    let conn = Connection::connect(&var("DATABASE_URL").unwrap()).await?;
    conn.query("SELECT 1").execute().await?;
    conn.terminate().await?;

    let config = Config::from_env().set_application_name("postwire-example");
    let conn = Connection::connect_with(config).await?;
    assert_eq!(conn.param("application_name").as_deref(), Some("postwire-example"));

    // Notification

    let mut messages = conn.subscribe();
    conn.execute_batch("LISTEN jobs; NOTIFY jobs, 'hello'").await?;

    loop {
        match messages.recv().await.unwrap() {
            AsyncMessage::Notification { channel, payload, .. } => {
                assert_eq!(channel, "jobs");
                assert_eq!(payload, "hello");
                break;
            },
            message => tracing::info!("{message:?}"),
        }
    }

    // Cancel

    let cancel = conn.cancel_token();
    let sleeper = tokio::spawn({
        let conn = conn.clone();
        async move { conn.query("SELECT pg_sleep(10)").execute().await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel().await?;

    let err = sleeper.await.unwrap().unwrap_err();
    assert_eq!(err.as_database().map(|e|e.code()), Some("57014"));

    // session is still usable after database error
    conn.query("SELECT 1").execute().await?;
    conn.terminate().await?;

    Ok(())
}

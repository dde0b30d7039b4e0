use futures::StreamExt;
use postwire::{Connection, Executor, Result, postgres::ReadyState};

pub async fn main() -> Result<()> {
    let conn = Connection::connect_env().await?;

    // Execute

    conn.execute_batch("CREATE TEMP TABLE postwire(id serial, name text)").await?;

    let rows = conn.query("INSERT INTO postwire(name) VALUES($1)")
        .bind("Deez")
        .execute()
        .await?;

    assert_eq!(rows, 1);

    let mut cmd = conn.query("INSERT INTO postwire(name) VALUES('Foo'),('Bar')");
    cmd.execute().await?;
    assert_eq!(cmd.tag(), Some("INSERT 0 2"));
    assert_eq!(cmd.rows_affected(), Some(2));

    // Queries

    let datas = conn.query("SELECT * FROM postwire")
        .fetch_all()
        .await?
        .unwrap();

    assert_eq!(datas.len(), 3);
    assert_eq!(datas[0].try_get_str("name").unwrap(), "Deez");

    let (id, name) = conn.query("SELECT * FROM postwire LIMIT 1")
        .map(|row| (row.try_parse::<_, i32>(0), row.try_get_str(1).map(str::to_owned)))
        .fetch_one()
        .await?
        .unwrap();

    assert_eq!(id.unwrap(), 1);
    assert_eq!(name.unwrap(), "Deez");

    let data = conn.query("SELECT * FROM postwire LIMIT 0").fetch_one().await?;
    assert!(data.is_none());

    let data = conn.query("CREATE TEMP TABLE foo()").fetch_all().await?;
    assert!(data.is_none());

    let mut stream = conn.query("SELECT name FROM postwire");
    while let Some(row) = stream.next().await {
        row?.try_get_str(0).unwrap();
    }

    // Transaction

    conn.execute_batch("BEGIN").await?;
    conn.query("INSERT INTO postwire(name) VALUES('Foo')").execute().await?;
    assert_eq!(conn.ready_state(), ReadyState::InTransaction);
    conn.execute_batch("COMMIT").await?;
    assert_eq!(conn.ready_state(), ReadyState::Idle);

    // Error case

    conn.query("SELECT foo").execute().await.unwrap_err();
    let err = conn.query("SELECT * FROM nonexistent").execute().await.unwrap_err();
    assert!(err.is_database());

    conn.terminate().await?;

    Ok(())
}

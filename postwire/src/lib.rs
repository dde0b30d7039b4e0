//! Postgres wire protocol engine
//!
//! # Examples
//!
//! Single connection:
//!
//! ```no_run
//! use postwire::{Connection, Executor};
//!
//! # async fn app() -> postwire::Result<()> {
//! let conn = Connection::connect_env().await?;
//!
//! let row = conn.query("SELECT 420::text, $1")
//!     .bind("Foo")
//!     .fetch_one()
//!     .await?
//!     .expect("one row");
//!
//! assert_eq!(row.try_get_str(0)?, "420");
//! assert_eq!(row.try_get_str(1)?, "Foo");
//! # Ok(())
//! # }
//! ```
//!
//! Database Pooling:
//!
//! ```no_run
//! use postwire::{Executor, PgPool};
//!
//! # async fn app() -> postwire::Result<()> {
//! let pool = PgPool::connect_env().await?;
//!
//! pool.execute_batch("CREATE TEMP TABLE foo(id int)").await?;
//!
//! let mut handles = vec![];
//!
//! for i in 0..14 {
//!     let pool = pool.clone();
//!     let t = tokio::spawn(async move {
//!         pool.query("INSERT INTO foo(id) VALUES($1)")
//!             .bind(i)
//!             .execute()
//!             .await
//!     });
//!     handles.push(t);
//! }
//!
//! for h in handles {
//!     h.await.unwrap()?;
//! }
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod common;
mod io;
pub mod net;
mod ext;

// Protocol
pub mod postgres;

// Authentication
pub mod phase;

// Component
pub mod row;
pub mod stream;

// Operation
pub mod transport;
pub mod command;
pub mod executor;

// Connection
pub mod connection;
pub mod pool;

mod error;


pub use row::Row;
pub use command::Command;
pub use stream::AsyncMessage;
pub use net::{SslMode, TlsConnect};

pub use executor::Executor;
pub use connection::{Connection, Config};
pub use pool::{Pool, PgPool, PoolConfig, PoolOptions};
pub use error::{Error, ErrorKind, Result};

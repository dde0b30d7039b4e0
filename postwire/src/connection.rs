//! Postgres session.
use bytes::BytesMut;
use std::{
    fmt,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, OwnedMutexGuard, broadcast},
};

use crate::{
    Result,
    common::ByteStr,
    net::Socket,
    phase::{StartupConfig, StartupResponse, startup},
    postgres::{ReadyState, frontend::CancelRequest},
    stream::{AsyncMessage, Params, PgStream},
    transport::Lease,
};

mod config;

pub use config::{Config, ParseError};

/// A single postgres session.
///
/// `Connection` is cheaply cloneable, all clones share one socket. Commands
/// are serialized, each command holds the stream lease until it is finished,
/// later commands wait in FIFO order.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    stream: Arc<AsyncMutex<PgStream>>,
    state: Mutex<SessionState>,
    params: Params,
    notifier: broadcast::Sender<AsyncMessage>,
    cancel: CancelToken,
}

#[derive(Debug, Clone, Copy)]
struct SessionState {
    ready: ReadyState,
    broken: bool,
}

impl Connection {
    /// Connect to `url`, see [`Config::parse`].
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect using config from environment variable.
    ///
    /// See [`Config::from_env`] for more details on env.
    pub async fn connect_env() -> Result<Self> {
        Self::connect_with(Config::from_env()).await
    }

    /// Open socket, negotiate SSL, and perform startup.
    pub async fn connect_with(config: Config) -> Result<Self> {
        let mut stream = PgStream::connect(&config, config.tls.as_deref())
            .await
            .map_err(|e|e.context("connect"))?;

        let res = startup(&StartupConfig::from(&config), &mut stream)
            .await
            .map_err(|e|e.context("startup"))?;

        #[cfg(feature = "log")]
        log::debug!("connected to {}:{}, backend pid {}", config.host, config.port, res.process_id);

        Ok(Self::new(stream, res, CancelToken {
            socket: config.socket_path(),
            host: config.host.clone(),
            port: config.port,
            process_id: res.process_id,
            secret_key: res.secret_key,
        }))
    }

    pub(crate) fn new(stream: PgStream, res: StartupResponse, cancel: CancelToken) -> Self {
        let shared = Shared {
            params: stream.params().clone(),
            notifier: stream.notifier().clone(),
            state: Mutex::new(SessionState { ready: res.ready, broken: false }),
            stream: Arc::new(AsyncMutex::new(stream)),
            cancel,
        };
        Self { shared: Arc::new(shared) }
    }

    /// Acquire the exclusive stream lease.
    ///
    /// Waits for the previous command, then drains any abandoned response
    /// until the backend is ready for query.
    pub async fn lease(&self) -> Result<StreamLease> {
        let mut stream = self.shared.stream.clone().lock_owned().await;

        match std::future::poll_fn(|cx|stream.poll_ready(cx)).await {
            Ok(ready) => {
                if let Some(ready) = ready {
                    self.shared.set_ready(ready);
                }
            },
            Err(err) => {
                self.shared.set_broken();
                return Err(err.context("lease"));
            },
        }

        Ok(StreamLease { stream: Some(stream), shared: self.shared.clone() })
    }

    /// Subscribe to notification, notice and parameter status.
    ///
    /// Notification is only received while the session is reading, e.g.
    /// during a command.
    pub fn subscribe(&self) -> broadcast::Receiver<AsyncMessage> {
        self.shared.notifier.subscribe()
    }

    /// Returns the current value of run-time parameter reported by the server.
    pub fn param(&self, name: &str) -> Option<ByteStr> {
        self.shared.params.lock().ok()?.get(name).cloned()
    }

    /// Transaction state of the last finished command.
    pub fn ready_state(&self) -> ReadyState {
        self.shared.state().ready
    }

    /// Returns `true` if the socket can no longer be used.
    pub fn is_broken(&self) -> bool {
        self.shared.state().broken
    }

    /// Returns the token to cancel in flight command.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Gracefully close the session.
    ///
    /// Waits for the current command, then sends `Terminate`.
    pub async fn terminate(&self) -> Result<()> {
        let mut stream = self.shared.stream.lock().await;
        self.shared.set_broken();
        stream.terminate().await?;
        Ok(())
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poison) => *poison.into_inner(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut SessionState)) {
        match self.state.lock() {
            Ok(mut state) => f(&mut *state),
            Err(poison) => f(&mut *poison.into_inner()),
        }
    }

    fn set_ready(&self, ready: ReadyState) {
        self.update(|e|e.ready = ready);
    }

    fn set_broken(&self) {
        self.update(|e|e.broken = true);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Connection")
            .field("process_id", &self.shared.cancel.process_id)
            .field("ready", &state.ready)
            .field("broken", &state.broken)
            .finish()
    }
}

/// Exclusive right to use the [`Connection`] stream.
///
/// Dropping the lease without [`release`][Lease::release] is the same as
/// releasing with unknown state.
pub struct StreamLease {
    stream: Option<OwnedMutexGuard<PgStream>>,
    shared: Arc<Shared>,
}

impl StreamLease {
    fn give_back(&mut self, ready: Option<ReadyState>) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        match ready {
            Some(ready) => self.shared.set_ready(ready),
            None if stream.is_broken() => self.shared.set_broken(),
            None => {
                #[cfg(feature = "log")]
                log::debug!("stream released without ready state, resync");
                stream.resync();
            },
        }
    }
}

impl Lease for StreamLease {
    type Transport = PgStream;

    fn transport(&mut self) -> &mut Self::Transport {
        self.stream.as_mut().expect("stream is only taken on release")
    }

    fn release(mut self, ready: Option<ReadyState>) {
        self.give_back(ready);
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.give_back(None);
    }
}

impl fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease").field("released", &self.stream.is_none()).finish()
    }
}

/// A token to cancel in flight command of a session.
///
/// Cancellation is sent over a new socket, and is best effort: the server
/// may have finished the command already.
#[derive(Clone)]
pub struct CancelToken {
    socket: Option<String>,
    host: ByteStr,
    port: u16,
    process_id: u32,
    secret_key: u32,
}

impl CancelToken {
    /// The backend process id of the session.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Send `CancelRequest`.
    pub async fn cancel(&self) -> Result<()> {
        let mut socket = match &self.socket {
            Some(path) => Socket::connect_socket(path).await?,
            None => Socket::connect_tcp(&self.host, self.port).await?,
        };

        let mut buf = BytesMut::with_capacity(16);
        CancelRequest { process_id: self.process_id, secret_key: self.secret_key }.write(&mut buf);
        socket.write_all(&buf).await?;
        socket.flush().await?;

        // server close the socket without response
        let _ = socket.read(&mut [0u8; 1]).await?;

        #[cfg(feature = "log")]
        log::debug!("cancel request sent for backend pid {}", self.process_id);

        Ok(())
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use bytes::{Buf, Bytes};
    use tokio::{io::DuplexStream, net::TcpListener};

    use super::*;
    use crate::{
        ErrorKind, Executor,
        postgres::{
            BackendMessage, ColumnDescription, DatabaseError, PgFormat,
            backend::{
                Authentication, BackendKeyData, BindComplete, CloseComplete, CommandComplete, DataRow,
                ErrorResponse, NotificationResponse, ParameterStatus, ParseComplete, ReadyForQuery,
                RowDescription,
            },
        },
    };

    /// Scripted backend, each response is written after the client sends `Sync` or `Query`.
    pub(crate) struct Backend {
        io: DuplexStream,
        buf: BytesMut,
    }

    impl Backend {
        /// Read frontend messages until `Sync` or `Query`, returns the message types.
        pub(crate) async fn read_until_sync(&mut self) -> Vec<u8> {
            let mut types = vec![];
            loop {
                while self.buf.len() >= 5 {
                    let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
                    if self.buf.len() < len + 1 {
                        break;
                    }
                    let msgtype = self.buf[0];
                    self.buf.advance(len + 1);
                    types.push(msgtype);
                    if matches!(msgtype, b'S' | b'Q') {
                        return types;
                    }
                }
                if self.io.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return types;
                }
            }
        }

        pub(crate) async fn reply(&mut self, messages: impl IntoIterator<Item = BackendMessage>) {
            let mut buf = BytesMut::new();
            for message in messages {
                message.write(&mut buf);
            }
            self.io.write_all(&buf).await.unwrap();
        }
    }

    pub(crate) fn session() -> (Connection, Backend) {
        let (client, server) = tokio::io::duplex(4096);
        let stream = PgStream::new(Socket::from_stream(client));
        let res = StartupResponse { process_id: 1, secret_key: 2, ready: ReadyState::Idle };
        let cancel = CancelToken { socket: None, host: "localhost".into(), port: 5432, process_id: 1, secret_key: 2 };
        (Connection::new(stream, res, cancel), Backend { io: server, buf: BytesMut::new() })
    }

    fn field(name: &'static str) -> ColumnDescription {
        ColumnDescription {
            name: name.into(),
            table_oid: None,
            attnum: None,
            type_oid: 25,
            type_len: -1,
            type_modifier: -1,
            format: PgFormat::Text,
        }
    }

    pub(crate) fn select(value: &'static str, ready: ReadyState) -> Vec<BackendMessage> {
        vec![
            ParseComplete.into(),
            BindComplete.into(),
            RowDescription { fields: vec![field("v")] }.into(),
            DataRow { values: vec![Some(Bytes::from_static(value.as_bytes()))] }.into(),
            CommandComplete { tag: "SELECT 1".into() }.into(),
            CloseComplete.into(),
            ReadyForQuery { state: ready }.into(),
        ]
    }

    #[tokio::test]
    async fn query_roundtrip() {
        let (conn, mut backend) = session();

        let server = tokio::spawn(async move {
            assert_eq!(backend.read_until_sync().await, b"PBDECS");
            backend.reply(select("foo", ReadyState::InTransaction)).await;
            backend
        });

        let row = conn.query("SELECT $1").bind("foo").fetch_one().await.unwrap().unwrap();
        assert_eq!(row.try_get_str(0).unwrap(), "foo");
        assert_eq!(conn.ready_state(), ReadyState::InTransaction);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn commands_serialized_in_order() {
        let (conn, mut backend) = session();

        let server = tokio::spawn(async move {
            for value in ["a", "b", "c"] {
                assert_eq!(backend.read_until_sync().await, b"PBDECS");
                backend.reply(select(value, ReadyState::Idle)).await;
            }
            backend
        });

        let mut handles = vec![];
        for _ in 0..3 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                let row = conn.query("SELECT 1").fetch_one().await.unwrap().unwrap();
                row.try_get_str(0).unwrap().to_owned()
            }));
        }

        let mut values = vec![];
        for h in handles {
            values.push(h.await.unwrap());
        }
        values.sort();
        assert_eq!(values, ["a", "b", "c"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_command_drained() {
        let (conn, mut backend) = session();

        let server = tokio::spawn(async move {
            assert_eq!(backend.read_until_sync().await, b"PBDECS");
            backend.reply(select("first", ReadyState::Idle)).await;
            assert_eq!(backend.read_until_sync().await, b"PBDECS");
            backend.reply(select("second", ReadyState::Idle)).await;
            backend
        });

        let mut cmd = conn.query("SELECT 'first'");
        assert!(cmd.start().await.unwrap());
        drop(cmd);

        let row = conn.query("SELECT 'second'").fetch_one().await.unwrap().unwrap();
        assert_eq!(row.try_get_str(0).unwrap(), "second");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn database_error_keeps_session() {
        let (conn, mut backend) = session();

        let server = tokio::spawn(async move {
            backend.read_until_sync().await;
            backend.reply([
                ErrorResponse { error: DatabaseError::new("ERROR", "42P01", "relation does not exist") }.into(),
                ReadyForQuery { state: ReadyState::Idle }.into(),
            ]).await;
            backend.read_until_sync().await;
            backend.reply(select("ok", ReadyState::Idle)).await;
            backend
        });

        let err = conn.query("SELECT * FROM nope").fetch_all().await.unwrap_err();
        assert_eq!(err.as_database().unwrap().code(), "42P01");
        assert!(!conn.is_broken());

        let row = conn.query("SELECT 'ok'").fetch_one().await.unwrap().unwrap();
        assert_eq!(row.try_get_str(0).unwrap(), "ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn early_ready_resyncs_before_next_command() {
        let (conn, mut backend) = session();

        let server = tokio::spawn(async move {
            assert_eq!(backend.read_until_sync().await, b"PBDECS");
            backend.reply([
                ParseComplete.into(),
                ReadyForQuery { state: ReadyState::Idle }.into(),
                // stale, must not leak into the next command
                BindComplete.into(),
            ]).await;
            assert_eq!(backend.read_until_sync().await, b"S");
            backend.reply([ReadyForQuery { state: ReadyState::Idle }.into()]).await;
            assert_eq!(backend.read_until_sync().await, b"PBDECS");
            backend.reply(select("ok", ReadyState::Idle)).await;
            backend
        });

        let err = conn.query("SELECT 1").fetch_all().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Unexpected(_)), "{err:?}");
        assert!(!conn.is_broken());

        let row = conn.query("SELECT 'ok'").fetch_one().await.unwrap().unwrap();
        assert_eq!(row.try_get_str(0).unwrap(), "ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn batch_and_async_messages() {
        let (conn, mut backend) = session();
        let mut sub = conn.subscribe();

        let server = tokio::spawn(async move {
            assert_eq!(backend.read_until_sync().await, b"Q");
            backend.reply([
                CommandComplete { tag: "LISTEN".into() }.into(),
                NotificationResponse { process_id: 7, channel: "jobs".into(), payload: "42".into() }.into(),
                ParameterStatus { name: "application_name".into(), value: "batch".into() }.into(),
                ReadyForQuery { state: ReadyState::Idle }.into(),
            ]).await;
            backend
        });

        conn.execute_batch("LISTEN jobs; SET application_name = 'batch'").await.unwrap();
        assert_eq!(conn.param("application_name").as_deref(), Some("batch"));
        assert!(matches!(sub.recv().await.unwrap(), AsyncMessage::Notification { process_id: 7, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_socket_breaks_session() {
        let (conn, backend) = session();
        drop(backend);

        let err = conn.query("SELECT 1").fetch_all().await.unwrap_err();
        assert!(err.is_fatal());

        let err = conn.lease().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Closed(_)));
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn connect_and_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            // startup
            let (mut socket, _) = listener.accept().await.unwrap();
            let len = socket.read_u32().await.unwrap() as usize;
            let mut startup = vec![0u8; len - 4];
            socket.read_exact(&mut startup).await.unwrap();
            assert!(startup.windows(6).any(|e| e == b"alice\0"));

            let mut buf = BytesMut::new();
            BackendMessage::from(Authentication::Ok).write(&mut buf);
            BackendMessage::from(ParameterStatus { name: "server_version".into(), value: "17.0".into() }).write(&mut buf);
            BackendMessage::from(BackendKeyData { process_id: 77, secret_key: 88 }).write(&mut buf);
            BackendMessage::from(ReadyForQuery { state: ReadyState::Idle }).write(&mut buf);
            socket.write_all(&buf).await.unwrap();

            // cancel
            let (mut cancel, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 16];
            cancel.read_exact(&mut request).await.unwrap();
            drop(cancel);
            (socket, request)
        });

        let config = Config::new("alice").set_host("127.0.0.1").set_port(port);
        let conn = Connection::connect_with(config).await.unwrap();
        assert_eq!(conn.param("server_version").as_deref(), Some("17.0"));
        assert_eq!(conn.cancel_token().process_id(), 77);

        conn.cancel_token().cancel().await.unwrap();
        let (_socket, request) = server.await.unwrap();
        let mut request = &request[..];
        assert_eq!(request.get_u32(), 16);
        assert_eq!(request.get_u32(), 80877102);
        assert_eq!(request.get_u32(), 77);
        assert_eq!(request.get_u32(), 88);
    }
}

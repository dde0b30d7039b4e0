//! Buffered postgres stream.
use bytes::BytesMut;
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    task::{Context, Poll, ready},
};
use tokio::{io::AsyncWriteExt, sync::broadcast};

use crate::{
    Result,
    common::{ByteStr, verbose},
    connection::Config,
    io::{poll_read, poll_write_all},
    net::{Socket, TlsConnect, negotiate_ssl},
    postgres::{
        BackendMessage, DatabaseError, EncodeError, FrontendMessage, PacketDecoder, ReadyState,
        frontend::{Sync, Terminate},
    },
    transport::{ConnectionClosed, PgTransport},
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Capacity of asynchronous message channel, lagging subscriber miss the oldest messages.
const NOTIFY_CAPACITY: usize = 64;

/// Server message received outside of a command response.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncMessage {
    /// `NOTIFY` from a listened channel.
    Notification {
        process_id: u32,
        channel: ByteStr,
        payload: ByteStr,
    },
    /// Warning or informational message.
    Notice(DatabaseError),
    /// Run-time parameter changed.
    ParameterStatus {
        name: ByteStr,
        value: ByteStr,
    },
}

pub(crate) type Params = Arc<Mutex<HashMap<ByteStr, ByteStr>>>;

/// Buffered connection to postgres.
///
/// Counts the `ReadyForQuery` expected from the backend, so the stream can be
/// drained back to a known state after a command is abandoned.
#[derive(Debug)]
pub struct PgStream {
    socket: Socket,
    decoder: PacketDecoder,
    write_buf: BytesMut,
    /// `Sync` or `Query` buffered but not flushed.
    queued_syncs: usize,
    /// `ReadyForQuery` not yet received.
    sync_pending: usize,
    /// Part of `write_buf` already written to the socket.
    flush_started: bool,
    broken: bool,
    last_ready: Option<ReadyState>,
    notifier: broadcast::Sender<AsyncMessage>,
    params: Params,
}

impl PgStream {
    pub fn new(socket: Socket) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            socket,
            decoder: PacketDecoder::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            queued_syncs: 0,
            sync_pending: 0,
            flush_started: false,
            broken: false,
            last_ready: None,
            notifier,
            params: Params::default(),
        }
    }

    /// Open socket as configured, including SSL negotiation.
    pub async fn connect(config: &Config, tls: Option<&dyn TlsConnect>) -> Result<Self> {
        let socket = match config.socket_path() {
            Some(path) => Socket::connect_socket(&path).await?,
            None => {
                let socket = Socket::connect_tcp(&config.host, config.port).await?;
                negotiate_ssl(socket, config.ssl, tls, &config.host).await?
            },
        };
        Ok(Self::new(socket))
    }

    /// Subscribe to asynchronous messages.
    pub fn subscribe(&self) -> broadcast::Receiver<AsyncMessage> {
        self.notifier.subscribe()
    }

    pub(crate) fn notifier(&self) -> &broadcast::Sender<AsyncMessage> {
        &self.notifier
    }

    /// Shared run-time parameters reported by the server.
    pub(crate) fn params(&self) -> &Params {
        &self.params
    }

    /// Returns `true` if the stream framing can no longer be trusted.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// The last `ReadyForQuery` state received.
    pub fn last_ready(&self) -> Option<ReadyState> {
        self.last_ready
    }

    /// Discard unsent messages and request a drain.
    ///
    /// Messages partially written to the socket are kept, the backend
    /// must receive the whole frame.
    pub fn resync(&mut self) {
        if !self.flush_started {
            self.write_buf.clear();
            self.queued_syncs = 0;
        }
        self.ready_request();
    }

    /// Poll until every requested `ReadyForQuery` is received.
    ///
    /// Returns the last ready state.
    pub fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<Option<ReadyState>>> {
        loop {
            if self.broken {
                return Poll::Ready(Err(ConnectionClosed.into()));
            }
            if self.sync_pending == 0 && self.queued_syncs == 0 {
                return Poll::Ready(Ok(self.last_ready));
            }
            let _message = ready!(self.poll_message(cx)?);
            verbose!(msgtype = ?char::from(_message.msgtype()), "drained");
        }
    }

    /// Send `Terminate` and shutdown the socket.
    pub async fn terminate(&mut self) -> io::Result<()> {
        if !self.broken {
            self.write_buf.clear();
            self.queued_syncs = 0;
            // `Terminate` never fail to encode
            let _ = FrontendMessage::from(Terminate).write(&mut self.write_buf);
            self.socket.write_all_buf(&mut self.write_buf).await?;
        }
        self.broken = true;
        self.socket.shutdown().await
    }

    fn publish(&mut self, message: AsyncMessage) {
        // no subscriber is fine
        let _ = self.notifier.send(message);
    }
}

impl PgTransport for PgStream {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        if self.write_buf.is_empty() {
            self.sync_pending += std::mem::take(&mut self.queued_syncs);
            return Poll::Ready(Ok(()));
        }

        let len = self.write_buf.len();
        match poll_write_all(&mut self.socket, &mut self.write_buf, cx) {
            Poll::Ready(Ok(())) => {
                self.flush_started = false;
                self.sync_pending += std::mem::take(&mut self.queued_syncs);
                Poll::Ready(Ok(()))
            },
            Poll::Ready(Err(err)) => {
                self.broken = true;
                Poll::Ready(Err(err))
            },
            Poll::Pending => {
                self.flush_started |= self.write_buf.len() != len;
                Poll::Pending
            },
        }
    }

    fn poll_message(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        loop {
            if self.broken {
                return Poll::Ready(Err(ConnectionClosed.into()));
            }

            if !self.write_buf.is_empty() || self.queued_syncs != 0 {
                ready!(self.poll_flush(cx)?);
            }

            let message = match self.decoder.decode() {
                Ok(Some(message)) => message,
                Ok(None) => {
                    let buf = self.decoder.buffer_mut();
                    if buf.capacity() == buf.len() {
                        buf.reserve(DEFAULT_BUF_CAPACITY);
                    }
                    let read = ready!(poll_read(&mut self.socket, buf, cx));
                    match read {
                        Ok(0) => {
                            self.broken = true;
                            return Poll::Ready(Err(ConnectionClosed.into()));
                        },
                        Ok(_) => continue,
                        Err(err) => {
                            self.broken = true;
                            return Poll::Ready(Err(err.into()));
                        },
                    }
                },
                Err(err) => {
                    self.broken = true;
                    return Poll::Ready(Err(err.into()));
                },
            };

            verbose!(msgtype = ?char::from(message.msgtype()), "recv");

            match message {
                BackendMessage::NotificationResponse(n) => {
                    self.publish(AsyncMessage::Notification {
                        process_id: n.process_id,
                        channel: n.channel,
                        payload: n.payload,
                    });
                },
                BackendMessage::NoticeResponse(n) => {
                    #[cfg(feature = "log")]
                    log::info!("{}: {}", n.notice.severity(), n.notice.message());
                    self.publish(AsyncMessage::Notice(n.notice));
                },
                BackendMessage::ParameterStatus(p) => {
                    if let Ok(mut params) = self.params.lock() {
                        params.insert(p.name.clone(), p.value.clone());
                    }
                    self.publish(AsyncMessage::ParameterStatus { name: p.name, value: p.value });
                },
                BackendMessage::ReadyForQuery(r) => {
                    self.sync_pending = self.sync_pending.saturating_sub(1);
                    self.last_ready = Some(r.state);
                    return Poll::Ready(Ok(BackendMessage::ReadyForQuery(r)));
                },
                message => return Poll::Ready(Ok(message)),
            }
        }
    }

    fn ready_request(&mut self) {
        if self.sync_pending == 0 && self.queued_syncs == 0 {
            // `Sync` never fail to encode
            let _ = self.send(Sync.into());
        }
    }

    fn send(&mut self, message: FrontendMessage<'_>) -> Result<(), EncodeError> {
        verbose!(msgtype = ?message.msgtype().map(char::from), "send");
        message.write(&mut self.write_buf)?;
        if matches!(message, FrontendMessage::Sync(_) | FrontendMessage::Query(_)) {
            self.queued_syncs += 1;
        }
        Ok(())
    }
}

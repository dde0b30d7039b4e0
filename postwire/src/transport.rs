//! The [`PgTransport`] and [`Lease`] traits.
use std::{
    fmt, io,
    task::{Context, Poll, ready},
};

use crate::{
    Result,
    postgres::{BackendMessage, BackendProtocol, EncodeError, FrontendMessage, ReadyState, UnexpectedMessage},
};

/// A buffered stream which can send and receive postgres message.
pub trait PgTransport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Calling `poll_message` will also try to [`poll_flush`][1] if there is buffered message.
    ///
    /// Implementor should handle asynchronous messages, `NoticeResponse`, `NotificationResponse`
    /// and `ParameterStatus`, and should not return it.
    ///
    /// End of stream is returned as [`ConnectionClosed`] error.
    ///
    /// [1]: PgTransport::poll_flush
    fn poll_message(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>>;

    /// Poll to receive a message of type `B`.
    ///
    /// `ErrorResponse` is returned as [`Err`], and other message type
    /// returns [`UnexpectedMessage`] error.
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        let message = ready!(self.poll_message(cx)?);
        Poll::Ready(expect(message))
    }

    /// Request implementor to ignore all backend messages until `ReadyForQuery` is received.
    fn ready_request(&mut self);

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send(&mut self, message: FrontendMessage<'_>) -> Result<(), EncodeError>;
}

/// Convert received message to the expected type.
pub fn expect<B: BackendProtocol>(message: BackendMessage) -> Result<B> {
    match B::from_message(message) {
        Ok(ok) => Ok(ok),
        Err(BackendMessage::ErrorResponse(err)) => Err(err.error.into()),
        Err(message) => Err(UnexpectedMessage::new(message.msgtype(), B::EXPECTED).into()),
    }
}

impl<P> PgTransport for &mut P where P: PgTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_message(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        P::poll_message(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn ready_request(&mut self) {
        P::ready_request(self);
    }

    fn send(&mut self, message: FrontendMessage<'_>) -> Result<(), EncodeError> {
        P::send(self, message)
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx|self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        std::future::poll_fn(|cx|self.poll_recv(cx))
    }

    /// Receive any backend message.
    fn message(&mut self) -> impl Future<Output = Result<BackendMessage>> {
        std::future::poll_fn(|cx|self.poll_message(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport { }

/// An exclusive right to use a [`PgTransport`] for one command.
///
/// A lease is given back by [`release`][Lease::release], which consume the lease,
/// so it can only be released once.
pub trait Lease: Send + Unpin + 'static {
    type Transport: PgTransport + Send;

    /// Returns the leased transport.
    fn transport(&mut self) -> &mut Self::Transport;

    /// Give back the transport.
    ///
    /// `Some` with the last received `ReadyForQuery` state when the command
    /// completed normally, or `None` when the transport state is unknown,
    /// in which case the owner must resynchronize before the next lease.
    fn release(self, ready: Option<ReadyState>);
}

/// Error when the connection is closed or the stream reached its end.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionClosed;

impl std::error::Error for ConnectionClosed { }

impl fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection closed")
    }
}

impl fmt::Debug for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

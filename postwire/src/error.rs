//! `postwire` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    connection::ParseError,
    phase::AuthError,
    pool::PoolError,
    postgres::{DatabaseError, EncodeError, ProtocolError, UnexpectedMessage},
    row::RowError,
    transport::ConnectionClosed,
};

/// A specialized [`Result`] type for `postwire` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `postwire` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Prefix the error message with `context`.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        if self.context.is_empty() {
            self.context = context;
        } else {
            self.context = format!("{context}: {}", self.context);
        }
        self
    }

    /// Returns `true` if the error is reported by the database server.
    ///
    /// Database error only affect the current command, the connection is still usable.
    pub fn is_database(&self) -> bool {
        matches!(self.kind, ErrorKind::Database(_))
    }

    /// Returns the database error, if any.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(db) => Some(db),
            _ => None,
        }
    }

    /// Returns `true` if the connection can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol(_) | ErrorKind::Io(_) | ErrorKind::Closed(_))
    }
}

/// All possible error kind from `postwire` library.
pub enum ErrorKind {
    Config(ParseError),
    Protocol(ProtocolError),
    Encode(EncodeError),
    Unexpected(UnexpectedMessage),
    Io(io::Error),
    Database(DatabaseError),
    Auth(AuthError),
    Pool(PoolError),
    Row(RowError),
    Closed(ConnectionClosed),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<UnexpectedMessage>e => ErrorKind::Unexpected(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<AuthError>e => ErrorKind::Auth(e));
from!(<PoolError>e => ErrorKind::Pool(e));
from!(<RowError>e => ErrorKind::Row(e));
from!(<ConnectionClosed>e => ErrorKind::Closed(e));

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
            Self::Unexpected(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Pool(e) => e.fmt(f),
            Self::Row(e) => e.fmt(f),
            Self::Closed(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

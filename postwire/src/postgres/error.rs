//! Protocol error
use std::{fmt, str::Utf8Error};

use super::BackendMessage;

/// An error when translating buffer from postgres.
///
/// Protocol error means the framing can no longer be trusted.
pub enum ProtocolError {
    /// Message type that is not a known backend message.
    UnknownMessage {
        msgtype: u8,
    },
    /// Authentication request code that is not defined by the protocol.
    UnknownAuth {
        auth: u32,
    },
    /// Format code other than `0` or `1`.
    UnknownFormat {
        format: u16,
    },
    /// Transaction status indicator other than `I`, `T` or `E`.
    UnknownReadyState {
        state: u8,
    },
    /// Response to SSLRequest other than `S` or `N`.
    UnrecognizedSslResponse {
        found: u8,
    },
    /// Message decoded as a type with different message type.
    Mismatch {
        expect: u8,
        found: u8,
    },
    /// Message length declared less than the length field itself.
    InvalidLength {
        msgtype: u8,
        len: i32,
    },
    /// Value length in a row less than `-1`.
    InvalidValueLength {
        len: i32,
    },
    /// Message body ended before all fields are read.
    Truncated,
    /// String field is not valid utf8.
    Utf8(Utf8Error),
}

impl ProtocolError {
    pub(crate) fn unknown(msgtype: u8) -> ProtocolError {
        Self::UnknownMessage { msgtype }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Mismatch { expect, found }
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMessage { msgtype } => {
                write!(f, "unknown backend message type: {}", char::from(*msgtype).escape_default())
            },
            Self::UnknownAuth { auth } => write!(f, "unknown authentication code: {auth}"),
            Self::UnknownFormat { format } => write!(f, "unknown format code: {format}"),
            Self::UnknownReadyState { state } => {
                write!(f, "unknown transaction status: {}", char::from(*state).escape_default())
            },
            Self::UnrecognizedSslResponse { found } => {
                write!(f, "unknown SSLRequest response: {}", char::from(*found).escape_default())
            },
            Self::Mismatch { expect, found } => write!(
                f,
                "expected message `{}` found `{}`",
                BackendMessage::message_name(*expect),
                BackendMessage::message_name(*found),
            ),
            Self::InvalidLength { msgtype, len } => write!(
                f,
                "invalid message length {len} for `{}`",
                BackendMessage::message_name(*msgtype),
            ),
            Self::InvalidValueLength { len } => write!(f, "invalid value length: {len}"),
            Self::Truncated => f.write_str("message body truncated"),
            Self::Utf8(e) => write!(f, "invalid utf8 in message: {e}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// An error when writing frontend message.
///
/// This is always a caller error, the message cannot be represented in the protocol.
#[derive(PartialEq, Eq)]
pub enum EncodeError {
    /// `Describe` or `Close` target other than `S` or `P`.
    UnrecognizedKind {
        message: &'static str,
        kind: u8,
    },
    /// String field contains nul byte.
    NulInString {
        message: &'static str,
    },
    /// Length or count does not fit in its field.
    TooLarge {
        message: &'static str,
    },
}

impl std::error::Error for EncodeError { }

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrecognizedKind { message, kind } => write!(
                f,
                "unrecognized message kind `{}` for `{message}`",
                char::from(*kind).escape_default(),
            ),
            Self::NulInString { message } => write!(f, "string contains nul byte in `{message}`"),
            Self::TooLarge { message } => write!(f, "`{message}` too large for protocol"),
        }
    }
}

impl fmt::Debug for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A well formed backend message that arrive out of order.
#[derive(Clone, PartialEq, Eq)]
pub struct UnexpectedMessage {
    found: u8,
    expected: &'static [u8],
}

impl UnexpectedMessage {
    pub(crate) fn new(found: u8, expected: &'static [u8]) -> Self {
        Self { found, expected }
    }

    /// Message type received.
    pub fn found(&self) -> u8 {
        self.found
    }

    /// Message types allowed at that point.
    pub fn expected(&self) -> &'static [u8] {
        self.expected
    }
}

impl std::error::Error for UnexpectedMessage { }

impl fmt::Display for UnexpectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected backend packet: {}. expected: ", char::from(self.found))?;
        for (i, msgtype) in self.expected.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", char::from(*msgtype))?;
        }
        Ok(())
    }
}

impl fmt::Debug for UnexpectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

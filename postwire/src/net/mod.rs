//! Socket and SSL negotiation.
use bytes::BytesMut;
use std::{fmt, io, pin::Pin, str::FromStr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    Result,
    postgres::{ProtocolError, frontend::SslRequest},
};

mod socket;

pub use socket::{AsyncStream, Socket};

/// Future returned by [`TlsConnect::connect`].
pub type TlsFuture = Pin<Box<dyn Future<Output = io::Result<Socket>> + Send>>;

/// A hook to upgrade the socket into TLS stream.
///
/// Called after the server accept `SSLRequest`, the returned socket
/// is typically created by [`Socket::from_stream`].
pub trait TlsConnect: Send + Sync + 'static {
    fn connect(&self, host: &str, socket: Socket) -> TlsFuture;
}

/// Whether to request an SSL connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    /// Never send `SSLRequest`.
    #[default]
    Disable,
    /// Request SSL if [`TlsConnect`] is provided, continue in cleartext if server refuse.
    Prefer,
    /// Request SSL, fail if server refuse or no [`TlsConnect`] provided.
    Require,
}

impl FromStr for SslMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" | "allow" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" | "verify-ca" | "verify-full" => Ok(Self::Require),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
        })
    }
}

/// Perform SSL negotiation when required by `mode`.
///
/// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-SSL>
pub async fn negotiate_ssl(
    mut socket: Socket,
    mode: SslMode,
    tls: Option<&dyn TlsConnect>,
    host: &str,
) -> Result<Socket> {
    let tls = match (mode, tls) {
        (SslMode::Disable, _) | (SslMode::Prefer, None) => return Ok(socket),
        (SslMode::Require, None) => {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "sslmode=require without TLS connector").into());
        },
        (_, Some(tls)) => tls,
    };

    let mut buf = BytesMut::with_capacity(8);
    SslRequest.write(&mut buf);
    socket.write_all(&buf).await?;
    socket.flush().await?;

    match socket.read_u8().await? {
        b'S' => {
            #[cfg(feature = "log")]
            log::debug!("server accept SSL, upgrading");
            Ok(tls.connect(host, socket).await?)
        },
        b'N' if mode == SslMode::Require => {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "server does not support SSL").into())
        },
        b'N' => {
            #[cfg(feature = "log")]
            log::debug!("server refuse SSL, continue in cleartext");
            Ok(socket)
        },
        found => Err(ProtocolError::UnrecognizedSslResponse { found }.into()),
    }
}

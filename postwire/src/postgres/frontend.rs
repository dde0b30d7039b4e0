//! Postgres Frontend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, Bytes, BytesMut};

use super::{EncodeError, Oid, PgFormat};
use crate::ext::{BufMutExt, UsizeExt};

/// Write a frontend message to `buf`.
///
/// On error, nothing is written to `buf`.
pub fn write<F: FrontendProtocol>(msg: &F, buf: &mut BytesMut) -> Result<(), EncodeError> {
    framed(buf, Some(F::MSGTYPE), F::NAME, |buf| msg.encode(buf))
}

/// Write optional message type, reserve the length slot, write the body, then backpatch the length.
fn framed(
    buf: &mut BytesMut,
    msgtype: Option<u8>,
    message: &'static str,
    body: impl FnOnce(&mut BytesMut) -> Result<(), EncodeError>,
) -> Result<(), EncodeError> {
    let offset = buf.len();

    if let Some(msgtype) = msgtype {
        buf.put_u8(msgtype);
    }

    let len_offset = buf.len();
    buf.put_u32(0);

    let len = body(buf).and_then(|_| {
        (buf.len() - len_offset).to_i32().ok_or(EncodeError::TooLarge { message })
    });

    match len {
        Ok(len) => {
            buf[len_offset..len_offset + 4].copy_from_slice(&len.to_be_bytes());
            Ok(())
        },
        Err(err) => {
            buf.truncate(offset);
            Err(err)
        },
    }
}

/// postgres String must be nul terminated, thus cannot contains nul
fn put_cstr(buf: &mut BytesMut, string: &str, message: &'static str) -> Result<(), EncodeError> {
    if string.as_bytes().contains(&b'\0') {
        return Err(EncodeError::NulInString { message });
    }
    buf.put_nul_string(string);
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize, message: &'static str) -> Result<(), EncodeError> {
    buf.put_u16(len.to_u16().ok_or(EncodeError::TooLarge { message })?);
    Ok(())
}

/// A type which can be encoded into postgres frontend message
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Message name, used in error message.
    const NAME: &'static str;

    /// Write the main body of the message.
    ///
    /// The message type and length is written by [`write`].
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the [`Startup`] message)
/// has no initial message-type byte, thus [`Startup`] does not implement [`FrontendProtocol`].
///
/// To write startup message, use [`Startup::write`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Other run-time parameters, applied at backend start time and act as session defaults.
    pub params: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    /// The protocol version number.
    ///
    /// The most significant 16 bits are the major version number (3 for the protocol described here).
    /// The least significant 16 bits are the minor version number (0 for the protocol described here).
    pub const PROTOCOL_VERSION: u32 = 196_608;

    pub fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        const NAME: &str = "Startup";

        framed(buf, None, NAME, |buf| {
            buf.put_u32(Self::PROTOCOL_VERSION);

            // The protocol version number is followed by one or more pairs of parameter name and value strings.

            put_cstr(buf, "user", NAME)?;
            put_cstr(buf, self.user, NAME)?;

            if let Some(db) = self.database {
                put_cstr(buf, "database", NAME)?;
                put_cstr(buf, db, NAME)?;
            }

            for (name, value) in self.params {
                put_cstr(buf, name, NAME)?;
                put_cstr(buf, value, NAME)?;
            }

            // A zero byte is required as a terminator after the last name/value pair.
            buf.put_u8(b'\0');
            Ok(())
        })
    }
}

/// Request the connection to be encrypted with SSL.
///
/// The server responds with a single byte, `S` or `N`.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    /// The SSL request code.
    ///
    /// The value is chosen to contain 1234 in the most significant 16 bits,
    /// and 5679 in the least significant 16 bits.
    pub const CODE: u32 = 80_877_103;

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(8);
        buf.put_u32(Self::CODE);
    }
}

/// Request to cancel the query in progress of another backend, sent over a new connection.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: u32,
    /// The secret key for the target backend.
    pub secret_key: u32,
}

impl CancelRequest {
    /// The cancel request code.
    ///
    /// The value is chosen to contain 1234 in the most significant 16 bits,
    /// and 5678 in the least significant 16 bits.
    pub const CODE: u32 = 80_877_102;

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(16);
        buf.put_u32(Self::CODE);
        buf.put_u32(self.process_id);
        buf.put_u32(self.secret_key);
    }
}

/// Identifies the message as a password response.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    const NAME: &'static str = "PasswordMessage";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_cstr(buf, self.password, Self::NAME)
    }
}

/// Identifies the message as an initial SASL response.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    /// Name of the SASL authentication mechanism that the client selected.
    pub mechanism: &'a str,
    /// SASL mechanism specific "Initial Response".
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    const NAME: &'static str = "SASLInitialResponse";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_cstr(buf, self.mechanism, Self::NAME)?;
        let len = self.data.len().to_i32().ok_or(EncodeError::TooLarge { message: Self::NAME })?;
        buf.put_i32(len);
        buf.put_slice(self.data);
        Ok(())
    }
}

/// Identifies the message as a SASL response.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    /// SASL mechanism specific message data.
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    const NAME: &'static str = "SASLResponse";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_slice(self.data);
        Ok(())
    }
}

/// Identifies the message as a simple query
#[derive(Debug)]
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    const NAME: &'static str = "Query";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_cstr(buf, self.sql, Self::NAME)
    }
}

/// Identifies the message as a Parse command
#[derive(Debug)]
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the query string,
    /// only the number that the frontend wants to prespecify types for.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    pub oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    const NAME: &'static str = "Parse";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_cstr(buf, self.prepare_name, Self::NAME)?;
        put_cstr(buf, self.sql, Self::NAME)?;
        put_len(buf, self.oids.len(), Self::NAME)?;
        for oid in self.oids {
            buf.put_u32(*oid);
        }
        Ok(())
    }
}

/// Identifies the message as a Bind command.
#[derive(Debug)]
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,
    /// The parameter [`PgFormat`].
    ///
    /// This can be empty to indicate that there are no parameters or that the parameters
    /// all use the default format (text); or one, in which case the specified format code
    /// is applied to all parameters; or it can equal the actual number of parameters.
    pub param_formats: &'a [PgFormat],
    /// The parameter values, `None` is a NULL parameter.
    ///
    /// This must match the number of parameters needed by the query.
    pub params: &'a [Option<Bytes>],
    /// The result-columns [`PgFormat`], with the same rule as `param_formats`.
    pub result_formats: &'a [PgFormat],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    const NAME: &'static str = "Bind";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_cstr(buf, self.portal_name, Self::NAME)?;
        put_cstr(buf, self.stmt_name, Self::NAME)?;

        put_len(buf, self.param_formats.len(), Self::NAME)?;
        for format in self.param_formats {
            buf.put_u16(format.format_code());
        }

        put_len(buf, self.params.len(), Self::NAME)?;
        for param in self.params {
            match param {
                Some(value) => {
                    let len = value.len().to_i32().ok_or(EncodeError::TooLarge { message: Self::NAME })?;
                    buf.put_i32(len);
                    buf.put_slice(value);
                },
                // -1 for NULL, no value bytes follow
                None => buf.put_i32(-1),
            }
        }

        put_len(buf, self.result_formats.len(), Self::NAME)?;
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
        Ok(())
    }
}

/// Identifies the message as a Execute command
#[derive(Debug)]
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_row: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    const NAME: &'static str = "Execute";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_cstr(buf, self.portal_name, Self::NAME)?;
        buf.put_u32(self.max_row);
        Ok(())
    }
}

/// Identifies the message as a Close command
#[derive(Debug)]
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    const NAME: &'static str = "Close";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if !matches!(self.variant, b'S' | b'P') {
            return Err(EncodeError::UnrecognizedKind { message: Self::NAME, kind: self.variant });
        }
        buf.put_u8(self.variant);
        put_cstr(buf, self.name, Self::NAME)
    }
}

/// Identifies the message as a Describe command.
#[derive(Debug)]
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    const NAME: &'static str = "Describe";

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if !matches!(self.kind, b'S' | b'P') {
            return Err(EncodeError::UnrecognizedKind { message: Self::NAME, kind: self.kind });
        }
        buf.put_u8(self.kind);
        put_cstr(buf, self.name, Self::NAME)
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;

            const NAME: &'static str = stringify!($name);

            fn encode(&self, _: &mut BytesMut) -> Result<(), EncodeError> {
                Ok(())
            }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Sync command
    struct Sync, b'S';

    /// Identifies the message as a Flush command
    struct Flush, b'H';

    /// Identifies the message as a termination.
    struct Terminate, b'X';
}

/// All frontend messages.
#[derive(Debug)]
pub enum FrontendMessage<'a> {
    Startup(Startup<'a>),
    SslRequest(SslRequest),
    CancelRequest(CancelRequest),
    PasswordMessage(PasswordMessage<'a>),
    SaslInitialResponse(SaslInitialResponse<'a>),
    SaslResponse(SaslResponse<'a>),
    Query(Query<'a>),
    Parse(Parse<'a>),
    Bind(Bind<'a>),
    Execute(Execute<'a>),
    Close(Close<'a>),
    Describe(Describe<'a>),
    Sync(Sync),
    Flush(Flush),
    Terminate(Terminate),
}

impl FrontendMessage<'_> {
    /// Returns the message type, untagged message returns `None`.
    pub fn msgtype(&self) -> Option<u8> {
        match self {
            Self::Startup(_) | Self::SslRequest(_) | Self::CancelRequest(_) => None,
            Self::PasswordMessage(_) => Some(PasswordMessage::MSGTYPE),
            Self::SaslInitialResponse(_) => Some(SaslInitialResponse::MSGTYPE),
            Self::SaslResponse(_) => Some(SaslResponse::MSGTYPE),
            Self::Query(_) => Some(Query::MSGTYPE),
            Self::Parse(_) => Some(Parse::MSGTYPE),
            Self::Bind(_) => Some(Bind::MSGTYPE),
            Self::Execute(_) => Some(Execute::MSGTYPE),
            Self::Close(_) => Some(Close::MSGTYPE),
            Self::Describe(_) => Some(Describe::MSGTYPE),
            Self::Sync(_) => Some(Sync::MSGTYPE),
            Self::Flush(_) => Some(Flush::MSGTYPE),
            Self::Terminate(_) => Some(Terminate::MSGTYPE),
        }
    }

    /// Write message to `buf`.
    ///
    /// On error, nothing is written to `buf`.
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Self::Startup(msg) => msg.write(buf),
            Self::SslRequest(msg) => {
                msg.write(buf);
                Ok(())
            },
            Self::CancelRequest(msg) => {
                msg.write(buf);
                Ok(())
            },
            Self::PasswordMessage(msg) => write(msg, buf),
            Self::SaslInitialResponse(msg) => write(msg, buf),
            Self::SaslResponse(msg) => write(msg, buf),
            Self::Query(msg) => write(msg, buf),
            Self::Parse(msg) => write(msg, buf),
            Self::Bind(msg) => write(msg, buf),
            Self::Execute(msg) => write(msg, buf),
            Self::Close(msg) => write(msg, buf),
            Self::Describe(msg) => write(msg, buf),
            Self::Sync(msg) => write(msg, buf),
            Self::Flush(msg) => write(msg, buf),
            Self::Terminate(msg) => write(msg, buf),
        }
    }
}

macro_rules! from_message {
    ($($name:ident,)* $(<'a> $borrowed:ident,)*) => {
        $(
            impl From<$name> for FrontendMessage<'_> {
                fn from(value: $name) -> Self {
                    Self::$name(value)
                }
            }
        )*
        $(
            impl<'a> From<$borrowed<'a>> for FrontendMessage<'a> {
                fn from(value: $borrowed<'a>) -> Self {
                    Self::$borrowed(value)
                }
            }
        )*
    };
}

from_message! {
    SslRequest,
    CancelRequest,
    Sync,
    Flush,
    Terminate,
    <'a> Startup,
    <'a> PasswordMessage,
    <'a> SaslInitialResponse,
    <'a> SaslResponse,
    <'a> Query,
    <'a> Parse,
    <'a> Bind,
    <'a> Execute,
    <'a> Close,
    <'a> Describe,
}

#[cfg(test)]
mod test {
    use bytes::{Bytes, BytesMut};

    use super::*;

    #[test]
    fn startup_layout() {
        let mut buf = BytesMut::new();
        Startup { user: "bob", database: Some("app"), params: &[] }.write(&mut buf).unwrap();

        let mut expected = vec![];
        expected.extend_from_slice(&[0, 0, 0, 31]);
        expected.extend_from_slice(&196_608u32.to_be_bytes());
        expected.extend_from_slice(b"user\0bob\0database\0app\0\0");
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn ssl_request_layout() {
        let mut buf = BytesMut::new();
        SslRequest.write(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 8, 4, 210, 22, 47]);
    }

    #[test]
    fn cancel_request_layout() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 7, secret_key: 9 }.write(&mut buf);
        assert_eq!(&buf[..4], &[0, 0, 0, 16]);
        assert_eq!(&buf[4..8], &80_877_102u32.to_be_bytes());
        assert_eq!(&buf[8..], &[0, 0, 0, 7, 0, 0, 0, 9]);
    }

    #[test]
    fn bind_null_and_empty() {
        let mut buf = BytesMut::new();
        let params = [None, Some(Bytes::new()), Some(Bytes::from_static(b"42"))];
        write(&Bind {
            portal_name: "",
            stmt_name: "",
            param_formats: &[],
            params: &params,
            result_formats: &[],
        }, &mut buf).unwrap();

        let mut expected = vec![b'B'];
        let body: &[u8] = &[
            0, 0, // portal, stmt
            0, 0, // param formats
            0, 3, // params
            0xff, 0xff, 0xff, 0xff, // NULL
            0, 0, 0, 0, // empty
            0, 0, 0, 2, b'4', b'2',
            0, 0, // result formats
        ];
        expected.extend_from_slice(&(4 + body.len() as u32).to_be_bytes());
        expected.extend_from_slice(body);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn unit_message() {
        let mut buf = BytesMut::new();
        write(&Sync, &mut buf).unwrap();
        write(&Terminate, &mut buf).unwrap();
        assert_eq!(&buf[..], b"S\0\0\0\x04X\0\0\0\x04");
    }

    #[test]
    fn unrecognized_kind() {
        let mut buf = BytesMut::from(&b"keep"[..]);
        let err = write(&Describe { kind: b'X', name: "" }, &mut buf).unwrap_err();
        assert_eq!(err, EncodeError::UnrecognizedKind { message: "Describe", kind: b'X' });
        let err = write(&Close { variant: b'Q', name: "" }, &mut buf).unwrap_err();
        assert_eq!(err, EncodeError::UnrecognizedKind { message: "Close", kind: b'Q' });
        // failed message leave no partial bytes
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn nul_in_sql() {
        let mut buf = BytesMut::new();
        let err = write(&Query { sql: "SELECT\0" }, &mut buf).unwrap_err();
        assert_eq!(err, EncodeError::NulInString { message: "Query" });
        assert!(buf.is_empty());
    }

    #[test]
    fn sasl_initial_response_layout() {
        let mut buf = BytesMut::new();
        FrontendMessage::from(SaslInitialResponse { mechanism: "SCRAM-SHA-256", data: b"n,,n=*,r=abc" })
            .write(&mut buf)
            .unwrap();
        assert_eq!(buf[0], b'p');
        assert_eq!(&buf[5..19], b"SCRAM-SHA-256\0");
        assert_eq!(&buf[19..23], &12i32.to_be_bytes());
        assert_eq!(&buf[23..], b"n,,n=*,r=abc");
    }
}

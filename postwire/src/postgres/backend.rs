//! Postgres Backend Messages
use bytes::{BufMut, Bytes, BytesMut};

use super::{DatabaseError, Oid, PgFormat, ProtocolError};
use crate::{
    common::ByteStr,
    ext::{BufMutExt, BytesExt},
};

/// A type that can be decoded into postgres backend message
pub trait BackendProtocol: Sized {
    /// Message types this type can be built from.
    const EXPECTED: &'static [u8];

    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;

    /// Extract this type from already decoded message.
    ///
    /// Returns the message back if the type does not match.
    fn from_message(message: BackendMessage) -> Result<Self, BackendMessage>;
}

/// Postgres backend messages
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    DataRow(DataRow),
    ErrorResponse(ErrorResponse),
    EmptyQueryResponse(EmptyQueryResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }

            /// Write backend message to `buf`.
            ///
            /// Client never send backend message, this is for testing and proxying.
            ///
            /// # Panics
            ///
            /// Panics if a field, column or value count does not fit the wire format.
            pub fn write(&self, buf: &mut BytesMut) {
                let offset = buf.len();
                buf.put_u8(self.msgtype());
                buf.put_u32(0);
                match self {
                    $(Self::$name(msg) => msg.encode(buf),)*
                }
                let len = (buf.len() - offset - 1) as u32;
                buf[offset + 1..offset + 5].copy_from_slice(&len.to_be_bytes());
            }
        }

        impl BackendProtocol for BackendMessage {
            const EXPECTED: &'static [u8] = &[$($name::MSGTYPE,)*];

            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }

            fn from_message(message: BackendMessage) -> Result<Self, BackendMessage> {
                Ok(message)
            }
        }

        $(
            impl From<$name> for BackendMessage {
                fn from(value: $name) -> Self {
                    Self::$name(value)
                }
            }
        )*
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    DataRow,
    ErrorResponse,
    EmptyQueryResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

/// Implement [`BackendProtocol`] given the message type, `decode` function and `encode` function.
macro_rules! backend {
    ($name:ident, $ty:literal) => {
        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            const EXPECTED: &'static [u8] = &[$ty];

            fn decode(msgtype: u8, body: Bytes) -> Result<Self,ProtocolError> {
                if Self::MSGTYPE != msgtype {
                    return Err(ProtocolError::unexpected(Self::MSGTYPE, msgtype))
                }
                Self::decode_body(body)
            }

            fn from_message(message: BackendMessage) -> Result<Self, BackendMessage> {
                match message {
                    BackendMessage::$name(ok) => Ok(ok),
                    message => Err(message),
                }
            }
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug, Clone, PartialEq)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8;4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue {
        data: Bytes,
    },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    SASL {
        /// SASL authentication mechanisms, in the server's order of preference.
        mechanisms: Vec<ByteStr>,
    },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue {
        /// SASL data, specific to the SASL mechanism being used.
        data: Bytes,
    },
    /// Specifies that SASL authentication has completed.
    SASLFinal {
        /// SASL outcome "additional data", specific to the SASL mechanism being used.
        data: Bytes,
    },
}

backend!(Authentication, b'R');

impl Authentication {
    /// Returns the authentication request code.
    pub fn code(&self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::KerberosV5 => 2,
            Self::CleartextPassword => 3,
            Self::MD5Password { .. } => 5,
            Self::GSS => 7,
            Self::GSSContinue { .. } => 8,
            Self::SSPI => 9,
            Self::SASL { .. } => 10,
            Self::SASLContinue { .. } => 11,
            Self::SASLFinal { .. } => 12,
        }
    }

    /// Returns the authentication method name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::KerberosV5 => "KerberosV5",
            Self::CleartextPassword => "CleartextPassword",
            Self::MD5Password { .. } => "MD5Password",
            Self::GSS => "GSS",
            Self::GSSContinue { .. } => "GSSContinue",
            Self::SSPI => "SSPI",
            Self::SASL { .. } => "SASL",
            Self::SASLContinue { .. } => "SASLContinue",
            Self::SASLFinal { .. } => "SASLFinal",
        }
    }

    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        let auth = match body.try_u32()? {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => Authentication::MD5Password { salt: body.try_u32()?.to_be_bytes(), },
            7 => Authentication::GSS,
            8 => Authentication::GSSContinue { data: body },
            9 => Authentication::SSPI,
            10 => {
                let mut mechanisms = vec![];
                loop {
                    let name = body.get_nul_bytestr()?;
                    if name.is_empty() {
                        break;
                    }
                    mechanisms.push(name);
                }
                Authentication::SASL { mechanisms }
            },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::UnknownAuth { auth }),
        };
        Ok(auth)
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.code());
        match self {
            Self::MD5Password { salt } => buf.put_slice(salt),
            Self::GSSContinue { data } | Self::SASLContinue { data } | Self::SASLFinal { data } => {
                buf.put_slice(data)
            },
            Self::SASL { mechanisms } => {
                for name in mechanisms {
                    buf.put_nul_string(name);
                }
                buf.put_u8(b'\0');
            },
            _ => { },
        }
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue CancelRequest messages later.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

backend!(BackendKeyData, b'K');

impl BackendKeyData {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        Ok(Self {
            process_id: body.try_u32()?,
            secret_key: body.try_u32()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.process_id);
        buf.put_u32(self.secret_key);
    }
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: ByteStr,
    /// The current value of the parameter
    pub value: ByteStr,
}

backend!(ParameterStatus, b'S');

impl ParameterStatus {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        Ok(Self {
            name: body.get_nul_bytestr()?,
            value: body.get_nul_bytestr()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_string(&self.name);
        buf.put_nul_string(&self.value);
    }
}

/// A warning message. The frontend should display the message.
#[derive(Debug, Clone, PartialEq)]
pub struct NoticeResponse {
    pub notice: DatabaseError,
}

backend!(NoticeResponse, b'N');

impl NoticeResponse {
    fn decode_body(body: Bytes) -> Result<Self,ProtocolError> {
        Ok(Self { notice: DatabaseError::decode(body)? })
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.notice.encode(buf);
    }
}

/// Identifies the message as an error
///
/// The message body consists of one or more identified fields, followed by a zero byte as a terminator.
/// Fields can appear in any order.
///
/// See [`DatabaseError`] for the available fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub error: DatabaseError,
}

backend!(ErrorResponse, b'E');

impl ErrorResponse {
    fn decode_body(body: Bytes) -> Result<Self,ProtocolError> {
        Ok(Self { error: DatabaseError::decode(body)? })
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.error.encode(buf);
    }
}

/// Identifies the message as a notification response.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: u32,
    /// The name of the channel that the notify has been raised on.
    pub channel: ByteStr,
    /// The “payload” string passed from the notifying process.
    pub payload: ByteStr,
}

backend!(NotificationResponse, b'A');

impl NotificationResponse {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        Ok(Self {
            process_id: body.try_u32()?,
            channel: body.get_nul_bytestr()?,
            payload: body.get_nul_bytestr()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.process_id);
        buf.put_nul_string(&self.channel);
        buf.put_nul_string(&self.payload);
    }
}

/// A single field of [`RowDescription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table, the object ID of the table.
    pub table_oid: Option<Oid>,
    /// If the field can be identified as a column of a specific table, the attribute number of the column.
    pub attnum: Option<i16>,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size (see `pg_type.typlen`). Note that negative values denote variable-width types.
    pub type_len: i16,
    /// The type modifier (see `pg_attribute.atttypmod`). The meaning of the modifier is type-specific.
    pub type_modifier: i32,
    /// The format code being used for the field.
    pub format: PgFormat,
}

/// Identifies the message as a row description
#[derive(Debug, Clone, PartialEq)]
pub struct RowDescription {
    pub fields: Vec<ColumnDescription>,
}

backend!(RowDescription, b'T');

impl RowDescription {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        let len = body.try_u16()?;
        let mut fields = Vec::with_capacity(len.into());
        for _ in 0..len {
            fields.push(ColumnDescription {
                name: body.get_nul_bytestr()?,
                // zero when the field is not a table column
                table_oid: Some(body.try_u32()?).filter(|e| *e != 0),
                attnum: Some(body.try_i16()?).filter(|e| *e != 0),
                type_oid: body.try_u32()?,
                type_len: body.try_i16()?,
                type_modifier: body.try_i32()?,
                format: PgFormat::from_code(body.try_u16()?)?,
            });
        }
        Ok(Self { fields })
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_count(buf, self.fields.len());
        for field in &self.fields {
            buf.put_nul_string(&field.name);
            buf.put_u32(field.table_oid.unwrap_or(0));
            buf.put_i16(field.attnum.unwrap_or(0));
            buf.put_u32(field.type_oid);
            buf.put_i16(field.type_len);
            buf.put_i32(field.type_modifier);
            buf.put_u16(field.format.format_code());
        }
    }
}

/// Identifies the message as a data row.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    /// Column values, `None` is a NULL value.
    ///
    /// Note that NULL is distinct from empty value.
    pub values: Vec<Option<Bytes>>,
}

backend!(DataRow, b'D');

impl DataRow {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        let len = body.try_u16()?;
        let mut values = Vec::with_capacity(len.into());
        for _ in 0..len {
            let value = match body.try_i32()? {
                -1 => None,
                len @ 0.. => Some(body.try_split_to(len as usize)?),
                len => return Err(ProtocolError::InvalidValueLength { len }),
            };
            values.push(value);
        }
        Ok(Self { values })
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_count(buf, self.values.len());
        for value in &self.values {
            match value {
                Some(value) => {
                    buf.put_i32(i32::try_from(value.len()).expect("value length fits in i32"));
                    buf.put_slice(value);
                },
                None => buf.put_i32(-1),
            }
        }
    }
}

/// Identifies the message as a command-completed response
///
/// For an INSERT command, the tag is INSERT oid rows, where rows is the number of rows inserted.
/// oid used to be the object ID of the inserted row if rows was 1 and the target table had OIDs,
/// but OIDs system columns are not supported anymore; therefore oid is always 0.
///
/// For a DELETE, UPDATE, MERGE, SELECT, MOVE, FETCH or COPY command, the tag is
/// the command name followed by the number of rows affected.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which SQL command was completed.
    pub tag: ByteStr,
}

backend!(CommandComplete, b'C');

impl CommandComplete {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        Ok(Self { tag: body.get_nul_bytestr()? })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_string(&self.tag);
    }

    /// Number of rows affected parsed from the command tag.
    ///
    /// Returns `0` for commands that does not report row count.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.tag.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major protocol version requested by the client.
    pub minor: u32,
    /// Protocol options not recognized by the server.
    pub options: Vec<ByteStr>,
}

backend!(NegotiateProtocolVersion, b'v');

impl NegotiateProtocolVersion {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        let minor = body.try_u32()?;
        let len = body.try_u32()?;
        let mut options = vec![];
        for _ in 0..len {
            options.push(body.get_nul_bytestr()?);
        }
        Ok(Self { minor, options })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.minor);
        buf.put_u32(self.options.len() as u32);
        for option in &self.options {
            buf.put_nul_string(option);
        }
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type.
    pub oids: Vec<Oid>,
}

backend!(ParameterDescription, b't');

impl ParameterDescription {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        let len = body.try_u16()?;
        let mut oids = Vec::with_capacity(len.into());
        for _ in 0..len {
            oids.push(body.try_u32()?);
        }
        Ok(Self { oids })
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_count(buf, self.oids.len());
        for oid in &self.oids {
            buf.put_u32(*oid);
        }
    }
}

/// Current backend transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Not in a transaction block, `I`.
    Idle,
    /// In a transaction block, `T`.
    InTransaction,
    /// In a failed transaction block, queries will be rejected until block is ended, `E`.
    Error,
}

impl ReadyState {
    pub fn from_code(state: u8) -> Result<ReadyState, ProtocolError> {
        match state {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::InTransaction),
            b'E' => Ok(Self::Error),
            state => Err(ProtocolError::UnknownReadyState { state }),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Idle => b'I',
            Self::InTransaction => b'T',
            Self::Error => b'E',
        }
    }
}

/// Identifies the message type. ReadyForQuery is sent whenever the backend is ready for a new query cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator.
    pub state: ReadyState,
}

backend!(ReadyForQuery, b'Z');

impl ReadyForQuery {
    fn decode_body(mut body: Bytes) -> Result<Self,ProtocolError> {
        Ok(Self { state: ReadyState::from_code(body.try_u8()?)? })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.state.code());
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name;

        backend!($name, $ty);

        impl $name {
            fn decode_body(_: Bytes) -> Result<Self,ProtocolError> {
                Ok(Self)
            }

            fn encode(&self, _: &mut BytesMut) { }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

/// Write `u16` element count.
fn put_count(buf: &mut BytesMut, len: usize) {
    buf.put_u16(u16::try_from(len).expect("element count fits in u16"));
}

#[cfg(test)]
mod test {
    use bytes::{Buf, Bytes, BytesMut};

    use super::*;

    fn round_trip(message: BackendMessage) {
        let mut buf = BytesMut::new();
        message.write(&mut buf);

        let msgtype = buf.get_u8();
        let len = buf.get_u32() as usize;
        assert_eq!(len, buf.len() + 4);

        let decoded = BackendMessage::decode(msgtype, buf.freeze()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn backend_round_trip() {
        let field = ColumnDescription {
            name: "id".into(),
            table_oid: Some(16384),
            attnum: Some(1),
            type_oid: 23,
            type_len: 4,
            type_modifier: -1,
            format: PgFormat::Text,
        };
        let computed = ColumnDescription {
            name: "?column?".into(),
            table_oid: None,
            attnum: None,
            format: PgFormat::Binary,
            ..field.clone()
        };

        let messages: Vec<BackendMessage> = vec![
            Authentication::Ok.into(),
            Authentication::MD5Password { salt: [1, 2, 3, 4] }.into(),
            Authentication::SASL { mechanisms: vec!["SCRAM-SHA-256".into(), "SCRAM-SHA-256-PLUS".into()] }.into(),
            Authentication::SASLContinue { data: Bytes::from_static(b"r=abc,s=c2FsdA==,i=4096") }.into(),
            BackendKeyData { process_id: 42, secret_key: 0xdead_beef }.into(),
            ParameterStatus { name: "TimeZone".into(), value: "UTC".into() }.into(),
            ErrorResponse { error: DatabaseError::new("ERROR", "42601", "syntax error").with_hint("hint") }.into(),
            NoticeResponse { notice: DatabaseError::new("NOTICE", "00000", "notice") }.into(),
            NotificationResponse { process_id: 9, channel: "jobs".into(), payload: "".into() }.into(),
            RowDescription { fields: vec![field, computed] }.into(),
            DataRow { values: vec![None, Some(Bytes::new()), Some(Bytes::from_static(b"420"))] }.into(),
            CommandComplete { tag: "INSERT 0 3".into() }.into(),
            NegotiateProtocolVersion { minor: 0, options: vec!["_pq_.foo".into()] }.into(),
            ParameterDescription { oids: vec![23, 25] }.into(),
            ReadyForQuery { state: ReadyState::InTransaction }.into(),
            ParseComplete.into(),
            BindComplete.into(),
            CloseComplete.into(),
            NoData.into(),
            EmptyQueryResponse.into(),
            PortalSuspended.into(),
        ];

        for message in messages {
            round_trip(message);
        }
    }

    #[test]
    fn row_description_zero_is_null() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(b"sum\0");
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&20u32.to_be_bytes());
        body.extend_from_slice(&8i16.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());

        let rd = RowDescription::decode(b'T', body.freeze()).unwrap();
        assert_eq!(rd.fields[0].table_oid, None);
        assert_eq!(rd.fields[0].attnum, None);
        assert_eq!(rd.fields[0].type_oid, 20);
    }

    #[test]
    fn unknown_codes() {
        let err = Authentication::decode(b'R', Bytes::from_static(&[0, 0, 0, 4])).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAuth { auth: 4 }));

        let err = ReadyForQuery::decode(b'Z', Bytes::from_static(b"X")).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownReadyState { state: b'X' }));

        let err = BackendMessage::decode(b'@', Bytes::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage { msgtype: b'@' }));

        let mut body = BytesMut::new();
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(b"a\0");
        body.extend_from_slice(&[0; 18]);
        body.extend_from_slice(&2u16.to_be_bytes());
        let err = RowDescription::decode(b'T', body.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownFormat { format: 2 }));
    }

    #[test]
    fn data_row_lengths() {
        let err = DataRow::decode(b'D', Bytes::from_static(&[0, 1, 0xff, 0xff, 0xff, 0xfe])).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidValueLength { len: -2 }));

        let err = DataRow::decode(b'D', Bytes::from_static(&[0, 1, 0, 0, 0, 5, b'a'])).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }

    #[test]
    fn typed_decode_mismatch() {
        let err = ParseComplete::decode(b'2', Bytes::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Mismatch { expect: b'1', found: b'2' }));

        let message = BackendMessage::from(BindComplete);
        assert!(ParseComplete::from_message(message.clone()).is_err());
        assert_eq!(BindComplete::from_message(message).unwrap(), BindComplete);
    }

    #[test]
    fn rows_affected() {
        let tag = |tag: &'static str| CommandComplete { tag: tag.into() }.rows_affected();
        assert_eq!(tag("INSERT 0 5"), 5);
        assert_eq!(tag("SELECT 12"), 12);
        assert_eq!(tag("UPDATE 3"), 3);
        assert_eq!(tag("CREATE TABLE"), 0);
        assert_eq!(tag("BEGIN"), 0);
    }

    #[test]
    #[should_panic = "element count fits in u16"]
    fn write_rejects_oversized_row() {
        let row = DataRow { values: vec![None; u16::MAX as usize + 1] };
        BackendMessage::from(row).write(&mut BytesMut::new());
    }
}

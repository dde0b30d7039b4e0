//! Server reported error and notice fields.
//!
//! <https://www.postgresql.org/docs/current/protocol-error-fields.html>
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use super::ProtocolError;
use crate::{
    common::ByteStr,
    ext::{BufMutExt, BytesExt},
};

/// Fields of `ErrorResponse` or `NoticeResponse` message.
///
/// Since more field types might be added in future, unrecognized fields are ignored.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DatabaseError {
    severity: ByteStr,
    severity_nonlocalized: Option<ByteStr>,
    code: ByteStr,
    message: ByteStr,
    detail: Option<ByteStr>,
    hint: Option<ByteStr>,
    position: Option<ByteStr>,
    internal_position: Option<ByteStr>,
    internal_query: Option<ByteStr>,
    where_: Option<ByteStr>,
    schema: Option<ByteStr>,
    table: Option<ByteStr>,
    column: Option<ByteStr>,
    data_type: Option<ByteStr>,
    constraint: Option<ByteStr>,
    file: Option<ByteStr>,
    line: Option<ByteStr>,
    routine: Option<ByteStr>,
}

macro_rules! fields {
    ($($code:literal => $field:ident,)*) => {
        impl DatabaseError {
            pub(crate) fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
                let mut me = Self::default();
                loop {
                    let code = body.try_u8()?;
                    if code == b'\0' {
                        break;
                    }
                    let value = body.get_nul_bytestr()?;
                    match code {
                        b'S' => me.severity = value,
                        b'C' => me.code = value,
                        b'M' => me.message = value,
                        $($code => me.$field = Some(value),)*
                        _ => { }
                    }
                }
                Ok(me)
            }

            pub(crate) fn encode(&self, buf: &mut BytesMut) {
                for (code, value) in [(b'S', &self.severity), (b'C', &self.code), (b'M', &self.message)] {
                    buf.put_u8(code);
                    buf.put_nul_string(value);
                }
                $(
                    if let Some(value) = &self.$field {
                        buf.put_u8($code);
                        buf.put_nul_string(value);
                    }
                )*
                buf.put_u8(b'\0');
            }
        }
    };
}

fields! {
    b'V' => severity_nonlocalized,
    b'D' => detail,
    b'H' => hint,
    b'P' => position,
    b'p' => internal_position,
    b'q' => internal_query,
    b'W' => where_,
    b's' => schema,
    b't' => table,
    b'c' => column,
    b'd' => data_type,
    b'n' => constraint,
    b'F' => file,
    b'L' => line,
    b'R' => routine,
}

impl DatabaseError {
    /// Create error with the three always present fields.
    pub fn new(
        severity: impl Into<ByteStr>,
        code: impl Into<ByteStr>,
        message: impl Into<ByteStr>,
    ) -> Self {
        Self {
            severity: severity.into(),
            code: code.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Set the `detail` field.
    pub fn with_detail(mut self, detail: impl Into<ByteStr>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the `hint` field.
    pub fn with_hint(mut self, hint: impl Into<ByteStr>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// `ERROR`, `FATAL`, or `PANIC` (in an error message), or `WARNING`, `NOTICE`, `DEBUG`,
    /// `INFO`, or `LOG` (in a notice message), or a localized translation of one of these.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// Same as [`severity`][DatabaseError::severity] except that the contents are never localized.
    pub fn severity_nonlocalized(&self) -> Option<&str> {
        self.severity_nonlocalized.as_deref()
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// An optional secondary error message carrying more detail about the problem.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// An optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Error cursor position as an index into the original query string, counted in characters.
    pub fn position(&self) -> Option<&str> {
        self.position.as_deref()
    }

    /// Cursor position into an internally generated command.
    pub fn internal_position(&self) -> Option<&str> {
        self.internal_position.as_deref()
    }

    /// The text of a failed internally-generated command.
    pub fn internal_query(&self) -> Option<&str> {
        self.internal_query.as_deref()
    }

    /// Context in which the error occurred.
    pub fn where_(&self) -> Option<&str> {
        self.where_.as_deref()
    }

    /// Name of the schema containing the object associated with the error.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Name of the table associated with the error.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Name of the table column associated with the error.
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// Name of the data type associated with the error.
    pub fn data_type(&self) -> Option<&str> {
        self.data_type.as_deref()
    }

    /// Name of the constraint associated with the error.
    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    /// The file name of the source-code location where the error was reported.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// The line number of the source-code location where the error was reported.
    pub fn line(&self) -> Option<&str> {
        self.line.as_deref()
    }

    /// The name of the source-code routine reporting the error.
    pub fn routine(&self) -> Option<&str> {
        self.routine.as_deref()
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, "\ndetail: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nhint: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

//! Postgres row operation.
//!
//! - [`Row`]
//! - [`Index`]
//! - [`RowError`]
use bytes::Bytes;
use std::{borrow::Cow, fmt, str::FromStr, str::Utf8Error, sync::Arc};

use crate::{
    ext::FmtExt,
    postgres::ColumnDescription,
};

/// Postgres row.
///
/// Values are kept as raw bytes in the format described by its column,
/// which is text unless requested otherwise.
#[derive(Clone)]
pub struct Row {
    fields: Arc<[ColumnDescription]>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    /// Pair a `DataRow` values with its `RowDescription` fields.
    ///
    /// Column count must match, returns [`RowError::ColumnMismatch`] otherwise.
    pub(crate) fn new(fields: Arc<[ColumnDescription]>, values: Vec<Option<Bytes>>) -> Result<Self, RowError> {
        if fields.len() != values.len() {
            return Err(RowError::ColumnMismatch { expected: fields.len(), found: values.len() });
        }
        Ok(Self { fields, values })
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of fields/column.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns the column descriptions.
    pub fn columns(&self) -> &[ColumnDescription] {
        &self.fields
    }

    /// Try get raw column value, `None` is a NULL value.
    pub fn try_get_raw<I: Index>(&self, idx: I) -> Result<Option<&Bytes>, RowError> {
        let nth = idx.position(&self.fields)?;
        Ok(self.values[nth].as_ref())
    }

    /// Try get column value as utf8 string.
    ///
    /// Returns [`RowError::Null`] if value is NULL.
    pub fn try_get_str<I: Index>(&self, idx: I) -> Result<&str, RowError> {
        let value = self.try_get_raw(idx)?.ok_or(RowError::Null)?;
        Ok(std::str::from_utf8(value)?)
    }

    /// Try parse text column value with its [`FromStr`] implementation.
    pub fn try_parse<I: Index, T>(&self, idx: I) -> Result<T, RowError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.try_get_str(idx)?
            .parse()
            .map_err(|e: T::Err| RowError::Parse(e.to_string().into()))
    }

    /// Consume self into the raw values.
    pub fn into_values(self) -> Vec<Option<Bytes>> {
        self.values
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (field, value) in self.fields.iter().zip(&self.values) {
            dbg.key(&field.name);
            match value {
                Some(value) => dbg.value(&value.lossy()),
                None => dbg.value(&format_args!("NULL")),
            };
        }
        dbg.finish()
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the nth column.
    fn position(self, fields: &[ColumnDescription]) -> Result<usize, RowError>;
}

impl Index for usize {
    fn position(self, fields: &[ColumnDescription]) -> Result<usize, RowError> {
        match self < fields.len() {
            true => Ok(self),
            false => Err(RowError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, fields: &[ColumnDescription]) -> Result<usize, RowError> {
        fields
            .iter()
            .position(|e| e.name == self)
            .ok_or_else(|| RowError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

/// An error when reading row value.
pub enum RowError {
    /// `DataRow` column count differ from `RowDescription` field count.
    ColumnMismatch {
        expected: usize,
        found: usize,
    },
    /// Column requested not found.
    ColumnNotFound(Cow<'static,str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Row is null.
    Null,
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Text value failed to parse.
    Parse(Cow<'static,str>),
}

impl From<Utf8Error> for RowError {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl std::error::Error for RowError { }

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColumnMismatch { expected, found } => {
                write!(f, "row description has {expected} columns but data row has {found}")
            },
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::Null => write!(f, "unexpected NULL value"),
            Self::Utf8(e) => write!(f, "{e}"),
            Self::Parse(e) => write!(f, "failed to parse value, {e}"),
        }
    }
}

impl fmt::Debug for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

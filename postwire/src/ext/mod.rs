use bytes::{Buf, BufMut, Bytes};
use std::fmt;

use crate::{common::ByteStr, postgres::ProtocolError};

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// length is usize in rust, while sometime postgres want i32,
    /// returns `None` instead of wrapping
    fn to_i32(self) -> Option<i32>;
    /// length is usize in rust, while sometime postgres want u16,
    /// returns `None` instead of wrapping
    fn to_u16(self) -> Option<u16>;
}

impl UsizeExt for usize {
    fn to_i32(self) -> Option<i32> {
        self.try_into().ok()
    }

    fn to_u16(self) -> Option<u16> {
        self.try_into().ok()
    }
}

pub trait BufMutExt {
    /// postgres String must be nul terminated
    fn put_nul_string(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

/// Bounds checked read of backend message body.
///
/// Unlike [`Buf`] methods, reading past the end returns [`ProtocolError::Truncated`] instead of panic.
pub trait BytesExt {
    fn get_nul_bytes(&mut self) -> Result<Bytes, ProtocolError>;

    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError>;

    fn try_u8(&mut self) -> Result<u8, ProtocolError>;

    fn try_i16(&mut self) -> Result<i16, ProtocolError>;

    fn try_u16(&mut self) -> Result<u16, ProtocolError>;

    fn try_i32(&mut self) -> Result<i32, ProtocolError>;

    fn try_u32(&mut self) -> Result<u32, ProtocolError>;

    fn try_split_to(&mut self, len: usize) -> Result<Bytes, ProtocolError>;
}

macro_rules! try_get {
    ($($name:ident => $get:ident: $ty:ty,)*) => {$(
        fn $name(&mut self) -> Result<$ty, ProtocolError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(ProtocolError::Truncated);
            }
            Ok(self.$get())
        }
    )*};
}

impl BytesExt for Bytes {
    fn get_nul_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let Some(end) = self.iter().position(|e| matches!(e, b'\0')) else {
            return Err(ProtocolError::Truncated);
        };
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        Ok(me)
    }

    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError> {
        ByteStr::from_utf8(self.get_nul_bytes()?).map_err(ProtocolError::Utf8)
    }

    try_get! {
        try_u8 => get_u8: u8,
        try_i16 => get_i16: i16,
        try_u16 => get_u16: u16,
        try_i32 => get_i32: i32,
        try_u32 => get_u32: u32,
    }

    fn try_split_to(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if self.len() < len {
            return Err(ProtocolError::Truncated);
        }
        Ok(self.split_to(len))
    }
}

/// Display bytes as utf8 lossy string.
pub struct LossyFmt<'a>(pub &'a [u8]);

impl fmt::Debug for LossyFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b\"")?;
        for chunk in self.0.utf8_chunks() {
            f.write_str(chunk.valid())?;
            for b in chunk.invalid() {
                write!(f, "\\x{b:02x}")?;
            }
        }
        write!(f, "\"")
    }
}

pub trait FmtExt {
    fn lossy(&self) -> LossyFmt<'_>;
}

impl FmtExt for [u8] {
    fn lossy(&self) -> LossyFmt<'_> {
        LossyFmt(self)
    }
}

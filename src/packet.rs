//! Typed value codec for packet bodies.
//!
//! A packet body is a flat sequence of tagged values:
//!
//! ```text
//! [u8 tag][payload] [u8 tag][payload] ...
//! ```
//!
//! All multi-byte scalars are big-endian. Strings carry a `u16` BE byte count
//! followed by the raw UTF-8 bytes (no terminator).
//!
//! | Type   | Tag    | Payload            |
//! |--------|--------|--------------------|
//! | Bool   | `0x01` | 1 byte             |
//! | Int8   | `0x02` | 1 byte             |
//! | Int16  | `0x04` | 2 bytes            |
//! | Int32  | `0x08` | 4 bytes            |
//! | Int64  | `0x10` | 8 bytes            |
//! | Double | `0x20` | 8 bytes (IEEE-754) |
//! | String | `0x40` | `u16` len + bytes  |
//! | UInt16 | `0x80` | 2 bytes            |
//!
//! [`Packet`] only appends and [`PacketReader`] only consumes, so a single
//! value is never both a writer and a reader. By convention the first value of
//! every body is an `Int16` selector identifying the command or message.

// Rust guideline compliant 2026-02

use std::fmt;

use thiserror::Error;

use crate::framing::MAX_FRAME_SIZE;

/// Wire type tag constants.
pub mod tag {
    /// Boolean (1 byte).
    pub const BOOL: u8 = 0x01;
    /// Signed 8-bit integer.
    pub const INT8: u8 = 0x02;
    /// Signed 16-bit integer.
    pub const INT16: u8 = 0x04;
    /// Signed 32-bit integer.
    pub const INT32: u8 = 0x08;
    /// Signed 64-bit integer.
    pub const INT64: u8 = 0x10;
    /// IEEE-754 double.
    pub const DOUBLE: u8 = 0x20;
    /// Length-prefixed string.
    pub const STRING: u8 = 0x40;
    /// Unsigned 16-bit integer.
    pub const UINT16: u8 = 0x80;
}

/// The complete type system of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// Boolean.
    Bool = tag::BOOL,
    /// Signed 8-bit integer.
    Int8 = tag::INT8,
    /// Signed 16-bit integer.
    Int16 = tag::INT16,
    /// Unsigned 16-bit integer.
    UInt16 = tag::UINT16,
    /// Signed 32-bit integer.
    Int32 = tag::INT32,
    /// Signed 64-bit integer.
    Int64 = tag::INT64,
    /// IEEE-754 double.
    Double = tag::DOUBLE,
    /// UTF-8 string with a 16-bit length prefix.
    String = tag::STRING,
}

impl ValueType {
    /// Map a wire tag back to its type.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            tag::BOOL => Some(Self::Bool),
            tag::INT8 => Some(Self::Int8),
            tag::INT16 => Some(Self::Int16),
            tag::UINT16 => Some(Self::UInt16),
            tag::INT32 => Some(Self::Int32),
            tag::INT64 => Some(Self::Int64),
            tag::DOUBLE => Some(Self::Double),
            tag::STRING => Some(Self::String),
            _ => None,
        }
    }

    /// The wire tag for this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Fixed payload width, or `None` for strings.
    fn scalar_width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 => Some(4),
            Self::Int64 | Self::Double => Some(8),
            Self::String => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Double => "double",
            Self::String => "string",
        };
        f.write_str(name)
    }
}

/// A single decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed 8-bit integer.
    Int8(i8),
    /// Signed 16-bit integer.
    Int16(i16),
    /// Unsigned 16-bit integer.
    UInt16(u16),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// IEEE-754 double.
    Double(f64),
    /// UTF-8 string.
    String(String),
}

impl Value {
    /// Type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Int8(_) => ValueType::Int8,
            Self::Int16(_) => ValueType::Int16,
            Self::UInt16(_) => ValueType::UInt16,
            Self::Int32(_) => ValueType::Int32,
            Self::Int64(_) => ValueType::Int64,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
        }
    }

    /// Exact number of bytes this value occupies on the wire (tag included).
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::String(s) => 1 + 2 + s.len(),
            other => 1 + other.value_type().scalar_width().unwrap_or(0),
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    i64 => Int64,
    f64 => Double,
    String => String,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

/// Errors raised while encoding or decoding a packet body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Appending the value would push the body past the frame limit.
    #[error("packet overflow: {needed} bytes needed, {available} available (max {MAX_FRAME_SIZE})")]
    Overflow {
        /// Bytes the value needs.
        needed: usize,
        /// Bytes left before the limit.
        available: usize,
    },

    /// A string is longer than its 16-bit length prefix can express.
    #[error("string too long: {0} bytes")]
    StringTooLong(usize),

    /// The tag on the wire is not the one the caller asked for.
    #[error("type mismatch: expected {expected}, found tag 0x{found:02x}")]
    TypeMismatch {
        /// Type requested by the reader.
        expected: ValueType,
        /// Tag found in the body.
        found: u8,
    },

    /// The tag byte is not part of the protocol.
    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    /// The payload (scalar width or claimed string length) runs past the body.
    #[error("truncated value: {needed} bytes needed, {remaining} remaining")]
    Truncated {
        /// Bytes the value claims.
        needed: usize,
        /// Bytes left in the body.
        remaining: usize,
    },

    /// String payload is not valid UTF-8.
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
}

/// Write-only packet body builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Create an empty packet.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Create a packet whose first value is the `Int16` selector.
    pub fn with_selector(selector: i16) -> Self {
        let mut packet = Self::new();
        // 3 bytes always fit in an empty body.
        let _ = packet.write_i16(selector);
        packet
    }

    /// Current body length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encoded body bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the packet and return the body bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Clear the body so the packet can be reused for the next frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append any value.
    pub fn write(&mut self, value: &Value) -> Result<&mut Self, PacketError> {
        match value {
            Value::Bool(v) => self.write_bool(*v),
            Value::Int8(v) => self.write_i8(*v),
            Value::Int16(v) => self.write_i16(*v),
            Value::UInt16(v) => self.write_u16(*v),
            Value::Int32(v) => self.write_i32(*v),
            Value::Int64(v) => self.write_i64(*v),
            Value::Double(v) => self.write_f64(*v),
            Value::String(v) => self.write_str(v),
        }
    }

    /// Append a boolean.
    pub fn write_bool(&mut self, v: bool) -> Result<&mut Self, PacketError> {
        self.put(tag::BOOL, &[u8::from(v)])
    }

    /// Append a signed 8-bit integer.
    pub fn write_i8(&mut self, v: i8) -> Result<&mut Self, PacketError> {
        self.put(tag::INT8, &v.to_be_bytes())
    }

    /// Append a signed 16-bit integer.
    pub fn write_i16(&mut self, v: i16) -> Result<&mut Self, PacketError> {
        self.put(tag::INT16, &v.to_be_bytes())
    }

    /// Append an unsigned 16-bit integer.
    pub fn write_u16(&mut self, v: u16) -> Result<&mut Self, PacketError> {
        self.put(tag::UINT16, &v.to_be_bytes())
    }

    /// Append a signed 32-bit integer.
    pub fn write_i32(&mut self, v: i32) -> Result<&mut Self, PacketError> {
        self.put(tag::INT32, &v.to_be_bytes())
    }

    /// Append a signed 64-bit integer.
    pub fn write_i64(&mut self, v: i64) -> Result<&mut Self, PacketError> {
        self.put(tag::INT64, &v.to_be_bytes())
    }

    /// Append a double.
    pub fn write_f64(&mut self, v: f64) -> Result<&mut Self, PacketError> {
        self.put(tag::DOUBLE, &v.to_be_bytes())
    }

    /// Append a string.
    pub fn write_str(&mut self, v: &str) -> Result<&mut Self, PacketError> {
        let len = u16::try_from(v.len()).map_err(|_| PacketError::StringTooLong(v.len()))?;
        self.reserve_checked(1 + 2 + v.len())?;
        self.buf.push(tag::STRING);
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(v.as_bytes());
        Ok(self)
    }

    fn put(&mut self, tag: u8, payload: &[u8]) -> Result<&mut Self, PacketError> {
        self.reserve_checked(1 + payload.len())?;
        self.buf.push(tag);
        self.buf.extend_from_slice(payload);
        Ok(self)
    }

    fn reserve_checked(&self, needed: usize) -> Result<(), PacketError> {
        let available = MAX_FRAME_SIZE - self.buf.len();
        if needed > available {
            return Err(PacketError::Overflow { needed, available });
        }
        Ok(())
    }
}

/// Read-only cursor over a received packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketReader {
    buf: Vec<u8>,
    pos: usize,
}

impl PacketReader {
    /// Wrap a received body.
    pub fn new(body: Vec<u8>) -> Self {
        Self { buf: body, pos: 0 }
    }

    /// Total body length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the cursor sits exactly at the end of the body.
    pub fn is_exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Raw body bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Move the cursor back to the start of the body.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Type of the next value, without consuming it.
    pub fn peek_type(&self) -> Result<ValueType, PacketError> {
        let tag = *self.buf.get(self.pos).ok_or(PacketError::Truncated {
            needed: 1,
            remaining: 0,
        })?;
        ValueType::from_tag(tag).ok_or(PacketError::UnknownTag(tag))
    }

    /// Read the leading `Int16` selector.
    pub fn read_selector(&mut self) -> Result<i16, PacketError> {
        self.read_i16()
    }

    /// Read one value of the expected type.
    ///
    /// On error the cursor is left where it was.
    pub fn read(&mut self, expected: ValueType) -> Result<Value, PacketError> {
        let start = self.pos;
        let result = self.read_inner(expected);
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    /// Decode every remaining value, whatever its type.
    pub fn read_all(&mut self) -> Result<Vec<Value>, PacketError> {
        let mut values = Vec::new();
        while !self.is_exhausted() {
            let ty = self.peek_type()?;
            values.push(self.read(ty)?);
        }
        Ok(values)
    }

    /// Read a boolean.
    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        match self.read(ValueType::Bool)? {
            Value::Bool(v) => Ok(v),
            _ => unreachable!("read(Bool) yields Value::Bool"),
        }
    }

    /// Read a signed 8-bit integer.
    pub fn read_i8(&mut self) -> Result<i8, PacketError> {
        match self.read(ValueType::Int8)? {
            Value::Int8(v) => Ok(v),
            _ => unreachable!("read(Int8) yields Value::Int8"),
        }
    }

    /// Read a signed 16-bit integer.
    pub fn read_i16(&mut self) -> Result<i16, PacketError> {
        match self.read(ValueType::Int16)? {
            Value::Int16(v) => Ok(v),
            _ => unreachable!("read(Int16) yields Value::Int16"),
        }
    }

    /// Read an unsigned 16-bit integer.
    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        match self.read(ValueType::UInt16)? {
            Value::UInt16(v) => Ok(v),
            _ => unreachable!("read(UInt16) yields Value::UInt16"),
        }
    }

    /// Read a signed 32-bit integer.
    pub fn read_i32(&mut self) -> Result<i32, PacketError> {
        match self.read(ValueType::Int32)? {
            Value::Int32(v) => Ok(v),
            _ => unreachable!("read(Int32) yields Value::Int32"),
        }
    }

    /// Read a signed 64-bit integer.
    pub fn read_i64(&mut self) -> Result<i64, PacketError> {
        match self.read(ValueType::Int64)? {
            Value::Int64(v) => Ok(v),
            _ => unreachable!("read(Int64) yields Value::Int64"),
        }
    }

    /// Read a double.
    pub fn read_f64(&mut self) -> Result<f64, PacketError> {
        match self.read(ValueType::Double)? {
            Value::Double(v) => Ok(v),
            _ => unreachable!("read(Double) yields Value::Double"),
        }
    }

    /// Read a string.
    pub fn read_string(&mut self) -> Result<String, PacketError> {
        match self.read(ValueType::String)? {
            Value::String(v) => Ok(v),
            _ => unreachable!("read(String) yields Value::String"),
        }
    }

    fn read_inner(&mut self, expected: ValueType) -> Result<Value, PacketError> {
        let found = self.take(1)?[0];
        if found != expected.tag() {
            return Err(match ValueType::from_tag(found) {
                Some(_) => PacketError::TypeMismatch { expected, found },
                None => PacketError::UnknownTag(found),
            });
        }

        let value = match expected {
            ValueType::Bool => Value::Bool(self.take(1)?[0] != 0),
            ValueType::Int8 => Value::Int8(i8::from_be_bytes(self.take_array()?)),
            ValueType::Int16 => Value::Int16(i16::from_be_bytes(self.take_array()?)),
            ValueType::UInt16 => Value::UInt16(u16::from_be_bytes(self.take_array()?)),
            ValueType::Int32 => Value::Int32(i32::from_be_bytes(self.take_array()?)),
            ValueType::Int64 => Value::Int64(i64::from_be_bytes(self.take_array()?)),
            ValueType::Double => Value::Double(f64::from_be_bytes(self.take_array()?)),
            ValueType::String => {
                let len = usize::from(u16::from_be_bytes(self.take_array()?));
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| PacketError::InvalidUtf8)?;
                Value::String(s.to_owned())
            }
        };
        Ok(value)
    }

    fn take(&mut self, n: usize) -> Result<&[u8], PacketError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(PacketError::Truncated { needed: n, remaining });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

impl From<Packet> for PacketReader {
    fn from(packet: Packet) -> Self {
        Self::new(packet.into_bytes())
    }
}

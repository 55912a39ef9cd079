//! Wire-format encoder.
//!
//! A [`Marshaller`] appends values to an aligned byte buffer against a parsed
//! signature. Little-endian is the default for outgoing messages; both
//! endians are supported so a message can be re-serialized either way.

use crate::error::SignatureBodyMismatchError;
use crate::signature::{Signature, SignatureType, TypeCode};
use crate::value::Value;

/// Maximum byte length of a single marshalled array.
pub const MAX_ARRAY_LENGTH: usize = 67_108_864; // 64 MiB

/// Byte order of a marshalled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// The endian mark used in message headers.
    pub fn mark(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    /// Decode an endian mark from a message header.
    pub fn from_mark(mark: u8) -> Option<Endian> {
        match mark {
            b'l' => Some(Endian::Little),
            b'B' => Some(Endian::Big),
            _ => None,
        }
    }
}

/// Encoder over an aligned byte buffer.
#[derive(Debug, Default)]
pub struct Marshaller {
    endian: Endian,
    buf: Vec<u8>,
}

macro_rules! write_scalar {
    ($name:ident, $ty:ty, $align:expr) => {
        fn $name(&mut self, value: $ty) {
            self.align($align);
            match self.endian {
                Endian::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
                Endian::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
            }
        }
    };
}

impl Marshaller {
    /// A little-endian marshaller with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A marshaller with explicit byte order.
    pub fn with_endian(endian: Endian) -> Self {
        Self {
            endian,
            buf: Vec::new(),
        }
    }

    /// The bytes written so far.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the marshaller, returning its buffer.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    /// Current buffer length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pad the buffer with zeros to a multiple of `n`, returning the number
    /// of padding bytes written.
    pub fn align(&mut self, n: usize) -> usize {
        let pad = (n - (self.buf.len() % n)) % n;
        for _ in 0..pad {
            self.buf.push(0);
        }
        pad
    }

    write_scalar!(write_i16, i16, 2);
    write_scalar!(write_u16, u16, 2);
    write_scalar!(write_i32, i32, 4);
    write_scalar!(write_u32, u32, 4);
    write_scalar!(write_i64, i64, 8);
    write_scalar!(write_u64, u64, 8);
    write_scalar!(write_f64, f64, 8);

    fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    fn write_signature_str(&mut self, value: &str) {
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    /// Verify `body` against `signature`, then append it.
    pub fn marshal(
        &mut self,
        signature: &Signature,
        body: &[Value],
    ) -> Result<(), SignatureBodyMismatchError> {
        signature.verify(body)?;
        for (ty, value) in signature.types.iter().zip(body) {
            self.write_single(ty, value)?;
        }
        Ok(())
    }

    /// Append one value of one complete type.
    pub fn write_single(
        &mut self,
        ty: &SignatureType,
        value: &Value,
    ) -> Result<(), SignatureBodyMismatchError> {
        let mismatch = || {
            SignatureBodyMismatchError(format!(
                "cannot marshal {} as type '{}'",
                value.kind(),
                ty.text
            ))
        };

        match (ty.code, value) {
            (TypeCode::Byte, Value::Byte(v)) => self.buf.push(*v),
            (TypeCode::Boolean, Value::Boolean(v)) => self.write_u32(u32::from(*v)),
            (TypeCode::Int16, Value::Int16(v)) => self.write_i16(*v),
            (TypeCode::Uint16, Value::Uint16(v)) => self.write_u16(*v),
            (TypeCode::Int32, Value::Int32(v)) => self.write_i32(*v),
            (TypeCode::Uint32, Value::Uint32(v)) => self.write_u32(*v),
            (TypeCode::Int64, Value::Int64(v)) => self.write_i64(*v),
            (TypeCode::Uint64, Value::Uint64(v)) => self.write_u64(*v),
            (TypeCode::Double, Value::Double(v)) => self.write_f64(*v),
            (TypeCode::UnixFd, Value::UnixFd(v)) => self.write_u32(*v),
            (TypeCode::String, Value::String(v)) => self.write_string(v),
            (TypeCode::ObjectPath, Value::ObjectPath(v)) => self.write_string(v),
            (TypeCode::Signature, Value::Signature(v)) => self.write_signature_str(v),
            (TypeCode::Variant, Value::Variant(variant)) => {
                self.write_signature_str(&variant.signature.text);
                self.write_single(&variant.signature, &variant.value)?;
            }
            (TypeCode::Struct, Value::Struct(fields)) => {
                self.align(8);
                for (child, field) in ty.children.iter().zip(fields) {
                    self.write_single(child, field)?;
                }
            }
            (TypeCode::Array, _) => self.write_array(ty, value)?,
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    fn write_array(
        &mut self,
        ty: &SignatureType,
        value: &Value,
    ) -> Result<(), SignatureBodyMismatchError> {
        self.align(4);
        let len_offset = self.buf.len();
        self.write_u32(0); // length placeholder, patched below

        let child = &ty.children[0];
        // The pad to the element alignment is not part of the array length.
        if child.code.alignment() == 8 {
            self.align(8);
        }
        let start = self.buf.len();

        match (child.code, value) {
            (TypeCode::DictEntry, Value::Dict(entries)) => {
                for (key, val) in entries {
                    self.align(8);
                    self.write_single(&child.children[0], key)?;
                    self.write_single(&child.children[1], val)?;
                }
            }
            (_, Value::Array(items)) => {
                for item in items {
                    self.write_single(child, item)?;
                }
            }
            _ => {
                return Err(SignatureBodyMismatchError(format!(
                    "cannot marshal {} as type '{}'",
                    value.kind(),
                    ty.text
                )))
            }
        }

        let content_len = self.buf.len() - start;
        if content_len > MAX_ARRAY_LENGTH {
            return Err(SignatureBodyMismatchError(format!(
                "array of {content_len} bytes exceeds the {MAX_ARRAY_LENGTH} byte limit"
            )));
        }
        let len_bytes = match self.endian {
            Endian::Little => (content_len as u32).to_le_bytes(),
            Endian::Big => (content_len as u32).to_be_bytes(),
        };
        self.buf[len_offset..len_offset + 4].copy_from_slice(&len_bytes);
        Ok(())
    }
}

//! Wire-format decoder and message framing.
//!
//! [`read_header`] parses the fixed 16-byte prefix, [`BodyReader`] is the
//! aligned cursor used for header fields and bodies, and [`Unmarshaller`]
//! frames complete messages out of an async byte stream. A read that cannot
//! complete suspends at the await point; partially read frames are retained
//! across suspensions.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{InvalidMessageError, Result};
use crate::marshal::{Endian, MAX_ARRAY_LENGTH};
use crate::message::{
    HeaderField, Message, MessageFlags, MessageType, MAX_MESSAGE_LENGTH, PROTOCOL_VERSION,
};
use crate::signature::{parse_signature, parse_single_type, SignatureType, TypeCode};
use crate::value::{Value, Variant};

/// Size of the fixed message prefix.
pub const HEADER_PREFIX_SIZE: usize = 16;

/// The decoded fixed prefix of a message.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub endian: Endian,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub protocol_version: u8,
    pub body_len: u32,
    pub serial: u32,
    /// Unpadded byte length of the header field array.
    pub fields_len: u32,
    /// Bytes remaining after the prefix: padded field array plus body.
    pub msg_len: usize,
}

/// Parse the fixed 16-byte prefix.
pub fn read_header(buf: &[u8; HEADER_PREFIX_SIZE]) -> std::result::Result<Header, InvalidMessageError> {
    let endian = Endian::from_mark(buf[0]).ok_or_else(|| {
        InvalidMessageError(format!("expected endian mark as the first byte, got {:#x}", buf[0]))
    })?;
    let message_type = MessageType::from_byte(buf[1])
        .ok_or_else(|| InvalidMessageError(format!("got unknown message type: {}", buf[1])))?;
    let flags = MessageFlags::from_bits(buf[2]);
    let protocol_version = buf[3];
    if protocol_version != PROTOCOL_VERSION {
        return Err(InvalidMessageError(format!(
            "got unknown protocol version: {protocol_version}"
        )));
    }

    let word = |range: std::ops::Range<usize>| -> u32 {
        let bytes: [u8; 4] = buf[range].try_into().expect("4-byte slice");
        match endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        }
    };
    let body_len = word(4..8);
    let serial = word(8..12);
    let fields_len = word(12..16);

    let padded_fields = (fields_len as usize + 7) & !7;
    let msg_len = padded_fields + body_len as usize;
    if HEADER_PREFIX_SIZE + msg_len > MAX_MESSAGE_LENGTH {
        return Err(InvalidMessageError(format!(
            "message of {} bytes exceeds the {MAX_MESSAGE_LENGTH} byte limit",
            HEADER_PREFIX_SIZE + msg_len
        )));
    }

    Ok(Header {
        endian,
        message_type,
        flags,
        protocol_version,
        body_len,
        serial,
        fields_len,
        msg_len,
    })
}

/// Aligned cursor over a decoded message region (everything after the fixed
/// prefix).
pub struct BodyReader<'a> {
    buf: &'a [u8],
    offset: usize,
    endian: Endian,
}

macro_rules! read_scalar {
    ($name:ident, $ty:ty, $size:expr) => {
        fn $name(&mut self) -> std::result::Result<$ty, InvalidMessageError> {
            self.align($size);
            let bytes: [u8; $size] = self.read_bytes($size)?.try_into().expect("sized slice");
            Ok(match self.endian {
                Endian::Little => <$ty>::from_le_bytes(bytes),
                Endian::Big => <$ty>::from_be_bytes(bytes),
            })
        }
    };
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self {
            buf,
            offset: 0,
            endian,
        }
    }

    /// Current cursor position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Advance the cursor to a multiple of `align`.
    pub fn align(&mut self, align: usize) {
        self.offset += (align - (self.offset % align)) % align;
    }

    fn read_bytes(&mut self, size: usize) -> std::result::Result<&'a [u8], InvalidMessageError> {
        let end = self.offset.checked_add(size).ok_or_else(|| {
            InvalidMessageError("declared length overflows the buffer".into())
        })?;
        if end > self.buf.len() {
            return Err(InvalidMessageError(format!(
                "declared length of {size} bytes exceeds the remaining buffer"
            )));
        }
        let bytes = &self.buf[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn read_byte(&mut self) -> std::result::Result<u8, InvalidMessageError> {
        Ok(self.read_bytes(1)?[0])
    }

    read_scalar!(read_i16, i16, 2);
    read_scalar!(read_u16, u16, 2);
    read_scalar!(read_i32, i32, 4);
    read_scalar!(read_u32, u32, 4);
    read_scalar!(read_i64, i64, 8);
    read_scalar!(read_u64, u64, 8);
    read_scalar!(read_f64, f64, 8);

    fn read_string(&mut self) -> std::result::Result<String, InvalidMessageError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| InvalidMessageError("string is not valid UTF-8".into()))?
            .to_string();
        if self.read_byte()? != 0 {
            return Err(InvalidMessageError("string is missing its NUL terminator".into()));
        }
        Ok(text)
    }

    fn read_signature_str(&mut self) -> std::result::Result<String, InvalidMessageError> {
        let len = self.read_byte()? as usize;
        let bytes = self.read_bytes(len)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| InvalidMessageError("signature is not valid ASCII".into()))?
            .to_string();
        if self.read_byte()? != 0 {
            return Err(InvalidMessageError(
                "signature is missing its NUL terminator".into(),
            ));
        }
        Ok(text)
    }

    /// Decode one value of one complete type, advancing the cursor.
    pub fn read_single(
        &mut self,
        ty: &SignatureType,
    ) -> std::result::Result<Value, InvalidMessageError> {
        Ok(match ty.code {
            TypeCode::Byte => Value::Byte(self.read_byte()?),
            TypeCode::Boolean => match self.read_u32()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(InvalidMessageError(format!(
                        "boolean must be 0 or 1, got {other}"
                    )))
                }
            },
            TypeCode::Int16 => Value::Int16(self.read_i16()?),
            TypeCode::Uint16 => Value::Uint16(self.read_u16()?),
            TypeCode::Int32 => Value::Int32(self.read_i32()?),
            TypeCode::Uint32 => Value::Uint32(self.read_u32()?),
            TypeCode::Int64 => Value::Int64(self.read_i64()?),
            TypeCode::Uint64 => Value::Uint64(self.read_u64()?),
            TypeCode::Double => Value::Double(self.read_f64()?),
            TypeCode::UnixFd => Value::UnixFd(self.read_u32()?),
            TypeCode::String => Value::String(self.read_string()?),
            TypeCode::ObjectPath => {
                let path = self.read_string()?;
                if !crate::validators::is_object_path_valid(&path) {
                    return Err(InvalidMessageError(format!("invalid object path: {path:?}")));
                }
                Value::ObjectPath(path)
            }
            TypeCode::Signature => {
                let text = self.read_signature_str()?;
                parse_signature(&text)
                    .map_err(|e| InvalidMessageError(e.to_string()))?;
                Value::Signature(text)
            }
            TypeCode::Variant => {
                let text = self.read_signature_str()?;
                let inner = parse_single_type(&text)
                    .map_err(|e| InvalidMessageError(e.to_string()))?;
                let value = self.read_single(&inner)?;
                Value::Variant(Box::new(Variant::unchecked(inner, value)))
            }
            TypeCode::Struct => {
                self.align(8);
                let mut fields = Vec::with_capacity(ty.children.len());
                for child in &ty.children {
                    fields.push(self.read_single(child)?);
                }
                Value::Struct(fields)
            }
            TypeCode::Array => self.read_array(ty)?,
            TypeCode::DictEntry => {
                return Err(InvalidMessageError(
                    "dict entry outside of an array".into(),
                ))
            }
        })
    }

    fn read_array(
        &mut self,
        ty: &SignatureType,
    ) -> std::result::Result<Value, InvalidMessageError> {
        let array_len = self.read_u32()? as usize;
        if array_len > MAX_ARRAY_LENGTH {
            return Err(InvalidMessageError(format!(
                "array of {array_len} bytes exceeds the {MAX_ARRAY_LENGTH} byte limit"
            )));
        }

        let child = &ty.children[0];
        // The pad to the element alignment is not part of the array length.
        if child.code.alignment() == 8 {
            self.align(8);
        }
        let stop = self.offset.checked_add(array_len).ok_or_else(|| {
            InvalidMessageError("array length overflows the buffer".into())
        })?;
        if stop > self.buf.len() {
            return Err(InvalidMessageError(format!(
                "array length of {array_len} bytes exceeds the remaining buffer"
            )));
        }

        if child.code == TypeCode::DictEntry {
            let mut entries: Vec<(Value, Value)> = Vec::new();
            while self.offset < stop {
                self.align(8);
                let key = self.read_single(&child.children[0])?;
                let value = self.read_single(&child.children[1])?;
                // A duplicate wire key overrides the earlier entry.
                match entries.iter_mut().find(|(k, _)| *k == key) {
                    Some(entry) => entry.1 = value,
                    None => entries.push((key, value)),
                }
            }
            if self.offset != stop {
                return Err(InvalidMessageError(
                    "array contents overran the declared length".into(),
                ));
            }
            Ok(Value::Dict(entries))
        } else {
            let mut items = Vec::new();
            while self.offset < stop {
                items.push(self.read_single(child)?);
            }
            if self.offset != stop {
                return Err(InvalidMessageError(
                    "array contents overran the declared length".into(),
                ));
            }
            Ok(Value::Array(items))
        }
    }

    /// Read the `a(yv)` header field array occupying the first `fields_len`
    /// bytes of the buffer.
    fn read_header_fields(
        &mut self,
        fields_len: usize,
    ) -> std::result::Result<Vec<(u8, Variant)>, InvalidMessageError> {
        let mut fields = Vec::new();
        while self.offset < fields_len {
            self.align(8);
            if self.offset >= fields_len {
                break;
            }
            let code = self.read_byte()?;
            let text = self.read_signature_str()?;
            let inner = parse_single_type(&text)
                .map_err(|e| InvalidMessageError(e.to_string()))?;
            let value = self.read_single(&inner)?;
            fields.push((code, Variant::unchecked(inner, value)));
        }
        Ok(fields)
    }
}

fn field_string(variant: Variant, name: &str) -> std::result::Result<String, InvalidMessageError> {
    match variant.value {
        Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Ok(s),
        other => Err(InvalidMessageError(format!(
            "header field {name} must be a string, got {}",
            other.kind()
        ))),
    }
}

fn field_u32(variant: Variant, name: &str) -> std::result::Result<u32, InvalidMessageError> {
    match variant.value {
        Value::Uint32(v) => Ok(v),
        other => Err(InvalidMessageError(format!(
            "header field {name} must be a uint32, got {}",
            other.kind()
        ))),
    }
}

/// Parse a complete message from its full wire bytes.
pub fn message_from_bytes(bytes: &[u8], unix_fds: Vec<Arc<OwnedFd>>) -> Result<Message> {
    if bytes.len() < HEADER_PREFIX_SIZE {
        return Err(InvalidMessageError("message shorter than its fixed prefix".into()).into());
    }
    let prefix: &[u8; HEADER_PREFIX_SIZE] = bytes[..HEADER_PREFIX_SIZE]
        .try_into()
        .expect("sized slice");
    let header = read_header(prefix)?;
    let rest = &bytes[HEADER_PREFIX_SIZE..];
    if rest.len() < header.msg_len {
        return Err(InvalidMessageError("message truncated".into()).into());
    }
    read_message_body(&header, &rest[..header.msg_len], unix_fds)
}

/// Decode header fields and body out of the region following the fixed
/// prefix.
pub fn read_message_body(
    header: &Header,
    rest: &[u8],
    unix_fds: Vec<Arc<OwnedFd>>,
) -> Result<Message> {
    let mut reader = BodyReader::new(rest, header.endian);
    let raw_fields = reader.read_header_fields(header.fields_len as usize)?;

    let mut message = Message {
        message_type: header.message_type,
        flags: header.flags,
        serial: header.serial,
        unix_fds,
        ..Message::default()
    };
    let mut signature_text = String::new();
    for (code, variant) in raw_fields {
        match HeaderField::from_byte(code) {
            Some(HeaderField::Path) => message.path = Some(field_string(variant, "PATH")?),
            Some(HeaderField::Interface) => {
                message.interface = Some(field_string(variant, "INTERFACE")?)
            }
            Some(HeaderField::Member) => message.member = Some(field_string(variant, "MEMBER")?),
            Some(HeaderField::ErrorName) => {
                message.error_name = Some(field_string(variant, "ERROR_NAME")?)
            }
            Some(HeaderField::ReplySerial) => {
                message.reply_serial = Some(field_u32(variant, "REPLY_SERIAL")?)
            }
            Some(HeaderField::Destination) => {
                message.destination = Some(field_string(variant, "DESTINATION")?)
            }
            Some(HeaderField::Sender) => message.sender = Some(field_string(variant, "SENDER")?),
            Some(HeaderField::Signature) => signature_text = field_string(variant, "SIGNATURE")?,
            Some(HeaderField::UnixFds) => {
                let _count = field_u32(variant, "UNIX_FDS")?;
            }
            // Unknown header fields must be ignored.
            None => {}
        }
    }

    message.signature = parse_signature(&signature_text)?;

    if header.body_len > 0 {
        if message.signature.is_empty() {
            return Err(InvalidMessageError(
                "message has a body but no SIGNATURE header field".into(),
            )
            .into());
        }
        reader.align(8);
        let mut body = Vec::with_capacity(message.signature.types.len());
        for ty in &message.signature.types {
            body.push(reader.read_single(ty)?);
        }
        message.body = body;
    }

    message.validate()?;
    Ok(message)
}

/// Frames complete messages out of an async byte stream.
pub struct Unmarshaller<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> Unmarshaller<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Access the underlying reader, e.g. to collect received fds.
    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Read one complete message frame: the 16-byte prefix, the padded
    /// header field array, and the body.
    pub async fn read_frame(&mut self) -> Result<(Header, Vec<u8>)> {
        let mut prefix = [0u8; HEADER_PREFIX_SIZE];
        self.reader.read_exact(&mut prefix).await?;
        let header = read_header(&prefix)?;
        let mut rest = vec![0u8; header.msg_len];
        self.reader.read_exact(&mut rest).await?;
        Ok((header, rest))
    }

    /// Read and decode one message.
    pub async fn read_message(&mut self, unix_fds: Vec<Arc<OwnedFd>>) -> Result<Message> {
        let (header, rest) = self.read_frame().await?;
        read_message_body(&header, &rest, unix_fds)
    }
}

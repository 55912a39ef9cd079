//! D-Bus messages.
//!
//! A [`Message`] is a value object: header fields plus a dynamically typed
//! body. Constructors validate names and the header fields required for each
//! message type, so an invalid message never reaches the wire.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use crate::error::{InvalidMessageError, Result};
use crate::marshal::{Endian, Marshaller};
use crate::signature::{parse_signature, Signature};
use crate::validators::{
    assert_bus_name_valid, assert_interface_name_valid, assert_member_name_valid,
    assert_object_path_valid,
};
use crate::value::{Value, Variant};

/// Wire protocol version understood by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum total size of a message we are willing to receive.
pub const MAX_MESSAGE_LENGTH: usize = 134_217_728; // 128 MiB

/// The four D-Bus message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    /// Decode a message type byte.
    pub fn from_byte(b: u8) -> Option<MessageType> {
        match b {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// Message flags. Unknown bits are preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const NO_REPLY_EXPECTED: MessageFlags = MessageFlags(0x1);
    pub const NO_AUTO_START: MessageFlags = MessageFlags(0x2);
    pub const ALLOW_INTERACTIVE_AUTH: MessageFlags = MessageFlags(0x4);

    pub fn from_bits(bits: u8) -> MessageFlags {
        MessageFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

/// Header field codes from the D-Bus specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

impl HeaderField {
    pub fn from_byte(b: u8) -> Option<HeaderField> {
        match b {
            1 => Some(HeaderField::Path),
            2 => Some(HeaderField::Interface),
            3 => Some(HeaderField::Member),
            4 => Some(HeaderField::ErrorName),
            5 => Some(HeaderField::ReplySerial),
            6 => Some(HeaderField::Destination),
            7 => Some(HeaderField::Sender),
            8 => Some(HeaderField::Signature),
            9 => Some(HeaderField::UnixFds),
            _ => None,
        }
    }
}

/// A D-Bus message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub destination: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub sender: Option<String>,
    /// File descriptors attached to this message; `h` values in the body are
    /// indexes into this list.
    pub unix_fds: Vec<Arc<OwnedFd>>,
    pub signature: Signature,
    pub body: Vec<Value>,
    /// Serial number, assigned by the bus at send time. Serial 0 is reserved.
    pub serial: u32,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        let fds =
            |m: &Message| -> Vec<i32> { m.unix_fds.iter().map(|fd| fd.as_raw_fd()).collect() };
        self.destination == other.destination
            && self.path == other.path
            && self.interface == other.interface
            && self.member == other.member
            && self.message_type == other.message_type
            && self.flags == other.flags
            && self.error_name == other.error_name
            && self.reply_serial == other.reply_serial
            && self.sender == other.sender
            && self.signature == other.signature
            && self.body == other.body
            && self.serial == other.serial
            && fds(self) == fds(other)
    }
}

impl Message {
    /// A method call to `member` at `path` on `destination`.
    pub fn method_call(destination: &str, path: &str, member: &str) -> Result<Message> {
        assert_bus_name_valid(destination)?;
        assert_object_path_valid(path)?;
        assert_member_name_valid(member)?;
        Ok(Message {
            destination: Some(destination.to_string()),
            path: Some(path.to_string()),
            member: Some(member.to_string()),
            message_type: MessageType::MethodCall,
            ..Message::default()
        })
    }

    /// A signal emitted from `path` on `interface`.
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Message> {
        assert_object_path_valid(path)?;
        assert_interface_name_valid(interface)?;
        assert_member_name_valid(member)?;
        Ok(Message {
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            message_type: MessageType::Signal,
            ..Message::default()
        })
    }

    /// A method return in reply to `call`.
    pub fn method_return(call: &Message) -> Result<Message> {
        if call.serial == 0 {
            return Err(InvalidMessageError(
                "cannot reply to a message without a serial".into(),
            )
            .into());
        }
        Ok(Message {
            destination: call.sender.clone(),
            message_type: MessageType::MethodReturn,
            reply_serial: Some(call.serial),
            ..Message::default()
        })
    }

    /// An error reply to `call` with the given error name and text.
    pub fn error(call: &Message, error_name: &str, text: &str) -> Result<Message> {
        assert_interface_name_valid(error_name)?;
        if call.serial == 0 {
            return Err(InvalidMessageError(
                "cannot reply to a message without a serial".into(),
            )
            .into());
        }
        Ok(Message {
            destination: call.sender.clone(),
            message_type: MessageType::Error,
            error_name: Some(error_name.to_string()),
            reply_serial: Some(call.serial),
            signature: parse_signature("s").expect("static signature"),
            body: vec![Value::String(text.to_string())],
            ..Message::default()
        })
    }

    /// Set the interface field.
    pub fn with_interface(mut self, interface: &str) -> Result<Message> {
        assert_interface_name_valid(interface)?;
        self.interface = Some(interface.to_string());
        Ok(self)
    }

    /// Set the destination field.
    pub fn with_destination(mut self, destination: &str) -> Result<Message> {
        assert_bus_name_valid(destination)?;
        self.destination = Some(destination.to_string());
        Ok(self)
    }

    /// Set the body and its signature. The body is verified against the
    /// signature when the message is serialized.
    pub fn with_body(mut self, signature: &str, body: Vec<Value>) -> Result<Message> {
        self.signature = parse_signature(signature)?;
        self.body = body;
        Ok(self)
    }

    /// Set the message flags.
    pub fn with_flags(mut self, flags: MessageFlags) -> Message {
        self.flags = flags;
        self
    }

    /// Attach file descriptors. `h` values in the body index into this list.
    pub fn with_unix_fds(mut self, fds: Vec<Arc<OwnedFd>>) -> Message {
        self.unix_fds = fds;
        self
    }

    /// Whether the sender of this message expects a reply.
    pub fn reply_expected(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// Check the header fields required for this message type.
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            Err(InvalidMessageError(format!(
                "missing required field for {:?}: {field}",
                self.message_type
            ))
            .into())
        };
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return missing("path");
                }
                if self.member.is_none() {
                    return missing("member");
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return missing("path");
                }
                if self.member.is_none() {
                    return missing("member");
                }
                if self.interface.is_none() {
                    return missing("interface");
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return missing("reply_serial");
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return missing("error_name");
                }
                if self.reply_serial.is_none() {
                    return missing("reply_serial");
                }
            }
        }
        Ok(())
    }

    /// Serialize in little-endian byte order.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.serialize_endian(Endian::Little)
    }

    /// Serialize with the given byte order: fixed 16-byte prefix, header
    /// field array padded to 8 bytes, then the body.
    pub fn serialize_endian(&self, endian: Endian) -> Result<Vec<u8>> {
        self.validate()?;

        let mut body_block = Marshaller::with_endian(endian);
        body_block.marshal(&self.signature, &self.body)?;

        let mut fields: Vec<Value> = Vec::new();
        let mut push = |code: HeaderField, variant: Variant| {
            fields.push(Value::Struct(vec![
                Value::Byte(code as u8),
                Value::Variant(Box::new(variant)),
            ]));
        };
        if let Some(path) = &self.path {
            push(
                HeaderField::Path,
                Variant::new("o", Value::ObjectPath(path.clone()))?,
            );
        }
        if let Some(interface) = &self.interface {
            push(
                HeaderField::Interface,
                Variant::new("s", Value::String(interface.clone()))?,
            );
        }
        if let Some(member) = &self.member {
            push(
                HeaderField::Member,
                Variant::new("s", Value::String(member.clone()))?,
            );
        }
        if let Some(error_name) = &self.error_name {
            push(
                HeaderField::ErrorName,
                Variant::new("s", Value::String(error_name.clone()))?,
            );
        }
        if let Some(reply_serial) = self.reply_serial {
            push(
                HeaderField::ReplySerial,
                Variant::new("u", Value::Uint32(reply_serial))?,
            );
        }
        if let Some(destination) = &self.destination {
            push(
                HeaderField::Destination,
                Variant::new("s", Value::String(destination.clone()))?,
            );
        }
        if let Some(sender) = &self.sender {
            push(
                HeaderField::Sender,
                Variant::new("s", Value::String(sender.clone()))?,
            );
        }
        if !self.signature.is_empty() {
            push(
                HeaderField::Signature,
                Variant::new("g", Value::Signature(self.signature.text.clone()))?,
            );
        }
        if !self.unix_fds.is_empty() {
            push(
                HeaderField::UnixFds,
                Variant::new("u", Value::Uint32(self.unix_fds.len() as u32))?,
            );
        }

        let header_signature = parse_signature("yyyyuua(yv)").expect("static signature");
        let header_body = vec![
            Value::Byte(endian.mark()),
            Value::Byte(self.message_type as u8),
            Value::Byte(self.flags.bits()),
            Value::Byte(PROTOCOL_VERSION),
            Value::Uint32(body_block.len() as u32),
            Value::Uint32(self.serial),
            Value::Array(fields),
        ];
        let mut header_block = Marshaller::with_endian(endian);
        header_block.marshal(&header_signature, &header_body)?;
        header_block.align(8);

        let mut out = header_block.into_buffer();
        out.extend_from_slice(body_block.buffer());
        Ok(out)
    }

    /// Parse a complete message from a byte buffer, taking ownership of any
    /// fds that arrived with it.
    pub fn from_bytes(bytes: &[u8], unix_fds: Vec<Arc<OwnedFd>>) -> Result<Message> {
        crate::unmarshal::message_from_bytes(bytes, unix_fds)
    }

    /// Build an ERROR reply to this message from a `DBusError`.
    pub fn error_reply(&self, err: &crate::error::DBusError) -> Result<Message> {
        Message::error(self, &err.name, &err.message)
    }
}

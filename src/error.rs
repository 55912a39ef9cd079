//! Error types for kapsule-dbus-client.

use thiserror::Error;

use crate::message::Message;

/// Result type alias for kapsule-dbus-client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a D-Bus peer.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A type signature could not be parsed.
    #[error(transparent)]
    InvalidSignature(#[from] InvalidSignatureError),

    /// A message body does not conform to its signature.
    #[error(transparent)]
    BodyMismatch(#[from] SignatureBodyMismatchError),

    /// A D-Bus address string could not be parsed.
    #[error(transparent)]
    InvalidAddress(#[from] InvalidAddressError),

    /// SASL authentication failed.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// An incoming wire message was malformed.
    #[error(transparent)]
    InvalidMessage(#[from] InvalidMessageError),

    /// Introspection XML violated the schema.
    #[error(transparent)]
    InvalidIntrospection(#[from] InvalidIntrospectionError),

    /// Bus name validation failed.
    #[error(transparent)]
    InvalidBusName(#[from] InvalidBusNameError),

    /// Object path validation failed.
    #[error(transparent)]
    InvalidObjectPath(#[from] InvalidObjectPathError),

    /// Interface name validation failed.
    #[error(transparent)]
    InvalidInterfaceName(#[from] InvalidInterfaceNameError),

    /// Member name validation failed.
    #[error(transparent)]
    InvalidMemberName(#[from] InvalidMemberNameError),

    /// A proxy was asked for an interface its introspection does not declare.
    #[error(transparent)]
    InterfaceNotFound(#[from] InterfaceNotFoundError),

    /// A proxy was asked to subscribe to a signal its introspection does not
    /// declare.
    #[error(transparent)]
    SignalDisabled(#[from] SignalDisabledError),

    /// The remote peer replied with a D-Bus error.
    #[error(transparent)]
    DBus(#[from] DBusError),

    /// The connection closed while an operation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation requires a ready connection.
    #[error("connection is not ready")]
    NotConnected,

    /// The interface is already exported at this path.
    #[error("interface {interface} is already exported at {path}")]
    AlreadyExported { path: String, interface: String },

    /// The message carries unix fds but the transport did not negotiate
    /// fd passing.
    #[error("unix fd passing was not negotiated on this connection")]
    FdPassingNotNegotiated,
}

/// A type signature string is malformed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid signature: {0}")]
pub struct InvalidSignatureError(pub String);

/// A value tree does not conform to the signature it is being marshalled
/// against.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("signature/body mismatch: {0}")]
pub struct SignatureBodyMismatchError(pub String);

/// A D-Bus address string is malformed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid address: {0}")]
pub struct InvalidAddressError(pub String);

/// An incoming wire message is malformed. Fatal to the connection because
/// stream alignment cannot be trusted afterwards.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid message: {0}")]
pub struct InvalidMessageError(pub String);

/// Introspection XML does not follow the D-Bus introspection schema.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid introspection data: {0}")]
pub struct InvalidIntrospectionError(pub String);

/// A string is not a valid bus name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid bus name: {0:?}")]
pub struct InvalidBusNameError(pub String);

/// A string is not a valid object path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid object path: {0:?}")]
pub struct InvalidObjectPathError(pub String);

/// A string is not a valid interface name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid interface name: {0:?}")]
pub struct InvalidInterfaceNameError(pub String);

/// A string is not a valid member name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid member name: {0:?}")]
pub struct InvalidMemberNameError(pub String);

/// The proxy's introspection data does not include the requested interface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("interface not found: {0}")]
pub struct InterfaceNotFoundError(pub String);

/// The proxy's introspection data does not declare the requested signal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("signal not available: {0}")]
pub struct SignalDisabledError(pub String);

/// Authentication-related errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The server rejected every mechanism we offered.
    #[error("all mechanisms rejected, server supports: {0}")]
    Rejected(String),

    /// The server answered with something the protocol does not allow here.
    #[error("unexpected response from server: {0:?}")]
    UnexpectedResponse(String),

    /// The server reported an error during the handshake.
    #[error("server error during authentication: {0}")]
    ServerError(String),

    /// A payload could not be hex-decoded or was otherwise malformed.
    #[error("invalid auth data: {0}")]
    InvalidData(String),
}

/// An error reply from a remote D-Bus peer, or a local failure expressed in
/// D-Bus error terms (such as a call timeout).
#[derive(Debug, Error, Clone)]
#[error("{name}: {message}")]
pub struct DBusError {
    /// The D-Bus error name, e.g. `org.freedesktop.DBus.Error.Failed`.
    pub name: String,
    /// Human-readable error text.
    pub message: String,
    /// The full ERROR reply, when this error came off the wire.
    pub reply: Option<Box<Message>>,
}

impl DBusError {
    /// Create an error with the given D-Bus error name and text.
    ///
    /// The name must be interface-shaped; it is validated when the error is
    /// turned into an ERROR message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            reply: None,
        }
    }

    /// Build a `DBusError` from a received ERROR message.
    ///
    /// The error text is the first string in the body, when present.
    pub fn from_message(reply: Message) -> Self {
        let name = reply.error_name.clone().unwrap_or_default();
        let message = reply
            .body
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Self {
            name,
            message,
            reply: Some(Box::new(reply)),
        }
    }
}

/// Well-known D-Bus error names.
pub mod error_names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
}

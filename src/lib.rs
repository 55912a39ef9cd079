//! kapsule-dbus-client - async D-Bus client library.
//!
//! A peer that connects to a D-Bus daemon (session or system bus),
//! authenticates over SASL, exchanges framed binary messages, and exposes a
//! high-level object/interface/signal model: proxies for remote objects and
//! exported interfaces for local ones. The wire protocol, marshalling and
//! dispatch are implemented natively; the crate interoperates bit-exactly
//! with the reference daemon and other D-Bus peers.

pub mod address;
pub mod auth;
pub mod bus;
pub mod error;
pub mod introspection;
pub mod marshal;
pub mod match_rules;
pub mod message;
pub mod proxy;
pub mod service;
pub mod signature;
pub mod transport;
pub mod unmarshal;
pub mod validators;
pub mod value;

pub use bus::{
    BusBuilder, BusType, ConnectionState, MatchHandle, MessageBus, PendingReply,
    ReleaseNameReply, RequestNameFlags, RequestNameReply,
};
pub use error::{DBusError, Error, Result};
pub use match_rules::MatchRule;
pub use message::{Message, MessageFlags, MessageType};
pub use proxy::{MethodReply, ProxyInterface, ProxyObject, SignalSubscription};
pub use service::{MethodCall, MethodResult, ServiceInterface};
pub use signature::{parse_signature, parse_single_type, Signature, SignatureType, TypeCode};
pub use value::{Value, Variant};

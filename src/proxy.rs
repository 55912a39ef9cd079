//! Typed access to remote objects.
//!
//! A [`ProxyObject`] pairs a destination and object path with introspection
//! data; each [`ProxyInterface`] validates calls against that data before
//! anything is sent. Proxies hold a weak reference to the bus and fail
//! cleanly with [`Error::ConnectionClosed`] once it is gone.

use std::os::fd::AsRawFd;
use std::sync::Weak;

use crate::bus::{duplicate_fd, BusInner, MatchHandle, MessageBus, PROPERTIES_INTERFACE};
use crate::error::{
    error_names, DBusError, Error, InterfaceNotFoundError, InvalidMemberNameError,
    InvalidMessageError, Result, SignalDisabledError,
};
use crate::introspection::{Interface, Node};
use crate::match_rules::MatchRule;
use crate::message::Message;
use crate::signature::parse_signature;
use crate::validators::{assert_bus_name_valid, assert_object_path_valid};
use crate::value::{replace_fds_with_idx, replace_idx_with_fds, Value, Variant};

/// A remote object: destination bus name, object path, and introspection.
pub struct ProxyObject {
    bus: Weak<BusInner>,
    destination: String,
    path: String,
    node: Node,
}

impl ProxyObject {
    pub(crate) fn new(
        bus: Weak<BusInner>,
        destination: &str,
        path: &str,
        node: Node,
    ) -> Result<ProxyObject> {
        assert_bus_name_valid(destination)?;
        assert_object_path_valid(path)?;
        Ok(ProxyObject {
            bus,
            destination: destination.to_string(),
            path: path.to_string(),
            node,
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn introspection(&self) -> &Node {
        &self.node
    }

    /// Typed access to one interface of the object.
    pub fn interface(&self, name: &str) -> Result<ProxyInterface> {
        let interface = self
            .node
            .interface(name)
            .ok_or_else(|| InterfaceNotFoundError(name.to_string()))?
            .clone();
        Ok(ProxyInterface {
            bus: self.bus.clone(),
            destination: self.destination.clone(),
            path: self.path.clone(),
            interface,
        })
    }
}

/// The reply of a proxied method call.
///
/// `args` has `h` values replaced with the raw fds that arrived with the
/// reply; those descriptors stay open as long as `message` is alive.
#[derive(Debug)]
pub struct MethodReply {
    pub args: Vec<Value>,
    pub message: Message,
}

/// An active signal subscription created through a proxy.
pub struct SignalSubscription {
    handle: MatchHandle,
}

/// One interface of a remote object.
pub struct ProxyInterface {
    bus: Weak<BusInner>,
    destination: String,
    path: String,
    interface: Interface,
}

impl ProxyInterface {
    /// The interface name.
    pub fn name(&self) -> &str {
        &self.interface.name
    }

    /// The introspection data backing this proxy.
    pub fn introspection(&self) -> &Interface {
        &self.interface
    }

    fn bus(&self) -> Result<MessageBus> {
        self.bus
            .upgrade()
            .map(MessageBus::from_inner)
            .ok_or(Error::ConnectionClosed)
    }

    /// Call a method, validating argument arity and types against the
    /// introspection before sending.
    ///
    /// `h` arguments carry raw fds; they are duplicated into the outgoing
    /// message, so the caller's descriptors remain open.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<MethodReply> {
        let bus = self.bus()?;
        let method = self.interface.method(member).ok_or_else(|| {
            InvalidMemberNameError(format!("{}.{member}", self.interface.name))
        })?;

        let in_signature = parse_signature(&method.in_signature())?;
        in_signature.verify(&args)?;

        let (args, raw_fds) = replace_fds_with_idx(&in_signature, args);
        let mut fds = Vec::with_capacity(raw_fds.len());
        for fd in raw_fds {
            fds.push(duplicate_fd(fd as i32)?);
        }

        let msg = Message::method_call(&self.destination, &self.path, member)?
            .with_interface(&self.interface.name)?
            .with_body(&in_signature.text, args)?
            .with_unix_fds(fds);
        let message = bus.call(msg).await?;

        let fd_numbers: Vec<u32> = message
            .unix_fds
            .iter()
            .map(|fd| fd.as_raw_fd() as u32)
            .collect();
        let args = replace_idx_with_fds(&message.signature, message.body.clone(), &fd_numbers);
        Ok(MethodReply { args, message })
    }

    /// Subscribe to a declared signal. The bus-side match rule is scoped to
    /// `(sender, path, interface, member)` with the sender resolved to the
    /// destination's unique name.
    pub async fn subscribe_signal(
        &self,
        member: &str,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<SignalSubscription> {
        if self.interface.signal(member).is_none() {
            return Err(
                SignalDisabledError(format!("{}.{member}", self.interface.name)).into(),
            );
        }
        let bus = self.bus()?;
        let sender = bus.get_name_owner(&self.destination).await?;
        let rule = MatchRule::for_signal(&sender, &self.path, &self.interface.name, member);
        let handle = bus.add_match(rule, handler).await?;
        Ok(SignalSubscription { handle })
    }

    /// Release a signal subscription; the daemon-side match is removed when
    /// the last subscriber for the rule goes.
    pub async fn unsubscribe_signal(&self, subscription: SignalSubscription) -> Result<()> {
        self.bus()?.remove_match(subscription.handle).await
    }

    /// Subscribe to `PropertiesChanged` for this interface.
    pub async fn subscribe_properties_changed(
        &self,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<SignalSubscription> {
        if self.interface.properties.is_empty() {
            return Err(SignalDisabledError(format!(
                "{} declares no properties",
                self.interface.name
            ))
            .into());
        }
        let bus = self.bus()?;
        let sender = bus.get_name_owner(&self.destination).await?;
        let mut rule = MatchRule::for_signal(
            &sender,
            &self.path,
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
        );
        rule.args.insert(0, self.interface.name.clone());
        let handle = bus.add_match(rule, handler).await?;
        Ok(SignalSubscription { handle })
    }

    /// Read a property through `org.freedesktop.DBus.Properties.Get`.
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        let property = self.interface.property(name).ok_or_else(|| {
            InvalidMemberNameError(format!("{}.{name}", self.interface.name))
        })?;
        if !property.access.readable() {
            return Err(DBusError::new(
                error_names::ACCESS_DENIED,
                format!("property {name} is not readable"),
            )
            .into());
        }
        let bus = self.bus()?;
        let msg = Message::method_call(&self.destination, &self.path, "Get")?
            .with_interface(PROPERTIES_INTERFACE)?
            .with_body(
                "ss",
                vec![
                    Value::String(self.interface.name.clone()),
                    Value::String(name.to_string()),
                ],
            )?;
        let reply = bus.call(msg).await?;
        let variant = reply
            .body
            .first()
            .and_then(Value::as_variant)
            .ok_or_else(|| InvalidMessageError("Get reply carried no variant".into()))?;
        Ok(variant.value.clone())
    }

    /// Write a property through `org.freedesktop.DBus.Properties.Set`. The
    /// value is verified against the property's declared type.
    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let property = self.interface.property(name).ok_or_else(|| {
            InvalidMemberNameError(format!("{}.{name}", self.interface.name))
        })?;
        if !property.access.writable() {
            return Err(DBusError::new(
                error_names::PROPERTY_READ_ONLY,
                format!("property {name} is read-only"),
            )
            .into());
        }
        let variant = Variant::new(&property.signature, value)?;
        let bus = self.bus()?;
        let msg = Message::method_call(&self.destination, &self.path, "Set")?
            .with_interface(PROPERTIES_INTERFACE)?
            .with_body(
                "ssv",
                vec![
                    Value::String(self.interface.name.clone()),
                    Value::String(name.to_string()),
                    Value::Variant(Box::new(variant)),
                ],
            )?;
        bus.call(msg).await?;
        Ok(())
    }

    /// Read every property through `org.freedesktop.DBus.Properties.GetAll`,
    /// with the variants unwrapped.
    pub async fn get_all_properties(&self) -> Result<Vec<(String, Value)>> {
        let bus = self.bus()?;
        let msg = Message::method_call(&self.destination, &self.path, "GetAll")?
            .with_interface(PROPERTIES_INTERFACE)?
            .with_body("s", vec![Value::String(self.interface.name.clone())])?;
        let reply = bus.call(msg).await?;
        let entries = reply
            .body
            .first()
            .and_then(Value::as_dict)
            .ok_or_else(|| InvalidMessageError("GetAll reply carried no dict".into()))?;
        let mut properties = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let (Some(name), Some(variant)) = (key.as_str(), value.as_variant()) else {
                return Err(InvalidMessageError("GetAll entries must be (sv)".into()).into());
            };
            properties.push((name.to_string(), variant.value.clone()));
        }
        Ok(properties)
    }
}

//! Exported service interfaces.
//!
//! A [`ServiceInterface`] describes one interface an application exports at
//! an object path: async method handlers, declared signals, and property
//! accessors. The bus dispatches incoming method calls against it and
//! synthesizes its introspection data.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use std::future::Future;

use crate::error::{error_names, DBusError, Result};
use crate::introspection;
use crate::message::Message;
use crate::signature::{parse_signature, parse_single_type, Signature, SignatureType};
use crate::validators::{assert_interface_name_valid, assert_member_name_valid};
use crate::value::Value;

/// An incoming method call as seen by a handler.
pub struct MethodCall {
    /// The full message, including attached fds.
    pub message: Arc<Message>,
    /// The decoded body.
    pub args: Vec<Value>,
}

/// What a method handler resolves to: the out values, matching the declared
/// out signature, or a D-Bus error sent back to the caller.
pub type MethodResult = std::result::Result<Vec<Value>, DBusError>;

type MethodHandler = Arc<dyn Fn(MethodCall) -> BoxFuture<'static, MethodResult> + Send + Sync>;
type PropertyGetter = Arc<dyn Fn() -> std::result::Result<Value, DBusError> + Send + Sync>;
type PropertySetter = Arc<dyn Fn(Value) -> std::result::Result<(), DBusError> + Send + Sync>;

/// A method exported on an interface.
pub struct MethodSpec {
    pub name: String,
    pub in_signature: Signature,
    pub out_signature: Signature,
    handler: MethodHandler,
}

impl MethodSpec {
    /// Invoke the handler.
    pub fn invoke(&self, call: MethodCall) -> BoxFuture<'static, MethodResult> {
        (self.handler)(call)
    }
}

/// A signal declared on an interface.
pub struct SignalSpec {
    pub name: String,
    pub signature: Signature,
}

/// A property exported on an interface.
pub struct PropertySpec {
    pub name: String,
    pub signature: SignatureType,
    pub access: introspection::Access,
    pub emits_changed: introspection::EmitsChangedSignal,
    getter: Option<PropertyGetter>,
    setter: Option<PropertySetter>,
}

/// One interface of an exported object.
pub struct ServiceInterface {
    name: String,
    methods: HashMap<String, MethodSpec>,
    signals: HashMap<String, SignalSpec>,
    properties: HashMap<String, PropertySpec>,
}

impl ServiceInterface {
    /// Create an empty interface with the given name.
    pub fn new(name: &str) -> Result<ServiceInterface> {
        assert_interface_name_valid(name)?;
        Ok(ServiceInterface {
            name: name.to_string(),
            methods: HashMap::new(),
            signals: HashMap::new(),
            properties: HashMap::new(),
        })
    }

    /// The interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a method with its in/out signatures and async handler.
    pub fn method<F, Fut>(
        mut self,
        name: &str,
        in_signature: &str,
        out_signature: &str,
        handler: F,
    ) -> Result<ServiceInterface>
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        assert_member_name_valid(name)?;
        let spec = MethodSpec {
            name: name.to_string(),
            in_signature: parse_signature(in_signature)?,
            out_signature: parse_signature(out_signature)?,
            handler: Arc::new(move |call| Box::pin(handler(call))),
        };
        self.methods.insert(name.to_string(), spec);
        Ok(self)
    }

    /// Declare a signal this interface emits.
    pub fn signal(mut self, name: &str, signature: &str) -> Result<ServiceInterface> {
        assert_member_name_valid(name)?;
        let spec = SignalSpec {
            name: name.to_string(),
            signature: parse_signature(signature)?,
        };
        self.signals.insert(name.to_string(), spec);
        Ok(self)
    }

    /// Add a read-only property backed by a getter.
    pub fn readonly_property<G>(
        self,
        name: &str,
        signature: &str,
        getter: G,
    ) -> Result<ServiceInterface>
    where
        G: Fn() -> std::result::Result<Value, DBusError> + Send + Sync + 'static,
    {
        self.add_property(
            name,
            signature,
            introspection::Access::Read,
            Some(Arc::new(getter)),
            None,
        )
    }

    /// Add a read-write property backed by a getter and a setter. Change
    /// signals are not emitted automatically; use
    /// `MessageBus::emit_properties_changed` when state changes.
    pub fn writable_property<G, S>(
        self,
        name: &str,
        signature: &str,
        getter: G,
        setter: S,
    ) -> Result<ServiceInterface>
    where
        G: Fn() -> std::result::Result<Value, DBusError> + Send + Sync + 'static,
        S: Fn(Value) -> std::result::Result<(), DBusError> + Send + Sync + 'static,
    {
        self.add_property(
            name,
            signature,
            introspection::Access::ReadWrite,
            Some(Arc::new(getter)),
            Some(Arc::new(setter)),
        )
    }

    fn add_property(
        mut self,
        name: &str,
        signature: &str,
        access: introspection::Access,
        getter: Option<PropertyGetter>,
        setter: Option<PropertySetter>,
    ) -> Result<ServiceInterface> {
        assert_member_name_valid(name)?;
        let spec = PropertySpec {
            name: name.to_string(),
            signature: parse_single_type(signature)?,
            access,
            emits_changed: introspection::EmitsChangedSignal::default(),
            getter,
            setter,
        };
        self.properties.insert(name.to_string(), spec);
        Ok(self)
    }

    /// Look up a method.
    pub fn find_method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    /// Look up a declared signal.
    pub fn find_signal(&self, name: &str) -> Option<&SignalSpec> {
        self.signals.get(name)
    }

    /// Read one property for `org.freedesktop.DBus.Properties.Get`.
    pub fn get_property(&self, name: &str) -> std::result::Result<Value, DBusError> {
        let property = self.properties.get(name).ok_or_else(|| {
            DBusError::new(
                error_names::UNKNOWN_PROPERTY,
                format!("interface {} has no property {name}", self.name),
            )
        })?;
        let getter = property.getter.as_ref().ok_or_else(|| {
            DBusError::new(
                error_names::ACCESS_DENIED,
                format!("property {name} is not readable"),
            )
        })?;
        let value = getter()?;
        property.signature.verify(&value).map_err(|e| {
            DBusError::new(error_names::FAILED, format!("property {name}: {e}"))
        })?;
        Ok(value)
    }

    /// Write one property for `org.freedesktop.DBus.Properties.Set`.
    pub fn set_property(&self, name: &str, value: Value) -> std::result::Result<(), DBusError> {
        let property = self.properties.get(name).ok_or_else(|| {
            DBusError::new(
                error_names::UNKNOWN_PROPERTY,
                format!("interface {} has no property {name}", self.name),
            )
        })?;
        let setter = property.setter.as_ref().ok_or_else(|| {
            DBusError::new(
                error_names::PROPERTY_READ_ONLY,
                format!("property {name} is read-only"),
            )
        })?;
        property.signature.verify(&value).map_err(|e| {
            DBusError::new(error_names::INVALID_ARGS, format!("property {name}: {e}"))
        })?;
        setter(value)
    }

    /// Read one property wrapped in a variant of its declared type, the
    /// shape `org.freedesktop.DBus.Properties.Get` replies with.
    pub fn get_property_variant(&self, name: &str) -> std::result::Result<Value, DBusError> {
        let value = self.get_property(name)?;
        let signature = self.properties[name].signature.clone();
        Ok(Value::Variant(Box::new(crate::value::Variant::unchecked(
            signature, value,
        ))))
    }

    /// Read every readable property wrapped in variants, the `a{sv}` shape
    /// of `GetAll` and `GetManagedObjects`.
    pub fn get_all_properties_as_variants(
        &self,
    ) -> std::result::Result<Vec<(String, Value)>, DBusError> {
        let mut entries: Vec<(String, Value)> = Vec::new();
        let mut names: Vec<&String> = self.properties.keys().collect();
        names.sort();
        for name in names {
            let property = &self.properties[name.as_str()];
            if property.getter.is_some() {
                entries.push((name.clone(), self.get_property_variant(name)?));
            }
        }
        Ok(entries)
    }

    /// Synthesize the introspection description of this interface.
    pub fn introspect(&self) -> introspection::Interface {
        let mut interface = introspection::Interface {
            name: self.name.clone(),
            ..introspection::Interface::default()
        };

        let args = |signature: &Signature, direction: introspection::Direction| {
            signature
                .types
                .iter()
                .map(|ty| introspection::Arg {
                    name: None,
                    direction,
                    signature: ty.text.clone(),
                })
                .collect::<Vec<_>>()
        };

        let mut method_names: Vec<&String> = self.methods.keys().collect();
        method_names.sort();
        for name in method_names {
            let spec = &self.methods[name.as_str()];
            interface.methods.push(introspection::Method {
                name: spec.name.clone(),
                in_args: args(&spec.in_signature, introspection::Direction::In),
                out_args: args(&spec.out_signature, introspection::Direction::Out),
            });
        }

        let mut signal_names: Vec<&String> = self.signals.keys().collect();
        signal_names.sort();
        for name in signal_names {
            let spec = &self.signals[name.as_str()];
            interface.signals.push(introspection::Signal {
                name: spec.name.clone(),
                args: args(&spec.signature, introspection::Direction::Out),
            });
        }

        let mut property_names: Vec<&String> = self.properties.keys().collect();
        property_names.sort();
        for name in property_names {
            let spec = &self.properties[name.as_str()];
            interface.properties.push(introspection::Property {
                name: spec.name.clone(),
                signature: spec.signature.text.clone(),
                access: spec.access,
                emits_changed: spec.emits_changed,
            });
        }

        interface
    }
}

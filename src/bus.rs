//! The message bus connection.
//!
//! [`MessageBus`] owns the transport and all connection state: the pending
//! reply table, the signal match registry, the exported object table, and
//! the name owner cache. One reader task pumps incoming messages and
//! dispatches them in arrival order; senders share the socket through a
//! write lock that also assigns serials, so wire order matches send order.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::address::{parse_address, session_bus_address, system_bus_address};
use crate::auth::{Authenticator, Mechanism};
use crate::error::{error_names, DBusError, Error, InvalidMessageError, Result};
use crate::introspection::Node;
use crate::match_rules::MatchRule;
use crate::message::{Message, MessageType};
use crate::proxy::ProxyObject;
use crate::service::{MethodCall, ServiceInterface};
use crate::transport::{Transport, TransportReader, TransportWriter};
use crate::unmarshal::{read_message_body, Unmarshaller};
use crate::validators::{assert_bus_name_valid, assert_object_path_valid};
use crate::value::{replace_fds_with_idx, replace_idx_with_fds, Value};

/// The bus daemon's well-known name, path and interface.
pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Which standard bus to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Session,
    System,
}

/// Connection lifecycle. A bus object that does not exist yet is the
/// "disconnected" state; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Authenticating,
    Ready,
    Closed,
}

/// Flags for `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestNameFlags(u32);

impl RequestNameFlags {
    pub const NONE: RequestNameFlags = RequestNameFlags(0);
    pub const ALLOW_REPLACEMENT: RequestNameFlags = RequestNameFlags(0x1);
    pub const REPLACE_EXISTING: RequestNameFlags = RequestNameFlags(0x2);
    pub const DO_NOT_QUEUE: RequestNameFlags = RequestNameFlags(0x4);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for RequestNameFlags {
    type Output = RequestNameFlags;

    fn bitor(self, rhs: RequestNameFlags) -> RequestNameFlags {
        RequestNameFlags(self.0 | rhs.0)
    }
}

/// Reply codes of `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl RequestNameReply {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::PrimaryOwner),
            2 => Some(Self::InQueue),
            3 => Some(Self::Exists),
            4 => Some(Self::AlreadyOwner),
            _ => None,
        }
    }
}

/// Reply codes of `ReleaseName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

impl ReleaseNameReply {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Released),
            2 => Some(Self::NonExistent),
            3 => Some(Self::NotOwner),
            _ => None,
        }
    }
}

type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync>;

struct MatchEntry {
    rule: MatchRule,
    handlers: Vec<(u64, SignalHandler)>,
}

#[derive(Default)]
struct MatchRegistry {
    /// Keyed by the canonical rule string; the daemon sees AddMatch on 0→1
    /// and RemoveMatch on 1→0 per key.
    entries: HashMap<String, MatchEntry>,
    next_id: u64,
}

/// Handle returned by `add_match`, used to remove the subscription again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchHandle {
    key: String,
    id: u64,
}

type ExportMap = HashMap<String, HashMap<String, Arc<ServiceInterface>>>;

pub(crate) struct BusInner {
    writer: TransportWriter,
    /// Serializes serial assignment and socket writes.
    write_lock: Mutex<()>,
    serials: AtomicU32,
    pending: StdMutex<HashMap<u32, oneshot::Sender<Result<Message>>>>,
    state: StdMutex<ConnectionState>,
    closed: Notify,
    matches: StdMutex<MatchRegistry>,
    exports: StdRwLock<ExportMap>,
    unique_name: StdMutex<Option<String>>,
    name_owners: StdMutex<HashMap<String, String>>,
    dropped_replies: AtomicU64,
    dispatch_error_hook: StdMutex<Option<Box<dyn Fn(String) + Send + Sync>>>,
    machine_id: StdMutex<Option<String>>,
    unix_fd: bool,
    guid: String,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.writer.shutdown();
    }
}

/// Builder for a bus connection.
pub struct BusBuilder {
    bus_type: BusType,
    address: Option<String>,
    mechanisms: Option<Vec<Box<dyn Mechanism>>>,
    negotiate_unix_fd: bool,
    hello_timeout: Duration,
}

impl BusBuilder {
    fn new() -> Self {
        Self {
            bus_type: BusType::Session,
            address: None,
            mechanisms: None,
            negotiate_unix_fd: true,
            hello_timeout: Duration::from_secs(30),
        }
    }

    /// Connect to the session or system bus (overridden by `address`).
    pub fn bus(mut self, bus_type: BusType) -> Self {
        self.bus_type = bus_type;
        self
    }

    /// Connect to an explicit address list instead of a standard bus.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Authentication mechanisms to offer, in order.
    pub fn mechanisms(mut self, mechanisms: Vec<Box<dyn Mechanism>>) -> Self {
        self.mechanisms = Some(mechanisms);
        self
    }

    /// Whether to negotiate unix fd passing on unix transports.
    pub fn negotiate_unix_fd(mut self, negotiate: bool) -> Self {
        self.negotiate_unix_fd = negotiate;
        self
    }

    /// Timeout for the initial Hello exchange.
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Resolve the address, try each endpoint in order, and return the first
    /// connection that authenticates and completes the Hello handshake.
    pub async fn connect(self) -> Result<MessageBus> {
        let address = match &self.address {
            Some(address) => address.clone(),
            None => match self.bus_type {
                BusType::Session => session_bus_address()?,
                BusType::System => system_bus_address(),
            },
        };
        let entries = parse_address(&address)?;

        let mut authenticator = match self.mechanisms {
            Some(mechanisms) => Authenticator::with_mechanisms(mechanisms),
            None => Authenticator::new(),
        };

        let mut last_error: Option<Error> = None;
        for entry in &entries {
            let endpoint = match entry.endpoint() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };
            match MessageBus::establish(
                &endpoint,
                &mut authenticator,
                self.negotiate_unix_fd,
                self.hello_timeout,
            )
            .await
            {
                Ok(bus) => return Ok(bus),
                Err(e) => {
                    warn!(endpoint = ?endpoint, error = %e, "Endpoint failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            crate::error::InvalidAddressError("address contains no usable endpoints".into())
                .into()
        }))
    }
}

/// A connection to a D-Bus daemon.
///
/// Cheap to clone; all clones share the connection. Proxies hold a weak
/// reference and become inoperative once the bus closes.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Connect to the session bus.
    pub async fn session() -> Result<MessageBus> {
        Self::builder().bus(BusType::Session).connect().await
    }

    /// Connect to the system bus.
    pub async fn system() -> Result<MessageBus> {
        Self::builder().bus(BusType::System).connect().await
    }

    /// Connect to an explicit D-Bus address.
    pub async fn connect_address(address: &str) -> Result<MessageBus> {
        Self::builder().address(address).connect().await
    }

    /// A builder for customized connections.
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    async fn establish(
        endpoint: &crate::address::Endpoint,
        authenticator: &mut Authenticator,
        negotiate_unix_fd: bool,
        hello_timeout: Duration,
    ) -> Result<MessageBus> {
        let mut transport = Transport::connect(endpoint).await?;
        let negotiate = negotiate_unix_fd && transport.supports_fds();
        let outcome = authenticator.authenticate(&mut transport, negotiate).await?;

        let bus = MessageBus::from_authenticated(transport, outcome.guid, outcome.unix_fd);

        match tokio::time::timeout(hello_timeout, bus.hello()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                bus.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                bus.disconnect().await;
                return Err(DBusError::new(
                    error_names::NO_REPLY,
                    "timed out waiting for the Hello reply",
                )
                .into());
            }
        }
        Ok(bus)
    }

    /// Wrap an authenticated transport and start the reader task. Exposed
    /// for tests that drive the handshake themselves.
    pub fn from_authenticated(transport: Transport, guid: String, unix_fd: bool) -> MessageBus {
        let (reader, writer) = transport.split();
        let inner = Arc::new(BusInner {
            writer,
            write_lock: Mutex::new(()),
            serials: AtomicU32::new(1),
            pending: StdMutex::new(HashMap::new()),
            state: StdMutex::new(ConnectionState::Authenticating),
            closed: Notify::new(),
            matches: StdMutex::new(MatchRegistry::default()),
            exports: StdRwLock::new(HashMap::new()),
            unique_name: StdMutex::new(None),
            name_owners: StdMutex::new(HashMap::new()),
            dropped_replies: AtomicU64::new(0),
            dispatch_error_hook: StdMutex::new(None),
            machine_id: StdMutex::new(None),
            unix_fd,
            guid,
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), reader));
        MessageBus { inner }
    }

    /// Send the mandatory Hello and record the assigned unique name.
    async fn hello(&self) -> Result<()> {
        let hello = Message::method_call(DBUS_SERVICE, DBUS_PATH, "Hello")?
            .with_interface(DBUS_INTERFACE)?;
        let reply = self.call(hello).await?;
        let name = reply
            .body
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| InvalidMessageError("Hello reply carried no name".into()))?
            .to_string();
        info!(unique_name = %name, guid = %self.inner.guid, "Connected to bus");
        *self.inner.unique_name.lock().expect("not poisoned") = Some(name);
        *self.inner.state.lock().expect("not poisoned") = ConnectionState::Ready;

        // Keep the name owner cache coherent, the way the mux subscribes to
        // NameOwnerChanged at startup. The handler body is empty; cache
        // updates happen in dispatch so every matching signal is seen.
        let rule = MatchRule {
            msg_type: Some("signal".into()),
            sender: Some(DBUS_SERVICE.into()),
            interface: Some(DBUS_INTERFACE.into()),
            member: Some("NameOwnerChanged".into()),
            ..MatchRule::default()
        };
        self.add_match(rule, |_| {}).await?;
        Ok(())
    }

    /// The unique name assigned by the daemon, once connected.
    pub fn unique_name(&self) -> Option<String> {
        self.inner.unique_name.lock().expect("not poisoned").clone()
    }

    /// The server GUID from authentication.
    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    /// Whether unix fd passing was negotiated.
    pub fn supports_unix_fd(&self) -> bool {
        self.inner.unix_fd
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("not poisoned")
    }

    /// Whether the connection is ready for traffic.
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Replies that arrived for serials nobody was waiting on.
    pub fn dropped_replies(&self) -> u64 {
        self.inner.dropped_replies.load(Ordering::Relaxed)
    }

    /// Install a hook that observes dispatch failures (panicking signal
    /// callbacks, handler panics). Failures are also logged.
    pub fn set_dispatch_error_hook(&self, hook: impl Fn(String) + Send + Sync + 'static) {
        *self
            .inner
            .dispatch_error_hook
            .lock()
            .expect("not poisoned") = Some(Box::new(hook));
    }

    /// Send a message.
    ///
    /// Assigns the serial and writes the frame. For a method call that
    /// expects a reply, a [`PendingReply`] is returned; dropping or
    /// cancelling it removes the pending entry.
    pub async fn send(&self, msg: Message) -> Result<Option<PendingReply>> {
        self.inner.send(msg).await
    }

    /// Send a method call and await its reply.
    ///
    /// An ERROR reply surfaces as [`Error::DBus`].
    pub async fn call(&self, msg: Message) -> Result<Message> {
        match self.inner.send(msg).await? {
            Some(reply) => reply.wait().await,
            None => Err(InvalidMessageError(
                "call() requires a method call that expects a reply".into(),
            )
            .into()),
        }
    }

    /// Send a method call and await its reply, failing with
    /// `org.freedesktop.DBus.Error.NoReply` if the timeout elapses. A late
    /// reply is dropped and counted.
    pub async fn call_with_timeout(&self, msg: Message, timeout: Duration) -> Result<Message> {
        let reply = match self.inner.send(msg).await? {
            Some(reply) => reply,
            None => {
                return Err(InvalidMessageError(
                    "call() requires a method call that expects a reply".into(),
                )
                .into())
            }
        };
        match tokio::time::timeout(timeout, reply.wait()).await {
            Ok(result) => result,
            // The timed-out future was dropped, which removed the pending
            // entry; a late reply only bumps the dropped counter.
            Err(_) => Err(DBusError::new(
                error_names::NO_REPLY,
                "method call timed out",
            )
            .into()),
        }
    }

    /// Emit a signal from `path`.
    pub async fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        signature: &str,
        body: Vec<Value>,
    ) -> Result<()> {
        let msg = Message::signal(path, interface, member)?.with_body(signature, body)?;
        self.inner.send(msg).await?;
        Ok(())
    }

    /// Emit `org.freedesktop.DBus.Properties.PropertiesChanged` for an
    /// exported interface. Property-change emission is always explicit;
    /// `changed` values must be variants.
    pub async fn emit_properties_changed(
        &self,
        path: &str,
        interface: &str,
        changed: Vec<(String, Value)>,
        invalidated: Vec<String>,
    ) -> Result<()> {
        let changed = Value::Dict(
            changed
                .into_iter()
                .map(|(name, value)| (Value::String(name), value))
                .collect(),
        );
        let invalidated = Value::Array(invalidated.into_iter().map(Value::String).collect());
        self.emit_signal(
            path,
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
            "sa{sv}as",
            vec![Value::String(interface.to_string()), changed, invalidated],
        )
        .await
    }

    /// Export an interface implementation at an object path.
    ///
    /// Introspection, `Peer`, `Properties` and `ObjectManager` are served
    /// automatically at exported paths. Re-exporting a live
    /// (path, interface) pair is rejected.
    pub fn export(&self, path: &str, interface: ServiceInterface) -> Result<()> {
        assert_object_path_valid(path)?;
        let mut exports = self.inner.exports.write().expect("not poisoned");
        let at_path = exports.entry(path.to_string()).or_default();
        if at_path.contains_key(interface.name()) {
            return Err(Error::AlreadyExported {
                path: path.to_string(),
                interface: interface.name().to_string(),
            });
        }
        debug!(path = %path, interface = %interface.name(), "Exported interface");
        at_path.insert(interface.name().to_string(), Arc::new(interface));
        Ok(())
    }

    /// Remove everything exported at a path.
    pub fn unexport(&self, path: &str) -> Result<()> {
        assert_object_path_valid(path)?;
        self.inner
            .exports
            .write()
            .expect("not poisoned")
            .remove(path);
        Ok(())
    }

    /// Remove one interface exported at a path.
    pub fn unexport_interface(&self, path: &str, interface: &str) -> Result<()> {
        assert_object_path_valid(path)?;
        let mut exports = self.inner.exports.write().expect("not poisoned");
        if let Some(at_path) = exports.get_mut(path) {
            at_path.remove(interface);
            if at_path.is_empty() {
                exports.remove(path);
            }
        }
        Ok(())
    }

    /// Subscribe a callback to signals matching `rule`.
    ///
    /// Identical rules are coalesced: the daemon sees one AddMatch no
    /// matter how many local callbacks share the rule.
    pub async fn add_match(
        &self,
        rule: MatchRule,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<MatchHandle> {
        self.inner.add_match(rule, Arc::new(handler)).await
    }

    /// Remove a subscription created by [`MessageBus::add_match`]. The
    /// daemon sees RemoveMatch when the last callback for the rule goes.
    pub async fn remove_match(&self, handle: MatchHandle) -> Result<()> {
        self.inner.remove_match(handle).await
    }

    /// Ask the daemon for ownership of a well-known name.
    pub async fn request_name(
        &self,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<RequestNameReply> {
        assert_bus_name_valid(name)?;
        let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, "RequestName")?
            .with_interface(DBUS_INTERFACE)?
            .with_body(
                "su",
                vec![Value::String(name.to_string()), Value::Uint32(flags.bits())],
            )?;
        let reply = self.call(msg).await?;
        let code = reply
            .body
            .first()
            .and_then(Value::as_u32)
            .ok_or_else(|| InvalidMessageError("RequestName reply carried no code".into()))?;
        RequestNameReply::from_code(code)
            .ok_or_else(|| InvalidMessageError(format!("unknown RequestName code: {code}")).into())
    }

    /// Release a well-known name.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        assert_bus_name_valid(name)?;
        let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, "ReleaseName")?
            .with_interface(DBUS_INTERFACE)?
            .with_body("s", vec![Value::String(name.to_string())])?;
        let reply = self.call(msg).await?;
        let code = reply
            .body
            .first()
            .and_then(Value::as_u32)
            .ok_or_else(|| InvalidMessageError("ReleaseName reply carried no code".into()))?;
        ReleaseNameReply::from_code(code)
            .ok_or_else(|| InvalidMessageError(format!("unknown ReleaseName code: {code}")).into())
    }

    /// Resolve the current owner of a bus name, consulting the cache kept
    /// coherent by NameOwnerChanged.
    pub async fn get_name_owner(&self, name: &str) -> Result<String> {
        assert_bus_name_valid(name)?;
        if name.starts_with(':') {
            return Ok(name.to_string());
        }
        if let Some(owner) = self
            .inner
            .name_owners
            .lock()
            .expect("not poisoned")
            .get(name)
        {
            return Ok(owner.clone());
        }
        let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, "GetNameOwner")?
            .with_interface(DBUS_INTERFACE)?
            .with_body("s", vec![Value::String(name.to_string())])?;
        let reply = self.call(msg).await?;
        let owner = reply
            .body
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| InvalidMessageError("GetNameOwner reply carried no name".into()))?
            .to_string();
        self.inner
            .name_owners
            .lock()
            .expect("not poisoned")
            .insert(name.to_string(), owner.clone());
        Ok(owner)
    }

    /// Introspect a remote object.
    pub async fn introspect(&self, destination: &str, path: &str) -> Result<Node> {
        let msg = Message::method_call(destination, path, "Introspect")?
            .with_interface(INTROSPECTABLE_INTERFACE)?;
        let reply = self.call(msg).await?;
        let xml = reply
            .body
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| InvalidMessageError("Introspect reply carried no XML".into()))?;
        Ok(Node::from_xml(xml)?)
    }

    /// Build a proxy for a remote object from its introspection data.
    pub fn get_proxy_object(
        &self,
        destination: &str,
        path: &str,
        node: Node,
    ) -> Result<ProxyObject> {
        ProxyObject::new(Arc::downgrade(&self.inner), destination, path, node)
    }

    /// Close the connection. Pending replies fail with a connection-closed
    /// error; subsequent sends fail immediately.
    pub async fn disconnect(&self) {
        self.inner.writer.shutdown();
        self.wait_for_disconnect().await;
    }

    /// Wait until the connection has fully closed.
    pub async fn wait_for_disconnect(&self) {
        loop {
            let notified = self.inner.closed.notified();
            tokio::pin!(notified);
            // Register before checking the state so a notification between
            // the check and the await is not lost.
            notified.as_mut().enable();
            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> MessageBus {
        MessageBus { inner }
    }
}

/// A reply that has not arrived yet.
///
/// Await it with [`PendingReply::wait`]; dropping or cancelling it removes
/// the pending entry so a late reply is dropped.
#[derive(Debug)]
pub struct PendingReply {
    serial: u32,
    rx: oneshot::Receiver<Result<Message>>,
    bus: Weak<BusInner>,
    settled: bool,
}

impl PendingReply {
    /// The serial of the outgoing call.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Wait for the reply. A METHOD_RETURN resolves to the message; an
    /// ERROR reply fails with [`Error::DBus`]; a closed connection fails
    /// with [`Error::ConnectionClosed`].
    pub async fn wait(mut self) -> Result<Message> {
        let received = (&mut self.rx).await;
        self.settled = true;
        match received {
            Ok(Ok(msg)) if msg.message_type == MessageType::Error => {
                Err(DBusError::from_message(msg).into())
            }
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Cancel the call: the pending entry is removed and a later response
    /// is dropped.
    pub fn cancel(mut self) {
        self.remove_entry();
        self.settled = true;
    }

    fn remove_entry(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.pending
                .lock()
                .expect("not poisoned")
                .remove(&self.serial);
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.settled {
            self.remove_entry();
        }
    }
}

impl BusInner {
    fn next_serial(&self) -> u32 {
        let serial = self.serials.fetch_add(1, Ordering::Relaxed);
        // Serial 0 is reserved, skip it on wraparound.
        if serial == 0 {
            self.serials.fetch_add(1, Ordering::Relaxed)
        } else {
            serial
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match *self.state.lock().expect("not poisoned") {
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            _ => Ok(()),
        }
    }

    pub(crate) async fn send(self: &Arc<Self>, mut msg: Message) -> Result<Option<PendingReply>> {
        self.ensure_open()?;
        if !msg.unix_fds.is_empty() && !self.unix_fd {
            return Err(Error::FdPassingNotNegotiated);
        }

        // Serial assignment and the write happen under one lock, so wire
        // order is send order and serials are strictly increasing.
        let guard = self.write_lock.lock().await;
        msg.serial = self.next_serial();
        let bytes = msg.serialize()?;

        let reply = if msg.reply_expected() {
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .expect("not poisoned")
                .insert(msg.serial, tx);
            Some(PendingReply {
                serial: msg.serial,
                rx,
                bus: Arc::downgrade(self),
                settled: false,
            })
        } else {
            None
        };

        let written = self.writer.write_all(&bytes, &msg.unix_fds).await;
        drop(guard);

        if let Err(e) = written {
            self.pending
                .lock()
                .expect("not poisoned")
                .remove(&msg.serial);
            return Err(e.into());
        }
        trace!(
            serial = msg.serial,
            msg_type = ?msg.message_type,
            destination = ?msg.destination,
            member = ?msg.member,
            "Sent message"
        );
        Ok(reply)
    }

    async fn call(self: &Arc<Self>, msg: Message) -> Result<Message> {
        match self.send(msg).await? {
            Some(reply) => reply.wait().await,
            None => Err(InvalidMessageError(
                "call() requires a method call that expects a reply".into(),
            )
            .into()),
        }
    }

    async fn add_match(
        self: &Arc<Self>,
        rule: MatchRule,
        handler: SignalHandler,
    ) -> Result<MatchHandle> {
        self.ensure_open()?;
        let key = rule.canonical_string();
        let (id, first_ref) = {
            let mut registry = self.matches.lock().expect("not poisoned");
            registry.next_id += 1;
            let id = registry.next_id;
            let first_ref = !registry.entries.contains_key(&key);
            registry
                .entries
                .entry(key.clone())
                .or_insert_with(|| MatchEntry {
                    rule: rule.clone(),
                    handlers: Vec::new(),
                })
                .handlers
                .push((id, handler));
            (id, first_ref)
        };
        let handle = MatchHandle {
            key: key.clone(),
            id,
        };

        if first_ref {
            let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, "AddMatch")?
                .with_interface(DBUS_INTERFACE)?
                .with_body("s", vec![Value::String(key.clone())])?;
            if let Err(e) = self.call(msg).await {
                // Roll the local entry back so the registry stays
                // consistent with what the daemon saw.
                let mut registry = self.matches.lock().expect("not poisoned");
                if let Some(entry) = registry.entries.get_mut(&key) {
                    entry.handlers.retain(|(entry_id, _)| *entry_id != id);
                    if entry.handlers.is_empty() {
                        registry.entries.remove(&key);
                    }
                }
                return Err(e);
            }
            debug!(rule = %key, "AddMatch issued");
        }
        Ok(handle)
    }

    async fn remove_match(self: &Arc<Self>, handle: MatchHandle) -> Result<()> {
        let last_ref = {
            let mut registry = self.matches.lock().expect("not poisoned");
            let Some(entry) = registry.entries.get_mut(&handle.key) else {
                return Ok(());
            };
            entry.handlers.retain(|(id, _)| *id != handle.id);
            if entry.handlers.is_empty() {
                registry.entries.remove(&handle.key);
                true
            } else {
                false
            }
        };

        if last_ref && self.ensure_open().is_ok() {
            let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, "RemoveMatch")?
                .with_interface(DBUS_INTERFACE)?
                .with_body("s", vec![Value::String(handle.key.clone())])?;
            self.call(msg).await?;
            debug!(rule = %handle.key, "RemoveMatch issued");
        }
        Ok(())
    }

    fn report_dispatch_error(&self, context: String) {
        error!(context = %context, "Dispatch callback failed");
        if let Some(hook) = &*self.dispatch_error_hook.lock().expect("not poisoned") {
            hook(context);
        }
    }

    fn dispatch_reply(&self, msg: Message) {
        let Some(reply_serial) = msg.reply_serial else {
            return;
        };
        let tx = self
            .pending
            .lock()
            .expect("not poisoned")
            .remove(&reply_serial);
        match tx {
            Some(tx) => {
                let _ = tx.send(Ok(msg));
            }
            None => {
                // Unknown serials are dropped silently, but counted.
                self.dropped_replies.fetch_add(1, Ordering::Relaxed);
                trace!(reply_serial, "Dropped reply for unknown serial");
            }
        }
    }

    fn update_name_owner_cache(&self, msg: &Message) {
        if msg.sender.as_deref() != Some(DBUS_SERVICE)
            || msg.interface.as_deref() != Some(DBUS_INTERFACE)
            || msg.member.as_deref() != Some("NameOwnerChanged")
        {
            return;
        }
        let (Some(Value::String(name)), Some(Value::String(new_owner))) =
            (msg.body.first(), msg.body.get(2))
        else {
            return;
        };
        let mut owners = self.name_owners.lock().expect("not poisoned");
        if new_owner.is_empty() {
            owners.remove(name);
        } else if owners.contains_key(name) {
            owners.insert(name.clone(), new_owner.clone());
        }
    }

    fn dispatch_signal(&self, msg: &Message) {
        self.update_name_owner_cache(msg);

        // Collect matching handlers under the lock, invoke outside it so a
        // callback may call back into the bus.
        let handlers: Vec<SignalHandler> = {
            let registry = self.matches.lock().expect("not poisoned");
            registry
                .entries
                .values()
                .filter(|entry| entry.rule.matches(msg))
                .flat_map(|entry| entry.handlers.iter().map(|(_, h)| Arc::clone(h)))
                .collect()
        };
        for handler in handlers {
            // A panicking callback is isolated; it never kills the loop.
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                self.report_dispatch_error(format!(
                    "signal callback panicked for {:?}.{:?}",
                    msg.interface, msg.member
                ));
            }
        }
    }

    fn exported_at(&self, path: &str) -> Option<HashMap<String, Arc<ServiceInterface>>> {
        self.exports
            .read()
            .expect("not poisoned")
            .get(path)
            .cloned()
    }

    fn has_descendants(&self, path: &str) -> bool {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.exports
            .read()
            .expect("not poisoned")
            .keys()
            .any(|exported| exported != path && exported.starts_with(&prefix))
    }

    /// Whether this path belongs to the exported object tree: either an
    /// interface lives here or somewhere below.
    fn path_is_served(&self, path: &str) -> bool {
        self.exports
            .read()
            .expect("not poisoned")
            .contains_key(path)
            || self.has_descendants(path)
    }

    async fn send_reply(self: &Arc<Self>, call: &Message, reply: Result<Message>) {
        if !call.reply_expected() {
            return;
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                let err = DBusError::new(error_names::FAILED, e.to_string());
                match call.error_reply(&err) {
                    Ok(reply) => reply,
                    Err(build_err) => {
                        warn!(error = %build_err, "Could not build error reply");
                        return;
                    }
                }
            }
        };
        if let Err(e) = self.send(reply).await {
            warn!(error = %e, "Could not send reply");
        }
    }

    fn machine_id(&self) -> String {
        let mut cached = self.machine_id.lock().expect("not poisoned");
        if let Some(id) = &*cached {
            return id.clone();
        }
        let id = std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .map(|content| content.trim().to_string())
            .unwrap_or_else(|_| uuid::Uuid::new_v4().as_simple().to_string());
        *cached = Some(id.clone());
        id
    }

    /// Synthesize introspection data for a path: exported interfaces, the
    /// standard interfaces, and child node names.
    fn introspect_path(&self, path: &str) -> Node {
        let mut node = Node::default();

        if let Some(at_path) = self.exported_at(path) {
            let mut names: Vec<&String> = at_path.keys().collect();
            names.sort();
            for name in names {
                node.interfaces.push(at_path[name.as_str()].introspect());
            }
            node.interfaces.push(standard::peer());
            node.interfaces.push(standard::introspectable());
            node.interfaces.push(standard::properties());
        }
        if self.has_descendants(path) {
            node.interfaces.push(standard::object_manager());
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut children: Vec<String> = self
            .exports
            .read()
            .expect("not poisoned")
            .keys()
            .filter(|exported| exported.as_str() != path)
            .filter_map(|exported| exported.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        children.sort();
        children.dedup();
        for child in children {
            node.nodes.push(Node {
                name: Some(child),
                ..Node::default()
            });
        }
        node
    }

    async fn dispatch_standard(self: &Arc<Self>, msg: &Message) -> bool {
        let path = msg.path.as_deref().unwrap_or("/");
        // The standard interfaces exist only on the exported object tree;
        // anywhere else the caller gets UnknownObject from the regular
        // dispatch path.
        if !self.path_is_served(path) {
            return false;
        }
        let member = msg.member.as_deref().unwrap_or("");
        match msg.interface.as_deref() {
            Some(PEER_INTERFACE) => {
                let reply = match member {
                    "Ping" => Message::method_return(msg),
                    "GetMachineId" => Message::method_return(msg).and_then(|reply| {
                        reply.with_body("s", vec![Value::String(self.machine_id())])
                    }),
                    _ => Message::error(
                        msg,
                        error_names::UNKNOWN_METHOD,
                        &format!("{PEER_INTERFACE} has no method {member}"),
                    ),
                };
                self.send_reply(msg, reply).await;
                true
            }
            Some(INTROSPECTABLE_INTERFACE) if member == "Introspect" => {
                let xml = self.introspect_path(path).to_xml();
                let reply = Message::method_return(msg)
                    .and_then(|reply| reply.with_body("s", vec![Value::String(xml)]));
                self.send_reply(msg, reply).await;
                true
            }
            Some(PROPERTIES_INTERFACE) => {
                let reply = self.handle_properties_call(msg, path, member);
                self.send_reply(msg, reply).await;
                true
            }
            Some(OBJECT_MANAGER_INTERFACE) if member == "GetManagedObjects" => {
                let reply = self.handle_get_managed_objects(msg, path);
                self.send_reply(msg, reply).await;
                true
            }
            _ => false,
        }
    }

    fn handle_properties_call(
        self: &Arc<Self>,
        msg: &Message,
        path: &str,
        member: &str,
    ) -> Result<Message> {
        let Some(at_path) = self.exported_at(path) else {
            return Message::error(
                msg,
                error_names::UNKNOWN_OBJECT,
                &format!("no object exported at {path}"),
            );
        };

        // An empty interface name means "search every interface here".
        let resolve = |interface: &str, property: &str| -> Option<Arc<ServiceInterface>> {
            if interface.is_empty() {
                at_path
                    .values()
                    .find(|iface| iface.get_property(property).is_ok())
                    .cloned()
            } else {
                at_path.get(interface).cloned()
            }
        };

        let dbus_err = |err: &DBusError| Message::error(msg, &err.name, &err.message);

        match (member, msg.signature.text.as_str()) {
            ("Get", "ss") => {
                let (Some(interface), Some(property)) =
                    (msg.body[0].as_str(), msg.body[1].as_str())
                else {
                    return Message::error(msg, error_names::INVALID_ARGS, "expected (ss)");
                };
                let Some(iface) = resolve(interface, property) else {
                    return Message::error(
                        msg,
                        error_names::UNKNOWN_INTERFACE,
                        &format!("no interface {interface} at {path}"),
                    );
                };
                match iface.get_property_variant(property) {
                    Ok(value) => {
                        Message::method_return(msg)?.with_body("v", vec![value])
                    }
                    Err(err) => dbus_err(&err),
                }
            }
            ("Set", "ssv") => {
                let (Some(interface), Some(property), Some(variant)) = (
                    msg.body[0].as_str(),
                    msg.body[1].as_str(),
                    msg.body[2].as_variant(),
                ) else {
                    return Message::error(msg, error_names::INVALID_ARGS, "expected (ssv)");
                };
                let Some(iface) = resolve(interface, property) else {
                    return Message::error(
                        msg,
                        error_names::UNKNOWN_INTERFACE,
                        &format!("no interface {interface} at {path}"),
                    );
                };
                match iface.set_property(property, variant.value.clone()) {
                    Ok(()) => Message::method_return(msg),
                    Err(err) => dbus_err(&err),
                }
            }
            ("GetAll", "s") => {
                let Some(interface) = msg.body[0].as_str() else {
                    return Message::error(msg, error_names::INVALID_ARGS, "expected (s)");
                };
                let Some(iface) = (if interface.is_empty() {
                    at_path.values().next().cloned()
                } else {
                    at_path.get(interface).cloned()
                }) else {
                    return Message::error(
                        msg,
                        error_names::UNKNOWN_INTERFACE,
                        &format!("no interface {interface} at {path}"),
                    );
                };
                match iface.get_all_properties_as_variants() {
                    Ok(entries) => {
                        let dict = Value::Dict(
                            entries
                                .into_iter()
                                .map(|(name, value)| (Value::String(name), value))
                                .collect(),
                        );
                        Message::method_return(msg)?.with_body("a{sv}", vec![dict])
                    }
                    Err(err) => dbus_err(&err),
                }
            }
            _ => Message::error(
                msg,
                error_names::UNKNOWN_METHOD,
                &format!("{PROPERTIES_INTERFACE} has no method {member} with this signature"),
            ),
        }
    }

    fn handle_get_managed_objects(self: &Arc<Self>, msg: &Message, path: &str) -> Result<Message> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let exports = self.exports.read().expect("not poisoned").clone();
        let mut objects: Vec<(Value, Value)> = Vec::new();
        let mut paths: Vec<&String> = exports
            .keys()
            .filter(|exported| exported.as_str() != path && exported.starts_with(&prefix))
            .collect();
        paths.sort();
        for exported in paths {
            let mut interfaces: Vec<(Value, Value)> = Vec::new();
            let mut names: Vec<&String> = exports[exported.as_str()].keys().collect();
            names.sort();
            for name in names {
                let iface = &exports[exported.as_str()][name.as_str()];
                let properties = match iface.get_all_properties_as_variants() {
                    Ok(entries) => entries,
                    Err(err) => return Message::error(msg, &err.name, &err.message),
                };
                interfaces.push((
                    Value::String(name.clone()),
                    Value::Dict(
                        properties
                            .into_iter()
                            .map(|(prop, value)| (Value::String(prop), value))
                            .collect(),
                    ),
                ));
            }
            objects.push((
                Value::ObjectPath(exported.clone()),
                Value::Dict(interfaces),
            ));
        }
        Message::method_return(msg)?.with_body("a{oa{sa{sv}}}", vec![Value::Dict(objects)])
    }

    async fn dispatch_method_call(self: &Arc<Self>, msg: Arc<Message>) {
        if self.dispatch_standard(&msg).await {
            return;
        }

        let path = msg.path.as_deref().unwrap_or("/");
        let member = msg.member.as_deref().unwrap_or("");

        let Some(at_path) = self.exported_at(path) else {
            let reply = Message::error(
                &msg,
                error_names::UNKNOWN_OBJECT,
                &format!("no object exported at {path}"),
            );
            self.send_reply(&msg, reply).await;
            return;
        };

        // Resolve the interface, accepting a unique member match across all
        // interfaces when the INTERFACE field is unset.
        let iface = match msg.interface.as_deref() {
            Some(interface) => match at_path.get(interface) {
                Some(iface) => Arc::clone(iface),
                None => {
                    let reply = Message::error(
                        &msg,
                        error_names::UNKNOWN_INTERFACE,
                        &format!("no interface {interface} at {path}"),
                    );
                    self.send_reply(&msg, reply).await;
                    return;
                }
            },
            None => {
                let mut matching: Vec<&Arc<ServiceInterface>> = at_path
                    .values()
                    .filter(|iface| iface.find_method(member).is_some())
                    .collect();
                match (matching.len(), matching.pop()) {
                    (1, Some(iface)) => Arc::clone(iface),
                    _ => {
                        let reply = Message::error(
                            &msg,
                            error_names::UNKNOWN_METHOD,
                            &format!("no unique method {member} at {path}"),
                        );
                        self.send_reply(&msg, reply).await;
                        return;
                    }
                }
            }
        };

        let Some(method) = iface.find_method(member) else {
            let reply = Message::error(
                &msg,
                error_names::UNKNOWN_METHOD,
                &format!("interface {} has no method {member}", iface.name()),
            );
            self.send_reply(&msg, reply).await;
            return;
        };

        if method.in_signature.text != msg.signature.text {
            let reply = Message::error(
                &msg,
                error_names::INVALID_ARGS,
                &format!(
                    "method {member} expects '{}', got '{}'",
                    method.in_signature.text, msg.signature.text
                ),
            );
            self.send_reply(&msg, reply).await;
            return;
        }

        // Handlers see `h` arguments as the raw fds that arrived with the
        // message, not wire indexes.
        let fd_numbers: Vec<u32> = msg
            .unix_fds
            .iter()
            .map(|fd| std::os::fd::AsRawFd::as_raw_fd(fd.as_ref()) as u32)
            .collect();
        let args = replace_idx_with_fds(&msg.signature, msg.body.clone(), &fd_numbers);

        let out_signature = method.out_signature.clone();
        let future = method.invoke(MethodCall {
            message: Arc::clone(&msg),
            args,
        });

        // Run the handler in its own task so it may call back into the bus,
        // including awaiting its own method calls.
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            let reply = match outcome {
                Ok(Ok(values)) => build_method_return(&msg, &out_signature, values),
                Ok(Err(dbus_err)) => msg.error_reply(&dbus_err),
                Err(_) => {
                    inner.report_dispatch_error(format!(
                        "method handler panicked for {:?}.{member_label}",
                        msg.interface,
                        member_label = msg.member.as_deref().unwrap_or("")
                    ));
                    Message::error(
                        &msg,
                        error_names::FAILED,
                        "method handler failed",
                    )
                }
            };
            inner.send_reply(&msg, reply).await;
        });
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        trace!(
            serial = msg.serial,
            msg_type = ?msg.message_type,
            sender = ?msg.sender,
            member = ?msg.member,
            "Received message"
        );
        match msg.message_type {
            MessageType::MethodReturn | MessageType::Error => self.dispatch_reply(msg),
            MessageType::Signal => self.dispatch_signal(&msg),
            MessageType::MethodCall => self.dispatch_method_call(Arc::new(msg)).await,
        }
    }

    /// Tear down after the reader exits: fail pending replies, drop
    /// handlers, mark the connection closed.
    fn finalize(&self) {
        {
            let mut state = self.state.lock().expect("not poisoned");
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.writer.shutdown();

        let pending: Vec<_> = {
            let mut pending = self.pending.lock().expect("not poisoned");
            pending.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
        self.matches.lock().expect("not poisoned").entries.clear();
        self.exports.write().expect("not poisoned").clear();
        self.closed.notify_waiters();
        info!("Connection closed");
    }
}

/// Build a METHOD_RETURN for handler output, translating raw fds in the
/// body back into wire indexes and duplicating them into the message.
fn build_method_return(
    call: &Message,
    out_signature: &crate::signature::Signature,
    values: Vec<Value>,
) -> Result<Message> {
    let (values, fds) = replace_fds_with_idx(out_signature, values);
    let mut owned_fds = Vec::with_capacity(fds.len());
    for fd in fds {
        owned_fds.push(duplicate_fd(fd as i32)?);
    }
    Ok(Message::method_return(call)?
        .with_body(&out_signature.text, values)?
        .with_unix_fds(owned_fds))
}

/// Duplicate a caller-held fd so the message owns its own copy.
pub(crate) fn duplicate_fd(fd: i32) -> Result<Arc<OwnedFd>> {
    use std::os::fd::FromRawFd;
    let duped = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_DUPFD_CLOEXEC(0))
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor we now own.
    Ok(Arc::new(unsafe { OwnedFd::from_raw_fd(duped) }))
}

async fn read_loop(inner: Weak<BusInner>, reader: TransportReader) {
    let mut unmarshaller = Unmarshaller::new(reader);
    loop {
        let frame = unmarshaller.read_frame().await;
        let msg = frame.and_then(|(header, rest)| {
            let fds = unmarshaller.reader_mut().take_fds();
            read_message_body(&header, &rest, fds)
        });

        let Some(inner) = inner.upgrade() else {
            // Every handle is gone; nobody can observe this connection.
            return;
        };

        match msg {
            Ok(msg) => inner.dispatch(msg).await,
            Err(Error::Io(e)) => {
                debug!(error = %e, "Transport closed");
                inner.finalize();
                return;
            }
            Err(e) => {
                // A malformed frame leaves the stream alignment unknown;
                // the connection cannot continue.
                error!(error = %e, "Fatal wire error, closing connection");
                inner.finalize();
                return;
            }
        }
    }
}

/// Introspection descriptions of the standard interfaces served at every
/// exported path.
mod standard {
    use crate::introspection::{Arg, Direction, Interface, Method, Signal};

    fn arg(name: &str, direction: Direction, signature: &str) -> Arg {
        Arg {
            name: Some(name.to_string()),
            direction,
            signature: signature.to_string(),
        }
    }

    pub(super) fn peer() -> Interface {
        Interface {
            name: super::PEER_INTERFACE.to_string(),
            methods: vec![
                Method {
                    name: "Ping".to_string(),
                    ..Method::default()
                },
                Method {
                    name: "GetMachineId".to_string(),
                    out_args: vec![arg("machine_uuid", Direction::Out, "s")],
                    ..Method::default()
                },
            ],
            ..Interface::default()
        }
    }

    pub(super) fn introspectable() -> Interface {
        Interface {
            name: super::INTROSPECTABLE_INTERFACE.to_string(),
            methods: vec![Method {
                name: "Introspect".to_string(),
                out_args: vec![arg("xml_data", Direction::Out, "s")],
                ..Method::default()
            }],
            ..Interface::default()
        }
    }

    pub(super) fn properties() -> Interface {
        Interface {
            name: super::PROPERTIES_INTERFACE.to_string(),
            methods: vec![
                Method {
                    name: "Get".to_string(),
                    in_args: vec![
                        arg("interface_name", Direction::In, "s"),
                        arg("property_name", Direction::In, "s"),
                    ],
                    out_args: vec![arg("value", Direction::Out, "v")],
                },
                Method {
                    name: "Set".to_string(),
                    in_args: vec![
                        arg("interface_name", Direction::In, "s"),
                        arg("property_name", Direction::In, "s"),
                        arg("value", Direction::In, "v"),
                    ],
                    ..Method::default()
                },
                Method {
                    name: "GetAll".to_string(),
                    in_args: vec![arg("interface_name", Direction::In, "s")],
                    out_args: vec![arg("properties", Direction::Out, "a{sv}")],
                },
            ],
            signals: vec![Signal {
                name: "PropertiesChanged".to_string(),
                args: vec![
                    arg("interface_name", Direction::Out, "s"),
                    arg("changed_properties", Direction::Out, "a{sv}"),
                    arg("invalidated_properties", Direction::Out, "as"),
                ],
            }],
            ..Interface::default()
        }
    }

    pub(super) fn object_manager() -> Interface {
        Interface {
            name: super::OBJECT_MANAGER_INTERFACE.to_string(),
            methods: vec![Method {
                name: "GetManagedObjects".to_string(),
                out_args: vec![arg(
                    "objpath_interfaces_and_properties",
                    Direction::Out,
                    "a{oa{sa{sv}}}",
                )],
                ..Method::default()
            }],
            signals: vec![
                Signal {
                    name: "InterfacesAdded".to_string(),
                    args: vec![
                        arg("object_path", Direction::Out, "o"),
                        arg("interfaces_and_properties", Direction::Out, "a{sa{sv}}"),
                    ],
                },
                Signal {
                    name: "InterfacesRemoved".to_string(),
                    args: vec![
                        arg("object_path", Direction::Out, "o"),
                        arg("interfaces", Direction::Out, "as"),
                    ],
                },
            ],
            ..Interface::default()
        }
    }
}

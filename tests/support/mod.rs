//! In-process mock D-Bus daemon for integration tests.
//!
//! Speaks the server side of SASL, hands out unique names, answers the
//! daemon methods the client uses (Hello, AddMatch, RequestName, ...), and
//! routes everything else between connections like the real daemon would.
//! Match rules are recorded so tests can assert on AddMatch/RemoveMatch
//! traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use kapsule_dbus_client::error::error_names;
use kapsule_dbus_client::message::{Message, MessageType};
use kapsule_dbus_client::transport::{Transport, TransportWriter};
use kapsule_dbus_client::unmarshal::{read_message_body, Unmarshaller};
use kapsule_dbus_client::value::Value;

const DBUS_SERVICE: &str = "org.freedesktop.DBus";

type SharedWriter = Arc<Mutex<TransportWriter>>;

pub struct DaemonState {
    connections: Mutex<HashMap<String, SharedWriter>>,
    names: Mutex<HashMap<String, String>>,
    pub match_adds: std::sync::Mutex<Vec<String>>,
    pub match_removes: std::sync::Mutex<Vec<String>>,
    next_connection: AtomicU64,
    serials: AtomicU32,
}

pub struct MockDaemon {
    pub address: String,
    pub state: Arc<DaemonState>,
    _dir: tempfile::TempDir,
}

impl MockDaemon {
    pub async fn start() -> MockDaemon {
        let dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = dir.path().join("bus.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind daemon socket");
        let state = Arc::new(DaemonState {
            connections: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            match_adds: std::sync::Mutex::new(Vec::new()),
            match_removes: std::sync::Mutex::new(Vec::new()),
            next_connection: AtomicU64::new(0),
            serials: AtomicU32::new(1),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle_connection(state, stream).await;
                });
            }
        });

        MockDaemon {
            address: format!("unix:path={}", socket_path.display()),
            state,
            _dir: dir,
        }
    }

    /// AddMatch rules containing the given fragment, in arrival order.
    pub fn adds_containing(&self, fragment: &str) -> Vec<String> {
        self.state
            .match_adds
            .lock()
            .unwrap()
            .iter()
            .filter(|rule| rule.contains(fragment))
            .cloned()
            .collect()
    }

    /// RemoveMatch rules containing the given fragment.
    pub fn removes_containing(&self, fragment: &str) -> Vec<String> {
        self.state
            .match_removes
            .lock()
            .unwrap()
            .iter()
            .filter(|rule| rule.contains(fragment))
            .cloned()
            .collect()
    }
}

async fn server_auth(transport: &mut Transport) -> std::io::Result<()> {
    let mut byte = [0u8; 1];
    transport.read_exact(&mut byte).await?;
    assert_eq!(byte[0], 0, "auth must start with a NUL byte");

    loop {
        let mut line = Vec::new();
        loop {
            transport.read_exact(&mut byte).await?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let line = String::from_utf8_lossy(&line).into_owned();

        if line.starts_with("AUTH ") {
            transport.write_all(b"OK 0123456789abcdef0123456789abcdef\r\n").await?;
        } else if line == "NEGOTIATE_UNIX_FD" {
            transport.write_all(b"AGREE_UNIX_FD\r\n").await?;
        } else if line == "BEGIN" {
            return Ok(());
        } else {
            transport.write_all(b"ERROR\r\n").await?;
        }
    }
}

async fn handle_connection(state: Arc<DaemonState>, stream: UnixStream) -> std::io::Result<()> {
    let mut transport = Transport::from_unix_stream(stream);
    server_auth(&mut transport).await?;

    let unique = format!(":1.{}", state.next_connection.fetch_add(1, Ordering::Relaxed));
    let (reader, writer) = transport.split();
    let writer = Arc::new(Mutex::new(writer));
    state
        .connections
        .lock()
        .await
        .insert(unique.clone(), Arc::clone(&writer));

    let mut unmarshaller = Unmarshaller::new(reader);
    loop {
        let frame = unmarshaller.read_frame().await;
        let Ok((header, rest)) = frame else {
            break;
        };
        let fds = unmarshaller.reader_mut().take_fds();
        let Ok(mut msg) = read_message_body(&header, &rest, fds) else {
            break;
        };
        msg.sender = Some(unique.clone());
        route(&state, &unique, msg).await;
    }

    state.connections.lock().await.remove(&unique);
    state
        .names
        .lock()
        .await
        .retain(|_, owner| owner != &unique);
    Ok(())
}

async fn deliver(writer: &SharedWriter, msg: &Message) {
    if let Ok(bytes) = msg.serialize() {
        let writer = writer.lock().await;
        let _ = writer.write_all(&bytes, &msg.unix_fds).await;
    }
}

async fn send_to_connection(state: &DaemonState, unique: &str, msg: &Message) {
    let writer = state.connections.lock().await.get(unique).cloned();
    if let Some(writer) = writer {
        deliver(&writer, msg).await;
    }
}

fn daemon_serial(state: &DaemonState) -> u32 {
    state.serials.fetch_add(1, Ordering::Relaxed)
}

async fn daemon_reply(state: &DaemonState, unique: &str, mut reply: Message) {
    reply.sender = Some(DBUS_SERVICE.to_string());
    reply.serial = daemon_serial(state);
    send_to_connection(state, unique, &reply).await;
}

async fn handle_daemon_call(state: &DaemonState, unique: &str, msg: Message) {
    let member = msg.member.as_deref().unwrap_or("");
    let reply = match member {
        "Hello" => Message::method_return(&msg)
            .and_then(|r| r.with_body("s", vec![Value::String(unique.to_string())])),
        "AddMatch" => {
            if let Some(rule) = msg.body.first().and_then(Value::as_str) {
                state.match_adds.lock().unwrap().push(rule.to_string());
            }
            Message::method_return(&msg)
        }
        "RemoveMatch" => {
            if let Some(rule) = msg.body.first().and_then(Value::as_str) {
                state.match_removes.lock().unwrap().push(rule.to_string());
            }
            Message::method_return(&msg)
        }
        "RequestName" => {
            if let Some(name) = msg.body.first().and_then(Value::as_str) {
                state
                    .names
                    .lock()
                    .await
                    .insert(name.to_string(), unique.to_string());
            }
            Message::method_return(&msg).and_then(|r| r.with_body("u", vec![Value::Uint32(1)]))
        }
        "ReleaseName" => {
            if let Some(name) = msg.body.first().and_then(Value::as_str) {
                state.names.lock().await.remove(name);
            }
            Message::method_return(&msg).and_then(|r| r.with_body("u", vec![Value::Uint32(1)]))
        }
        "GetNameOwner" => {
            let name = msg.body.first().and_then(Value::as_str).unwrap_or("");
            match state.names.lock().await.get(name) {
                Some(owner) => Message::method_return(&msg)
                    .and_then(|r| r.with_body("s", vec![Value::String(owner.clone())])),
                None => Message::error(
                    &msg,
                    error_names::NAME_HAS_NO_OWNER,
                    &format!("no owner for {name}"),
                ),
            }
        }
        "Ping" => Message::method_return(&msg),
        _ => Message::error(
            &msg,
            error_names::UNKNOWN_METHOD,
            &format!("mock daemon does not implement {member}"),
        ),
    };
    if let Ok(reply) = reply {
        daemon_reply(state, unique, reply).await;
    }
}

async fn route(state: &DaemonState, sender_unique: &str, msg: Message) {
    if msg.message_type == MessageType::Signal {
        // Broadcast to every other connection; clients filter locally.
        let writers: Vec<SharedWriter> = state
            .connections
            .lock()
            .await
            .iter()
            .filter(|(unique, _)| unique.as_str() != sender_unique)
            .map(|(_, writer)| Arc::clone(writer))
            .collect();
        for writer in writers {
            deliver(&writer, &msg).await;
        }
        return;
    }

    match msg.destination.as_deref() {
        Some(DBUS_SERVICE) => handle_daemon_call(state, sender_unique, msg).await,
        Some(dest) => {
            let target = if dest.starts_with(':') {
                Some(dest.to_string())
            } else {
                state.names.lock().await.get(dest).cloned()
            };
            match target {
                Some(unique) => send_to_connection(state, &unique, &msg).await,
                None => {
                    if msg.reply_expected() {
                        if let Ok(reply) = Message::error(
                            &msg,
                            error_names::SERVICE_UNKNOWN,
                            &format!("no such service: {dest}"),
                        ) {
                            daemon_reply(state, sender_unique, reply).await;
                        }
                    }
                }
            }
        }
        None => {}
    }
}

/// A raw peer that authenticates, says Hello, optionally claims a name, and
/// then ignores every incoming message. Used to test pending calls that
/// never get a reply.
pub struct SilentPeer {
    pub unique_name: String,
    _task: tokio::task::JoinHandle<()>,
}

impl SilentPeer {
    pub async fn connect(address: &str, request_name: Option<&str>) -> SilentPeer {
        let entries = kapsule_dbus_client::address::parse_address(address).expect("parse address");
        let endpoint = entries[0].endpoint().expect("endpoint");
        let mut transport = Transport::connect(&endpoint).await.expect("connect");

        let mut authenticator = kapsule_dbus_client::auth::Authenticator::new();
        authenticator
            .authenticate(&mut transport, false)
            .await
            .expect("authenticate");

        let (reader, writer) = transport.split();
        let mut unmarshaller = Unmarshaller::new(reader);

        let mut hello = Message::method_call(DBUS_SERVICE, "/org/freedesktop/DBus", "Hello")
            .expect("hello")
            .with_interface(DBUS_SERVICE)
            .expect("hello interface");
        hello.serial = 1;
        writer
            .write_all(&hello.serialize().expect("serialize"), &[])
            .await
            .expect("send hello");
        let reply = unmarshaller.read_message(Vec::new()).await.expect("hello reply");
        let unique_name = reply
            .body
            .first()
            .and_then(Value::as_str)
            .expect("unique name")
            .to_string();

        if let Some(name) = request_name {
            let mut request = Message::method_call(DBUS_SERVICE, "/org/freedesktop/DBus", "RequestName")
                .expect("request name")
                .with_interface(DBUS_SERVICE)
                .expect("interface")
                .with_body("su", vec![Value::String(name.to_string()), Value::Uint32(0)])
                .expect("body");
            request.serial = 2;
            writer
                .write_all(&request.serialize().expect("serialize"), &[])
                .await
                .expect("send request");
            unmarshaller
                .read_message(Vec::new())
                .await
                .expect("request reply");
        }

        // Swallow everything from here on.
        let task = tokio::spawn(async move {
            loop {
                if unmarshaller.read_frame().await.is_err() {
                    return;
                }
                let _ = unmarshaller.reader_mut().take_fds();
            }
        });

        SilentPeer {
            unique_name,
            _task: task,
        }
    }
}

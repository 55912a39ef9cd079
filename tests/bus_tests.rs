//! End-to-end tests against the in-process mock daemon.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use kapsule_dbus_client::error::{error_names, DBusError, Error};
use kapsule_dbus_client::match_rules::MatchRule;
use kapsule_dbus_client::message::Message;
use kapsule_dbus_client::service::ServiceInterface;
use kapsule_dbus_client::value::Value;
use kapsule_dbus_client::{ConnectionState, MessageBus, RequestNameFlags, RequestNameReply};

use support::{MockDaemon, SilentPeer};

async fn connect(daemon: &MockDaemon) -> MessageBus {
    MessageBus::connect_address(&daemon.address)
        .await
        .expect("connect to mock daemon")
}

fn echo_interface() -> ServiceInterface {
    ServiceInterface::new("com.example.Echo")
        .unwrap()
        .method("Echo", "s", "s", |call| async move { Ok(call.args) })
        .unwrap()
        .method("Boom", "", "", |_call| async move {
            Err(DBusError::new("com.example.Boom", "nope"))
        })
        .unwrap()
        .method("ReadFd", "h", "s", |call| async move {
            let Value::UnixFd(fd) = call.args[0] else {
                return Err(DBusError::new(error_names::INVALID_ARGS, "expected an fd"));
            };
            // Borrow the received descriptor without taking ownership; the
            // message keeps it open.
            use std::io::Read;
            use std::os::fd::FromRawFd;
            let mut file =
                std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd as i32) });
            let mut content = String::new();
            file.read_to_string(&mut content)
                .map_err(|e| DBusError::new(error_names::FAILED, e.to_string()))?;
            Ok(vec![Value::String(content)])
        })
        .unwrap()
        .readonly_property("Version", "u", || Ok(Value::Uint32(7)))
        .unwrap()
}

/// The first exchange on any connection is Hello, and the reply is a unique
/// name of the `:N.N` shape.
#[tokio::test]
async fn test_hello_assigns_unique_name() {
    let daemon = MockDaemon::start().await;
    let bus = connect(&daemon).await;

    let name = bus.unique_name().expect("unique name recorded");
    let rest = name.strip_prefix(':').expect("unique names start with ':'");
    let (a, b) = rest.split_once('.').expect("unique names contain a dot");
    assert!(a.chars().all(|c| c.is_ascii_digit()));
    assert!(b.chars().all(|c| c.is_ascii_digit()));
    assert!(bus.connected());
}

#[tokio::test]
async fn test_echo_round_trip_via_proxy() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    service.export("/com/example", echo_interface()).unwrap();
    assert_eq!(
        service
            .request_name("com.example.Echo", RequestNameFlags::NONE)
            .await
            .unwrap(),
        RequestNameReply::PrimaryOwner
    );

    let node = client.introspect("com.example.Echo", "/com/example").await.unwrap();
    let proxy = client
        .get_proxy_object("com.example.Echo", "/com/example", node)
        .unwrap();
    let iface = proxy.interface("com.example.Echo").unwrap();

    for text in ["", "hello", "λ→π"] {
        let reply = iface.call("Echo", vec![Value::from(text)]).await.unwrap();
        assert_eq!(reply.args, vec![Value::from(text)]);
    }
}

#[tokio::test]
async fn test_error_reply_surfaces_name_and_message() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    service.export("/com/example", echo_interface()).unwrap();
    service
        .request_name("com.example.Echo", RequestNameFlags::NONE)
        .await
        .unwrap();

    let node = client.introspect("com.example.Echo", "/com/example").await.unwrap();
    let proxy = client
        .get_proxy_object("com.example.Echo", "/com/example", node)
        .unwrap();
    let iface = proxy.interface("com.example.Echo").unwrap();

    let err = iface.call("Boom", vec![]).await.unwrap_err();
    match err {
        Error::DBus(err) => {
            assert_eq!(err.name, "com.example.Boom");
            assert_eq!(err.message, "nope");
        }
        other => panic!("expected a DBus error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_method_and_interface_errors() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    service.export("/com/example", echo_interface()).unwrap();
    service
        .request_name("com.example.Echo", RequestNameFlags::NONE)
        .await
        .unwrap();

    let call = |interface: &str, member: &str, path: &str| {
        let msg = Message::method_call("com.example.Echo", path, member)
            .unwrap()
            .with_interface(interface)
            .unwrap();
        client.call(msg)
    };

    let err = call("com.example.Echo", "Nope", "/com/example").await.unwrap_err();
    let Error::DBus(err) = err else { panic!() };
    assert_eq!(err.name, error_names::UNKNOWN_METHOD);

    let err = call("com.example.Other", "Echo", "/com/example").await.unwrap_err();
    let Error::DBus(err) = err else { panic!() };
    assert_eq!(err.name, error_names::UNKNOWN_INTERFACE);

    let err = call("com.example.Echo", "Echo", "/wrong/path").await.unwrap_err();
    let Error::DBus(err) = err else { panic!() };
    assert_eq!(err.name, error_names::UNKNOWN_OBJECT);
}

#[tokio::test]
async fn test_signal_routing_invokes_handler_exactly_once() {
    let daemon = MockDaemon::start().await;
    let receiver = connect(&daemon).await;
    let emitter = connect(&daemon).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let rule =
        MatchRule::parse("type='signal',interface='com.example',member='Ping'").unwrap();
    receiver
        .add_match(rule, move |msg| {
            tx.send(msg.body.clone()).unwrap();
        })
        .await
        .unwrap();

    emitter
        .emit_signal("/anywhere", "com.example", "Ping", "s", vec![Value::from("x")])
        .await
        .unwrap();
    // A signal that must not match.
    emitter
        .emit_signal("/anywhere", "com.example", "Pong", "s", vec![Value::from("y")])
        .await
        .unwrap();

    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("signal delivered")
        .unwrap();
    assert_eq!(body, vec![Value::from("x")]);
    assert!(rx.try_recv().is_err(), "handler must fire exactly once");
}

#[tokio::test]
async fn test_add_match_refcount_coalesces_daemon_traffic() {
    let daemon = MockDaemon::start().await;
    let bus = connect(&daemon).await;

    let rule = MatchRule::parse("type='signal',interface='com.example',member='Counted'")
        .unwrap();
    let canonical = rule.canonical_string();

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(bus.add_match(rule.clone(), |_| {}).await.unwrap());
    }
    assert_eq!(daemon.adds_containing("Counted"), vec![canonical.clone()]);

    for handle in handles {
        bus.remove_match(handle).await.unwrap();
    }
    assert_eq!(daemon.removes_containing("Counted"), vec![canonical]);
}

#[tokio::test]
async fn test_panicking_signal_callback_does_not_kill_the_bus() {
    let daemon = MockDaemon::start().await;
    let receiver = connect(&daemon).await;
    let emitter = connect(&daemon).await;

    let hook_hits = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&hook_hits);
    receiver.set_dispatch_error_hook(move |_| {
        hook_counter.fetch_add(1, Ordering::SeqCst);
    });

    let rule = MatchRule::parse("type='signal',member='Explode'").unwrap();
    receiver
        .add_match(rule, |_| panic!("callback bug"))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let rule = MatchRule::parse("type='signal',member='Survive'").unwrap();
    receiver
        .add_match(rule, move |_| {
            tx.send(()).unwrap();
        })
        .await
        .unwrap();

    emitter
        .emit_signal("/t", "com.example", "Explode", "", vec![])
        .await
        .unwrap();
    emitter
        .emit_signal("/t", "com.example", "Survive", "", vec![])
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bus still dispatching after a panicking callback")
        .unwrap();
    assert_eq!(hook_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unix_fd_passing() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;
    assert!(service.supports_unix_fd());
    assert!(client.supports_unix_fd());

    service.export("/com/example", echo_interface()).unwrap();
    service
        .request_name("com.example.Echo", RequestNameFlags::NONE)
        .await
        .unwrap();

    let node = client.introspect("com.example.Echo", "/com/example").await.unwrap();
    let proxy = client
        .get_proxy_object("com.example.Echo", "/com/example", node)
        .unwrap();
    let iface = proxy.interface("com.example.Echo").unwrap();

    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    {
        use std::io::Write;
        use std::os::fd::IntoRawFd;
        let mut file = unsafe {
            use std::os::fd::FromRawFd;
            std::fs::File::from_raw_fd(write_end.into_raw_fd())
        };
        file.write_all(b"through the pipe").unwrap();
        // Dropping the file closes the write end so the service sees EOF.
    }

    use std::os::fd::AsRawFd;
    let raw_read = read_end.as_raw_fd();
    let reply = iface
        .call("ReadFd", vec![Value::UnixFd(raw_read as u32)])
        .await
        .unwrap();
    assert_eq!(reply.args, vec![Value::from("through the pipe")]);

    // The caller's descriptor was duplicated for sending, so the original
    // is still valid.
    assert!(nix::fcntl::fcntl(raw_read, nix::fcntl::FcntlArg::F_GETFD).is_ok());
    drop(read_end);
}

#[tokio::test]
async fn test_properties_over_the_wire() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    service.export("/com/example", echo_interface()).unwrap();
    service
        .request_name("com.example.Echo", RequestNameFlags::NONE)
        .await
        .unwrap();

    let node = client.introspect("com.example.Echo", "/com/example").await.unwrap();
    let proxy = client
        .get_proxy_object("com.example.Echo", "/com/example", node)
        .unwrap();
    let iface = proxy.interface("com.example.Echo").unwrap();

    assert_eq!(iface.get_property("Version").await.unwrap(), Value::Uint32(7));
    let all = iface.get_all_properties().await.unwrap();
    assert_eq!(all, vec![("Version".to_string(), Value::Uint32(7))]);

    let err = iface
        .set_property("Version", Value::Uint32(8))
        .await
        .unwrap_err();
    let Error::DBus(err) = err else { panic!() };
    assert_eq!(err.name, error_names::PROPERTY_READ_ONLY);
}

#[tokio::test]
async fn test_disconnect_fails_pending_and_subsequent_sends() {
    let daemon = MockDaemon::start().await;
    let bus = connect(&daemon).await;
    let _silent = SilentPeer::connect(&daemon.address, Some("test.silent")).await;

    let call = Message::method_call("test.silent", "/quiet", "Never")
        .unwrap()
        .with_interface("test.silent.Iface")
        .unwrap();
    let pending = bus.send(call).await.unwrap().expect("reply expected");

    let closer = bus.clone();
    tokio::spawn(async move {
        closer.disconnect().await;
    });

    let err = tokio::time::timeout(Duration::from_secs(5), pending.wait())
        .await
        .expect("pending call fails promptly on disconnect")
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    assert_eq!(bus.state(), ConnectionState::Closed);

    let call = Message::method_call("test.silent", "/quiet", "Never").unwrap();
    let err = bus.send(call).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn test_call_timeout_maps_to_no_reply() {
    let daemon = MockDaemon::start().await;
    let bus = connect(&daemon).await;
    let _silent = SilentPeer::connect(&daemon.address, Some("test.sleepy")).await;

    let call = Message::method_call("test.sleepy", "/quiet", "Never")
        .unwrap()
        .with_interface("test.sleepy.Iface")
        .unwrap();
    let err = bus
        .call_with_timeout(call, Duration::from_millis(50))
        .await
        .unwrap_err();
    let Error::DBus(err) = err else {
        panic!("expected a DBus NoReply error");
    };
    assert_eq!(err.name, error_names::NO_REPLY);
}

#[tokio::test]
async fn test_cancel_removes_pending_entry() {
    let daemon = MockDaemon::start().await;
    let bus = connect(&daemon).await;
    let silent = SilentPeer::connect(&daemon.address, Some("test.mute")).await;

    let call = Message::method_call("test.mute", "/quiet", "Never")
        .unwrap()
        .with_interface("test.mute.Iface")
        .unwrap();
    let pending = bus.send(call).await.unwrap().expect("reply expected");
    pending.cancel();

    // The connection is still usable after a cancel.
    let name = bus.get_name_owner("test.mute").await.unwrap();
    assert_eq!(name, silent.unique_name);
}

#[tokio::test]
async fn test_reexport_same_interface_rejected() {
    let daemon = MockDaemon::start().await;
    let bus = connect(&daemon).await;

    bus.export("/obj", echo_interface()).unwrap();
    let err = bus.export("/obj", echo_interface()).unwrap_err();
    assert!(matches!(err, Error::AlreadyExported { .. }));

    bus.unexport("/obj").unwrap();
    bus.export("/obj", echo_interface()).unwrap();
}

#[tokio::test]
async fn test_introspection_lists_children_and_standard_interfaces() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    service.export("/com/example/a", echo_interface()).unwrap();
    service
        .request_name("com.example.Tree", RequestNameFlags::NONE)
        .await
        .unwrap();

    let root = client.introspect("com.example.Tree", "/com/example").await.unwrap();
    assert_eq!(root.nodes.len(), 1);
    assert_eq!(root.nodes[0].name.as_deref(), Some("a"));

    let leaf = client.introspect("com.example.Tree", "/com/example/a").await.unwrap();
    assert!(leaf.interface("com.example.Echo").is_some());
    assert!(leaf.interface("org.freedesktop.DBus.Peer").is_some());
    assert!(leaf.interface("org.freedesktop.DBus.Properties").is_some());
}

#[tokio::test]
async fn test_signal_subscription_via_proxy() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    let iface = echo_interface().signal("Echoed", "s").unwrap();
    service.export("/com/example", iface).unwrap();
    service
        .request_name("com.example.Echo", RequestNameFlags::NONE)
        .await
        .unwrap();

    let node = client.introspect("com.example.Echo", "/com/example").await.unwrap();
    let proxy = client
        .get_proxy_object("com.example.Echo", "/com/example", node)
        .unwrap();
    let proxy_iface = proxy.interface("com.example.Echo").unwrap();

    // Subscribing to an undeclared signal is rejected up front.
    assert!(matches!(
        proxy_iface.subscribe_signal("NotDeclared", |_| {}).await,
        Err(Error::SignalDisabled(_))
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = proxy_iface
        .subscribe_signal("Echoed", move |msg| {
            tx.send(msg.body.clone()).unwrap();
        })
        .await
        .unwrap();

    service
        .emit_signal(
            "/com/example",
            "com.example.Echo",
            "Echoed",
            "s",
            vec![Value::from("ping")],
        )
        .await
        .unwrap();

    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("signal delivered")
        .unwrap();
    assert_eq!(body, vec![Value::from("ping")]);

    proxy_iface.unsubscribe_signal(subscription).await.unwrap();
}

#[tokio::test]
async fn test_proxy_validates_arguments_before_send() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    service.export("/com/example", echo_interface()).unwrap();
    service
        .request_name("com.example.Echo", RequestNameFlags::NONE)
        .await
        .unwrap();

    let node = client.introspect("com.example.Echo", "/com/example").await.unwrap();
    let proxy = client
        .get_proxy_object("com.example.Echo", "/com/example", node)
        .unwrap();
    let iface = proxy.interface("com.example.Echo").unwrap();

    // Wrong arity and wrong type are both rejected locally.
    assert!(matches!(
        iface.call("Echo", vec![]).await,
        Err(Error::BodyMismatch(_))
    ));
    assert!(matches!(
        iface.call("Echo", vec![Value::Uint32(1)]).await,
        Err(Error::BodyMismatch(_))
    ));
    assert!(matches!(
        iface.call("NoSuchMethod", vec![]).await,
        Err(Error::InvalidMemberName(_))
    ));

    // An unknown interface is caught at proxy construction.
    assert!(matches!(
        proxy.interface("com.example.Missing"),
        Err(Error::InterfaceNotFound(_))
    ));
}

#[tokio::test]
async fn test_proxy_fails_cleanly_after_bus_closes() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    service.export("/com/example", echo_interface()).unwrap();
    service
        .request_name("com.example.Echo", RequestNameFlags::NONE)
        .await
        .unwrap();

    let node = client.introspect("com.example.Echo", "/com/example").await.unwrap();
    let proxy = client
        .get_proxy_object("com.example.Echo", "/com/example", node)
        .unwrap();
    let iface = proxy.interface("com.example.Echo").unwrap();

    client.disconnect().await;
    drop(client);

    let err = iface.call("Echo", vec![Value::from("x")]).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn test_no_reply_expected_suppresses_reply() {
    let daemon = MockDaemon::start().await;
    let service = connect(&daemon).await;
    let client = connect(&daemon).await;

    service.export("/com/example", echo_interface()).unwrap();
    service
        .request_name("com.example.Echo", RequestNameFlags::NONE)
        .await
        .unwrap();

    use kapsule_dbus_client::message::MessageFlags;
    let msg = Message::method_call("com.example.Echo", "/com/example", "Echo")
        .unwrap()
        .with_interface("com.example.Echo")
        .unwrap()
        .with_body("s", vec![Value::from("fire and forget")])
        .unwrap()
        .with_flags(MessageFlags::NO_REPLY_EXPECTED);

    let pending = client.send(msg).await.unwrap();
    assert!(pending.is_none());

    // No stray reply shows up: a dropped reply would bump the counter.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.dropped_replies(), 0);
}

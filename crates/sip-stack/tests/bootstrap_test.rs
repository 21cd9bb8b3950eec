//! End-to-end tests for the transport bootstrap
//!
//! These bind real sockets on 127.0.0.1 and drive them with plain tokio
//! clients, checking what the shared observer receives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

use gbsip_sip_stack::{
    ChannelObserver, EngineHandle, EngineOptions, SipEvent, SipEventKind, SipObserver,
    StackConfigurator, TransportBootstrapper, TransportError, TransportKind,
};

const MESSAGE: &[u8] = b"MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
    Via: SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bK-keepalive\r\n\
    Content-Type: Application/MANSCDP+xml\r\n\
    Content-Length: 4\r\n\r\n<a/>";

/// A port that is free for both TCP and UDP on loopback
fn free_port() -> u16 {
    loop {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = tcp.local_addr().unwrap().port();
        if std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

fn configure() -> EngineHandle {
    StackConfigurator::new()
        .configure(EngineOptions::new("127.0.0.1"))
        .expect("engine should configure")
}

fn channel_observer() -> (Arc<dyn SipObserver>, mpsc::UnboundedReceiver<SipEvent>) {
    let (observer, events) = ChannelObserver::new();
    (Arc::new(observer), events)
}

fn same_observer(a: &Arc<dyn SipObserver>, b: &Arc<dyn SipObserver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Waits for the first event matching `pred`, skipping the others
async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<SipEvent>, pred: F) -> SipEvent
where
    F: Fn(&SipEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("observer channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_both_transports_share_observer() {
    let engine = configure();
    let port = free_port();
    let (observer, _events) = channel_observer();

    let running = TransportBootstrapper::new(&engine).bootstrap("127.0.0.1", port, &observer);

    let tcp = running.endpoint(TransportKind::Stream).expect("TCP should start");
    let udp = running.endpoint(TransportKind::Datagram).expect("UDP should start");
    assert_eq!(tcp.port(), port);
    assert_eq!(udp.port(), port);
    assert_eq!(tcp.local_addr(), udp.local_addr());

    assert!(same_observer(tcp.listener().unwrap(), &observer));
    assert!(same_observer(udp.listener().unwrap(), &observer));

    assert!(tcp.dialog_errors_automatically_handled());
    assert!(!udp.dialog_errors_automatically_handled());

    assert!(tcp.engine().unwrap().ptr_eq(&engine));
    assert_eq!(engine.listening_point_count(), 2);

    running.close_all().await;
    assert_eq!(engine.listening_point_count(), 0);
}

#[tokio::test]
async fn test_tcp_failure_does_not_affect_udp() {
    let engine = configure();
    let port = free_port();
    let _occupied = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    let (observer, _events) = channel_observer();
    let bootstrapper = TransportBootstrapper::new(&engine);

    let tcp = bootstrapper.start_transport(TransportKind::Stream, "127.0.0.1", port, &observer);
    assert!(matches!(tcp, Err(TransportError::InvalidBindTarget { port: p, .. }) if p == port));

    let udp = bootstrapper
        .start_transport(TransportKind::Datagram, "127.0.0.1", port, &observer)
        .expect("UDP should start even though TCP failed");
    assert_eq!(udp.transport_kind(), TransportKind::Datagram);
    assert_eq!(engine.listening_point_count(), 1);

    udp.close().await;
}

#[tokio::test]
async fn test_udp_failure_does_not_affect_tcp() {
    let engine = configure();
    let port = free_port();
    let _occupied = std::net::UdpSocket::bind(("127.0.0.1", port)).unwrap();
    let (observer, _events) = channel_observer();

    let running = TransportBootstrapper::new(&engine).bootstrap("127.0.0.1", port, &observer);

    assert!(running.endpoint(TransportKind::Stream).is_some());
    assert!(running.endpoint(TransportKind::Datagram).is_none());
    assert_eq!(running.failures().len(), 1);
    assert_eq!(running.failures()[0].error.kind(), Some(TransportKind::Datagram));

    running.close_all().await;
}

#[tokio::test]
async fn test_same_kind_twice_is_busy() {
    let engine = configure();
    let port = free_port();
    let (observer, _events) = channel_observer();
    let bootstrapper = TransportBootstrapper::new(&engine);

    let first = bootstrapper
        .start_transport(TransportKind::Datagram, "127.0.0.1", port, &observer)
        .unwrap();
    let second = bootstrapper.start_transport(TransportKind::Datagram, "127.0.0.1", port, &observer);
    assert!(matches!(second, Err(TransportError::ResourceBusy { .. })));

    first.close().await;
}

#[tokio::test]
async fn test_invalid_bind_targets() {
    let engine = configure();
    let (observer, _events) = channel_observer();
    let bootstrapper = TransportBootstrapper::new(&engine);

    let port_zero = bootstrapper.start_transport(TransportKind::Stream, "127.0.0.1", 0, &observer);
    assert!(matches!(port_zero, Err(TransportError::InvalidBindTarget { .. })));

    // TEST-NET-1 is never assigned to a local interface
    let foreign = bootstrapper.start_transport(TransportKind::Datagram, "192.0.2.1", free_port(), &observer);
    assert!(matches!(foreign, Err(TransportError::InvalidBindTarget { .. })));

    assert_eq!(engine.listening_point_count(), 0);
}

#[tokio::test]
async fn test_second_listener_is_rejected() {
    let engine = configure();
    let port = free_port();
    let (observer, _events) = channel_observer();

    let endpoint = TransportBootstrapper::new(&engine)
        .start_transport(TransportKind::Datagram, "127.0.0.1", port, &observer)
        .unwrap();

    let (other, _other_events) = channel_observer();
    assert!(matches!(
        endpoint.add_listener(other),
        Err(TransportError::ResourceExhausted { .. })
    ));
    assert!(same_observer(endpoint.listener().unwrap(), &observer));

    endpoint.close().await;
}

#[tokio::test]
async fn test_inbound_messages_reach_observer_from_both_transports() {
    let engine = configure();
    let port = free_port();
    let (observer, mut events) = channel_observer();
    let running = TransportBootstrapper::new(&engine).bootstrap("127.0.0.1", port, &observer);
    let target: SocketAddr = ([127, 0, 0, 1], port).into();

    let udp_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp_peer.send_to(MESSAGE, target).await.unwrap();
    let event = wait_for(&mut events, |e| {
        e.transport == TransportKind::Datagram && matches!(e.kind, SipEventKind::Message { .. })
    })
    .await;
    assert_eq!(event.payload().unwrap().as_ref(), MESSAGE);
    assert_eq!(event.local_addr, target);

    let mut tcp_peer = TcpStream::connect(target).await.unwrap();
    let tcp_addr = tcp_peer.local_addr().unwrap();
    tcp_peer.write_all(MESSAGE).await.unwrap();
    let event = wait_for(&mut events, |e| {
        e.transport == TransportKind::Stream && matches!(e.kind, SipEventKind::Message { .. })
    })
    .await;
    match event.kind {
        SipEventKind::Message { payload, source } => {
            assert_eq!(payload.as_ref(), MESSAGE);
            assert_eq!(source, tcp_addr);
        }
        other => panic!("Expected message, got {:?}", other),
    }

    // Outbound through the UDP endpoint
    let udp = running.endpoint(TransportKind::Datagram).unwrap();
    udp.send(Bytes::from_static(b"SIP/2.0 200 OK\r\n\r\n"), udp_peer.local_addr().unwrap())
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = timeout(Duration::from_secs(5), udp_peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"SIP/2.0 200 OK\r\n\r\n");
    assert_eq!(from, target);

    running.close_all().await;
    wait_for(&mut events, |e| matches!(e.kind, SipEventKind::EndpointClosed)).await;
}

#[tokio::test]
async fn test_broken_stream_connection_is_handled_automatically() {
    let engine = configure();
    let port = free_port();
    let (observer, mut events) = channel_observer();
    let tcp = TransportBootstrapper::new(&engine)
        .start_transport(TransportKind::Stream, "127.0.0.1", port, &observer)
        .unwrap();

    let mut peer = TcpStream::connect(tcp.local_addr()).await.unwrap();
    peer.write_all(b"INVITE sip:a@b SIP/2.0\r\nContent-Length: x\r\n\r\n").await.unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e.kind, SipEventKind::DialogErrorHandled { .. } | SipEventKind::IoError { .. })
    })
    .await;
    assert!(matches!(event.kind, SipEventKind::DialogErrorHandled { .. }));

    tcp.close().await;
}

#[tokio::test]
async fn test_broken_connection_without_auto_handling_reaches_observer() {
    let engine = configure();
    let port = free_port();
    let (observer, mut events) = channel_observer();

    // Built by hand, so no transport policy is applied
    let point = engine
        .create_listening_point("127.0.0.1", port, TransportKind::Stream)
        .unwrap();
    let endpoint = engine.create_endpoint(&point).unwrap();
    endpoint.add_listener(observer).unwrap();
    assert!(!endpoint.dialog_errors_automatically_handled());

    let mut peer = TcpStream::connect(endpoint.local_addr()).await.unwrap();
    let peer_addr = peer.local_addr().unwrap();
    peer.write_all(b"INVITE sip:a@b SIP/2.0\r\nContent-Length: x\r\n\r\n").await.unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e.kind, SipEventKind::DialogErrorHandled { .. } | SipEventKind::IoError { .. })
    })
    .await;
    match event.kind {
        SipEventKind::IoError { peer, .. } => assert_eq!(peer, Some(peer_addr)),
        other => panic!("Expected IoError, got {:?}", other),
    }

    endpoint.close().await;
}

#[tokio::test]
async fn test_closure_observer() {
    let engine = configure();
    let port = free_port();
    let (tx, mut rx) = mpsc::unbounded_channel::<TransportKind>();
    let observer: Arc<dyn SipObserver> = Arc::new(move |event: SipEvent| {
        let _ = tx.send(event.transport);
    });

    let udp = TransportBootstrapper::new(&engine)
        .start_transport(TransportKind::Datagram, "127.0.0.1", port, &observer)
        .unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(MESSAGE, udp.local_addr()).await.unwrap();

    let kind = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(kind, TransportKind::Datagram);

    udp.close().await;
}

#[tokio::test]
async fn test_closed_endpoint_can_be_bound_again() {
    let engine = configure();
    let port = free_port();
    let (observer, _events) = channel_observer();
    let bootstrapper = TransportBootstrapper::new(&engine);

    let running = bootstrapper.bootstrap("127.0.0.1", port, &observer);
    assert_eq!(running.endpoints().len(), 2);
    running.close_all().await;

    // Sockets are released by the time close returns
    let again = bootstrapper.bootstrap("127.0.0.1", port, &observer);
    assert_eq!(again.endpoints().len(), 2);
    assert!(again.failures().is_empty());

    again.close_all().await;
}

#[tokio::test]
async fn test_engine_shutdown_after_endpoints() {
    let engine = configure();
    let port = free_port();
    let (observer, _events) = channel_observer();
    let bootstrapper = TransportBootstrapper::new(&engine);
    let running = bootstrapper.bootstrap("127.0.0.1", port, &observer);

    running.shutdown(&engine).await;
    assert!(engine.is_shut_down());
    assert_eq!(engine.listening_point_count(), 0);

    // Nothing in the process holds the port anymore
    let udp = std::net::UdpSocket::bind(("127.0.0.1", port));
    assert!(udp.is_ok(), "UDP port still bound: {:?}", udp.err());
    let tcp = std::net::TcpListener::bind(("127.0.0.1", port));
    assert!(tcp.is_ok(), "TCP port still bound: {:?}", tcp.err());

    let after = bootstrapper.start_transport(TransportKind::Datagram, "127.0.0.1", free_port(), &observer);
    assert!(matches!(after, Err(TransportError::EngineShutdown)));
}

//! End-to-end tests over loopback sockets.
//!
//! Every test builds its own reactor pool and binds ephemeral ports.

use drift_integration_tests::{Event, RecordingService, loopback, test_pool};
use drift_transport::{
    CallbackName, Client, ConnectClient, Datagram, Listener, Param, ServiceDescriptor,
    ShutdownMode, TransportError,
};
use std::sync::Arc;
use std::time::Duration;

fn datagram_service() -> ServiceDescriptor {
    ServiceDescriptor::new()
        .on_datagram([Param::Datagram, Param::Caller])
        .on_error()
}

// ============================================================================
// Round trip
// ============================================================================

#[tokio::test]
async fn test_hello_world_round_trip() {
    let pool = test_pool();
    let listener = Listener::bind(&pool, &loopback()).await.unwrap();
    let service = Arc::new(RecordingService::replying(b"world"));
    listener.attach(service.clone(), datagram_service());
    listener.start().unwrap();

    let client = Client::bind(&pool, &loopback()).await.unwrap();
    client
        .send_datagram(&Datagram::new(&b"hello"[..], listener.local_addr()))
        .await
        .unwrap();

    let reply = client.receive_datagram().await.unwrap();
    assert_eq!(reply.data().as_ref(), b"world");
    assert_eq!(reply.peer(), listener.local_addr());
    assert_eq!(
        service.events(),
        vec![Event::Enter("hello".into()), Event::Exit("hello".into())]
    );

    listener.close(ShutdownMode::Graceful).await;
    client.close();
}

#[tokio::test]
async fn test_bytes_callback_round_trip() {
    let pool = test_pool();
    let listener = Listener::bind(&pool, &loopback()).await.unwrap();
    let service = Arc::new(RecordingService::replying(b"pong"));
    listener.attach(
        service.clone(),
        ServiceDescriptor::new().on_bytes([Param::Caller, Param::Bytes]),
    );
    listener.start().unwrap();

    let port = listener.local_addr().port();
    let client = ConnectClient::connect(&pool, &loopback().with_remote("127.0.0.1", port))
        .await
        .unwrap();
    client.write_bytes(&b"ping"[..]).await.unwrap();

    assert_eq!(client.read_bytes().await.unwrap().as_ref(), b"pong");
    listener.close(ShutdownMode::Graceful).await;
}

// ============================================================================
// Receive semantics
// ============================================================================

#[tokio::test]
async fn test_timeout_fires_once_and_socket_stays_usable() {
    let pool = test_pool();
    let config = drift_transport::EndpointConfig {
        read_timeout: Some(0.1),
        ..loopback()
    };
    let receiver = Client::bind(&pool, &config).await.unwrap();
    let sender = Client::bind(&pool, &loopback()).await.unwrap();

    let err = receiver.receive_datagram().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "Read timed out");

    sender
        .send_datagram(&Datagram::new(&b"after"[..], receiver.local_addr()))
        .await
        .unwrap();
    let datagram = receiver.receive_datagram().await.unwrap();
    assert_eq!(datagram.data().as_ref(), b"after");
    assert_eq!(datagram.peer(), sender.local_addr());
}

#[tokio::test]
async fn test_data_queued_before_receive_is_delivered() {
    let pool = test_pool();
    let receiver = Client::bind(&pool, &loopback()).await.unwrap();
    let sender = Client::bind(&pool, &loopback()).await.unwrap();

    for payload in [&b"one"[..], &b"two"[..]] {
        sender
            .send_datagram(&Datagram::new(payload, receiver.local_addr()))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(receiver.receive_datagram().await.unwrap().data().as_ref(), b"one");
    assert_eq!(receiver.receive_datagram().await.unwrap().data().as_ref(), b"two");
}

#[tokio::test]
async fn test_second_concurrent_receive_is_rejected() {
    let pool = test_pool();
    let client = Arc::new(Client::bind(&pool, &loopback()).await.unwrap());

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.receive_datagram().await })
    };
    while !pool.tables().is_pending(client.transport().id()) {
        tokio::task::yield_now().await;
    }

    let second = client.receive_datagram().await;
    assert!(matches!(second, Err(TransportError::AlreadyPending(_))));

    client.close();
    assert!(first.await.unwrap().unwrap_err().is_closed());
}

#[tokio::test]
async fn test_close_cancels_outstanding_receive() {
    let pool = test_pool();
    let client = Arc::new(Client::bind(&pool, &loopback()).await.unwrap());

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.receive_datagram().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.close();

    let result = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("receive hung after close")
        .unwrap();
    assert!(matches!(result, Err(TransportError::Closed)));
}

#[tokio::test]
async fn test_connected_client_filters_other_senders() {
    let pool = test_pool();
    let peer = Client::bind(&pool, &loopback()).await.unwrap();
    let stranger = Client::bind(&pool, &loopback()).await.unwrap();

    let port = peer.local_addr().port();
    let client = ConnectClient::connect(&pool, &loopback().with_remote("127.0.0.1", port))
        .await
        .unwrap();

    stranger
        .send_datagram(&Datagram::new(&b"noise"[..], client.local_addr()))
        .await
        .unwrap();
    peer.send_datagram(&Datagram::new(&b"signal"[..], client.local_addr()))
        .await
        .unwrap();

    assert_eq!(client.read_bytes().await.unwrap().as_ref(), b"signal");
}

// ============================================================================
// Fragmentation
// ============================================================================

#[tokio::test]
async fn test_oversized_payload_arrives_as_independent_datagrams() {
    let pool = test_pool();
    let receiver = Client::bind(&pool, &loopback()).await.unwrap();
    let config = drift_transport::EndpointConfig {
        fragment_size: 1000,
        ..loopback()
    };
    let sender = Client::bind(&pool, &config).await.unwrap();

    let payload: Vec<u8> = (0..4500u32).map(|i| (i % 256) as u8).collect();
    let report = sender
        .send_datagram(&Datagram::new(payload.clone(), receiver.local_addr()))
        .await
        .unwrap();
    assert_eq!(report.fragments, 5);

    let mut received = Vec::new();
    for _ in 0..5 {
        let datagram = receiver.receive_datagram().await.unwrap();
        assert!(datagram.len() <= 1000);
        received.extend_from_slice(datagram.data());
    }
    assert_eq!(received, payload);
}

// ============================================================================
// Dispatch policy
// ============================================================================

async fn deliver_two(descriptor: ServiceDescriptor) -> Vec<Event> {
    let pool = test_pool();
    let listener = Listener::bind(&pool, &loopback()).await.unwrap();
    let service = Arc::new(RecordingService::holding(Duration::from_millis(200)));
    listener.attach(service.clone(), descriptor);
    listener.start().unwrap();

    let client = Client::bind(&pool, &loopback()).await.unwrap();
    for payload in [&b"first"[..], &b"second"[..]] {
        client
            .send_datagram(&Datagram::new(payload, listener.local_addr()))
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.events().len() < 4 {
        assert!(tokio::time::Instant::now() < deadline, "callbacks did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    listener.close(ShutdownMode::Graceful).await;
    service.events()
}

#[tokio::test]
async fn test_isolated_callback_runs_concurrently() {
    let events = deliver_two(
        datagram_service().isolated(CallbackName::OnDatagram),
    )
    .await;

    assert!(matches!(events[0], Event::Enter(_)));
    assert!(matches!(events[1], Event::Enter(_)));
}

#[tokio::test]
async fn test_sequential_callback_is_serialized() {
    let events = deliver_two(datagram_service()).await;

    assert_eq!(
        events,
        vec![
            Event::Enter("first".into()),
            Event::Exit("first".into()),
            Event::Enter("second".into()),
            Event::Exit("second".into()),
        ]
    );
}

#[tokio::test]
async fn test_graceful_close_lets_callbacks_reply() {
    let pool = test_pool();
    let listener = Listener::bind(&pool, &loopback()).await.unwrap();
    let service = Arc::new(
        RecordingService::replying(b"late reply").with_hold(Duration::from_millis(100)),
    );
    listener.attach(service.clone(), datagram_service());
    listener.start().unwrap();

    let client = Client::bind(&pool, &loopback()).await.unwrap();
    client
        .send_datagram(&Datagram::new(&b"slow"[..], listener.local_addr()))
        .await
        .unwrap();

    while service.events().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    listener.close(ShutdownMode::Graceful).await;

    assert_eq!(
        client.receive_datagram().await.unwrap().data().as_ref(),
        b"late reply"
    );
}

#[tokio::test]
async fn test_listener_timeout_reports_to_error_callback() {
    let pool = test_pool();
    let config = drift_transport::EndpointConfig {
        read_timeout: Some(0.05),
        ..loopback()
    };
    let listener = Listener::bind(&pool, &config).await.unwrap();
    let service = Arc::new(RecordingService::default());
    listener.attach(service.clone(), datagram_service());
    listener.start().unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    listener.close(ShutdownMode::Immediate).await;

    let errors = service.errors();
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|message| message == "Read timed out"));
}

//! Transport integration tests against a local mock realtime server.

mod mock_server;

use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::json;

use mock_server::{MockRealtimeServer, WAIT};
use waav_realtime::core::realtime::{
    ConnectionState, RealtimeError, ReconnectionConfig, Transport, TransportConfig, TransportEvent,
};

fn fast_config(max_attempts: u32) -> TransportConfig {
    TransportConfig {
        reconnection: ReconnectionConfig {
            enabled: true,
            max_attempts,
            initial_delay_ms: 20,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        },
        heartbeat_interval: Duration::from_secs(30),
        probe_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

async fn next_event<S>(events: &mut S) -> Option<TransportEvent>
where
    S: Stream<Item = TransportEvent> + Unpin,
{
    tokio::time::timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for a transport event")
}

/// Skip inbound frames until a lifecycle event arrives.
async fn next_lifecycle<S>(events: &mut S) -> Option<TransportEvent>
where
    S: Stream<Item = TransportEvent> + Unpin,
{
    loop {
        match next_event(events).await {
            Some(TransportEvent::Frame(_)) => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_connect_delivers_greeting_and_sends_headers() {
    let server = MockRealtimeServer::start().await;
    let transport = Transport::new(fast_config(5));

    let headers = vec![
        ("Authorization".to_string(), "Bearer sk-test".to_string()),
        ("OpenAI-Beta".to_string(), "realtime=v1".to_string()),
    ];
    transport.connect(&server.url(), &headers).await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);

    let mut events = Box::pin(transport.receive());
    match next_event(&mut events).await {
        Some(TransportEvent::Frame(frame)) => assert!(frame.contains("session.created")),
        other => panic!("unexpected {other:?}"),
    }

    let handshake = &server.handshakes()[0];
    assert_eq!(handshake.headers["authorization"], "Bearer sk-test");
    assert_eq!(handshake.headers["openai-beta"], "realtime=v1");

    transport
        .send(json!({"type": "input_audio_buffer.clear"}).to_string())
        .await
        .unwrap();
    server.wait_for_type("input_audio_buffer.clear", 1).await;

    transport.disconnect().await;
}

#[tokio::test]
async fn test_invalid_address_is_a_configuration_error() {
    let transport = Transport::new(fast_config(5));
    let result = transport.connect("http://localhost:1/realtime", &[]).await;
    assert!(matches!(result, Err(RealtimeError::InvalidConfiguration(_))));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_rejected_credentials_fail_authentication() {
    let server = MockRealtimeServer::start().await;
    server.set_reject_auth(true);

    let transport = Transport::new(fast_config(5));
    let result = transport.connect(&server.url(), &[]).await;
    assert!(matches!(result, Err(RealtimeError::AuthenticationFailed(_))));
    assert_eq!(transport.state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_unanswered_probe_fails_connect() {
    let server = MockRealtimeServer::start().await;
    server.set_greeting(false);
    server.stall(true);

    let mut config = fast_config(5);
    config.probe_timeout = Duration::from_millis(200);
    let transport = Transport::new(config);

    let result = transport.connect(&server.url(), &[]).await;
    assert!(matches!(result, Err(RealtimeError::ConnectionFailed(_))));
    assert_eq!(transport.state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_reconnects_after_drop() {
    let server = MockRealtimeServer::start().await;
    let transport = Transport::new(fast_config(5));
    transport.connect(&server.url(), &[]).await.unwrap();
    let mut events = Box::pin(transport.receive());

    server.drop_connections();

    assert_eq!(
        next_lifecycle(&mut events).await,
        Some(TransportEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(20)
        })
    );
    assert_eq!(
        next_lifecycle(&mut events).await,
        Some(TransportEvent::Reconnected { attempt: 1 })
    );
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(transport.attempts(), 0);
    assert_eq!(server.connection_count(), 2);

    // Greeting of the new connection follows the notification.
    match next_event(&mut events).await {
        Some(TransportEvent::Frame(frame)) => assert!(frame.contains("sess_2")),
        other => panic!("unexpected {other:?}"),
    }

    transport
        .send(json!({"type": "input_audio_buffer.commit"}).to_string())
        .await
        .unwrap();
    server.wait_for_type("input_audio_buffer.commit", 1).await;

    transport.disconnect().await;
}

#[tokio::test]
async fn test_sends_during_backoff_fail_and_are_not_replayed() {
    let server = MockRealtimeServer::start().await;
    let mut config = fast_config(5);
    config.reconnection.initial_delay_ms = 300;
    let transport = Transport::new(config);
    transport.connect(&server.url(), &[]).await.unwrap();
    let mut events = Box::pin(transport.receive());

    server.drop_connections();
    match next_lifecycle(&mut events).await {
        Some(TransportEvent::Reconnecting { attempt: 1, .. }) => {}
        other => panic!("unexpected {other:?}"),
    }

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        transport.send(json!({"type": "response.create"}).to_string()),
    )
    .await
    .expect("send must not wait for the reconnection");
    assert!(matches!(result, Err(RealtimeError::NotConnected)));

    assert_eq!(
        next_lifecycle(&mut events).await,
        Some(TransportEvent::Reconnected { attempt: 1 })
    );
    transport
        .send(json!({"type": "input_audio_buffer.clear"}).to_string())
        .await
        .unwrap();
    server.wait_for_type("input_audio_buffer.clear", 1).await;
    assert!(server.received_of_type("response.create").is_empty());

    transport.disconnect().await;
}

#[tokio::test]
async fn test_exhaustion_after_max_attempts() {
    let server = MockRealtimeServer::start().await;
    let transport = Transport::new(fast_config(3));
    transport.connect(&server.url(), &[]).await.unwrap();
    let mut events = Box::pin(transport.receive());

    server.set_refuse(true);
    server.drop_connections();

    let mut delays = Vec::new();
    let failure = loop {
        match next_lifecycle(&mut events).await {
            Some(TransportEvent::Reconnecting { attempt, delay }) => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay.as_millis());
            }
            Some(TransportEvent::Failed(e)) => break e,
            other => panic!("unexpected {other:?}"),
        }
    };

    assert_eq!(delays, vec![20, 40, 80]);
    assert!(matches!(failure, RealtimeError::ConnectionFailed(_)));
    assert_eq!(next_event(&mut events).await, None);
    assert_eq!(transport.state(), ConnectionState::Error);
    assert_eq!(server.connection_count(), 1);

    let result = transport
        .send(json!({"type": "input_audio_buffer.commit"}).to_string())
        .await;
    assert!(matches!(result, Err(RealtimeError::NotConnected)));
}

#[tokio::test]
async fn test_disabled_reconnection_fails_immediately() {
    let server = MockRealtimeServer::start().await;
    let mut config = fast_config(5);
    config.reconnection = ReconnectionConfig::disabled();
    let transport = Transport::new(config);
    transport.connect(&server.url(), &[]).await.unwrap();
    let mut events = Box::pin(transport.receive());

    server.drop_connections();

    assert!(matches!(
        next_lifecycle(&mut events).await,
        Some(TransportEvent::Failed(_))
    ));
    assert_eq!(next_event(&mut events).await, None);
}

#[tokio::test]
async fn test_unanswered_heartbeat_forces_reconnect() {
    let server = MockRealtimeServer::start().await;
    let mut config = fast_config(5);
    config.heartbeat_interval = Duration::from_millis(100);
    config.probe_timeout = Duration::from_millis(150);
    let transport = Transport::new(config);
    transport.connect(&server.url(), &[]).await.unwrap();
    let mut events = Box::pin(transport.receive());

    server.stall(true);
    match next_lifecycle(&mut events).await {
        Some(TransportEvent::Reconnecting { attempt: 1, .. }) => {}
        other => panic!("unexpected {other:?}"),
    }
    server.stall(false);

    loop {
        match next_lifecycle(&mut events).await {
            Some(TransportEvent::Reconnected { .. }) => break,
            Some(TransportEvent::Reconnecting { .. }) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(transport.state(), ConnectionState::Connected);

    transport.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_ends_stream_and_closes_socket() {
    let server = MockRealtimeServer::start().await;
    let transport = Transport::new(fast_config(5));
    transport.connect(&server.url(), &[]).await.unwrap();
    server.wait_for_connections(1).await;

    let mut events = Box::pin(transport.receive());
    transport.disconnect().await;

    // Frames that arrived before the disconnect may still be drained.
    while let Some(event) = next_event(&mut events).await {
        assert!(matches!(event, TransportEvent::Frame(_)));
    }
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    server.wait_for_no_live_connections().await;

    // Disconnect is idempotent.
    transport.disconnect().await;
}

//! Producer -> viewer streaming over loopback TCP.

use std::time::Duration;

use pulse_session::ConnectionState;

use crate::harness::{timing, TestProducer, TestViewer};

#[tokio::test]
async fn test_startup_logs_reach_viewer() {
    let viewer = TestViewer::start(false).await.unwrap();
    let producer = TestProducer::start(viewer.handle.local_addr());

    // Logged before any connection exists: held by the startup buffer
    producer.log("boot");

    producer.wait_streaming().await.unwrap();
    viewer.wait_texts(&["boot"]).await.unwrap();

    producer.log("a");
    producer.log("b");
    viewer.wait_texts(&["boot", "a", "b"]).await.unwrap();

    let clients = viewer.handle.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].app_name, "integration");

    producer.shutdown().await;
    viewer.wait_clients(0).await.unwrap();
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_paused_viewer_receives_nothing_until_resume() {
    let viewer = TestViewer::start(true).await.unwrap();
    let producer = TestProducer::start(viewer.handle.local_addr());

    producer.wait_state(ConnectionState::Connected).await.unwrap();
    assert!(producer.snapshot().is_paused);

    // Past the startup window, paused records are not kept
    tokio::time::sleep(timing().startup_buffer + Duration::from_millis(200)).await;
    producer.log("while paused");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(viewer.texts().is_empty());

    viewer.handle.resume();
    producer.wait_streaming().await.unwrap();
    producer.log("after resume");
    viewer.wait_texts(&["after resume"]).await.unwrap();

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_pause_mid_stream() {
    let viewer = TestViewer::start(false).await.unwrap();
    let producer = TestProducer::start(viewer.handle.local_addr());
    producer.wait_streaming().await.unwrap();

    producer.log("one");
    viewer.wait_texts(&["one"]).await.unwrap();

    viewer.handle.pause();
    let p = &producer;
    crate::harness::wait_until("producer paused", Duration::from_secs(2), || async move {
        p.snapshot().is_paused
    })
    .await
    .unwrap();

    // Connection stays up while paused: pings keep flowing
    tokio::time::sleep(timing().ping_timeout * 2).await;
    assert_eq!(producer.snapshot().state, ConnectionState::Connected);

    viewer.handle.resume();
    producer.wait_streaming().await.unwrap();
    producer.log("two");
    viewer.wait_texts(&["one", "two"]).await.unwrap();

    producer.shutdown().await;
    viewer.shutdown().await;
}

#[tokio::test]
async fn test_disable_closes_connection() {
    let viewer = TestViewer::start(false).await.unwrap();
    let producer = TestProducer::start(viewer.handle.local_addr());
    producer.wait_streaming().await.unwrap();
    viewer.wait_clients(1).await.unwrap();

    assert!(producer.producer.session.disable());
    producer.wait_state(ConnectionState::Idle).await.unwrap();
    viewer.wait_clients(0).await.unwrap();

    let snapshot = producer.snapshot();
    assert!(!snapshot.is_enabled);
    assert!(snapshot.connected_peer.is_none());
    assert!(snapshot.discovered_peers.is_empty());

    // Disabled stays disabled: no reconnect after a few retry intervals
    tokio::time::sleep(timing().connection_retry * 3).await;
    assert_eq!(producer.snapshot().state, ConnectionState::Idle);
    assert!(viewer.handle.clients().is_empty());

    producer.shutdown().await;
    viewer.shutdown().await;
}
